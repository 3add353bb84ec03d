pub mod chatdtos;
pub mod escalationdtos;
pub mod eventdtos;
