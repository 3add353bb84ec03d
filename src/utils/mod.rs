pub mod case_number;
pub mod phone;
