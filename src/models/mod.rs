pub mod chatmodel;
pub mod conversationmodel;
pub mod escalationmodel;
pub mod presencemodel;
pub mod sessionmodel;
