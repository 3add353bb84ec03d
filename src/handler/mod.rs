pub mod chat;
pub mod chatbot;
pub mod escalation;
pub mod realtime;
