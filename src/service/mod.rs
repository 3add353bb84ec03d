pub mod activity_service;
pub mod ai_service;
pub mod background_jobs;
pub mod chat_session;
pub mod chatbot_service;
pub mod dedup;
pub mod error;
pub mod escalation_service;
pub mod gateway;
pub mod live_chat_service;
pub mod queue_service;
pub mod storage_service;
