pub mod activitydb;
pub mod conversationdb;
pub mod db;
pub mod escalationdb;
pub mod memory;
pub mod messagedb;

use activitydb::ActivityExt;
use conversationdb::ConversationExt;
use escalationdb::EscalationExt;
use messagedb::MessageExt;

/// Everything the escalation core needs from persistence.
pub trait SupportStore:
    EscalationExt + MessageExt + ConversationExt + ActivityExt + Send + Sync + std::fmt::Debug
{
}

impl<T> SupportStore for T where
    T: EscalationExt + MessageExt + ConversationExt + ActivityExt + Send + Sync + std::fmt::Debug
{
}
