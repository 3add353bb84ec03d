// models/chatmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "sender_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    Customer,
    Agent,
    Ai,
    System,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "system_message_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SystemMessageType {
    AgentConnected,
    AgentDisconnected,
    ChatEnded,
    QueueTimeout,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub file_name: String,
    pub file_url: String,
    pub file_size: i64,
    pub mime_type: String,
}

/// Immutable once stored. `seq` is the store's insertion order and breaks
/// `created_at` ties.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: Uuid,
    pub seq: i64,
    pub business_id: Uuid,
    pub session_id: String,
    pub escalation_id: Option<Uuid>,
    pub sender_type: SenderType,
    pub body: Option<String>,
    pub system_message_type: Option<SystemMessageType>,
    #[sqlx(json)]
    pub attachments: Vec<Attachment>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewMessage {
    pub business_id: Uuid,
    pub session_id: String,
    pub escalation_id: Option<Uuid>,
    pub sender_type: SenderType,
    pub body: Option<String>,
    pub system_message_type: Option<SystemMessageType>,
    pub attachments: Vec<Attachment>,
}

impl NewMessage {
    pub fn text(
        business_id: Uuid,
        session_id: impl Into<String>,
        escalation_id: Option<Uuid>,
        sender_type: SenderType,
        body: impl Into<String>,
    ) -> Self {
        Self {
            business_id,
            session_id: session_id.into(),
            escalation_id,
            sender_type,
            body: Some(body.into()),
            system_message_type: None,
            attachments: Vec::new(),
        }
    }

    pub fn system(
        business_id: Uuid,
        session_id: impl Into<String>,
        escalation_id: Uuid,
        kind: SystemMessageType,
        body: impl Into<String>,
    ) -> Self {
        Self {
            business_id,
            session_id: session_id.into(),
            escalation_id: Some(escalation_id),
            sender_type: SenderType::System,
            body: Some(body.into()),
            system_message_type: Some(kind),
            attachments: Vec::new(),
        }
    }

    pub fn has_content(&self) -> bool {
        let has_body = self
            .body
            .as_deref()
            .map(|body| !body.trim().is_empty())
            .unwrap_or(false);
        has_body || !self.attachments.is_empty()
    }
}
