// models/sessionmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Waiting,
    Matched,
    Active,
    AgentDisconnected,
    Ended,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::AgentDisconnected | SessionState::Ended)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Customer,
    Agent,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    Agent,
    Customer,
    System,
    CustomerLeftQueue,
    QueueTimeout,
}

/// One matching cycle for an escalation. A re-queue after an agent drop
/// starts a fresh instance with the same `escalation_id`.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: Uuid,
    pub escalation_id: Uuid,
    pub business_id: Uuid,
    pub conversation_id: String,
    pub room_id: String,
    pub customer_connection_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub agent_connection_id: Option<Uuid>,
    pub state: SessionState,
    pub retry_count: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub end_reason: Option<EndReason>,
}
