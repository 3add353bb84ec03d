// models/presencemodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Availability {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct AgentPresence {
    pub agent_id: Uuid,
    pub business_id: Uuid,
    pub connection_id: Option<Uuid>,
    pub availability: Availability,
    /// Escalation the agent is serving while busy.
    pub active_escalation: Option<Uuid>,
    pub available_since: Option<DateTime<Utc>>,
    pub last_assigned_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub escalation_id: Uuid,
    pub business_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(skip)]
    pub seq: u64,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub business_id: Uuid,
    pub waiting: Vec<QueuedPosition>,
    pub agents: Vec<AgentPresence>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct QueuedPosition {
    pub position: usize,
    #[serde(flatten)]
    pub entry: QueueEntry,
}
