// models/escalationmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "escalation_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    Escalated,
    Pending,
    Resolved,
}

impl EscalationStatus {
    pub fn to_str(&self) -> &str {
        match self {
            EscalationStatus::Escalated => "escalated",
            EscalationStatus::Pending => "pending",
            EscalationStatus::Resolved => "resolved",
        }
    }
}

/// A customer's request for a human. `case_number` is assigned once on insert.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    #[serde(rename = "_id")]
    pub id: Uuid,
    pub case_number: String,
    pub business_id: Uuid,
    pub session_id: String,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: Option<String>,
    pub concern: Option<String>,
    pub description: Option<String>,
    pub status: EscalationStatus,
    pub case_owner: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerInfo {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewEscalation {
    pub business_id: Uuid,
    pub session_id: String,
    pub customer: CustomerInfo,
    pub concern: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Activity {
    pub id: Uuid,
    pub escalation_id: Uuid,
    pub kind: String,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}
