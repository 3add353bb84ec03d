// db/memory.rs
//
// Process-local store used when DATABASE_URL is not configured and by the
// unit tests. Implements the same extension traits as DBClient.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use sqlx::Error;
use uuid::Uuid;

use super::{
    activitydb::ActivityExt, conversationdb::ConversationExt, escalationdb::EscalationExt,
    messagedb::MessageExt,
};
use crate::{
    models::{chatmodel::*, conversationmodel::*, escalationmodel::*},
    utils::case_number::format_case_number,
};

#[derive(Debug, Default)]
struct Tables {
    escalations: HashMap<Uuid, Escalation>,
    messages: Vec<Message>,
    settings: HashMap<Uuid, ChatbotSettings>,
    conversations: HashMap<String, Conversation>,
    activities: Vec<Activity>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    case_seq: AtomicU64,
    message_seq: AtomicU64,
    unavailable: AtomicBool,
    activity_delay_ms: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every write fail as if the database pool were exhausted.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Slows every activity write, standing in for a sluggish database.
    pub fn set_activity_delay(&self, delay: Duration) {
        self.activity_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), Error> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(Error::PoolTimedOut);
        }
        Ok(())
    }
}

#[async_trait]
impl EscalationExt for MemoryStore {
    async fn create_escalation(&self, new: NewEscalation) -> Result<Escalation, Error> {
        self.check_writable()?;
        let sequence = self.case_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();

        let escalation = Escalation {
            id: Uuid::new_v4(),
            case_number: format_case_number(now, sequence),
            business_id: new.business_id,
            session_id: new.session_id,
            customer_name: new.customer.name,
            customer_email: new.customer.email,
            customer_phone: new.customer.phone,
            concern: new.concern,
            description: new.description,
            status: EscalationStatus::Escalated,
            case_owner: None,
            created_at: now,
            updated_at: now,
        };

        self.tables
            .write()
            .escalations
            .insert(escalation.id, escalation.clone());
        Ok(escalation)
    }

    async fn get_escalation(&self, escalation_id: Uuid) -> Result<Option<Escalation>, Error> {
        Ok(self.tables.read().escalations.get(&escalation_id).cloned())
    }

    async fn get_escalation_by_case_number(
        &self,
        case_number: &str,
    ) -> Result<Option<Escalation>, Error> {
        Ok(self
            .tables
            .read()
            .escalations
            .values()
            .find(|e| e.case_number == case_number)
            .cloned())
    }

    async fn list_escalations(
        &self,
        business_id: Uuid,
        status: Option<EscalationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Escalation>, Error> {
        let tables = self.tables.read();
        let mut rows: Vec<Escalation> = tables
            .escalations
            .values()
            .filter(|e| e.business_id == business_id)
            .filter(|e| status.map(|s| e.status == s).unwrap_or(true))
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_escalation_status(
        &self,
        escalation_id: Uuid,
        status: EscalationStatus,
    ) -> Result<Option<Escalation>, Error> {
        self.check_writable()?;
        let mut tables = self.tables.write();
        Ok(tables.escalations.get_mut(&escalation_id).map(|e| {
            e.status = status;
            e.updated_at = Utc::now();
            e.clone()
        }))
    }

    async fn update_escalation_owner(
        &self,
        escalation_id: Uuid,
        case_owner: Option<Uuid>,
    ) -> Result<Option<Escalation>, Error> {
        self.check_writable()?;
        let mut tables = self.tables.write();
        Ok(tables.escalations.get_mut(&escalation_id).map(|e| {
            e.case_owner = case_owner;
            e.updated_at = Utc::now();
            e.clone()
        }))
    }
}

#[async_trait]
impl MessageExt for MemoryStore {
    async fn append_message(&self, new: NewMessage) -> Result<Message, Error> {
        self.check_writable()?;
        let mut tables = self.tables.write();
        // seq is drawn under the write lock so insertion order matches seq order
        let seq = self.message_seq.fetch_add(1, Ordering::SeqCst) as i64 + 1;

        let message = Message {
            id: Uuid::new_v4(),
            seq,
            business_id: new.business_id,
            session_id: new.session_id,
            escalation_id: new.escalation_id,
            sender_type: new.sender_type,
            body: new.body,
            system_message_type: new.system_message_type,
            attachments: new.attachments,
            created_at: Utc::now(),
        };
        tables.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages_by_session(&self, session_id: &str) -> Result<Vec<Message>, Error> {
        let tables = self.tables.read();
        let mut rows: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.seq.cmp(&b.seq)));
        Ok(rows)
    }
}

#[async_trait]
impl ConversationExt for MemoryStore {
    async fn get_chatbot_settings(&self, business_id: Uuid) -> Result<Option<ChatbotSettings>, Error> {
        Ok(self.tables.read().settings.get(&business_id).cloned())
    }

    async fn upsert_chatbot_settings(
        &self,
        business_id: Uuid,
        enable_live_chat: bool,
    ) -> Result<ChatbotSettings, Error> {
        self.check_writable()?;
        let settings = ChatbotSettings {
            business_id,
            enable_live_chat,
        };
        self.tables
            .write()
            .settings
            .insert(business_id, settings.clone());
        Ok(settings)
    }

    async fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>, Error> {
        Ok(self.tables.read().conversations.get(session_id).cloned())
    }

    async fn create_conversation(
        &self,
        business_id: Uuid,
        session_id: &str,
    ) -> Result<Conversation, Error> {
        self.check_writable()?;
        let mut tables = self.tables.write();
        let conversation = tables
            .conversations
            .entry(session_id.to_string())
            .or_insert_with(|| Conversation {
                session_id: session_id.to_string(),
                business_id,
                created_at: Utc::now(),
            })
            .clone();
        Ok(conversation)
    }
}

#[async_trait]
impl ActivityExt for MemoryStore {
    async fn record_activity(
        &self,
        escalation_id: Uuid,
        kind: &str,
        detail: Option<serde_json::Value>,
    ) -> Result<Activity, Error> {
        let delay = self.activity_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        self.check_writable()?;
        let activity = Activity {
            id: Uuid::new_v4(),
            escalation_id,
            kind: kind.to_string(),
            detail,
            created_at: Utc::now(),
        };
        self.tables.write().activities.push(activity.clone());
        Ok(activity)
    }

    async fn list_activities(&self, escalation_id: Uuid) -> Result<Vec<Activity>, Error> {
        Ok(self
            .tables
            .read()
            .activities
            .iter()
            .filter(|a| a.escalation_id == escalation_id)
            .cloned()
            .collect())
    }
}
