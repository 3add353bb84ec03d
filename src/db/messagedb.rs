// db/messagedb.rs
use async_trait::async_trait;
use sqlx::{types::Json, Error};

use super::db::DBClient;
use crate::models::chatmodel::*;

#[async_trait]
pub trait MessageExt {
    /// Append-only; existing rows are never updated.
    async fn append_message(&self, new: NewMessage) -> Result<Message, Error>;

    /// Oldest first, `seq` breaking timestamp ties.
    async fn list_messages_by_session(&self, session_id: &str) -> Result<Vec<Message>, Error>;
}

#[async_trait]
impl MessageExt for DBClient {
    async fn append_message(&self, new: NewMessage) -> Result<Message, Error> {
        sqlx::query_as::<_, Message>(
            r#"
            INSERT INTO messages
            (business_id, session_id, escalation_id, sender_type, body,
             system_message_type, attachments)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, seq, business_id, session_id, escalation_id, sender_type,
                      body, system_message_type, attachments, created_at
            "#
        )
        .bind(new.business_id)
        .bind(new.session_id)
        .bind(new.escalation_id)
        .bind(new.sender_type)
        .bind(new.body)
        .bind(new.system_message_type)
        .bind(Json(new.attachments))
        .fetch_one(&self.pool)
        .await
    }

    async fn list_messages_by_session(&self, session_id: &str) -> Result<Vec<Message>, Error> {
        sqlx::query_as::<_, Message>(
            r#"
            SELECT id, seq, business_id, session_id, escalation_id, sender_type,
                   body, system_message_type, attachments, created_at
            FROM messages
            WHERE session_id = $1
            ORDER BY created_at ASC, seq ASC
            "#
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
    }
}
