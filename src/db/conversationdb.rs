// db/conversationdb.rs
use async_trait::async_trait;
use sqlx::Error;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::conversationmodel::*;

/// Business settings and AI conversation lookups owned by the dashboard side.
#[async_trait]
pub trait ConversationExt {
    async fn get_chatbot_settings(&self, business_id: Uuid) -> Result<Option<ChatbotSettings>, Error>;

    async fn upsert_chatbot_settings(
        &self,
        business_id: Uuid,
        enable_live_chat: bool,
    ) -> Result<ChatbotSettings, Error>;

    async fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>, Error>;

    async fn create_conversation(
        &self,
        business_id: Uuid,
        session_id: &str,
    ) -> Result<Conversation, Error>;
}

#[async_trait]
impl ConversationExt for DBClient {
    async fn get_chatbot_settings(&self, business_id: Uuid) -> Result<Option<ChatbotSettings>, Error> {
        sqlx::query_as::<_, ChatbotSettings>(
            r#"
            SELECT business_id, enable_live_chat
            FROM chatbot_settings
            WHERE business_id = $1
            "#
        )
        .bind(business_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn upsert_chatbot_settings(
        &self,
        business_id: Uuid,
        enable_live_chat: bool,
    ) -> Result<ChatbotSettings, Error> {
        sqlx::query_as::<_, ChatbotSettings>(
            r#"
            INSERT INTO chatbot_settings (business_id, enable_live_chat)
            VALUES ($1, $2)
            ON CONFLICT (business_id) DO UPDATE SET enable_live_chat = EXCLUDED.enable_live_chat
            RETURNING business_id, enable_live_chat
            "#
        )
        .bind(business_id)
        .bind(enable_live_chat)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_conversation(&self, session_id: &str) -> Result<Option<Conversation>, Error> {
        sqlx::query_as::<_, Conversation>(
            r#"
            SELECT session_id, business_id, created_at
            FROM conversations
            WHERE session_id = $1
            "#
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn create_conversation(
        &self,
        business_id: Uuid,
        session_id: &str,
    ) -> Result<Conversation, Error> {
        sqlx::query_as::<_, Conversation>(
            r#"
            INSERT INTO conversations (session_id, business_id)
            VALUES ($1, $2)
            ON CONFLICT (session_id) DO UPDATE SET session_id = EXCLUDED.session_id
            RETURNING session_id, business_id, created_at
            "#
        )
        .bind(session_id)
        .bind(business_id)
        .fetch_one(&self.pool)
        .await
    }
}
