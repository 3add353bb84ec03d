// db/activitydb.rs
use async_trait::async_trait;
use sqlx::Error;
use uuid::Uuid;

use super::db::DBClient;
use crate::models::escalationmodel::Activity;

#[async_trait]
pub trait ActivityExt {
    async fn record_activity(
        &self,
        escalation_id: Uuid,
        kind: &str,
        detail: Option<serde_json::Value>,
    ) -> Result<Activity, Error>;

    async fn list_activities(&self, escalation_id: Uuid) -> Result<Vec<Activity>, Error>;
}

#[async_trait]
impl ActivityExt for DBClient {
    async fn record_activity(
        &self,
        escalation_id: Uuid,
        kind: &str,
        detail: Option<serde_json::Value>,
    ) -> Result<Activity, Error> {
        sqlx::query_as::<_, Activity>(
            r#"
            INSERT INTO escalation_activities (escalation_id, kind, detail)
            VALUES ($1, $2, $3)
            RETURNING id, escalation_id, kind, detail, created_at
            "#
        )
        .bind(escalation_id)
        .bind(kind)
        .bind(detail)
        .fetch_one(&self.pool)
        .await
    }

    async fn list_activities(&self, escalation_id: Uuid) -> Result<Vec<Activity>, Error> {
        sqlx::query_as::<_, Activity>(
            r#"
            SELECT id, escalation_id, kind, detail, created_at
            FROM escalation_activities
            WHERE escalation_id = $1
            ORDER BY created_at ASC
            "#
        )
        .bind(escalation_id)
        .fetch_all(&self.pool)
        .await
    }
}
