// service/activity_service.rs
use std::sync::Arc;

use uuid::Uuid;

use crate::{
    db::{activitydb::ActivityExt, SupportStore},
    models::{
        escalationmodel::{Activity, Escalation, EscalationStatus},
        sessionmodel::EndReason,
    },
    service::error::ServiceError,
};

#[derive(Debug, Clone)]
pub struct ActivityService {
    store: Arc<dyn SupportStore>,
}

impl ActivityService {
    pub fn new(store: Arc<dyn SupportStore>) -> Self {
        Self { store }
    }

    pub async fn log_created(&self, escalation: &Escalation) -> Result<(), ServiceError> {
        self.log(
            escalation.id,
            "escalation_created",
            Some(serde_json::json!({
                "caseNumber": escalation.case_number,
                "concern": escalation.concern,
            })),
        )
        .await
    }

    pub async fn log_status_change(
        &self,
        escalation_id: Uuid,
        from: EscalationStatus,
        to: EscalationStatus,
    ) -> Result<(), ServiceError> {
        self.log(
            escalation_id,
            "status_changed",
            Some(serde_json::json!({ "from": from.to_str(), "to": to.to_str() })),
        )
        .await
    }

    pub async fn log_owner_change(
        &self,
        escalation_id: Uuid,
        from: Option<Uuid>,
        to: Option<Uuid>,
    ) -> Result<(), ServiceError> {
        self.log(
            escalation_id,
            "owner_changed",
            Some(serde_json::json!({ "from": from, "to": to })),
        )
        .await
    }

    pub async fn log_live_chat_connected(&self, escalation_id: Uuid, agent_id: Uuid) -> Result<(), ServiceError> {
        self.log(
            escalation_id,
            "live_chat_connected",
            Some(serde_json::json!({ "agentId": agent_id })),
        )
        .await
    }

    pub async fn log_agent_disconnected(
        &self,
        escalation_id: Uuid,
        agent_id: Uuid,
        retry_count: u32,
    ) -> Result<(), ServiceError> {
        self.log(
            escalation_id,
            "agent_disconnected",
            Some(serde_json::json!({ "agentId": agent_id, "retryCount": retry_count })),
        )
        .await
    }

    pub async fn log_live_chat_ended(&self, escalation_id: Uuid, reason: EndReason) -> Result<(), ServiceError> {
        self.log(
            escalation_id,
            "live_chat_ended",
            Some(serde_json::json!({ "reason": reason })),
        )
        .await
    }

    pub async fn list(&self, escalation_id: Uuid) -> Result<Vec<Activity>, ServiceError> {
        Ok(self.store.list_activities(escalation_id).await?)
    }

    async fn log(
        &self,
        escalation_id: Uuid,
        kind: &str,
        detail: Option<serde_json::Value>,
    ) -> Result<(), ServiceError> {
        self.store.record_activity(escalation_id, kind, detail).await?;
        tracing::debug!("activity {} recorded for escalation {}", kind, escalation_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory::MemoryStore;

    #[tokio::test]
    async fn activities_are_listed_per_escalation() {
        let store: Arc<dyn SupportStore> = Arc::new(MemoryStore::new());
        let activity = ActivityService::new(store);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        activity
            .log_status_change(a, EscalationStatus::Escalated, EscalationStatus::Pending)
            .await
            .unwrap();
        activity.log_owner_change(a, None, Some(Uuid::new_v4())).await.unwrap();
        activity.log_live_chat_ended(b, EndReason::Agent).await.unwrap();

        let listed = activity.list(a).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].kind, "status_changed");
        assert_eq!(listed[0].detail.as_ref().unwrap()["to"], "pending");
        assert_eq!(activity.list(b).await.unwrap()[0].detail.as_ref().unwrap()["reason"], "agent");
    }
}
