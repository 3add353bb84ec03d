// service/escalation_service.rs
//
// Case registry: creation, business-scoped lookup and the two agent-side
// setters. Status and owner writes replace the whole field, so concurrent
// updates are last-writer-wins.
use std::sync::Arc;

use uuid::Uuid;
use validator::Validate;

use crate::{
    db::{conversationdb::ConversationExt, escalationdb::EscalationExt, SupportStore},
    dtos::escalationdtos::{CreateEscalationDto, EscalationListQuery},
    models::escalationmodel::{Activity, Escalation, EscalationStatus},
    service::{activity_service::ActivityService, error::ServiceError},
    utils::case_number::is_valid_case_number,
};

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone)]
pub struct EscalationService {
    store: Arc<dyn SupportStore>,
    activity: ActivityService,
}

impl EscalationService {
    pub fn new(store: Arc<dyn SupportStore>) -> Self {
        Self {
            activity: ActivityService::new(store.clone()),
            store,
        }
    }

    pub async fn create_escalation(&self, body: CreateEscalationDto) -> Result<Escalation, ServiceError> {
        body.validate()
            .map_err(|e| ServiceError::Validation(e.to_string()))?;
        let new = body.into_new_escalation();

        self.store
            .get_conversation(&new.session_id)
            .await?
            .filter(|c| c.business_id == new.business_id)
            .ok_or_else(|| ServiceError::ConversationNotFound(new.session_id.clone()))?;

        let escalation = self.store.create_escalation(new).await?;
        tracing::info!(
            "escalation {} created as {} for business {}",
            escalation.id,
            escalation.case_number,
            escalation.business_id
        );

        if let Err(e) = self.activity.log_created(&escalation).await {
            tracing::warn!("activity for new escalation {} not recorded: {}", escalation.id, e);
        }
        Ok(escalation)
    }

    /// Case continuation. A case from another business is reported exactly
    /// like a missing one.
    pub async fn get_by_case_number(
        &self,
        case_number: &str,
        business_id: Uuid,
    ) -> Result<Escalation, ServiceError> {
        let case_number = case_number.trim().to_uppercase();
        if !is_valid_case_number(&case_number) {
            return Err(ServiceError::CaseNotFound(case_number));
        }

        self.store
            .get_escalation_by_case_number(&case_number)
            .await?
            .filter(|e| e.business_id == business_id)
            .ok_or(ServiceError::CaseNotFound(case_number))
    }

    pub async fn get(&self, escalation_id: Uuid) -> Result<Escalation, ServiceError> {
        self.store
            .get_escalation(escalation_id)
            .await?
            .ok_or(ServiceError::EscalationNotFound(escalation_id))
    }

    pub async fn list(&self, query: &EscalationListQuery) -> Result<Vec<Escalation>, ServiceError> {
        let page = query.page.unwrap_or(1).max(1);
        let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
        let offset = ((page - 1) * limit) as i64;

        Ok(self
            .store
            .list_escalations(query.business_id, query.status, limit as i64, offset)
            .await?)
    }

    /// Idempotent: setting the current value records nothing.
    pub async fn update_status(
        &self,
        escalation_id: Uuid,
        status: EscalationStatus,
    ) -> Result<Escalation, ServiceError> {
        let current = self.get(escalation_id).await?;
        if current.status == status {
            return Ok(current);
        }

        let updated = self
            .store
            .update_escalation_status(escalation_id, status)
            .await?
            .ok_or(ServiceError::EscalationNotFound(escalation_id))?;
        tracing::info!(
            "escalation {} status {} -> {}",
            escalation_id,
            current.status.to_str(),
            status.to_str()
        );

        if let Err(e) = self
            .activity
            .log_status_change(escalation_id, current.status, status)
            .await
        {
            tracing::warn!("status activity for {} not recorded: {}", escalation_id, e);
        }
        Ok(updated)
    }

    pub async fn update_owner(
        &self,
        escalation_id: Uuid,
        case_owner: Option<Uuid>,
    ) -> Result<Escalation, ServiceError> {
        let current = self.get(escalation_id).await?;
        if current.case_owner == case_owner {
            return Ok(current);
        }

        let updated = self
            .store
            .update_escalation_owner(escalation_id, case_owner)
            .await?
            .ok_or(ServiceError::EscalationNotFound(escalation_id))?;
        tracing::info!("escalation {} owner set to {:?}", escalation_id, case_owner);

        if let Err(e) = self
            .activity
            .log_owner_change(escalation_id, current.case_owner, case_owner)
            .await
        {
            tracing::warn!("owner activity for {} not recorded: {}", escalation_id, e);
        }
        Ok(updated)
    }

    pub async fn activities(&self, escalation_id: Uuid) -> Result<Vec<Activity>, ServiceError> {
        self.get(escalation_id).await?;
        self.activity.list(escalation_id).await
    }
}
