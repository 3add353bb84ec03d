// db/escalationdb.rs
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Error;
use uuid::Uuid;

use super::db::DBClient;
use crate::{models::escalationmodel::*, utils::case_number::format_case_number};

#[async_trait]
pub trait EscalationExt {
    /// Inserts with status `escalated` and a freshly drawn case number.
    async fn create_escalation(&self, new: NewEscalation) -> Result<Escalation, Error>;

    async fn get_escalation(&self, escalation_id: Uuid) -> Result<Option<Escalation>, Error>;

    async fn get_escalation_by_case_number(
        &self,
        case_number: &str,
    ) -> Result<Option<Escalation>, Error>;

    async fn list_escalations(
        &self,
        business_id: Uuid,
        status: Option<EscalationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Escalation>, Error>;

    async fn update_escalation_status(
        &self,
        escalation_id: Uuid,
        status: EscalationStatus,
    ) -> Result<Option<Escalation>, Error>;

    async fn update_escalation_owner(
        &self,
        escalation_id: Uuid,
        case_owner: Option<Uuid>,
    ) -> Result<Option<Escalation>, Error>;
}

const ESCALATION_COLUMNS: &str = r#"
    id, case_number, business_id, session_id, customer_name, customer_email,
    customer_phone, concern, description, status, case_owner, created_at, updated_at
"#;

#[async_trait]
impl EscalationExt for DBClient {
    async fn create_escalation(&self, new: NewEscalation) -> Result<Escalation, Error> {
        let sequence = sqlx::query_scalar::<_, i64>("SELECT nextval('escalation_case_seq')")
            .fetch_one(&self.pool)
            .await?;

        let now = Utc::now();
        let case_number = format_case_number(now, sequence as u64);

        sqlx::query_as::<_, Escalation>(&format!(
            r#"
            INSERT INTO escalations
            (case_number, business_id, session_id, customer_name, customer_email,
             customer_phone, concern, description, status, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $10)
            RETURNING {}
            "#,
            ESCALATION_COLUMNS
        ))
        .bind(case_number)
        .bind(new.business_id)
        .bind(new.session_id)
        .bind(new.customer.name)
        .bind(new.customer.email)
        .bind(new.customer.phone)
        .bind(new.concern)
        .bind(new.description)
        .bind(EscalationStatus::Escalated)
        .bind(now)
        .fetch_one(&self.pool)
        .await
    }

    async fn get_escalation(&self, escalation_id: Uuid) -> Result<Option<Escalation>, Error> {
        sqlx::query_as::<_, Escalation>(&format!(
            "SELECT {} FROM escalations WHERE id = $1",
            ESCALATION_COLUMNS
        ))
        .bind(escalation_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn get_escalation_by_case_number(
        &self,
        case_number: &str,
    ) -> Result<Option<Escalation>, Error> {
        sqlx::query_as::<_, Escalation>(&format!(
            "SELECT {} FROM escalations WHERE case_number = $1",
            ESCALATION_COLUMNS
        ))
        .bind(case_number)
        .fetch_optional(&self.pool)
        .await
    }

    async fn list_escalations(
        &self,
        business_id: Uuid,
        status: Option<EscalationStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Escalation>, Error> {
        sqlx::query_as::<_, Escalation>(&format!(
            r#"
            SELECT {} FROM escalations
            WHERE business_id = $1
              AND ($2::escalation_status IS NULL OR status = $2)
            ORDER BY created_at DESC
            LIMIT $3 OFFSET $4
            "#,
            ESCALATION_COLUMNS
        ))
        .bind(business_id)
        .bind(status)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await
    }

    async fn update_escalation_status(
        &self,
        escalation_id: Uuid,
        status: EscalationStatus,
    ) -> Result<Option<Escalation>, Error> {
        sqlx::query_as::<_, Escalation>(&format!(
            r#"
            UPDATE escalations
            SET status = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            ESCALATION_COLUMNS
        ))
        .bind(escalation_id)
        .bind(status)
        .fetch_optional(&self.pool)
        .await
    }

    async fn update_escalation_owner(
        &self,
        escalation_id: Uuid,
        case_owner: Option<Uuid>,
    ) -> Result<Option<Escalation>, Error> {
        sqlx::query_as::<_, Escalation>(&format!(
            r#"
            UPDATE escalations
            SET case_owner = $2, updated_at = NOW()
            WHERE id = $1
            RETURNING {}
            "#,
            ESCALATION_COLUMNS
        ))
        .bind(escalation_id)
        .bind(case_owner)
        .fetch_optional(&self.pool)
        .await
    }
}
