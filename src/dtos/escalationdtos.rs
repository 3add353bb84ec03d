use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::escalationmodel::{CustomerInfo, EscalationStatus, NewEscalation};

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEscalationDto {
    pub business_id: Uuid,

    #[validate(length(min = 1, message = "Session id is required"))]
    pub session_id: String,

    #[validate(length(min = 1, max = 120, message = "Name is required"))]
    pub customer_name: String,

    #[validate(
        length(min = 1, message = "Email is required"),
        email(message = "Email is invalid")
    )]
    pub customer_email: String,

    #[validate(custom = "crate::utils::phone::validate_phone")]
    pub customer_phone: Option<String>,

    #[validate(length(max = 200, message = "Concern must be at most 200 characters"))]
    pub concern: Option<String>,

    #[validate(length(max = 5000, message = "Description must be at most 5000 characters"))]
    pub description: Option<String>,
}

impl CreateEscalationDto {
    pub fn into_new_escalation(self) -> NewEscalation {
        let phone = self
            .customer_phone
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty());

        NewEscalation {
            business_id: self.business_id,
            session_id: self.session_id.trim().to_string(),
            customer: CustomerInfo {
                name: self.customer_name.trim().to_string(),
                email: self.customer_email.trim().to_lowercase(),
                phone,
            },
            concern: self.concern.map(|c| c.trim().to_string()).filter(|c| !c.is_empty()),
            description: self.description,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaseLookupQuery {
    pub business_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationListQuery {
    pub business_id: Uuid,
    pub status: Option<EscalationStatus>,
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusDto {
    pub status: EscalationStatus,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOwnerDto {
    pub case_owner: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dto() -> CreateEscalationDto {
        CreateEscalationDto {
            business_id: Uuid::new_v4(),
            session_id: "sess-1".into(),
            customer_name: "Jane Doe".into(),
            customer_email: "jane@x.com".into(),
            customer_phone: None,
            concern: Some("Billing".into()),
            description: None,
        }
    }

    #[test]
    fn valid_form_passes() {
        assert!(dto().validate().is_ok());
    }

    #[test]
    fn bad_email_is_rejected() {
        let mut body = dto();
        body.customer_email = "jane-at-x".into();
        assert!(body.validate().is_err());
    }

    #[test]
    fn missing_name_is_rejected() {
        let mut body = dto();
        body.customer_name = String::new();
        assert!(body.validate().is_err());
    }

    #[test]
    fn short_phone_is_rejected_and_loose_phone_accepted() {
        let mut body = dto();
        body.customer_phone = Some("12345".into());
        assert!(body.validate().is_err());

        body.customer_phone = Some("+1 555-123-4567".into());
        assert!(body.validate().is_ok());
    }

    #[test]
    fn deserializes_camel_case_payload() {
        let json = r#"{
            "businessId": "6f1c1f6e-8f43-4a4f-9f0e-0e6c1f0a1b2c",
            "sessionId": "abc",
            "customerName": "Jane Doe",
            "customerEmail": "Jane@X.com"
        }"#;
        let body: CreateEscalationDto = serde_json::from_str(json).unwrap();
        let new = body.into_new_escalation();
        assert_eq!(new.customer.email, "jane@x.com");
        assert!(new.customer.phone.is_none());
        assert!(new.concern.is_none());
    }
}
