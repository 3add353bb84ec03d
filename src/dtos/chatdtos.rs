use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::{chatmodel::SenderType, presencemodel::Availability};

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageDto {
    pub business_id: Uuid,

    #[validate(length(min = 1, message = "Session id is required"))]
    pub session_id: String,

    #[validate(length(min = 1, max = 5000, message = "Message must be 1-5000 characters"))]
    pub message: String,

    pub sender_type: SenderType,

    pub escalation_id: Option<Uuid>,
}

#[derive(Validate, Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskChatbotDto {
    pub business_id: Uuid,

    #[validate(length(min = 1, max = 4000, message = "Query must be 1-4000 characters"))]
    pub query: String,

    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatbotAnswerDto {
    pub answer: String,
    pub session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAvailabilityDto {
    pub business_id: Uuid,
    pub availability: Availability,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct EndChatDto {
    pub agent_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateChatbotSettingsDto {
    pub enable_live_chat: bool,
}
