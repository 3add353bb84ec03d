use thiserror::Error;
use uuid::Uuid;
use crate::{
    error::{ErrorMessage, HttpError},
    models::sessionmodel::SessionState,
};
use axum::http::StatusCode;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Escalation {0} not found")]
    EscalationNotFound(Uuid),

    #[error("Case {0} not found")]
    CaseNotFound(String),

    #[error("Business {0} not found")]
    BusinessNotFound(Uuid),

    #[error("Conversation {0} not found")]
    ConversationNotFound(String),

    #[error("No chat session for escalation {0}")]
    SessionNotFound(Uuid),

    #[error("Live chat is disabled for business {0}")]
    LiveChatDisabled(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Cannot move chat session from {from:?} to {to:?}")]
    InvalidTransition { from: SessionState, to: SessionState },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Upstream error: {0}")]
    Upstream(String),
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        match error {
            ServiceError::LiveChatDisabled(_) => {
                HttpError::forbidden(ErrorMessage::LiveChatDisabled.to_string())
            }
            ServiceError::Database(ref e) => {
                tracing::error!("database failure: {}", e);
                HttpError::server_error(ErrorMessage::StorageUnavailable.to_string())
            }
            ServiceError::Storage(ref e) => {
                tracing::error!("storage failure: {}", e);
                HttpError::server_error(ErrorMessage::StorageUnavailable.to_string())
            }
            ServiceError::Transport(ref e) => {
                tracing::warn!("transport failure surfaced to http: {}", e);
                HttpError::server_error(ErrorMessage::ServerError.to_string())
            }
            _ => HttpError::new(error.to_string(), status),
        }
    }
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_)
            | ServiceError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,

            ServiceError::EscalationNotFound(_)
            | ServiceError::CaseNotFound(_)
            | ServiceError::BusinessNotFound(_)
            | ServiceError::ConversationNotFound(_)
            | ServiceError::SessionNotFound(_) => StatusCode::NOT_FOUND,

            ServiceError::LiveChatDisabled(_) => StatusCode::FORBIDDEN,

            ServiceError::Conflict(_) => StatusCode::CONFLICT,

            ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,

            ServiceError::Transport(_)
            | ServiceError::Database(_)
            | ServiceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code sent with realtime `chat_error` events.
    pub fn code(&self) -> &'static str {
        match self {
            ServiceError::Validation(_) => "validation",
            ServiceError::EscalationNotFound(_)
            | ServiceError::CaseNotFound(_)
            | ServiceError::BusinessNotFound(_)
            | ServiceError::ConversationNotFound(_)
            | ServiceError::SessionNotFound(_) => "not_found",
            ServiceError::LiveChatDisabled(_) => "live_chat_disabled",
            ServiceError::Conflict(_) => "conflict",
            ServiceError::InvalidTransition { .. } => "invalid_transition",
            ServiceError::Transport(_) => "transport",
            ServiceError::Database(_) | ServiceError::Storage(_) => "storage",
            ServiceError::Upstream(_) => "upstream",
        }
    }

    /// Text safe to show an end user. Persistence details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            ServiceError::Database(_) | ServiceError::Storage(_) => {
                ErrorMessage::StorageUnavailable.to_string()
            }
            ServiceError::LiveChatDisabled(_) => ErrorMessage::LiveChatDisabled.to_string(),
            _ => self.to_string(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::Database(_) | ServiceError::Storage(_) | ServiceError::Transport(_)
        )
    }
}
