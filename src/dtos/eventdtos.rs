//! Realtime frames exchanged over the chat socket.
//!
//! Every frame is `{"event": "<name>", "data": {...}}`. Inbound frames are
//! decoded into [`ClientEvent`] at the socket boundary; anything that fails to
//! decode never reaches the session state machine.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{
    chatmodel::{Attachment, Message},
    sessionmodel::{EndReason, SessionState},
};

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    #[serde(rename_all = "camelCase")]
    JoinEscalation { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    RequestChat { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    LeaveQueue { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CustomerTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CustomerStoppedTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    AgentTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    AgentStoppedTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    SendMessage {
        escalation_id: Uuid,
        #[serde(default)]
        body: Option<String>,
        #[serde(default)]
        attachments: Vec<Attachment>,
    },
    AgentAvailable,
    AgentUnavailable,
    #[serde(rename_all = "camelCase")]
    EndChat { escalation_id: Uuid },
    Ping,
}

impl ClientEvent {
    pub fn parse(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    Joined {
        escalation_id: Uuid,
        room_id: String,
        state: Option<SessionState>,
        queue_position: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    QueueJoined {
        escalation_id: Uuid,
        position: usize,
        retry_count: u32,
    },
    #[serde(rename_all = "camelCase")]
    ChatStarted {
        escalation_id: Uuid,
        session_id: Uuid,
        room_id: String,
        agent_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    AgentConnected { escalation_id: Uuid, agent_id: Uuid },
    NewMessage(Message),
    SystemMessage(Message),
    #[serde(rename_all = "camelCase")]
    AgentTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    AgentStoppedTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CustomerTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    CustomerStoppedTyping { escalation_id: Uuid },
    #[serde(rename_all = "camelCase")]
    AgentDisconnectedDuringChat {
        escalation_id: Uuid,
        retry_count: u32,
        queue_position: Option<usize>,
    },
    #[serde(rename_all = "camelCase")]
    ChatError { code: String, message: String },
    #[serde(rename_all = "camelCase")]
    ChatEnded { escalation_id: Uuid, reason: EndReason },
    Pong,
}

impl ServerEvent {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        ServerEvent::ChatError {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ServerEvent::AgentTyping { .. }
                | ServerEvent::AgentStoppedTyping { .. }
                | ServerEvent::CustomerTyping { .. }
                | ServerEvent::CustomerStoppedTyping { .. }
                | ServerEvent::Pong
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::Joined { .. } => "joined",
            ServerEvent::QueueJoined { .. } => "queue_joined",
            ServerEvent::ChatStarted { .. } => "chat_started",
            ServerEvent::AgentConnected { .. } => "agent_connected",
            ServerEvent::NewMessage(_) => "new_message",
            ServerEvent::SystemMessage(_) => "system_message",
            ServerEvent::AgentTyping { .. } => "agent_typing",
            ServerEvent::AgentStoppedTyping { .. } => "agent_stopped_typing",
            ServerEvent::CustomerTyping { .. } => "customer_typing",
            ServerEvent::CustomerStoppedTyping { .. } => "customer_stopped_typing",
            ServerEvent::AgentDisconnectedDuringChat { .. } => "agent_disconnected_during_chat",
            ServerEvent::ChatError { .. } => "chat_error",
            ServerEvent::ChatEnded { .. } => "chat_ended",
            ServerEvent::Pong => "pong",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_chat() {
        let id = Uuid::new_v4();
        let frame = format!(r#"{{"event":"request_chat","data":{{"escalationId":"{}"}}}}"#, id);
        assert_eq!(
            ClientEvent::parse(&frame).unwrap(),
            ClientEvent::RequestChat { escalation_id: id }
        );
    }

    #[test]
    fn parses_unit_events_without_data() {
        assert_eq!(ClientEvent::parse(r#"{"event":"ping"}"#).unwrap(), ClientEvent::Ping);
        assert_eq!(
            ClientEvent::parse(r#"{"event":"agent_available"}"#).unwrap(),
            ClientEvent::AgentAvailable
        );
    }

    #[test]
    fn send_message_defaults_attachments() {
        let id = Uuid::new_v4();
        let frame = format!(
            r#"{{"event":"send_message","data":{{"escalationId":"{}","body":"hi"}}}}"#,
            id
        );
        match ClientEvent::parse(&frame).unwrap() {
            ClientEvent::SendMessage { body, attachments, .. } => {
                assert_eq!(body.as_deref(), Some("hi"));
                assert!(attachments.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn rejects_unknown_and_untyped_payloads() {
        assert!(ClientEvent::parse(r#"{"event":"drop_tables"}"#).is_err());
        assert!(ClientEvent::parse(r#"{"event":"request_chat","data":{"escalationId":42}}"#).is_err());
        assert!(ClientEvent::parse("not json").is_err());
    }

    #[test]
    fn server_event_wire_name_matches_tag() {
        let id = Uuid::new_v4();
        let event = ServerEvent::AgentDisconnectedDuringChat {
            escalation_id: id,
            retry_count: 1,
            queue_position: Some(1),
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.name());
        assert_eq!(value["data"]["retryCount"], 1);
    }
}
