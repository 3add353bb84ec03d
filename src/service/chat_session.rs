// service/chat_session.rs
//
// Lifecycle of one matching cycle:
//
//   WAITING --matched--> MATCHED --both joined--> ACTIVE --end--> ENDED
//      |                    |                        |
//      +--left queue--> ENDED   +--agent dropped--> AGENT_DISCONNECTED
//
// AGENT_DISCONNECTED and ENDED are terminal for the instance; a re-queue
// starts a new ChatSession for the same escalation.
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    models::{
        escalationmodel::Escalation,
        sessionmodel::{ChatSession, EndReason, ParticipantRole, SessionState},
    },
    service::error::ServiceError,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    AgentMatched { agent_id: Uuid },
    PartyJoined { role: ParticipantRole, connection_id: Uuid },
    PartyLeft { role: ParticipantRole, connection_id: Uuid },
    AgentDropped,
    Ended { reason: EndReason },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Transition {
    Unchanged,
    Moved { from: SessionState, to: SessionState },
}

impl Transition {
    pub fn entered(&self, state: SessionState) -> bool {
        matches!(self, Transition::Moved { to, .. } if *to == state)
    }
}

const ROOM_PREFIX: &str = "escalation:";

pub fn room_for(escalation_id: Uuid) -> String {
    format!("{}{}", ROOM_PREFIX, escalation_id)
}

pub fn escalation_from_room(room: &str) -> Option<Uuid> {
    room.strip_prefix(ROOM_PREFIX)
        .and_then(|id| Uuid::parse_str(id).ok())
}

impl ChatSession {
    pub fn waiting(escalation: &Escalation, retry_count: u32, now: DateTime<Utc>) -> Self {
        ChatSession {
            id: Uuid::new_v4(),
            escalation_id: escalation.id,
            business_id: escalation.business_id,
            conversation_id: escalation.session_id.clone(),
            room_id: room_for(escalation.id),
            customer_connection_id: None,
            agent_id: None,
            agent_connection_id: None,
            state: SessionState::Waiting,
            retry_count,
            started_at: now,
            ended_at: None,
            end_reason: None,
        }
    }

    /// Fresh WAITING instance for the same escalation after a re-queue. The
    /// customer's connection carries over; the agent side starts empty.
    pub fn next_cycle(&self, retry_count: u32, now: DateTime<Utc>) -> Self {
        ChatSession {
            id: Uuid::new_v4(),
            escalation_id: self.escalation_id,
            business_id: self.business_id,
            conversation_id: self.conversation_id.clone(),
            room_id: self.room_id.clone(),
            customer_connection_id: self.customer_connection_id,
            agent_id: None,
            agent_connection_id: None,
            state: SessionState::Waiting,
            retry_count,
            started_at: now,
            ended_at: None,
            end_reason: None,
        }
    }

    pub fn both_joined(&self) -> bool {
        self.customer_connection_id.is_some() && self.agent_connection_id.is_some()
    }

    fn move_to(&mut self, to: SessionState, now: DateTime<Utc>) -> Transition {
        let from = self.state;
        self.state = to;
        if to.is_terminal() {
            self.ended_at = Some(now);
        }
        tracing::debug!("session {} {:?} -> {:?}", self.id, from, to);
        Transition::Moved { from, to }
    }

    fn invalid(&self, to: SessionState) -> ServiceError {
        ServiceError::InvalidTransition {
            from: self.state,
            to,
        }
    }

    /// Single entry point for every state change.
    pub fn apply(&mut self, event: SessionEvent, now: DateTime<Utc>) -> Result<Transition, ServiceError> {
        use SessionState::*;

        match (self.state, event) {
            (Waiting, SessionEvent::AgentMatched { agent_id }) => {
                self.agent_id = Some(agent_id);
                Ok(self.move_to(Matched, now))
            }
            (_, SessionEvent::AgentMatched { .. }) => Err(self.invalid(Matched)),

            (Waiting, SessionEvent::PartyJoined { role: ParticipantRole::Customer, connection_id }) => {
                self.customer_connection_id = Some(connection_id);
                Ok(Transition::Unchanged)
            }
            (Matched, SessionEvent::PartyJoined { role, connection_id }) => {
                match role {
                    ParticipantRole::Customer => self.customer_connection_id = Some(connection_id),
                    ParticipantRole::Agent => self.agent_connection_id = Some(connection_id),
                }
                if self.both_joined() {
                    Ok(self.move_to(Active, now))
                } else {
                    Ok(Transition::Unchanged)
                }
            }
            (Active, SessionEvent::PartyJoined { role, connection_id }) => {
                match role {
                    ParticipantRole::Customer => self.customer_connection_id = Some(connection_id),
                    ParticipantRole::Agent => self.agent_connection_id = Some(connection_id),
                }
                Ok(Transition::Unchanged)
            }
            (_, SessionEvent::PartyJoined { .. }) => Err(self.invalid(Active)),

            (state, SessionEvent::PartyLeft { role, connection_id }) => {
                let slot = match role {
                    ParticipantRole::Customer => &mut self.customer_connection_id,
                    ParticipantRole::Agent => &mut self.agent_connection_id,
                };
                if *slot == Some(connection_id) && !state.is_terminal() {
                    *slot = None;
                }
                Ok(Transition::Unchanged)
            }

            (Matched | Active, SessionEvent::AgentDropped) => Ok(self.move_to(AgentDisconnected, now)),
            (AgentDisconnected, SessionEvent::AgentDropped) => Ok(Transition::Unchanged),
            (_, SessionEvent::AgentDropped) => Err(self.invalid(AgentDisconnected)),

            (Waiting | Matched | Active, SessionEvent::Ended { reason }) => {
                self.end_reason = Some(reason);
                Ok(self.move_to(Ended, now))
            }
            (Ended, SessionEvent::Ended { .. }) => Ok(Transition::Unchanged),
            (AgentDisconnected, SessionEvent::Ended { .. }) => Err(self.invalid(Ended)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::escalationmodel::EscalationStatus;

    fn escalation() -> Escalation {
        let now = Utc::now();
        Escalation {
            id: Uuid::new_v4(),
            case_number: "CASE-2024-01-000001".into(),
            business_id: Uuid::new_v4(),
            session_id: "conv-1".into(),
            customer_name: "Jane Doe".into(),
            customer_email: "jane@x.com".into(),
            customer_phone: None,
            concern: Some("Billing".into()),
            description: None,
            status: EscalationStatus::Escalated,
            case_owner: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn joined(role: ParticipantRole, connection_id: Uuid) -> SessionEvent {
        SessionEvent::PartyJoined { role, connection_id }
    }

    #[test]
    fn happy_path_reaches_active_then_ended() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        let (customer, agent_conn, agent) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());

        session.apply(joined(ParticipantRole::Customer, customer), now).unwrap();
        assert_eq!(session.state, SessionState::Waiting);

        let t = session.apply(SessionEvent::AgentMatched { agent_id: agent }, now).unwrap();
        assert!(t.entered(SessionState::Matched));

        let t = session.apply(joined(ParticipantRole::Agent, agent_conn), now).unwrap();
        assert!(t.entered(SessionState::Active));

        let t = session
            .apply(SessionEvent::Ended { reason: EndReason::Agent }, now)
            .unwrap();
        assert!(t.entered(SessionState::Ended));
        assert!(session.ended_at.is_some());

        // ending twice is a no-op
        let t = session
            .apply(SessionEvent::Ended { reason: EndReason::Agent }, now)
            .unwrap();
        assert_eq!(t, Transition::Unchanged);
    }

    #[test]
    fn matched_waits_for_customer_to_rejoin() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        session
            .apply(SessionEvent::AgentMatched { agent_id: Uuid::new_v4() }, now)
            .unwrap();
        session.apply(joined(ParticipantRole::Agent, Uuid::new_v4()), now).unwrap();
        assert_eq!(session.state, SessionState::Matched);

        let t = session.apply(joined(ParticipantRole::Customer, Uuid::new_v4()), now).unwrap();
        assert!(t.entered(SessionState::Active));
    }

    #[test]
    fn agent_drop_is_terminal_for_instance() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        session.apply(joined(ParticipantRole::Customer, Uuid::new_v4()), now).unwrap();
        session
            .apply(SessionEvent::AgentMatched { agent_id: Uuid::new_v4() }, now)
            .unwrap();
        session.apply(joined(ParticipantRole::Agent, Uuid::new_v4()), now).unwrap();

        let t = session.apply(SessionEvent::AgentDropped, now).unwrap();
        assert!(t.entered(SessionState::AgentDisconnected));
        assert_eq!(session.apply(SessionEvent::AgentDropped, now).unwrap(), Transition::Unchanged);
        assert!(session
            .apply(SessionEvent::Ended { reason: EndReason::Agent }, now)
            .is_err());
        assert!(session
            .apply(SessionEvent::AgentMatched { agent_id: Uuid::new_v4() }, now)
            .is_err());
    }

    #[test]
    fn next_cycle_reuses_room_and_customer() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        let customer = Uuid::new_v4();
        session.apply(joined(ParticipantRole::Customer, customer), now).unwrap();
        session
            .apply(SessionEvent::AgentMatched { agent_id: Uuid::new_v4() }, now)
            .unwrap();
        session.apply(SessionEvent::AgentDropped, now).unwrap();

        let next = session.next_cycle(1, now);
        assert_ne!(next.id, session.id);
        assert_eq!(next.room_id, session.room_id);
        assert_eq!(next.state, SessionState::Waiting);
        assert_eq!(next.customer_connection_id, Some(customer));
        assert_eq!(next.agent_id, None);
        assert_eq!(next.retry_count, 1);
    }

    #[test]
    fn leaving_queue_ends_waiting_session() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        let t = session
            .apply(SessionEvent::Ended { reason: EndReason::CustomerLeftQueue }, now)
            .unwrap();
        assert!(t.entered(SessionState::Ended));
        assert_eq!(session.agent_id, None);
        assert_eq!(session.end_reason, Some(EndReason::CustomerLeftQueue));
    }

    #[test]
    fn room_names_round_trip_to_escalation() {
        let id = Uuid::new_v4();
        assert_eq!(escalation_from_room(&room_for(id)), Some(id));
        assert_eq!(escalation_from_room("lobby"), None);
    }

    #[test]
    fn waiting_session_cannot_drop_an_agent() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        assert!(matches!(
            session.apply(SessionEvent::AgentDropped, now),
            Err(ServiceError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn stale_leave_does_not_clear_newer_connection() {
        let now = Utc::now();
        let mut session = ChatSession::waiting(&escalation(), 0, now);
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        session.apply(joined(ParticipantRole::Customer, old), now).unwrap();
        session.apply(joined(ParticipantRole::Customer, new), now).unwrap();
        session
            .apply(SessionEvent::PartyLeft { role: ParticipantRole::Customer, connection_id: old }, now)
            .unwrap();
        assert_eq!(session.customer_connection_id, Some(new));
    }
}
