// service/dedup.rs
//
// Server-side suppression of repeated system notices. The store keeps every
// row; clients still dedup their own rendered history.
use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::chatmodel::{Message, SenderType, SystemMessageType};

fn within(a: DateTime<Utc>, b: DateTime<Utc>, window: Duration) -> bool {
    (a - b).abs() <= window
}

#[derive(Debug, Clone)]
struct Seen {
    session_id: Uuid,
    body: Option<String>,
    kind: Option<SystemMessageType>,
    at: DateTime<Utc>,
}

/// Remembers recently broadcast system messages per session cycle so a
/// rebroadcast inside the window is suppressed. A re-queued chat gets a new
/// session id, so its notices are never held back by the previous cycle.
#[derive(Debug)]
pub struct SystemMessageGuard {
    window: Duration,
    recent: VecDeque<Seen>,
}

impl SystemMessageGuard {
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).unwrap_or_else(|_| Duration::seconds(1)),
            recent: VecDeque::new(),
        }
    }

    /// Returns true when the message should be delivered.
    pub fn admit(&mut self, session_id: Uuid, message: &Message) -> bool {
        if message.sender_type != SenderType::System {
            return true;
        }

        let now = message.created_at;
        let window = self.window;
        while let Some(front) = self.recent.front() {
            if now - front.at > window * 4 {
                self.recent.pop_front();
            } else {
                break;
            }
        }

        let duplicate = self.recent.iter().any(|seen| {
            seen.session_id == session_id
                && seen.body == message.body
                && seen.kind == message.system_message_type
                && within(seen.at, now, window)
        });
        if duplicate {
            tracing::debug!("suppressed duplicate system message in session {}", session_id);
            return false;
        }

        self.recent.push_back(Seen {
            session_id,
            body: message.body.clone(),
            kind: message.system_message_type,
            at: now,
        });
        true
    }
}
