// service/gateway.rs
//
// Connection registry and room fan-out for the realtime channel. Each socket
// owns a bounded outbound queue; the socket task drains it in order, which
// is what keeps delivery FIFO per sender.
use std::collections::HashSet;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

use crate::{
    dtos::eventdtos::ServerEvent, models::sessionmodel::ParticipantRole,
    service::error::ServiceError,
};

pub const OUTBOUND_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub role: ParticipantRole,
    pub business_id: Uuid,
    pub agent_id: Option<Uuid>,
}

#[derive(Debug)]
struct Connection {
    info: ConnectionInfo,
    sender: mpsc::Sender<ServerEvent>,
    last_seen: Instant,
    rooms: HashSet<String>,
}

/// What is left of a connection after it is unregistered.
#[derive(Debug, Clone)]
pub struct Departed {
    pub info: ConnectionInfo,
    pub rooms: Vec<String>,
}

#[derive(Debug)]
pub struct Gateway {
    connections: DashMap<Uuid, Connection>,
    rooms: DashMap<String, HashSet<Uuid>>,
    agents: DashMap<Uuid, Uuid>,
    capacity: usize,
}

impl Default for Gateway {
    fn default() -> Self {
        Self::with_capacity(OUTBOUND_CAPACITY)
    }
}

impl Gateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Gateway {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            agents: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn register(
        &self,
        role: ParticipantRole,
        business_id: Uuid,
        agent_id: Option<Uuid>,
    ) -> (ConnectionInfo, mpsc::Receiver<ServerEvent>) {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let info = ConnectionInfo {
            id: Uuid::new_v4(),
            role,
            business_id,
            agent_id,
        };

        self.connections.insert(
            info.id,
            Connection {
                info: info.clone(),
                sender,
                last_seen: Instant::now(),
                rooms: HashSet::new(),
            },
        );
        if let Some(agent_id) = agent_id {
            self.agents.insert(agent_id, info.id);
        }

        tracing::info!("connection {} opened as {:?} for business {}", info.id, role, business_id);
        (info, receiver)
    }

    pub fn connection(&self, connection_id: Uuid) -> Option<ConnectionInfo> {
        self.connections.get(&connection_id).map(|c| c.info.clone())
    }

    /// Latest live connection of an agent.
    pub fn agent_connection(&self, agent_id: Uuid) -> Option<Uuid> {
        self.agents
            .get(&agent_id)
            .map(|c| *c)
            .filter(|id| self.connections.contains_key(id))
    }

    /// Rejoining a room the connection is already in is a no-op.
    pub fn join(&self, connection_id: Uuid, room: &str) -> Result<(), ServiceError> {
        {
            let mut connection = self
                .connections
                .get_mut(&connection_id)
                .ok_or_else(|| ServiceError::Transport(format!("connection {} is closed", connection_id)))?;
            connection.rooms.insert(room.to_string());
        }
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
        tracing::debug!("connection {} joined {}", connection_id, room);
        Ok(())
    }

    pub fn leave(&self, connection_id: Uuid, room: &str) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.rooms.remove(room);
        }
        self.remove_member(room, connection_id);
    }

    fn remove_member(&self, room: &str, connection_id: Uuid) {
        let now_empty = match self.rooms.get_mut(room) {
            Some(mut members) => {
                members.remove(&connection_id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.rooms.remove_if(room, |_, members| members.is_empty());
        }
    }

    pub fn members(&self, room: &str) -> Vec<Uuid> {
        self.rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Queues one event for one connection. Typing signals are dropped
    /// silently when the connection is backed up.
    pub fn send_to(&self, connection_id: Uuid, event: ServerEvent) -> Result<(), ServiceError> {
        let sender = self
            .connections
            .get(&connection_id)
            .map(|c| c.sender.clone())
            .ok_or_else(|| ServiceError::Transport(format!("connection {} is closed", connection_id)))?;

        match sender.try_send(event) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(event)) if event.is_transient() => {
                tracing::debug!("dropped {} for busy connection {}", event.name(), connection_id);
                Ok(())
            }
            Err(TrySendError::Full(event)) => Err(ServiceError::Transport(format!(
                "outbound buffer full for {}, dropped {}",
                connection_id,
                event.name()
            ))),
            Err(TrySendError::Closed(event)) => Err(ServiceError::Transport(format!(
                "connection {} closed before {} was delivered",
                connection_id,
                event.name()
            ))),
        }
    }

    pub fn send_to_agent(&self, agent_id: Uuid, event: ServerEvent) -> Result<(), ServiceError> {
        let connection_id = self
            .agent_connection(agent_id)
            .ok_or_else(|| ServiceError::Transport(format!("agent {} has no live connection", agent_id)))?;
        self.send_to(connection_id, event)
    }

    /// Fans out to every member of the room except `except`. Delivery
    /// failures are logged and do not stop the fan-out. Returns how many
    /// members received the event.
    pub fn emit(&self, room: &str, event: ServerEvent, except: Option<Uuid>) -> usize {
        self.emit_filtered(room, event, |info| Some(info.id) != except)
    }

    /// Fans out to the members that do not hold `role`.
    pub fn emit_to_others_of(&self, room: &str, event: ServerEvent, role: ParticipantRole) -> usize {
        self.emit_filtered(room, event, |info| info.role != role)
    }

    fn emit_filtered<F>(&self, room: &str, event: ServerEvent, include: F) -> usize
    where
        F: Fn(&ConnectionInfo) -> bool,
    {
        let mut delivered = 0;
        for member in self.members(room) {
            let Some(info) = self.connection(member) else {
                continue;
            };
            if !include(&info) {
                continue;
            }
            match self.send_to(member, event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => tracing::warn!("{} in room {}: {}", event.name(), room, e),
            }
        }
        delivered
    }

    pub fn touch(&self, connection_id: Uuid) {
        if let Some(mut connection) = self.connections.get_mut(&connection_id) {
            connection.last_seen = Instant::now();
        }
    }

    /// Connections that have been silent for longer than `timeout`.
    pub fn expired(&self, timeout: Duration, now: Instant) -> Vec<Uuid> {
        self.connections
            .iter()
            .filter(|c| now.saturating_duration_since(c.last_seen) > timeout)
            .map(|c| *c.key())
            .collect()
    }

    /// Removes the connection and its room memberships. Dropping the sender
    /// ends the socket's outbound task.
    pub fn unregister(&self, connection_id: Uuid) -> Option<Departed> {
        let (_, connection) = self.connections.remove(&connection_id)?;
        for room in &connection.rooms {
            self.remove_member(room, connection_id);
        }
        if let Some(agent_id) = connection.info.agent_id {
            self.agents.remove_if(&agent_id, |_, current| *current == connection_id);
        }

        tracing::info!("connection {} closed", connection_id);
        Some(Departed {
            info: connection.info,
            rooms: connection.rooms.into_iter().collect(),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}
