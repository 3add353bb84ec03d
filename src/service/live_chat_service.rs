// service/live_chat_service.rs
//
// Drives chat sessions from realtime frames, REST calls and background
// sweeps. Every state change for an escalation happens while holding that
// escalation's session lock; the queue and agent pool are touched only
// through QueueService.
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use tokio::{sync::Mutex, task::JoinHandle};
use uuid::Uuid;

use crate::{
    config::Config,
    db::{conversationdb::ConversationExt, escalationdb::EscalationExt, messagedb::MessageExt, SupportStore},
    dtos::eventdtos::{ClientEvent, ServerEvent},
    models::{
        chatmodel::{Attachment, Message, NewMessage, SenderType, SystemMessageType},
        escalationmodel::Escalation,
        presencemodel::{AgentPresence, Availability},
        sessionmodel::{ChatSession, EndReason, ParticipantRole, SessionState},
    },
    service::{
        activity_service::ActivityService,
        chat_session::{escalation_from_room, room_for, SessionEvent, Transition},
        dedup::SystemMessageGuard,
        error::ServiceError,
        gateway::{ConnectionInfo, Departed, Gateway},
        queue_service::{Assignment, QueueService},
    },
};

pub const CONNECTED_TO_AGENT: &str = "You are now connected to an agent.";
pub const AGENT_DISCONNECTED: &str = "Agent has disconnected. You will be reassigned.";
pub const CHAT_ENDED: &str = "This chat has ended.";
pub const QUEUE_TIMEOUT: &str = "No agent is available right now. Please try again later.";

type SessionCell = Arc<Mutex<ChatSession>>;

/// Grace-period task for a dropped agent, tagged so a finished task only
/// clears its own entry.
#[derive(Debug)]
struct PendingDrop {
    token: Uuid,
    handle: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MatchOutcome {
    Started,
    /// Agent released and the entry dropped; the pool may match again.
    Discarded,
    /// Agent released and the entry put back for a later pass.
    Deferred,
}

/// Who asked for a chat to end.
#[derive(Debug, Clone, Copy)]
pub enum EndedBy<'a> {
    Connection(&'a ConnectionInfo),
    Agent(Uuid),
    System,
}

impl EndedBy<'_> {
    fn reason(&self) -> EndReason {
        match self {
            EndedBy::Connection(info) => match info.role {
                ParticipantRole::Customer => EndReason::Customer,
                ParticipantRole::Agent => EndReason::Agent,
            },
            EndedBy::Agent(_) => EndReason::Agent,
            EndedBy::System => EndReason::System,
        }
    }
}

fn sender_for(role: ParticipantRole) -> SenderType {
    match role {
        ParticipantRole::Customer => SenderType::Customer,
        ParticipantRole::Agent => SenderType::Agent,
    }
}

fn role_for(sender: SenderType) -> Option<ParticipantRole> {
    match sender {
        SenderType::Customer => Some(ParticipantRole::Customer),
        SenderType::Agent => Some(ParticipantRole::Agent),
        SenderType::Ai | SenderType::System => None,
    }
}

fn typing_event(role: ParticipantRole, escalation_id: Uuid, typing: bool) -> ServerEvent {
    match (role, typing) {
        (ParticipantRole::Customer, true) => ServerEvent::CustomerTyping { escalation_id },
        (ParticipantRole::Customer, false) => ServerEvent::CustomerStoppedTyping { escalation_id },
        (ParticipantRole::Agent, true) => ServerEvent::AgentTyping { escalation_id },
        (ParticipantRole::Agent, false) => ServerEvent::AgentStoppedTyping { escalation_id },
    }
}

fn require_agent(info: &ConnectionInfo) -> Result<Uuid, ServiceError> {
    match (info.role, info.agent_id) {
        (ParticipantRole::Agent, Some(agent_id)) => Ok(agent_id),
        _ => Err(ServiceError::Validation(
            "this action needs an agent connection".to_string(),
        )),
    }
}

#[derive(Debug)]
pub struct LiveChatService {
    config: Config,
    store: Arc<dyn SupportStore>,
    queue: Arc<QueueService>,
    gateway: Arc<Gateway>,
    activity: ActivityService,
    sessions: DashMap<Uuid, SessionCell>,
    typing: DashMap<(Uuid, ParticipantRole), JoinHandle<()>>,
    pending_drops: DashMap<Uuid, PendingDrop>,
    system_guard: SyncMutex<SystemMessageGuard>,
}

impl LiveChatService {
    pub fn new(
        config: Config,
        store: Arc<dyn SupportStore>,
        queue: Arc<QueueService>,
        gateway: Arc<Gateway>,
    ) -> Self {
        let system_guard = SyncMutex::new(SystemMessageGuard::new(config.dedup_window()));
        Self {
            activity: ActivityService::new(store.clone()),
            config,
            store,
            queue,
            gateway,
            sessions: DashMap::new(),
            typing: DashMap::new(),
            pending_drops: DashMap::new(),
            system_guard,
        }
    }

    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    fn session_cell(&self, escalation_id: Uuid) -> Option<SessionCell> {
        self.sessions.get(&escalation_id).map(|cell| cell.clone())
    }

    /// Current session instance for an escalation, if any.
    pub async fn session(&self, escalation_id: Uuid) -> Option<ChatSession> {
        let cell = self.session_cell(escalation_id)?;
        let session = cell.lock().await;
        Some(session.clone())
    }

    async fn escalation_for(&self, escalation_id: Uuid, business_id: Uuid) -> Result<Escalation, ServiceError> {
        self.store
            .get_escalation(escalation_id)
            .await?
            .filter(|e| e.business_id == business_id)
            .ok_or(ServiceError::EscalationNotFound(escalation_id))
    }

    fn ensure_participant(&self, session: &ChatSession, info: &ConnectionInfo) -> Result<(), ServiceError> {
        let allowed = match info.role {
            ParticipantRole::Customer => session.customer_connection_id == Some(info.id),
            ParticipantRole::Agent => info.agent_id.is_some() && session.agent_id == info.agent_id,
        };
        if !allowed {
            return Err(ServiceError::Conflict(format!(
                "connection {} is not part of the chat for escalation {}",
                info.id, session.escalation_id
            )));
        }
        Ok(())
    }

    // ---- realtime entry points -------------------------------------------

    /// Decodes one inbound socket frame and runs it. Failures go back to the
    /// sender as `chat_error` instead of closing the socket.
    pub async fn handle_frame(&self, connection_id: Uuid, frame: &str) {
        self.gateway.touch(connection_id);

        let event = match ClientEvent::parse(frame) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!("invalid frame from {}: {}", connection_id, e);
                let _ = self
                    .gateway
                    .send_to(connection_id, ServerEvent::error("invalid_event", e.to_string()));
                return;
            }
        };

        if let Err(e) = self.dispatch(connection_id, event).await {
            if e.is_retryable() {
                tracing::error!("realtime event from {} failed: {}", connection_id, e);
            } else {
                tracing::debug!("realtime event from {} rejected: {}", connection_id, e);
            }
            if let Err(send_err) = self
                .gateway
                .send_to(connection_id, ServerEvent::error(e.code(), e.client_message()))
            {
                tracing::warn!("could not report error to {}: {}", connection_id, send_err);
            }
        }
    }

    /// Single entry point for every client event.
    pub async fn dispatch(&self, connection_id: Uuid, event: ClientEvent) -> Result<(), ServiceError> {
        let info = self
            .gateway
            .connection(connection_id)
            .ok_or_else(|| ServiceError::Transport(format!("connection {} is closed", connection_id)))?;

        match event {
            ClientEvent::JoinEscalation { escalation_id } => self.join_escalation(&info, escalation_id).await,
            ClientEvent::RequestChat { escalation_id } => self.request_chat(&info, escalation_id).await,
            ClientEvent::LeaveQueue { escalation_id } => self.leave_queue(&info, escalation_id).await,
            ClientEvent::CustomerTyping { escalation_id } => {
                self.typing(&info, escalation_id, ParticipantRole::Customer, true).await
            }
            ClientEvent::CustomerStoppedTyping { escalation_id } => {
                self.typing(&info, escalation_id, ParticipantRole::Customer, false).await
            }
            ClientEvent::AgentTyping { escalation_id } => {
                self.typing(&info, escalation_id, ParticipantRole::Agent, true).await
            }
            ClientEvent::AgentStoppedTyping { escalation_id } => {
                self.typing(&info, escalation_id, ParticipantRole::Agent, false).await
            }
            ClientEvent::SendMessage {
                escalation_id,
                body,
                attachments,
            } => self
                .send_message(&info, escalation_id, body, attachments)
                .await
                .map(|_| ()),
            ClientEvent::AgentAvailable => self.agent_available(&info).await,
            ClientEvent::AgentUnavailable => self.agent_unavailable(&info),
            ClientEvent::EndChat { escalation_id } => {
                self.end_chat(escalation_id, EndedBy::Connection(&info)).await
            }
            ClientEvent::Ping => self.gateway.send_to(connection_id, ServerEvent::Pong),
        }
    }

    async fn join_escalation(&self, info: &ConnectionInfo, escalation_id: Uuid) -> Result<(), ServiceError> {
        self.escalation_for(escalation_id, info.business_id).await?;
        let room = room_for(escalation_id);

        let Some(cell) = self.session_cell(escalation_id) else {
            if info.role == ParticipantRole::Agent {
                return Err(ServiceError::SessionNotFound(escalation_id));
            }
            self.gateway.join(info.id, &room)?;
            return self.gateway.send_to(
                info.id,
                ServerEvent::Joined {
                    escalation_id,
                    room_id: room,
                    state: None,
                    queue_position: self.queue.position(escalation_id),
                },
            );
        };

        let mut session = cell.lock().await;
        let mut transition = Transition::Unchanged;

        if session.state.is_terminal() {
            if info.role == ParticipantRole::Agent {
                return Err(ServiceError::SessionNotFound(escalation_id));
            }
            self.gateway.join(info.id, &room)?;
        } else {
            if info.role == ParticipantRole::Agent {
                let agent_id = require_agent(info)?;
                if session.agent_id != Some(agent_id) {
                    return Err(ServiceError::Conflict(format!(
                        "escalation {} is not assigned to agent {}",
                        escalation_id, agent_id
                    )));
                }
                self.cancel_pending_drop(agent_id);
            }
            self.gateway.join(info.id, &room)?;
            transition = session.apply(
                SessionEvent::PartyJoined {
                    role: info.role,
                    connection_id: info.id,
                },
                Utc::now(),
            )?;
        }

        self.gateway.send_to(
            info.id,
            ServerEvent::Joined {
                escalation_id,
                room_id: session.room_id.clone(),
                state: Some(session.state),
                queue_position: self.queue.position(escalation_id),
            },
        )?;

        if transition.entered(SessionState::Active) {
            self.on_active(&session).await?;
        }
        Ok(())
    }

    async fn on_active(&self, session: &ChatSession) -> Result<(), ServiceError> {
        tracing::info!(
            "chat for escalation {} is live with agent {:?}",
            session.escalation_id,
            session.agent_id
        );

        let persisted = self
            .append_system(session, SystemMessageType::AgentConnected, CONNECTED_TO_AGENT)
            .await;
        if let Ok(message) = &persisted {
            self.broadcast_system(session, message.clone());
        }

        if let Some(agent_id) = session.agent_id {
            self.gateway.emit(
                &session.room_id,
                ServerEvent::AgentConnected {
                    escalation_id: session.escalation_id,
                    agent_id,
                },
                None,
            );
            self.note_activity(
                self.activity
                    .log_live_chat_connected(session.escalation_id, agent_id)
                    .await,
            );
        }

        persisted.map(|_| ())
    }

    async fn request_chat(&self, info: &ConnectionInfo, escalation_id: Uuid) -> Result<(), ServiceError> {
        if info.role != ParticipantRole::Customer {
            return Err(ServiceError::Validation(
                "only customers can request a live chat".to_string(),
            ));
        }
        let escalation = self.escalation_for(escalation_id, info.business_id).await?;
        let settings = self
            .store
            .get_chatbot_settings(info.business_id)
            .await?
            .ok_or(ServiceError::BusinessNotFound(info.business_id))?;
        if !settings.enable_live_chat {
            return Err(ServiceError::LiveChatDisabled(info.business_id));
        }

        self.gateway.join(info.id, &room_for(escalation_id))?;
        let cell = self.open_session(&escalation).await;

        {
            let mut session = cell.lock().await;
            let transition = session.apply(
                SessionEvent::PartyJoined {
                    role: ParticipantRole::Customer,
                    connection_id: info.id,
                },
                Utc::now(),
            )?;

            if session.state != SessionState::Waiting {
                // Already matched: a repeated request just resends the pairing.
                if let Some(agent_id) = session.agent_id {
                    self.gateway.send_to(
                        info.id,
                        ServerEvent::ChatStarted {
                            escalation_id,
                            session_id: session.id,
                            room_id: session.room_id.clone(),
                            agent_id,
                        },
                    )?;
                }
                if transition.entered(SessionState::Active) {
                    self.on_active(&session).await?;
                }
                return Ok(());
            }

            let outcome = self.queue.enqueue(escalation_id, info.business_id);
            self.gateway.send_to(
                info.id,
                ServerEvent::QueueJoined {
                    escalation_id,
                    position: outcome.position,
                    retry_count: outcome.retry_count,
                },
            )?;
        }

        self.run_matching(info.business_id).await;
        Ok(())
    }

    /// Reuses a live session or starts a new WAITING cycle.
    async fn open_session(&self, escalation: &Escalation) -> SessionCell {
        if let Some(cell) = self.session_cell(escalation.id) {
            let terminal = cell.lock().await.state.is_terminal();
            if !terminal {
                return cell;
            }
        }
        let session = ChatSession::waiting(escalation, self.queue.retry_count(escalation.id), Utc::now());
        let cell = Arc::new(Mutex::new(session));
        self.sessions.insert(escalation.id, cell.clone());
        cell
    }

    /// Pairs waiting escalations with available agents until one side runs
    /// out. Returns how many chats were started.
    pub async fn run_matching(&self, business_id: Uuid) -> usize {
        let mut started = 0;
        loop {
            let assignments = self.queue.match_all(business_id);
            if assignments.is_empty() {
                break;
            }
            let mut released = false;
            let mut deferred = false;
            for assignment in assignments {
                match self.start_match(assignment).await {
                    MatchOutcome::Started => started += 1,
                    MatchOutcome::Discarded => released = true,
                    MatchOutcome::Deferred => deferred = true,
                }
            }
            if !released || deferred {
                break;
            }
        }
        started
    }

    async fn start_match(&self, assignment: Assignment) -> MatchOutcome {
        let escalation_id = assignment.entry.escalation_id;
        let agent_id = assignment.agent_id;

        let Some(mut cell) = self.session_cell(escalation_id) else {
            tracing::warn!("matched escalation {} has no session, releasing agent {}", escalation_id, agent_id);
            self.queue.release_agent(agent_id);
            return MatchOutcome::Discarded;
        };
        let mut session = loop {
            let mut session = cell.clone().lock_owned().await;
            let Err(e) = session.apply(SessionEvent::AgentMatched { agent_id }, Utc::now()) else {
                break session;
            };
            let terminal = session.state.is_terminal();
            drop(session);

            // the cell may have been replaced by a new cycle while we waited
            match self.session_cell(escalation_id) {
                Some(current) if !Arc::ptr_eq(&current, &cell) => {
                    cell = current;
                    continue;
                }
                _ => {}
            }

            self.queue.release_agent(agent_id);
            if terminal {
                tracing::warn!("discarding match for ended escalation {}: {}", escalation_id, e);
                return MatchOutcome::Discarded;
            }
            tracing::warn!("escalation {} cannot take agent yet ({}), keeping it queued", escalation_id, e);
            self.queue.restore(assignment.entry);
            return MatchOutcome::Deferred;
        };
        session.retry_count = assignment.entry.retry_count;

        let event = ServerEvent::ChatStarted {
            escalation_id,
            session_id: session.id,
            room_id: session.room_id.clone(),
            agent_id,
        };
        self.gateway
            .emit_to_others_of(&session.room_id, event.clone(), ParticipantRole::Agent);
        if let Err(e) = self.gateway.send_to_agent(agent_id, event) {
            tracing::warn!("chat_started not delivered to agent {}: {}", agent_id, e);
        }
        MatchOutcome::Started
    }

    pub async fn send_message(
        &self,
        info: &ConnectionInfo,
        escalation_id: Uuid,
        body: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, ServiceError> {
        let cell = self
            .session_cell(escalation_id)
            .ok_or(ServiceError::SessionNotFound(escalation_id))?;
        let session = cell.lock().await;
        if session.state != SessionState::Active {
            return Err(ServiceError::SessionNotFound(escalation_id));
        }
        self.ensure_participant(&session, info)?;

        let new = NewMessage {
            business_id: session.business_id,
            session_id: session.conversation_id.clone(),
            escalation_id: Some(escalation_id),
            sender_type: sender_for(info.role),
            body: body.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()),
            system_message_type: None,
            attachments,
        };
        if !new.has_content() {
            return Err(ServiceError::Validation(
                "message needs a body or an attachment".to_string(),
            ));
        }

        // persist first; live delivery is best effort
        let message = self.store.append_message(new).await?;

        if self.cancel_typing_timer(escalation_id, info.role) {
            self.gateway.emit(
                &session.room_id,
                typing_event(info.role, escalation_id, false),
                Some(info.id),
            );
        }
        self.gateway
            .emit(&session.room_id, ServerEvent::NewMessage(message.clone()), Some(info.id));
        Ok(message)
    }

    async fn typing(
        &self,
        info: &ConnectionInfo,
        escalation_id: Uuid,
        role: ParticipantRole,
        typing: bool,
    ) -> Result<(), ServiceError> {
        if info.role != role {
            return Err(ServiceError::Validation(
                "typing event does not match the connection role".to_string(),
            ));
        }
        let Some(cell) = self.session_cell(escalation_id) else {
            return Ok(());
        };
        let room = {
            let session = cell.lock().await;
            if session.state != SessionState::Active || self.ensure_participant(&session, info).is_err() {
                return Ok(());
            }
            session.room_id.clone()
        };

        if typing {
            self.gateway
                .emit(&room, typing_event(role, escalation_id, true), Some(info.id));
            self.schedule_typing_stop(escalation_id, role, room, info.id);
        } else {
            self.cancel_typing_timer(escalation_id, role);
            self.gateway
                .emit(&room, typing_event(role, escalation_id, false), Some(info.id));
        }
        Ok(())
    }

    fn schedule_typing_stop(&self, escalation_id: Uuid, role: ParticipantRole, room: String, from: Uuid) {
        let gateway = self.gateway.clone();
        let idle = self.config.typing_idle();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(idle).await;
            gateway.emit(&room, typing_event(role, escalation_id, false), Some(from));
        });
        if let Some(previous) = self.typing.insert((escalation_id, role), handle) {
            previous.abort();
        }
    }

    /// Returns true when a typing indicator was still running.
    fn cancel_typing_timer(&self, escalation_id: Uuid, role: ParticipantRole) -> bool {
        match self.typing.remove(&(escalation_id, role)) {
            Some((_, handle)) => {
                let running = !handle.is_finished();
                handle.abort();
                running
            }
            None => false,
        }
    }

    fn cancel_all_typing(&self, escalation_id: Uuid) {
        self.cancel_typing_timer(escalation_id, ParticipantRole::Customer);
        self.cancel_typing_timer(escalation_id, ParticipantRole::Agent);
    }

    async fn agent_available(&self, info: &ConnectionInfo) -> Result<(), ServiceError> {
        let agent_id = require_agent(info)?;
        self.cancel_pending_drop(agent_id);
        self.queue
            .set_agent_available(agent_id, info.business_id, Some(info.id));
        self.run_matching(info.business_id).await;
        Ok(())
    }

    fn agent_unavailable(&self, info: &ConnectionInfo) -> Result<(), ServiceError> {
        let agent_id = require_agent(info)?;
        self.queue.set_agent_offline(agent_id);
        Ok(())
    }

    async fn leave_queue(&self, info: &ConnectionInfo, escalation_id: Uuid) -> Result<(), ServiceError> {
        if info.role != ParticipantRole::Customer {
            return Err(ServiceError::Validation(
                "only customers can leave the queue".to_string(),
            ));
        }
        if self.session_cell(escalation_id).is_none() {
            self.queue.dequeue(escalation_id);
            return Ok(());
        }
        self.end_chat(escalation_id, EndedBy::Connection(info)).await
    }

    /// Explicit end. A customer ending a chat that is still WAITING counts as
    /// leaving the queue. Ending twice is a no-op.
    pub async fn end_chat(&self, escalation_id: Uuid, ended_by: EndedBy<'_>) -> Result<(), ServiceError> {
        let cell = self
            .session_cell(escalation_id)
            .ok_or(ServiceError::SessionNotFound(escalation_id))?;

        let business_id = {
            let mut session = cell.lock().await;
            match ended_by {
                EndedBy::Connection(info) => self.ensure_participant(&session, info)?,
                EndedBy::Agent(agent_id) if session.agent_id != Some(agent_id) => {
                    return Err(ServiceError::Conflict(format!(
                        "escalation {} is not assigned to agent {}",
                        escalation_id, agent_id
                    )));
                }
                _ => {}
            }

            let reason = match (session.state, ended_by.reason()) {
                (SessionState::Waiting, EndReason::Customer) => EndReason::CustomerLeftQueue,
                (_, reason) => reason,
            };
            match self.close(&mut session, reason).await? {
                true => session.business_id,
                false => return Ok(()),
            }
        };

        self.run_matching(business_id).await;
        Ok(())
    }

    /// Moves the session to ENDED and releases what it held. Returns false
    /// when it had already ended.
    async fn close(&self, session: &mut ChatSession, reason: EndReason) -> Result<bool, ServiceError> {
        if session.state.is_terminal() {
            session.apply(SessionEvent::Ended { reason }, Utc::now())?;
            return Ok(false);
        }
        if session.state == SessionState::Waiting {
            self.queue.dequeue(session.escalation_id);
        }

        let notice = match (session.state, reason) {
            (_, EndReason::QueueTimeout) => Some((SystemMessageType::QueueTimeout, QUEUE_TIMEOUT)),
            (SessionState::Active, _) => Some((SystemMessageType::ChatEnded, CHAT_ENDED)),
            _ => None,
        };
        if let Some((kind, body)) = notice {
            match self.append_system(session, kind, body).await {
                Ok(message) => self.broadcast_system(session, message),
                Err(e) => tracing::error!(
                    "closing notice for escalation {} not stored: {}",
                    session.escalation_id,
                    e
                ),
            }
        }

        session.apply(SessionEvent::Ended { reason }, Utc::now())?;
        tracing::info!("chat for escalation {} ended ({:?})", session.escalation_id, reason);
        self.finish_session(session, reason).await;
        Ok(true)
    }

    async fn finish_session(&self, session: &ChatSession, reason: EndReason) {
        let escalation_id = session.escalation_id;
        self.cancel_all_typing(escalation_id);
        self.queue.forget(escalation_id);

        let event = ServerEvent::ChatEnded { escalation_id, reason };
        self.gateway.emit(&session.room_id, event.clone(), None);

        if let Some(agent_id) = session.agent_id {
            match session.agent_connection_id {
                Some(connection_id) => self.gateway.leave(connection_id, &session.room_id),
                None => {
                    if let Err(e) = self.gateway.send_to_agent(agent_id, event) {
                        tracing::debug!("chat_ended not delivered to agent {}: {}", agent_id, e);
                    }
                }
            }
            self.queue.release_agent(agent_id);
        }

        self.note_activity(self.activity.log_live_chat_ended(escalation_id, reason).await);
    }

    // ---- disconnects ------------------------------------------------------

    /// Socket closed or went silent. Never ends a chat: a dropped agent is
    /// surfaced as AGENT_DISCONNECTED after the reconnect grace period.
    pub async fn handle_disconnect(self: &Arc<Self>, connection_id: Uuid) {
        let Some(departed) = self.gateway.unregister(connection_id) else {
            return;
        };
        match departed.info.role {
            ParticipantRole::Customer => self.customer_dropped(&departed).await,
            ParticipantRole::Agent => {
                if let Some(agent_id) = departed.info.agent_id {
                    self.agent_connection_lost(agent_id, connection_id).await;
                }
            }
        }
    }

    async fn customer_dropped(&self, departed: &Departed) {
        for room in &departed.rooms {
            let Some(escalation_id) = escalation_from_room(room) else {
                continue;
            };
            let Some(cell) = self.session_cell(escalation_id) else {
                continue;
            };
            let mut session = cell.lock().await;
            let _ = session.apply(
                SessionEvent::PartyLeft {
                    role: ParticipantRole::Customer,
                    connection_id: departed.info.id,
                },
                Utc::now(),
            );
            if self.cancel_typing_timer(escalation_id, ParticipantRole::Customer) {
                self.gateway.emit(
                    room,
                    typing_event(ParticipantRole::Customer, escalation_id, false),
                    None,
                );
            }
            tracing::info!(
                "customer connection {} left escalation {} ({:?})",
                departed.info.id,
                escalation_id,
                session.state
            );
        }
    }

    async fn agent_connection_lost(self: &Arc<Self>, agent_id: Uuid, connection_id: Uuid) {
        self.queue.clear_agent_connection(agent_id, connection_id);
        if self.gateway.agent_connection(agent_id).is_some() {
            return;
        }

        let grace = self.config.agent_reconnect_grace();
        if grace.is_zero() {
            self.agent_gone(agent_id).await;
            return;
        }

        tracing::info!("agent {} dropped, waiting {:?} for a reconnect", agent_id, grace);
        let this = Arc::clone(self);
        let token = Uuid::new_v4();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            if this.gateway.agent_connection(agent_id).is_none() {
                this.agent_gone(agent_id).await;
            }
            this.pending_drops
                .remove_if(&agent_id, |_, pending| pending.token == token);
        });
        if let Some(previous) = self.pending_drops.insert(agent_id, PendingDrop { token, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_pending_drop(&self, agent_id: Uuid) {
        if let Some((_, pending)) = self.pending_drops.remove(&agent_id) {
            pending.handle.abort();
        }
    }

    /// Going offline keeps the agent's escalation; only this path and
    /// `release_agent` let go of it.
    async fn agent_gone(&self, agent_id: Uuid) {
        let active = self.queue.agent(agent_id).and_then(|p| p.active_escalation);
        self.queue.set_agent_offline(agent_id);
        tracing::warn!("agent {} is gone", agent_id);

        if let Some(escalation_id) = active {
            if let Err(e) = self.agent_dropped(escalation_id, agent_id).await {
                tracing::error!("re-queue of escalation {} failed: {}", escalation_id, e);
            }
        }
        self.queue.release_agent(agent_id);
    }

    /// ACTIVE (or MATCHED) session lost its agent without an end signal:
    /// notify the customer, re-queue with a bumped retry count and start a
    /// new WAITING cycle.
    async fn agent_dropped(&self, escalation_id: Uuid, agent_id: Uuid) -> Result<(), ServiceError> {
        let cell = self
            .session_cell(escalation_id)
            .ok_or(ServiceError::SessionNotFound(escalation_id))?;

        let business_id = {
            let mut session = cell.lock().await;
            if session.agent_id != Some(agent_id) {
                return Ok(());
            }
            let now = Utc::now();
            let transition = session.apply(SessionEvent::AgentDropped, now)?;
            if !transition.entered(SessionState::AgentDisconnected) {
                return Ok(());
            }
            self.cancel_all_typing(escalation_id);

            let persisted = self
                .append_system(&session, SystemMessageType::AgentDisconnected, AGENT_DISCONNECTED)
                .await;
            if let Some(connection_id) = session.agent_connection_id {
                self.gateway.leave(connection_id, &session.room_id);
            }

            // The new cycle must be current before its entry is visible to
            // matching. It stays locked until the customer has been told.
            let next_cell = Arc::new(Mutex::new(
                session.next_cycle(self.queue.retry_count(escalation_id) + 1, now),
            ));
            let mut next = next_cell.lock().await;
            self.sessions.insert(escalation_id, next_cell.clone());
            let outcome = self
                .queue
                .requeue_after_disconnect(escalation_id, session.business_id);
            next.retry_count = outcome.retry_count;

            match persisted {
                Ok(message) => self.broadcast_system(&session, message),
                Err(e) => tracing::error!(
                    "disconnect notice for escalation {} not stored: {}",
                    escalation_id,
                    e
                ),
            }
            self.gateway.emit(
                &session.room_id,
                ServerEvent::AgentDisconnectedDuringChat {
                    escalation_id,
                    retry_count: outcome.retry_count,
                    queue_position: Some(outcome.position),
                },
                None,
            );
            drop(next);

            self.note_activity(
                self.activity
                    .log_agent_disconnected(escalation_id, agent_id, outcome.retry_count)
                    .await,
            );
            session.business_id
        };

        self.run_matching(business_id).await;
        Ok(())
    }

    // ---- sweeps -----------------------------------------------------------

    /// Treats connections that stopped sending frames as dropped.
    pub async fn sweep_heartbeats(self: &Arc<Self>) -> usize {
        let expired = self
            .gateway
            .expired(self.config.heartbeat_timeout(), Instant::now());
        for connection_id in &expired {
            tracing::warn!("connection {} missed its heartbeat", connection_id);
            self.handle_disconnect(*connection_id).await;
        }
        expired.len()
    }

    /// Abandonment policy. Only active when a maximum wait is configured.
    pub async fn expire_abandoned(&self, now: DateTime<Utc>) -> usize {
        let Some(max_wait) = self.config.max_queue_wait_secs else {
            return 0;
        };
        let expired = self
            .queue
            .expire_waiting(chrono::Duration::seconds(max_wait as i64), now);

        for entry in &expired {
            let Some(cell) = self.session_cell(entry.escalation_id) else {
                continue;
            };
            let mut session = cell.lock().await;
            if session.state != SessionState::Waiting {
                continue;
            }
            if let Err(e) = self.close(&mut session, EndReason::QueueTimeout).await {
                tracing::error!("queue timeout for escalation {} failed: {}", entry.escalation_id, e);
            }
        }
        expired.len()
    }

    // ---- REST surface -----------------------------------------------------

    /// Rejects a REST post that could never be stored. Uploads run this
    /// before writing the file.
    pub async fn check_post(
        &self,
        business_id: Uuid,
        session_id: &str,
        escalation_id: Option<Uuid>,
        sender_type: SenderType,
    ) -> Result<(), ServiceError> {
        if sender_type == SenderType::System {
            return Err(ServiceError::Validation(
                "system messages are generated by the server".to_string(),
            ));
        }
        self.store
            .get_conversation(session_id)
            .await?
            .filter(|c| c.business_id == business_id)
            .ok_or_else(|| ServiceError::ConversationNotFound(session_id.to_string()))?;

        if let Some(escalation_id) = escalation_id {
            let escalation = self.escalation_for(escalation_id, business_id).await?;
            if escalation.session_id != session_id {
                return Err(ServiceError::Validation(
                    "escalation belongs to a different conversation".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Message posted over HTTP. Persisted, then pushed to the live room when
    /// the escalation has an active chat.
    pub async fn post_message(
        &self,
        business_id: Uuid,
        session_id: &str,
        escalation_id: Option<Uuid>,
        sender_type: SenderType,
        body: Option<String>,
        attachments: Vec<Attachment>,
    ) -> Result<Message, ServiceError> {
        self.check_post(business_id, session_id, escalation_id, sender_type)
            .await?;

        let new = NewMessage {
            business_id,
            session_id: session_id.to_string(),
            escalation_id,
            sender_type,
            body: body.map(|b| b.trim().to_string()).filter(|b| !b.is_empty()),
            system_message_type: None,
            attachments,
        };
        if !new.has_content() {
            return Err(ServiceError::Validation(
                "message needs a body or an attachment".to_string(),
            ));
        }

        let Some(cell) = escalation_id.and_then(|id| self.session_cell(id)) else {
            return Ok(self.store.append_message(new).await?);
        };
        let session = cell.lock().await;
        let message = self.store.append_message(new).await?;
        if session.state == SessionState::Active {
            let event = ServerEvent::NewMessage(message.clone());
            match role_for(sender_type) {
                Some(role) => self.gateway.emit_to_others_of(&session.room_id, event, role),
                None => self.gateway.emit(&session.room_id, event, None),
            };
        }
        Ok(message)
    }

    /// Dashboard presence change without a live socket.
    pub async fn set_availability(
        &self,
        agent_id: Uuid,
        business_id: Uuid,
        availability: Availability,
    ) -> Result<AgentPresence, ServiceError> {
        match availability {
            Availability::Available => {
                self.cancel_pending_drop(agent_id);
                self.queue.set_agent_available(agent_id, business_id, None);
                self.run_matching(business_id).await;
            }
            Availability::Offline => {
                self.queue.set_agent_offline(agent_id);
            }
            Availability::Busy => {
                return Err(ServiceError::Validation(
                    "agents become busy only through matching".to_string(),
                ))
            }
        }
        self.queue
            .agent(agent_id)
            .filter(|presence| presence.business_id == business_id)
            .ok_or_else(|| ServiceError::Validation(format!("agent {} has no presence", agent_id)))
    }

    // ---- helpers ----------------------------------------------------------

    async fn append_system(
        &self,
        session: &ChatSession,
        kind: SystemMessageType,
        body: &str,
    ) -> Result<Message, ServiceError> {
        let new = NewMessage::system(
            session.business_id,
            session.conversation_id.clone(),
            session.escalation_id,
            kind,
            body,
        );
        Ok(self.store.append_message(new).await?)
    }

    fn broadcast_system(&self, session: &ChatSession, message: Message) {
        let admitted = self.system_guard.lock().admit(session.id, &message);
        if admitted {
            self.gateway
                .emit(&session.room_id, ServerEvent::SystemMessage(message), None);
        }
    }

    fn note_activity(&self, result: Result<(), ServiceError>) {
        if let Err(e) = result {
            tracing::warn!("activity not recorded: {}", e);
        }
    }
}
