// handler/realtime.rs
//
// Socket endpoint. Frames are JSON `{"event": ..., "data": ...}` in both
// directions; see dtos::eventdtos.
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query,
    },
    response::IntoResponse,
    routing::get,
    Extension, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use uuid::Uuid;

use crate::{error::HttpError, models::sessionmodel::ParticipantRole, AppState};

pub fn realtime_handler() -> Router {
    Router::new().route("/", get(ws_handler))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeQuery {
    pub role: ParticipantRole,
    pub business_id: Uuid,
    pub agent_id: Option<Uuid>,
}

impl RealtimeQuery {
    /// Agents must say who they are; customers never carry an agent id.
    fn identity(&self) -> Result<Option<Uuid>, HttpError> {
        match (self.role, self.agent_id) {
            (ParticipantRole::Agent, None) => {
                Err(HttpError::bad_request("agentId is required for agent connections"))
            }
            (ParticipantRole::Agent, agent_id) => Ok(agent_id),
            (ParticipantRole::Customer, _) => Ok(None),
        }
    }
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<RealtimeQuery>,
    Extension(app_state): Extension<Arc<AppState>>,
) -> Result<impl IntoResponse, HttpError> {
    let agent_id = query.identity()?;
    let (role, business_id) = (query.role, query.business_id);

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, app_state, role, business_id, agent_id)))
}

async fn handle_socket(
    socket: WebSocket,
    app_state: Arc<AppState>,
    role: ParticipantRole,
    business_id: Uuid,
    agent_id: Option<Uuid>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let live_chat = app_state.live_chat.clone();
    let (info, mut rx) = live_chat.gateway().register(role, business_id, agent_id);
    let connection_id = info.id;

    let mut sender_task = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let frame = match serde_json::to_string(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::error!("failed to encode event for {}: {}", connection_id, e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(frame)).await.is_err() {
                break;
            }
        }
    });

    let receiver_chat = live_chat.clone();
    let mut receiver_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => receiver_chat.handle_frame(connection_id, &text).await,
                Message::Ping(_) | Message::Pong(_) => receiver_chat.gateway().touch(connection_id),
                Message::Close(_) => break,
                Message::Binary(_) => {
                    tracing::debug!("ignoring binary frame from {}", connection_id);
                }
            }
        }
    });

    tokio::select! {
        _ = &mut sender_task => receiver_task.abort(),
        _ = &mut receiver_task => sender_task.abort(),
    }

    tracing::info!("connection {} closed", connection_id);
    live_chat.handle_disconnect(connection_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_connections_need_an_agent_id() {
        let business = Uuid::new_v4();
        let agent = RealtimeQuery {
            role: ParticipantRole::Agent,
            business_id: business,
            agent_id: None,
        };
        assert!(agent.identity().is_err());

        let customer = RealtimeQuery {
            role: ParticipantRole::Customer,
            business_id: business,
            agent_id: Some(Uuid::new_v4()),
        };
        assert_eq!(customer.identity().unwrap(), None);
    }

    #[test]
    fn query_uses_camel_case() {
        let query: RealtimeQuery = serde_json::from_value(serde_json::json!({
            "role": "agent",
            "businessId": Uuid::new_v4(),
            "agentId": Uuid::new_v4(),
        }))
        .unwrap();
        assert!(query.identity().unwrap().is_some());
    }
}
