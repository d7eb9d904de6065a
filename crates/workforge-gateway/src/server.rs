use crate::connection::{Connection, ConnectionManager};
use crate::middleware::{auth_middleware, AuthConfig};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    middleware as axum_mw,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use workforge_orchestrator::{ControlCommand, Orchestrator, StatusEvent};

/// Shared application state.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub connections: Arc<ConnectionManager>,
}

/// Direct answer to a command sent by one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandReply {
    Ack { command: ControlCommand },
    Error { message: String },
}

/// The monitoring gateway.
///
/// - `GET /ws`: a `snapshot` event, then every hub event; accepts JSON
///   control commands.
/// - `GET /snapshot`: the current [`workforge_orchestrator::SystemSnapshot`].
/// - `GET /health`: liveness, connected monitors and a progress summary.
pub struct GatewayServer;

impl GatewayServer {
    /// Build the gateway without auth.
    pub fn build(orchestrator: Arc<Orchestrator>) -> Router {
        Self::build_with_auth(orchestrator, AuthConfig::default())
    }

    pub fn build_with_auth(orchestrator: Arc<Orchestrator>, auth: AuthConfig) -> Router {
        let state = Arc::new(AppState {
            orchestrator,
            connections: ConnectionManager::new(),
        });

        let app = Router::new()
            .route("/ws", get(ws_handler))
            .route("/snapshot", get(snapshot_handler))
            .route("/health", get(health_handler))
            .with_state(state);

        if auth.is_enabled() {
            app.layer(axum_mw::from_fn_with_state(Arc::new(auth), auth_middleware))
        } else {
            app
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let progress = state.orchestrator.coordinator().progress();
    let connections = state.connections.list().await;
    Json(serde_json::json!({
        "status": "ok",
        "service": "workforge",
        "monitors": connections.len(),
        "connections": connections,
        "running": state.orchestrator.pool().running_roles().await,
        "progress": progress,
    }))
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.orchestrator.full_snapshot().await)
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let connection_id = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let (tx, mut replies) = mpsc::unbounded_channel::<String>();
    state
        .connections
        .add(Connection {
            id: connection_id,
            connected_at: Utc::now(),
            tx,
        })
        .await;

    let subscription = state.orchestrator.subscribe().await;
    let mut events = subscription.events;
    let first = StatusEvent::Snapshot {
        snapshot: Box::new(subscription.snapshot),
    };

    // Snapshot first, then hub events interleaved with this client's replies.
    let send_task = tokio::spawn(async move {
        let mut outgoing = serde_json::to_string(&first).ok();
        loop {
            if let Some(text) = outgoing.take() {
                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            outgoing = tokio::select! {
                event = events.recv() => match event {
                    Some(event) => match serde_json::to_string(&event) {
                        Ok(text) => Some(text),
                        Err(e) => {
                            warn!(error = %e, "Failed to encode status event");
                            None
                        }
                    },
                    None => break,
                },
                reply = replies.recv() => match reply {
                    Some(text) => Some(text),
                    None => break,
                },
            };
        }
    });

    let orchestrator = Arc::clone(&state.orchestrator);
    let connections = Arc::clone(&state.connections);
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let reply = handle_command(&orchestrator, &text).await;
                    match serde_json::to_string(&reply) {
                        Ok(encoded) => {
                            connections.send_to(connection_id, &encoded).await;
                        }
                        Err(e) => warn!(error = %e, "Failed to encode command reply"),
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    state.connections.remove(connection_id).await;
}

async fn handle_command(orchestrator: &Orchestrator, text: &str) -> CommandReply {
    let command: ControlCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => {
            debug!(error = %e, "Unparseable monitor command");
            return CommandReply::Error {
                message: format!("Invalid command: {e}"),
            };
        }
    };
    match orchestrator.apply_command(command.clone()).await {
        Ok(()) => CommandReply::Ack { command },
        Err(e) => {
            info!(error = %e, "Monitor command rejected");
            CommandReply::Error {
                message: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use workforge_core::Role;

    #[test]
    fn test_reply_serialization() {
        let ack = CommandReply::Ack {
            command: ControlCommand::Stop { role: Role::Tester },
        };
        let json = serde_json::to_value(&ack).unwrap();
        assert_eq!(json["type"], "ack");
        assert_eq!(json["command"]["command"], "stop");
        assert_eq!(json["command"]["role"], "tester");

        let err: CommandReply =
            serde_json::from_str(r#"{"type":"error","message":"nope"}"#).unwrap();
        assert!(matches!(err, CommandReply::Error { message } if message == "nope"));
    }
}
