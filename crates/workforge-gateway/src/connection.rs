use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

/// A connected monitoring client.
#[derive(Debug)]
pub struct Connection {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
    /// Replies addressed to this client only (command acks and errors).
    pub tx: mpsc::UnboundedSender<String>,
}

/// Public view of a connection for `/health`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub connected_at: DateTime<Utc>,
}

/// Tracks active WebSocket monitors.
pub struct ConnectionManager {
    connections: RwLock<HashMap<Uuid, Connection>>,
}

impl ConnectionManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add(&self, conn: Connection) {
        let id = conn.id;
        self.connections.write().await.insert(id, conn);
        tracing::info!(connection_id = %id, "Monitor connected");
    }

    pub async fn remove(&self, id: Uuid) {
        self.connections.write().await.remove(&id);
        tracing::info!(connection_id = %id, "Monitor disconnected");
    }

    /// Send to one client. Returns `false` if it is gone.
    pub async fn send_to(&self, id: Uuid, message: &str) -> bool {
        let conns = self.connections.read().await;
        conns
            .get(&id)
            .is_some_and(|conn| conn.tx.send(message.to_string()).is_ok())
    }

    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .connections
            .read()
            .await
            .values()
            .map(|c| ConnectionInfo {
                id: c.id,
                connected_at: c.connected_at,
            })
            .collect();
        infos.sort_by_key(|c| c.connected_at);
        infos
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }
}
