//! Monitoring transport for Workforge.
//!
//! Serves the status hub over a WebSocket, answers control commands from
//! monitors, and delivers escalations to an HTTP webhook.

/// Connected monitor registry.
pub mod connection;
/// Optional API-key auth.
pub mod middleware;
/// axum router and WebSocket handling.
pub mod server;
/// Webhook escalation sink.
pub mod webhook;

pub use middleware::AuthConfig;
pub use server::{CommandReply, GatewayServer};
pub use webhook::{WebhookConfig, WebhookEscalation};
