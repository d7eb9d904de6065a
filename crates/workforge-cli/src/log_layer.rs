//! Forwards log lines to monitors through the status hub.

use chrono::Utc;
use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;
use workforge_orchestrator::{StatusEvent, StatusHub};

/// A `tracing` layer that publishes WARN and ERROR lines, plus INFO lines
/// from `workforge*` targets, as [`StatusEvent::Log`].
///
/// The layer is installed before the hub exists; events seen before
/// [`HubLogLayer::attach`] are dropped.
#[derive(Clone, Default)]
pub struct HubLogLayer {
    hub: Arc<OnceLock<Arc<StatusHub>>>,
}

impl HubLogLayer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start forwarding to `hub`. Only the first call takes effect.
    pub fn attach(&self, hub: Arc<StatusHub>) {
        let _ = self.hub.set(hub);
    }

    fn forwards(level: &Level, target: &str) -> bool {
        *level <= Level::WARN || (*level == Level::INFO && target.starts_with("workforge"))
    }
}

impl<S: Subscriber> Layer<S> for HubLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let Some(hub) = self.hub.get() else {
            return;
        };
        let meta = event.metadata();
        if !Self::forwards(meta.level(), meta.target()) {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        hub.publish(StatusEvent::Log {
            level: meta.level().to_string(),
            target: meta.target().to_string(),
            message: visitor.finish(),
            at: Utc::now(),
        });
    }
}

/// Renders `message` followed by the remaining fields as `key=value`.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        match (self.message.is_empty(), self.fields.is_empty()) {
            (_, true) => self.message,
            (true, false) => self.fields,
            (false, false) => format!("{} {}", self.message, self.fields),
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            self.record_debug(field, &value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
            return;
        }
        if !self.fields.is_empty() {
            self.fields.push(' ');
        }
        let _ = write!(self.fields, "{}={value:?}", field.name());
    }
}
