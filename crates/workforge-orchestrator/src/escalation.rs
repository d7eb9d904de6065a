use crate::types::{Subtask, SubtaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// Everything a human or supervisor needs to pick up a surfaced failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationContext {
    pub goal: String,
    pub subtask_id: Option<SubtaskId>,
    pub role: Option<Role>,
    pub file_path: Option<String>,
    pub instruction: Option<String>,
    pub rework_count: u32,
    /// Best confidence reached before giving up.
    pub best_confidence: Option<f64>,
}

impl EscalationContext {
    pub fn for_goal(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            subtask_id: None,
            role: None,
            file_path: None,
            instruction: None,
            rework_count: 0,
            best_confidence: None,
        }
    }

    pub fn for_subtask(goal: impl Into<String>, subtask: &Subtask) -> Self {
        Self {
            goal: goal.into(),
            subtask_id: Some(subtask.id.clone()),
            role: Some(subtask.role),
            file_path: Some(subtask.file_path.clone()),
            instruction: Some(subtask.instruction.clone()),
            rework_count: subtask.rework_count,
            best_confidence: subtask.best.as_ref().map(|b| b.confidence()),
        }
    }
}

/// A delivered escalation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationRecord {
    /// Error variant, e.g. `all_providers_exhausted`.
    pub kind: String,
    pub error: String,
    pub context: EscalationContext,
    pub at: DateTime<Utc>,
}

impl EscalationRecord {
    pub fn new(error: &WorkforgeError, context: &EscalationContext) -> Self {
        Self {
            kind: error_kind(error).to_string(),
            error: error.to_string(),
            context: context.clone(),
            at: Utc::now(),
        }
    }
}

/// Stable snake_case name of an error variant.
pub fn error_kind(error: &WorkforgeError) -> &'static str {
    match error {
        WorkforgeError::DuplicateId(_) => "duplicate_id",
        WorkforgeError::UnknownSubtask(_) => "unknown_subtask",
        WorkforgeError::InvalidTransition { .. } => "invalid_transition",
        WorkforgeError::ProviderTransient(_) => "provider_transient",
        WorkforgeError::Timeout(_) => "timeout",
        WorkforgeError::AllProvidersExhausted { .. } => "all_providers_exhausted",
        WorkforgeError::RetryCeilingExceeded { .. } => "retry_ceiling_exceeded",
        WorkforgeError::SubtaskFailed { .. } => "subtask_failed",
        WorkforgeError::Config(_) => "config",
        WorkforgeError::Http(_) => "http",
        WorkforgeError::Persistence(_) => "persistence",
        WorkforgeError::Escalation(_) => "escalation",
        WorkforgeError::Scorer(_) => "scorer",
        WorkforgeError::Gateway(_) => "gateway",
        WorkforgeError::Json(_) => "json",
        WorkforgeError::Io(_) => "io",
    }
}

/// Destination for failures that cannot be recovered locally.
#[async_trait]
pub trait EscalationSink: Send + Sync {
    async fn escalate(&self, error: &WorkforgeError, context: &EscalationContext) -> WorkforgeResult<()>;
}

/// Logs escalations at error level.
pub struct LogEscalation;

#[async_trait]
impl EscalationSink for LogEscalation {
    async fn escalate(&self, err: &WorkforgeError, context: &EscalationContext) -> WorkforgeResult<()> {
        error!(
            kind = error_kind(err),
            error = %err,
            goal = %context.goal,
            subtask = ?context.subtask_id,
            role = ?context.role,
            file = ?context.file_path,
            "Escalation raised"
        );
        Ok(())
    }
}

/// Forwards escalations to an in-process receiver.
pub struct ChannelEscalation {
    tx: mpsc::UnboundedSender<EscalationRecord>,
}

impl ChannelEscalation {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<EscalationRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EscalationSink for ChannelEscalation {
    async fn escalate(&self, err: &WorkforgeError, context: &EscalationContext) -> WorkforgeResult<()> {
        self.tx
            .send(EscalationRecord::new(err, context))
            .map_err(|_| WorkforgeError::Escalation("Escalation receiver dropped".into()))
    }
}

/// Delivers to every inner sink; reports the first failure after trying all.
pub struct CompositeEscalation {
    sinks: Vec<Arc<dyn EscalationSink>>,
}

impl CompositeEscalation {
    pub fn new(sinks: Vec<Arc<dyn EscalationSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl EscalationSink for CompositeEscalation {
    async fn escalate(&self, err: &WorkforgeError, context: &EscalationContext) -> WorkforgeResult<()> {
        let mut first_error = None;
        for sink in &self.sinks {
            if let Err(e) = sink.escalate(err, context).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    struct Broken;

    #[async_trait]
    impl EscalationSink for Broken {
        async fn escalate(&self, _: &WorkforgeError, _: &EscalationContext) -> WorkforgeResult<()> {
            Err(WorkforgeError::Escalation("down".into()))
        }
    }

    fn exhausted() -> WorkforgeError {
        WorkforgeError::AllProvidersExhausted {
            role: Role::Executor,
            attempts: 6,
            last_error: "quota exceeded".into(),
        }
    }

    #[tokio::test]
    async fn test_channel_delivers_record() {
        let (sink, mut rx) = ChannelEscalation::channel();
        let task = Subtask::executor("a.py", "Implement a.py");
        let ctx = EscalationContext::for_subtask("build app", &task);
        sink.escalate(&exhausted(), &ctx).await.unwrap();

        let record = rx.recv().await.unwrap();
        assert_eq!(record.kind, "all_providers_exhausted");
        assert_eq!(record.context.goal, "build app");
        assert_eq!(record.context.file_path.as_deref(), Some("a.py"));
    }

    #[tokio::test]
    async fn test_composite_tries_every_sink() {
        let (channel, mut rx) = ChannelEscalation::channel();
        let composite = CompositeEscalation::new(vec![
            Arc::new(Broken),
            Arc::new(channel),
            Arc::new(LogEscalation),
        ]);
        let result = composite
            .escalate(&exhausted(), &EscalationContext::for_goal("g"))
            .await;
        assert!(result.is_err());
        assert!(rx.try_recv().is_ok());
    }
}
