//! Coordination runtime for a role-based worker pool.
//!
//! A project structure is decomposed into one `executor` subtask per file.
//! Workers of each role claim subtasks from per-role FIFO queues, generate
//! an artifact through the role's provider chain and have it scored by the
//! [`MetricEvaluator`]. Accepted executor work spawns `tester` and
//! `documenter` follow-ons; rejected work is requeued up to a retry ceiling;
//! unrecoverable failures are escalated. Every change is published on the
//! [`StatusHub`].
//!
//! # Main types
//!
//! - [`Orchestrator`]: Assembled runtime with `run`, control commands and hot reload.
//! - [`Coordinator`]: Decomposition, outcome handling, follow-ons, backpressure.
//! - [`TaskQueueManager`]: Per-role queues and the subtask state machine.
//! - [`MetricEvaluator`]: Weighted scoring gated on per-metric thresholds.
//! - [`WorkerPool`]: One polling loop per role.
//! - [`StatusHub`]: Non-blocking status broadcast.

/// Configuration model and validation.
pub mod config;
/// Decomposition, outcome handling and follow-on spawning.
pub mod coordinator;
/// Top-level runtime assembly.
pub mod engine;
/// Escalation context and sinks.
pub mod escalation;
/// Metrics, scorers and threshold gating.
pub mod evaluator;
/// Status events and the broadcast hub.
pub mod hub;
/// Worker state and counters.
pub mod monitor;
/// Artifact persistence.
pub mod persistence;
/// Role prompts and output paths.
pub mod profiles;
/// Progress derived from a queue snapshot.
pub mod progress;
/// Per-role queues and subtask status tracking.
pub mod task_queue;
/// Subtasks, artifacts, outcomes and control commands.
pub mod types;
/// Per-role worker loops.
pub mod worker;

pub use config::{http_backend_factory, BackendFactory, LimitsConfig, RoleConfig, WorkforgeConfig};
pub use coordinator::{structure_files, Coordinator, PersistedArtifact};
pub use engine::{Orchestrator, OrchestratorBuilder, RunReport};
pub use escalation::{
    ChannelEscalation, CompositeEscalation, EscalationContext, EscalationRecord, EscalationSink,
    LogEscalation,
};
pub use evaluator::{EvaluationConfig, EvaluationResult, FnScorer, Metric, MetricEvaluator, MetricScorer};
pub use hub::{StatusEvent, StatusHub, Subscriber, Subscription, SystemSnapshot};
pub use monitor::{WorkerMonitor, WorkerState, WorkerStatus};
pub use persistence::{ArtifactStore, CommitId, InMemoryArtifactStore};
pub use progress::Progress;
pub use task_queue::{Claim, QueueSnapshot, ReportEffect, TaskQueueManager};
pub use types::{
    Artifact, ControlCommand, LoadLevel, LoadLevels, Outcome, ScoredArtifact, Subtask, SubtaskId,
    SubtaskStatus,
};
pub use worker::WorkerPool;
