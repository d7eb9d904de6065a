//! Core types and error definitions for the Workforge coordinator.
//!
//! This crate provides the foundational types shared across all Workforge
//! crates: the unified error enum and the closed set of worker roles.
//!
//! # Main types
//!
//! - [`WorkforgeError`]: Unified error enum for all Workforge subsystems.
//! - [`WorkforgeResult`]: Convenience alias for `Result<T, WorkforgeError>`.
//! - [`Role`]: The role a worker (and every subtask) belongs to.

/// The closed set of worker roles.
pub mod role;

pub use role::Role;

// --- Error types ---

/// Top-level error type for the Workforge framework.
///
/// The first group of variants mirrors the coordinator's failure taxonomy;
/// the rest are ambient errors raised by configuration, transport and
/// collaborator adapters.
#[derive(Debug, thiserror::Error)]
pub enum WorkforgeError {
    /// A subtask ID was enqueued while already known to the run.
    #[error("Duplicate subtask id: {0}")]
    DuplicateId(String),

    /// A report or control call referenced an ID that is not tracked.
    #[error("Unknown subtask: {0}")]
    UnknownSubtask(String),

    /// A status change that is not an edge of the subtask state machine.
    #[error("Invalid transition for subtask {id}: {from} -> {to}")]
    InvalidTransition {
        /// Subtask the transition was attempted on.
        id: String,
        /// Status the subtask was in.
        from: String,
        /// Status that was requested.
        to: String,
    },

    /// A single generation attempt failed; the chain may retry it.
    #[error("Provider error: {0}")]
    ProviderTransient(String),

    /// A generation call exceeded its hard upper bound.
    #[error("Timeout after {0}s")]
    Timeout(u64),

    /// Every backend in a role's chain failed up to its retry ceiling.
    #[error("All providers exhausted for role {role} after {attempts} attempts: {last_error}")]
    AllProvidersExhausted {
        /// Role whose chain was exhausted.
        role: Role,
        /// Total attempts made across the chain.
        attempts: u32,
        /// Error returned by the final attempt.
        last_error: String,
    },

    /// A subtask was sent back for rework more times than allowed.
    #[error("Retry ceiling exceeded for subtask {id} after {attempts} rework cycles")]
    RetryCeilingExceeded {
        /// Subtask that hit the ceiling.
        id: String,
        /// Rework cycles consumed.
        attempts: u32,
    },

    /// A subtask was reported failed by its worker or an external reporter.
    #[error("Subtask {id} failed: {reason}")]
    SubtaskFailed {
        /// Subtask that failed.
        id: String,
        /// Reason given with the report.
        reason: String,
    },

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// An error from an outbound HTTP request.
    #[error("HTTP error: {0}")]
    Http(String),

    /// The artifact store could not materialize a file.
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// An escalation sink failed to deliver.
    #[error("Escalation error: {0}")]
    Escalation(String),

    /// A metric scorer failed to produce a score.
    #[error("Scorer error: {0}")]
    Scorer(String),

    /// An error from the monitoring gateway.
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkforgeError {
    /// Whether this error should be escalated to an external collaborator
    /// rather than recovered locally.
    pub fn is_escalated(&self) -> bool {
        matches!(
            self,
            WorkforgeError::AllProvidersExhausted { .. }
                | WorkforgeError::RetryCeilingExceeded { .. }
                | WorkforgeError::SubtaskFailed { .. }
        )
    }
}

/// A convenience `Result` alias using [`WorkforgeError`].
pub type WorkforgeResult<T> = Result<T, WorkforgeError>;
