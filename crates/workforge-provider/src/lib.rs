//! Generation dispatch for Workforge workers.
//!
//! A role's [`ProviderChain`] orders one or more named [`GenerationBackend`]s
//! (primary first). Every attempt is paced by a jittered delay, failures are
//! retried on the same backend with a fixed backoff, and the chain falls back
//! to the next backend once the retry ceiling is hit. Exhausting every backend
//! yields [`workforge_core::WorkforgeError::AllProvidersExhausted`].

/// HTTP generation backends and the backend trait.
pub mod backends;
/// Ordered fallback chain with pacing and retry.
pub mod chain;
/// Backend specifications, pacing ranges and retry policy.
pub mod config;
/// Per-role registry of provider chains.
pub mod set;

pub use backends::{build_backend, GenerationBackend, GenerationRequest};
pub use chain::{BackendHealth, ChainLink, Generated, ProviderChain};
pub use config::{BackendKind, BackendSpec, PacingRange, RetryPolicy};
pub use set::{ChainHealth, ProviderSet};
