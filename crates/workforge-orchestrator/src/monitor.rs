use crate::types::SubtaskId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use workforge_core::Role;

/// Lifecycle state of one role's worker loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Idle,
    Working,
    Stopped,
    Error,
}

/// Per-worker counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerMetrics {
    pub claimed: u64,
    pub accepted: u64,
    pub reworked: u64,
    pub failed: u64,
    /// Claims handed back on stop.
    pub abandoned: u64,
    /// Generation attempts across all backends, retries included.
    pub generation_attempts: u64,
    pub generation_ms: u64,
}

/// Real-time snapshot of a worker's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    pub role: Role,
    pub status: WorkerStatus,
    pub current_subtask: Option<SubtaskId>,
    pub idle_interval_ms: u64,
    pub metrics: WorkerMetrics,
}

/// How a worker's claim ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimEnd {
    Accepted,
    Reworked,
    Failed,
    Abandoned,
}

/// Tracks state and metrics for every role's worker.
pub struct WorkerMonitor {
    states: Arc<RwLock<HashMap<Role, WorkerState>>>,
}

impl WorkerMonitor {
    pub fn new() -> Self {
        let states = Role::ALL
            .iter()
            .map(|role| {
                (
                    *role,
                    WorkerState {
                        role: *role,
                        status: WorkerStatus::Stopped,
                        current_subtask: None,
                        idle_interval_ms: 0,
                        metrics: WorkerMetrics::default(),
                    },
                )
            })
            .collect();
        Self {
            states: Arc::new(RwLock::new(states)),
        }
    }

    async fn update(&self, role: Role, f: impl FnOnce(&mut WorkerState)) -> Option<WorkerState> {
        let mut states = self.states.write().await;
        let state = states.get_mut(&role)?;
        f(state);
        Some(state.clone())
    }

    pub async fn set_status(&self, role: Role, status: WorkerStatus) -> Option<WorkerState> {
        self.update(role, |s| {
            s.status = status;
            if status != WorkerStatus::Working {
                s.current_subtask = None;
            }
        })
        .await
    }

    pub async fn set_idle_interval(&self, role: Role, idle_ms: u64) -> Option<WorkerState> {
        self.update(role, |s| s.idle_interval_ms = idle_ms).await
    }

    /// Mark a worker as working on a claimed subtask.
    pub async fn start_subtask(&self, role: Role, id: SubtaskId) -> Option<WorkerState> {
        self.update(role, |s| {
            s.status = WorkerStatus::Working;
            s.current_subtask = Some(id);
            s.metrics.claimed += 1;
        })
        .await
    }

    /// Mark a worker idle again and count how its claim ended.
    pub async fn finish_subtask(&self, role: Role, end: ClaimEnd) -> Option<WorkerState> {
        self.update(role, |s| {
            s.current_subtask = None;
            s.status = WorkerStatus::Idle;
            match end {
                ClaimEnd::Accepted => s.metrics.accepted += 1,
                ClaimEnd::Reworked => s.metrics.reworked += 1,
                ClaimEnd::Failed => s.metrics.failed += 1,
                ClaimEnd::Abandoned => s.metrics.abandoned += 1,
            }
        })
        .await
    }

    /// Flag a worker whose provider chain gave up on its last claim.
    pub async fn record_error(&self, role: Role) -> Option<WorkerState> {
        self.update(role, |s| s.status = WorkerStatus::Error).await
    }

    pub async fn record_generation(&self, role: Role, attempts: u32, duration_ms: u64) {
        self.update(role, |s| {
            s.metrics.generation_attempts += u64::from(attempts);
            s.metrics.generation_ms += duration_ms;
        })
        .await;
    }

    /// States of all workers, in role order.
    pub async fn snapshot(&self) -> Vec<WorkerState> {
        let states = self.states.read().await;
        let mut out: Vec<WorkerState> = states.values().cloned().collect();
        out.sort_by_key(|s| s.role);
        out
    }

    pub async fn get_state(&self, role: Role) -> Option<WorkerState> {
        self.states.read().await.get(&role).cloned()
    }

    /// Sum of every worker's counters.
    pub async fn aggregate_metrics(&self) -> WorkerMetrics {
        let states = self.states.read().await;
        let mut total = WorkerMetrics::default();
        for state in states.values() {
            total.claimed += state.metrics.claimed;
            total.accepted += state.metrics.accepted;
            total.reworked += state.metrics.reworked;
            total.failed += state.metrics.failed;
            total.abandoned += state.metrics.abandoned;
            total.generation_attempts += state.metrics.generation_attempts;
            total.generation_ms += state.metrics.generation_ms;
        }
        total
    }

    /// Zero every counter, keeping statuses.
    pub async fn reset_metrics(&self) {
        let mut states = self.states.write().await;
        for state in states.values_mut() {
            state.metrics = WorkerMetrics::default();
        }
    }
}

impl Default for WorkerMonitor {
    fn default() -> Self {
        Self::new()
    }
}
