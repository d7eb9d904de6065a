use crate::task_queue::QueueSnapshot;
use crate::types::SubtaskStatus;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use workforge_core::Role;

/// Per-role completion counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RoleProgress {
    pub known: usize,
    pub accepted: usize,
    pub failed: usize,
}

/// Aggregate completion, derived on demand from a queue snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    /// Files found in the decomposed structure.
    pub structure_ceiling: usize,
    /// Subtasks ever registered: the executor per file plus spawned follow-ons.
    pub total_known: usize,
    pub pending: usize,
    pub processing: usize,
    pub accepted: usize,
    pub failed: usize,
    /// Rework cycles consumed across all subtasks.
    pub rework_cycles: u64,
    pub by_role: BTreeMap<Role, RoleProgress>,
    /// `100 * accepted / total_known`.
    pub percent: f64,
    /// Share of attempts that ended accepted; failures and reworks count
    /// against it.
    pub efficiency: f64,
}

impl Progress {
    pub fn from_snapshot(snapshot: &QueueSnapshot, structure_ceiling: usize) -> Self {
        let mut progress = Progress {
            structure_ceiling,
            ..Default::default()
        };

        let live = snapshot
            .subtasks
            .iter()
            .map(|t| (t.role, t.status, t.rework_count));
        let retired = snapshot
            .retired
            .iter()
            .map(|r| (r.role, r.status, r.rework_count));

        for (role, status, reworks) in live.chain(retired) {
            progress.total_known += 1;
            progress.rework_cycles += u64::from(reworks);
            let per_role = progress.by_role.entry(role).or_default();
            per_role.known += 1;
            match status {
                SubtaskStatus::Pending | SubtaskStatus::NeedsRework => progress.pending += 1,
                SubtaskStatus::Processing => progress.processing += 1,
                SubtaskStatus::Accepted => {
                    progress.accepted += 1;
                    per_role.accepted += 1;
                }
                SubtaskStatus::Failed => {
                    progress.failed += 1;
                    per_role.failed += 1;
                }
            }
        }

        if progress.total_known > 0 {
            progress.percent = 100.0 * progress.accepted as f64 / progress.total_known as f64;
        }
        let attempts = progress.accepted as u64 + progress.failed as u64 + progress.rework_cycles;
        if attempts > 0 {
            progress.efficiency = progress.accepted as f64 / attempts as f64;
        }
        progress
    }

    /// Every known subtask reached `accepted` or `failed`.
    pub fn is_settled(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}
