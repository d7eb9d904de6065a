use crate::types::{Outcome, Subtask, SubtaskId, SubtaskStatus};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// Result of a claim attempt.
#[derive(Debug)]
pub enum Claim {
    /// The subtask is now `processing` and owned by the caller.
    Claimed(Box<Subtask>),
    /// The role's queue has nothing pending.
    Empty,
    /// The global concurrency ceiling is reached.
    Saturated,
}

/// What a report (or explicit failure) did to the subtask.
#[derive(Debug, Clone)]
pub enum ReportEffect {
    /// `processing → accepted`.
    Accepted(Box<Subtask>),
    /// `processing → needs_rework → pending`, back at the tail of its queue.
    Requeued(Box<Subtask>),
    /// `processing → failed`.
    Failed {
        subtask: Box<Subtask>,
        /// The rework count was already at the retry ceiling.
        ceiling_exceeded: bool,
    },
    /// The subtask was already terminal, or the report answers a claim that
    /// was already settled; nothing changed.
    Duplicate { id: SubtaskId, status: SubtaskStatus },
}

impl ReportEffect {
    pub fn subtask(&self) -> Option<&Subtask> {
        match self {
            ReportEffect::Accepted(s) | ReportEffect::Requeued(s) => Some(s),
            ReportEffect::Failed { subtask, .. } => Some(subtask),
            ReportEffect::Duplicate { .. } => None,
        }
    }
}

/// Minimal record left behind once a terminal subtask is retired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredSubtask {
    pub id: SubtaskId,
    pub role: Role,
    pub file_path: String,
    pub status: SubtaskStatus,
    pub rework_count: u32,
    pub failure: Option<String>,
    pub confidence: Option<f64>,
}

impl RetiredSubtask {
    fn from_subtask(task: &Subtask) -> Self {
        Self {
            id: task.id.clone(),
            role: task.role,
            file_path: task.file_path.clone(),
            status: task.status,
            rework_count: task.rework_count,
            failure: task.failure.clone(),
            confidence: task.best.as_ref().map(|b| b.confidence()),
        }
    }
}

/// Point-in-time copy of every queue and subtask.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueSnapshot {
    pub taken_at: Option<DateTime<Utc>>,
    /// Pending IDs per role, head first.
    pub queues: BTreeMap<Role, Vec<SubtaskId>>,
    /// Live subtasks, oldest first.
    pub subtasks: Vec<Subtask>,
    /// Terminal subtasks that have been retired.
    pub retired: Vec<RetiredSubtask>,
}

impl QueueSnapshot {
    pub fn depth(&self, role: Role) -> usize {
        self.queues.get(&role).map_or(0, Vec::len)
    }
}

#[derive(Default)]
struct QueueState {
    subtasks: HashMap<SubtaskId, Subtask>,
    queues: HashMap<Role, VecDeque<SubtaskId>>,
    retired: HashMap<SubtaskId, RetiredSubtask>,
}

impl QueueState {
    fn processing_count(&self) -> usize {
        self.subtasks
            .values()
            .filter(|t| t.status == SubtaskStatus::Processing)
            .count()
    }

    fn pop_pending(&mut self, role: Role) -> Option<SubtaskId> {
        let queue = self.queues.get_mut(&role)?;
        while let Some(id) = queue.pop_front() {
            if self
                .subtasks
                .get(&id)
                .is_some_and(|t| t.status == SubtaskStatus::Pending)
            {
                return Some(id);
            }
        }
        None
    }
}

/// Per-role FIFO queues plus the status of every subtask in the run.
///
/// All mutation happens under one lock, so a claim, a report and the queue
/// membership it implies are observed atomically: a subtask is in exactly one
/// queue iff it is `pending`, and at most one worker holds it in `processing`.
pub struct TaskQueueManager {
    state: Mutex<QueueState>,
    retry_ceiling: Mutex<u32>,
}

impl TaskQueueManager {
    pub fn new(retry_ceiling: u32) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            retry_ceiling: Mutex::new(retry_ceiling),
        }
    }

    pub fn retry_ceiling(&self) -> u32 {
        *self.retry_ceiling.lock()
    }

    pub fn set_retry_ceiling(&self, ceiling: u32) {
        *self.retry_ceiling.lock() = ceiling;
    }

    /// Register a `pending` subtask at the tail of its role's queue.
    ///
    /// Fails with [`WorkforgeError::DuplicateId`] if the ID is live or retired.
    pub fn enqueue(&self, mut subtask: Subtask) -> WorkforgeResult<SubtaskId> {
        let mut state = self.state.lock();
        if state.subtasks.contains_key(&subtask.id) || state.retired.contains_key(&subtask.id) {
            return Err(WorkforgeError::DuplicateId(subtask.id.to_string()));
        }
        subtask.status = SubtaskStatus::Pending;
        subtask.updated_at = Utc::now();
        let id = subtask.id.clone();
        state
            .queues
            .entry(subtask.role)
            .or_default()
            .push_back(id.clone());
        state.subtasks.insert(id.clone(), subtask);
        Ok(id)
    }

    /// Pop the head of `role`'s queue and mark it `processing`.
    ///
    /// The returned copy carries the claim's `attempt`, which the eventual
    /// report must echo.
    pub fn claim(&self, role: Role) -> Option<Subtask> {
        match self.claim_within(role, usize::MAX) {
            Claim::Claimed(task) => Some(*task),
            Claim::Empty | Claim::Saturated => None,
        }
    }

    /// Like [`claim`](Self::claim) but refuses while `max_in_flight` subtasks
    /// are already `processing`.
    pub fn claim_within(&self, role: Role, max_in_flight: usize) -> Claim {
        let mut state = self.state.lock();
        if state.processing_count() >= max_in_flight {
            return Claim::Saturated;
        }
        let Some(id) = state.pop_pending(role) else {
            return Claim::Empty;
        };
        let Some(task) = state.subtasks.get_mut(&id) else {
            return Claim::Empty;
        };
        if task.set_status(SubtaskStatus::Processing).is_err() {
            return Claim::Empty;
        }
        task.attempt += 1;
        Claim::Claimed(Box::new(task.clone()))
    }

    /// Apply a worker's outcome to claim `attempt` of a `processing` subtask.
    ///
    /// Reports against terminal subtasks, and reports for a claim that was
    /// already reported or released, are no-ops. A rework outcome past the
    /// retry ceiling fails the subtask instead of requeueing it.
    pub fn report(
        &self,
        id: &SubtaskId,
        attempt: u32,
        outcome: Outcome,
    ) -> WorkforgeResult<ReportEffect> {
        let ceiling = self.retry_ceiling();
        let mut state = self.state.lock();
        let task = match Self::reportable(&mut state, id, attempt, outcome.label())? {
            Ok(task) => task,
            Err(effect) => return Ok(effect),
        };

        match outcome {
            Outcome::Accepted(artifact) => {
                task.set_status(SubtaskStatus::Accepted)?;
                task.best = Some(artifact);
                Ok(ReportEffect::Accepted(Box::new(task.clone())))
            }
            Outcome::NeedsRework(artifact) => {
                task.offer_artifact(artifact);
                if task.rework_count >= ceiling {
                    task.failure = Some(format!(
                        "retry ceiling of {ceiling} rework cycles exceeded"
                    ));
                    task.set_status(SubtaskStatus::Failed)?;
                    return Ok(ReportEffect::Failed {
                        subtask: Box::new(task.clone()),
                        ceiling_exceeded: true,
                    });
                }
                task.set_status(SubtaskStatus::NeedsRework)?;
                task.rework_count += 1;
                task.set_status(SubtaskStatus::Pending)?;
                let (role, snapshot) = (task.role, task.clone());
                state.queues.entry(role).or_default().push_back(id.clone());
                Ok(ReportEffect::Requeued(Box::new(snapshot)))
            }
            Outcome::Failed { reason } => {
                task.set_status(SubtaskStatus::Failed)?;
                task.failure = Some(reason);
                Ok(ReportEffect::Failed {
                    subtask: Box::new(task.clone()),
                    ceiling_exceeded: false,
                })
            }
        }
    }

    /// Resolve `id` to a mutable subtask held under claim `attempt`, or the
    /// no-op effect for a terminal subtask or an already settled claim.
    fn reportable<'a>(
        state: &'a mut QueueState,
        id: &SubtaskId,
        attempt: u32,
        requested: &str,
    ) -> WorkforgeResult<Result<&'a mut Subtask, ReportEffect>> {
        if let Some(retired) = state.retired.get(id) {
            return Ok(Err(ReportEffect::Duplicate {
                id: id.clone(),
                status: retired.status,
            }));
        }
        let task = state
            .subtasks
            .get_mut(id)
            .ok_or_else(|| WorkforgeError::UnknownSubtask(id.to_string()))?;
        let current = task.status == SubtaskStatus::Processing && attempt == task.attempt;
        let settled = attempt > 0 && attempt <= task.attempt;
        if task.status.is_terminal() || (!current && settled) {
            return Ok(Err(ReportEffect::Duplicate {
                id: id.clone(),
                status: task.status,
            }));
        }
        if !current {
            return Err(WorkforgeError::InvalidTransition {
                id: id.to_string(),
                from: task.status.to_string(),
                to: requested.to_string(),
            });
        }
        Ok(Ok(task))
    }

    /// Fail claim `attempt` of a subtask directly, bypassing the rework path.
    pub fn fail(
        &self,
        id: &SubtaskId,
        attempt: u32,
        reason: impl Into<String>,
    ) -> WorkforgeResult<ReportEffect> {
        self.report(
            id,
            attempt,
            Outcome::Failed {
                reason: reason.into(),
            },
        )
    }

    /// Return an abandoned claim to the head of its queue.
    pub fn release(&self, id: &SubtaskId) -> WorkforgeResult<()> {
        let mut state = self.state.lock();
        let task = state
            .subtasks
            .get_mut(id)
            .ok_or_else(|| WorkforgeError::UnknownSubtask(id.to_string()))?;
        task.set_status(SubtaskStatus::Pending)?;
        let role = task.role;
        state.queues.entry(role).or_default().push_front(id.clone());
        Ok(())
    }

    /// Drop a terminal subtask's payload, keeping a tombstone so later
    /// reports stay idempotent and progress still counts it.
    pub fn retire(&self, id: &SubtaskId) -> bool {
        let mut state = self.state.lock();
        let terminal = state
            .subtasks
            .get(id)
            .is_some_and(|t| t.status.is_terminal());
        if !terminal {
            return false;
        }
        match state.subtasks.remove(id) {
            Some(task) => {
                state
                    .retired
                    .insert(id.clone(), RetiredSubtask::from_subtask(&task));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &SubtaskId) -> Option<Subtask> {
        self.state.lock().subtasks.get(id).cloned()
    }

    /// Status of a live or retired subtask.
    pub fn status(&self, id: &SubtaskId) -> Option<SubtaskStatus> {
        let state = self.state.lock();
        state
            .subtasks
            .get(id)
            .map(|t| t.status)
            .or_else(|| state.retired.get(id).map(|r| r.status))
    }

    pub fn depth(&self, role: Role) -> usize {
        self.state.lock().queues.get(&role).map_or(0, VecDeque::len)
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().processing_count()
    }

    /// Number of subtasks ever registered since the last reset.
    pub fn known_count(&self) -> usize {
        let state = self.state.lock();
        state.subtasks.len() + state.retired.len()
    }

    /// Whether every known subtask is terminal (vacuously true when empty).
    pub fn all_terminal(&self) -> bool {
        self.state
            .lock()
            .subtasks
            .values()
            .all(|t| t.status.is_terminal())
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.state.lock();
        let queues = Role::ALL
            .iter()
            .map(|role| {
                let ids = state
                    .queues
                    .get(role)
                    .map(|q| q.iter().cloned().collect())
                    .unwrap_or_default();
                (*role, ids)
            })
            .collect();
        let mut subtasks: Vec<Subtask> = state.subtasks.values().cloned().collect();
        subtasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let mut retired: Vec<RetiredSubtask> = state.retired.values().cloned().collect();
        retired.sort_by(|a, b| a.id.cmp(&b.id));
        QueueSnapshot {
            taken_at: Some(Utc::now()),
            queues,
            subtasks,
            retired,
        }
    }

    /// Forget every subtask, queue entry and tombstone.
    pub fn reset(&self) {
        *self.state.lock() = QueueState::default();
    }

    /// Check the queue-membership invariants, describing the first violation.
    pub fn verify_invariants(&self) -> Result<(), String> {
        let state = self.state.lock();
        let mut seen: HashMap<&SubtaskId, Role> = HashMap::new();
        for (role, queue) in &state.queues {
            for id in queue {
                if seen.insert(id, *role).is_some() {
                    return Err(format!("{id} is queued more than once"));
                }
                match state.subtasks.get(id) {
                    Some(t) if t.status != SubtaskStatus::Pending => {
                        return Err(format!("{id} is queued while {}", t.status));
                    }
                    Some(t) if t.role != *role => {
                        return Err(format!("{id} is queued under {role} but belongs to {}", t.role));
                    }
                    Some(_) => {}
                    None => return Err(format!("{id} is queued but unknown")),
                }
            }
        }
        for task in state.subtasks.values() {
            if task.status == SubtaskStatus::Pending && !seen.contains_key(&task.id) {
                return Err(format!("{} is pending but not queued", task.id));
            }
        }
        Ok(())
    }
}

impl Default for TaskQueueManager {
    fn default() -> Self {
        Self::new(3)
    }
}
