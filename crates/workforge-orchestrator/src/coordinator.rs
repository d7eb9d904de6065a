use crate::escalation::{EscalationContext, EscalationSink};
use crate::hub::{StatusEvent, StatusHub};
use crate::persistence::{validate_relative_path, ArtifactStore, CommitId};
use crate::profiles::{executor_instruction, follow_on_instruction, output_path};
use crate::progress::Progress;
use crate::task_queue::{Claim, QueueSnapshot, ReportEffect, TaskQueueManager};
use crate::types::{Outcome, Subtask, SubtaskId, SubtaskStatus};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// An accepted artifact and where it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedArtifact {
    pub subtask_id: SubtaskId,
    pub role: Role,
    pub file_path: String,
    pub output_path: String,
    /// `None` when the store rejected the write.
    pub commit: Option<CommitId>,
    pub confidence: f64,
    pub backend: Option<String>,
}

/// Flatten a nested structure map into file paths.
///
/// Keys are names; a `null` value is a file and an object is a directory.
/// Paths are joined with `/` in key order.
pub fn structure_files(structure: &Value) -> WorkforgeResult<Vec<String>> {
    let Value::Object(root) = structure else {
        return Err(WorkforgeError::Config(
            "Project structure must be a mapping of names".into(),
        ));
    };
    let mut files = Vec::new();
    collect_files(root, "", &mut files)?;
    Ok(files)
}

fn collect_files(map: &Map<String, Value>, prefix: &str, out: &mut Vec<String>) -> WorkforgeResult<()> {
    for (name, value) in map {
        let path = if prefix.is_empty() {
            name.clone()
        } else {
            format!("{prefix}/{name}")
        };
        validate_relative_path(&path)
            .map_err(|_| WorkforgeError::Config(format!("Invalid structure entry: {path:?}")))?;
        match value {
            Value::Null => out.push(path),
            Value::Object(children) => collect_files(children, &path, out)?,
            other => {
                return Err(WorkforgeError::Config(format!(
                    "Structure entry {path} must be null (file) or a mapping (directory), got {other}"
                )))
            }
        }
    }
    Ok(())
}

/// Turns a goal into subtasks and reacts to their outcomes.
///
/// Every state change goes through here so the hub sees it: decomposition,
/// claims, reports, follow-on spawning, persistence and escalation.
pub struct Coordinator {
    queue: Arc<TaskQueueManager>,
    hub: Arc<StatusHub>,
    escalation: Arc<dyn EscalationSink>,
    store: Arc<dyn ArtifactStore>,
    concurrency_ceiling: AtomicUsize,
    structure_ceiling: AtomicUsize,
    goal: RwLock<String>,
    persisted: Mutex<Vec<PersistedArtifact>>,
    escalations: AtomicU64,
    /// Outcomes reported but not yet fully settled.
    settling: AtomicUsize,
}

/// Marks an outcome as in flight until dropped.
struct SettlingGuard<'a>(&'a AtomicUsize);

impl<'a> SettlingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for SettlingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Coordinator {
    pub fn new(
        queue: Arc<TaskQueueManager>,
        hub: Arc<StatusHub>,
        escalation: Arc<dyn EscalationSink>,
        store: Arc<dyn ArtifactStore>,
        concurrency_ceiling: usize,
    ) -> Self {
        Self {
            queue,
            hub,
            escalation,
            store,
            concurrency_ceiling: AtomicUsize::new(concurrency_ceiling.max(1)),
            structure_ceiling: AtomicUsize::new(0),
            goal: RwLock::new(String::new()),
            persisted: Mutex::new(Vec::new()),
            escalations: AtomicU64::new(0),
            settling: AtomicUsize::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<TaskQueueManager> {
        &self.queue
    }

    pub fn goal(&self) -> String {
        self.goal.read().clone()
    }

    /// Enqueue one executor subtask per file of `structure`.
    ///
    /// Files already known to the run are skipped with a warning.
    pub fn decompose(&self, goal: &str, structure: &Value) -> WorkforgeResult<Vec<SubtaskId>> {
        let files = structure_files(structure)?;
        *self.goal.write() = goal.to_string();

        let mut ids = Vec::with_capacity(files.len());
        for path in &files {
            let task = Subtask::executor(path, executor_instruction(goal, path));
            match self.queue.enqueue(task) {
                Ok(id) => {
                    self.publish_status(&id, Role::Executor, path, None, SubtaskStatus::Pending, 0);
                    ids.push(id);
                }
                Err(WorkforgeError::DuplicateId(id)) => {
                    warn!(subtask_id = %id, "Duplicate subtask in structure, ignoring");
                }
                Err(e) => return Err(e),
            }
        }
        self.structure_ceiling.fetch_add(ids.len(), Ordering::SeqCst);

        info!(goal = %goal, files = ids.len(), "Structure decomposed");
        self.publish_depth(Role::Executor);
        self.publish_progress();
        Ok(ids)
    }

    /// Claim the next subtask for `role` unless the concurrency ceiling is
    /// reached.
    pub fn claim(&self, role: Role) -> Claim {
        let claim = self.queue.claim_within(role, self.concurrency_ceiling());
        if let Claim::Claimed(task) = &claim {
            debug!(subtask_id = %task.id, role = %role, "Subtask claimed");
            self.publish_status(
                &task.id,
                role,
                &task.file_path,
                Some(SubtaskStatus::Pending),
                SubtaskStatus::Processing,
                task.rework_count,
            );
            self.publish_depth(role);
        }
        claim
    }

    /// Apply a worker outcome for claim `attempt` and react to it.
    pub async fn report(
        &self,
        id: &SubtaskId,
        attempt: u32,
        outcome: Outcome,
    ) -> WorkforgeResult<ReportEffect> {
        let _settling = SettlingGuard::enter(&self.settling);
        let effect = self.queue.report(id, attempt, outcome)?;
        let failure = match &effect {
            ReportEffect::Failed {
                subtask,
                ceiling_exceeded: true,
            } => Some(WorkforgeError::RetryCeilingExceeded {
                id: subtask.id.to_string(),
                attempts: subtask.rework_count,
            }),
            ReportEffect::Failed { subtask, .. } => Some(WorkforgeError::SubtaskFailed {
                id: subtask.id.to_string(),
                reason: subtask.failure.clone().unwrap_or_default(),
            }),
            _ => None,
        };
        self.settle(&effect, failure).await;
        Ok(effect)
    }

    /// Fail a claimed subtask because of `error` and escalate it once.
    pub async fn fail(
        &self,
        id: &SubtaskId,
        attempt: u32,
        error: WorkforgeError,
    ) -> WorkforgeResult<ReportEffect> {
        let _settling = SettlingGuard::enter(&self.settling);
        let effect = self.queue.fail(id, attempt, error.to_string())?;
        self.settle(&effect, Some(error)).await;
        Ok(effect)
    }

    /// Hand an abandoned claim back to its queue.
    pub fn release(&self, id: &SubtaskId) -> WorkforgeResult<()> {
        self.queue.release(id)?;
        if let Some(task) = self.queue.get(id) {
            info!(subtask_id = %id, role = %task.role, "Claim abandoned, requeued at head");
            self.publish_status(
                id,
                task.role,
                &task.file_path,
                Some(SubtaskStatus::Processing),
                SubtaskStatus::Pending,
                task.rework_count,
            );
            self.publish_depth(task.role);
        }
        Ok(())
    }

    async fn settle(&self, effect: &ReportEffect, failure: Option<WorkforgeError>) {
        match effect {
            ReportEffect::Accepted(task) => {
                info!(subtask_id = %task.id, role = %task.role, "Subtask accepted");
                self.publish_transition(task, SubtaskStatus::Processing, SubtaskStatus::Accepted);
                self.persist(task).await;
                if task.role == Role::Executor {
                    self.spawn_follow_ons(task);
                }
                self.queue.retire(&task.id);
            }
            ReportEffect::Requeued(task) => {
                info!(
                    subtask_id = %task.id,
                    role = %task.role,
                    rework_count = task.rework_count,
                    "Subtask needs rework"
                );
                self.publish_transition(task, SubtaskStatus::Processing, SubtaskStatus::NeedsRework);
                self.publish_transition(task, SubtaskStatus::NeedsRework, SubtaskStatus::Pending);
                self.publish_depth(task.role);
            }
            ReportEffect::Failed { subtask, .. } => {
                warn!(
                    subtask_id = %subtask.id,
                    role = %subtask.role,
                    reason = subtask.failure.as_deref().unwrap_or(""),
                    "Subtask failed"
                );
                self.publish_transition(subtask, SubtaskStatus::Processing, SubtaskStatus::Failed);
                if let Some(err) = failure {
                    self.escalate(&err, Some(subtask.as_ref())).await;
                }
                self.queue.retire(&subtask.id);
            }
            ReportEffect::Duplicate { id, status } => {
                debug!(subtask_id = %id, status = %status, "Duplicate report ignored");
                return;
            }
        }
        self.publish_progress();
    }

    async fn persist(&self, task: &Subtask) {
        let Some(best) = &task.best else {
            warn!(subtask_id = %task.id, "Accepted subtask has no artifact to persist");
            return;
        };
        let path = output_path(task.role, &task.file_path);
        let commit = match self.store.write(&path, &best.artifact.content).await {
            Ok(commit) => {
                info!(subtask_id = %task.id, path = %path, commit = %commit, "Artifact persisted");
                Some(commit)
            }
            Err(e) => {
                error!(subtask_id = %task.id, path = %path, error = %e, "Failed to persist artifact");
                self.escalate(&e, Some(task)).await;
                None
            }
        };
        self.persisted.lock().push(PersistedArtifact {
            subtask_id: task.id.clone(),
            role: task.role,
            file_path: task.file_path.clone(),
            output_path: path,
            commit,
            confidence: best.confidence(),
            backend: best.artifact.backend.clone(),
        });
    }

    fn spawn_follow_ons(&self, parent: &Subtask) {
        let content = parent
            .best
            .as_ref()
            .map(|b| b.artifact.content.clone())
            .unwrap_or_default();
        for role in parent.role.follow_ons() {
            let child = Subtask::follow_on(parent, *role, follow_on_instruction(*role, &parent.file_path))
                .with_context(content.clone());
            match self.queue.enqueue(child) {
                Ok(id) => {
                    debug!(subtask_id = %id, parent = %parent.id, "Follow-on spawned");
                    self.publish_status(&id, *role, &parent.file_path, None, SubtaskStatus::Pending, 0);
                    self.publish_depth(*role);
                }
                Err(WorkforgeError::DuplicateId(id)) => {
                    warn!(subtask_id = %id, "Follow-on already exists, ignoring");
                }
                Err(e) => error!(parent = %parent.id, error = %e, "Failed to spawn follow-on"),
            }
        }
    }

    async fn escalate(&self, err: &WorkforgeError, subtask: Option<&Subtask>) {
        let goal = self.goal();
        let context = match subtask {
            Some(task) => EscalationContext::for_subtask(goal, task),
            None => EscalationContext::for_goal(goal),
        };
        self.escalations.fetch_add(1, Ordering::SeqCst);
        self.hub.publish(StatusEvent::Escalation {
            subtask_id: context.subtask_id.clone(),
            role: context.role,
            error: err.to_string(),
        });
        if let Err(e) = self.escalation.escalate(err, &context).await {
            error!(error = %e, escalated = %err, "Escalation sink failed");
        }
    }

    pub fn concurrency_ceiling(&self) -> usize {
        self.concurrency_ceiling.load(Ordering::SeqCst)
    }

    pub fn set_concurrency_ceiling(&self, ceiling: usize) -> WorkforgeResult<()> {
        if ceiling == 0 {
            return Err(WorkforgeError::Config(
                "concurrency ceiling must be at least 1".into(),
            ));
        }
        let previous = self.concurrency_ceiling.swap(ceiling, Ordering::SeqCst);
        if previous != ceiling {
            info!(from = previous, to = ceiling, "Concurrency ceiling changed");
        }
        Ok(())
    }

    pub fn structure_ceiling(&self) -> usize {
        self.structure_ceiling.load(Ordering::SeqCst)
    }

    pub fn escalation_count(&self) -> u64 {
        self.escalations.load(Ordering::SeqCst)
    }

    pub fn persisted(&self) -> Vec<PersistedArtifact> {
        self.persisted.lock().clone()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        self.queue.snapshot()
    }

    pub fn progress(&self) -> Progress {
        Progress::from_snapshot(&self.queue.snapshot(), self.structure_ceiling())
    }

    /// Every known subtask is terminal and no outcome is still spawning
    /// follow-ons.
    pub fn is_complete(&self) -> bool {
        // Terminal state is read first: a report marks its guard before it
        // changes any status.
        self.queue.all_terminal() && self.settling.load(Ordering::SeqCst) == 0
    }

    /// Drop all subtasks and run state.
    pub fn reset(&self) {
        self.queue.reset();
        self.structure_ceiling.store(0, Ordering::SeqCst);
        self.persisted.lock().clear();
        self.goal.write().clear();
        info!("Coordinator reset");
        for role in Role::ALL {
            self.publish_depth(role);
        }
        self.publish_progress();
    }

    fn publish_transition(&self, task: &Subtask, from: SubtaskStatus, to: SubtaskStatus) {
        self.publish_status(&task.id, task.role, &task.file_path, Some(from), to, task.rework_count);
    }

    fn publish_status(
        &self,
        id: &SubtaskId,
        role: Role,
        file_path: &str,
        from: Option<SubtaskStatus>,
        to: SubtaskStatus,
        rework_count: u32,
    ) {
        self.hub.publish(StatusEvent::SubtaskStatus {
            id: id.clone(),
            role,
            file_path: file_path.to_string(),
            from,
            to,
            rework_count,
        });
    }

    fn publish_depth(&self, role: Role) {
        self.hub.publish(StatusEvent::QueueDepth {
            role,
            depth: self.queue.depth(role),
        });
    }

    fn publish_progress(&self) {
        self.hub.publish(StatusEvent::Progress {
            progress: self.progress(),
        });
    }
}
