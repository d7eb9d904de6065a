use crate::config::RoleConfig;
use crate::coordinator::Coordinator;
use crate::evaluator::MetricEvaluator;
use crate::hub::{StatusEvent, StatusHub};
use crate::monitor::{ClaimEnd, WorkerMonitor, WorkerState, WorkerStatus};
use crate::profiles::{output_path, RoleProfile};
use crate::task_queue::{Claim, ReportEffect};
use crate::types::{Artifact, LoadLevel, LoadLevels, Outcome, ScoredArtifact, Subtask, SubtaskId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use workforge_core::{Role, WorkforgeResult};
use workforge_provider::ProviderSet;

/// Runtime-adjustable settings of one role's worker.
struct RoleSettings {
    idle_ms: AtomicU64,
    load_levels: RwLock<LoadLevels>,
    profile: RwLock<RoleProfile>,
}

impl RoleSettings {
    fn new(role: Role) -> Self {
        Self {
            idle_ms: AtomicU64::new(LoadLevels::default().normal_ms),
            load_levels: RwLock::new(LoadLevels::default()),
            profile: RwLock::new(RoleProfile::for_role(role, None)),
        }
    }

    fn idle_interval(&self) -> Duration {
        Duration::from_millis(self.idle_ms.load(Ordering::SeqCst))
    }
}

/// Everything a worker loop needs, cloned into its task.
#[derive(Clone)]
struct WorkerContext {
    role: Role,
    coordinator: Arc<Coordinator>,
    providers: Arc<ProviderSet>,
    evaluator: Arc<MetricEvaluator>,
    monitor: Arc<WorkerMonitor>,
    hub: Arc<StatusHub>,
    settings: Arc<RoleSettings>,
}

impl WorkerContext {
    fn publish(&self, state: Option<WorkerState>) {
        if let Some(state) = state {
            self.hub.publish(StatusEvent::Worker { state });
        }
    }
}

struct RunningWorker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// One polling loop per role.
///
/// A worker claims the head of its role's queue, generates through the role's
/// provider chain, scores the result and reports the outcome. With nothing to
/// claim (or the concurrency ceiling reached) it sleeps for the role's idle
/// interval. Stopping is cooperative: a claim still waiting on generation is
/// handed back to its queue.
pub struct WorkerPool {
    coordinator: Arc<Coordinator>,
    providers: Arc<ProviderSet>,
    evaluator: Arc<MetricEvaluator>,
    monitor: Arc<WorkerMonitor>,
    hub: Arc<StatusHub>,
    settings: HashMap<Role, Arc<RoleSettings>>,
    running: Mutex<HashMap<Role, RunningWorker>>,
}

impl WorkerPool {
    pub fn new(
        coordinator: Arc<Coordinator>,
        providers: Arc<ProviderSet>,
        evaluator: Arc<MetricEvaluator>,
        monitor: Arc<WorkerMonitor>,
        hub: Arc<StatusHub>,
    ) -> Self {
        let settings = Role::ALL
            .iter()
            .map(|role| (*role, Arc::new(RoleSettings::new(*role))))
            .collect();
        Self {
            coordinator,
            providers,
            evaluator,
            monitor,
            hub,
            settings,
            running: Mutex::new(HashMap::new()),
        }
    }

    fn settings(&self, role: Role) -> Arc<RoleSettings> {
        match self.settings.get(&role) {
            Some(s) => Arc::clone(s),
            // every role is inserted in `new`
            None => Arc::new(RoleSettings::new(role)),
        }
    }

    /// Apply a role's idle interval, load presets and prompt.
    pub async fn configure_role(&self, role: Role, config: &RoleConfig) {
        let settings = self.settings(role);
        *settings.load_levels.write() = config.load_levels;
        *settings.profile.write() = RoleProfile::for_role(role, config.system_prompt.as_deref())
            .with_temperature(config.temperature);
        self.set_idle_interval(role, Duration::from_millis(config.idle_interval_ms))
            .await;
    }

    /// Spawn the role's loop. Returns `false` if it is already running.
    pub async fn start(&self, role: Role) -> bool {
        let mut running = self.running.lock().await;
        if let Some(worker) = running.get(&role) {
            if !worker.handle.is_finished() {
                return false;
            }
        }
        let (stop, stop_rx) = watch::channel(false);
        let ctx = WorkerContext {
            role,
            coordinator: Arc::clone(&self.coordinator),
            providers: Arc::clone(&self.providers),
            evaluator: Arc::clone(&self.evaluator),
            monitor: Arc::clone(&self.monitor),
            hub: Arc::clone(&self.hub),
            settings: self.settings(role),
        };
        let handle = tokio::spawn(run_worker(ctx, stop_rx));
        running.insert(role, RunningWorker { stop, handle });
        info!(role = %role, "Worker started");
        true
    }

    /// Signal the role's loop to stop and wait for it. Returns `false` if it
    /// was not running.
    pub async fn stop(&self, role: Role) -> bool {
        let worker = self.running.lock().await.remove(&role);
        let Some(worker) = worker else {
            return false;
        };
        let _ = worker.stop.send(true);
        if let Err(e) = worker.handle.await {
            error!(role = %role, error = %e, "Worker task ended abnormally");
        }
        info!(role = %role, "Worker stopped");
        true
    }

    pub async fn start_all(&self) {
        for role in Role::ALL {
            self.start(role).await;
        }
    }

    pub async fn stop_all(&self) {
        for role in Role::ALL {
            self.stop(role).await;
        }
    }

    pub async fn is_running(&self, role: Role) -> bool {
        self.running
            .lock()
            .await
            .get(&role)
            .is_some_and(|w| !w.handle.is_finished())
    }

    /// Roles whose loop is currently alive.
    pub async fn running_roles(&self) -> Vec<Role> {
        let running = self.running.lock().await;
        let mut roles: Vec<Role> = running
            .iter()
            .filter(|(_, w)| !w.handle.is_finished())
            .map(|(r, _)| *r)
            .collect();
        roles.sort();
        roles
    }

    pub fn idle_interval(&self, role: Role) -> Duration {
        self.settings(role).idle_interval()
    }

    /// Takes effect from the worker's next idle sleep.
    pub async fn set_idle_interval(&self, role: Role, interval: Duration) {
        let ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self.settings(role).idle_ms.store(ms, Ordering::SeqCst);
        debug!(role = %role, idle_ms = ms, "Idle interval set");
        let state = self.monitor.set_idle_interval(role, ms).await;
        if let Some(state) = state {
            self.hub.publish(StatusEvent::Worker { state });
        }
    }

    /// Switch the role to one of its idle-interval presets.
    pub async fn set_load_level(&self, role: Role, level: LoadLevel) -> Duration {
        let ms = self.settings(role).load_levels.read().interval_ms(level);
        let interval = Duration::from_millis(ms);
        info!(role = %role, level = ?level, idle_ms = ms, "Load level set");
        self.set_idle_interval(role, interval).await;
        interval
    }
}

async fn run_worker(ctx: WorkerContext, mut stop_rx: watch::Receiver<bool>) {
    let role = ctx.role;
    ctx.publish(ctx.monitor.set_status(role, WorkerStatus::Idle).await);
    ctx.publish(
        ctx.monitor
            .set_idle_interval(role, ctx.settings.idle_ms.load(Ordering::SeqCst))
            .await,
    );

    loop {
        if *stop_rx.borrow_and_update() {
            break;
        }
        match ctx.coordinator.claim(role) {
            Claim::Claimed(subtask) => process(&ctx, *subtask, &mut stop_rx).await,
            Claim::Empty | Claim::Saturated => {
                tokio::select! {
                    _ = tokio::time::sleep(ctx.settings.idle_interval()) => {}
                    _ = stopped(&mut stop_rx) => {}
                }
            }
        }
    }

    ctx.publish(ctx.monitor.set_status(role, WorkerStatus::Stopped).await);
}

/// Resolves once a stop is requested or the pool is gone.
async fn stopped(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn process(ctx: &WorkerContext, subtask: Subtask, stop_rx: &mut watch::Receiver<bool>) {
    let role = ctx.role;
    let id = subtask.id.clone();
    ctx.publish(ctx.monitor.start_subtask(role, id.clone()).await);

    let request = ctx.settings.profile.read().request_for(&subtask);
    let started = Instant::now();
    let generated = tokio::select! {
        biased;
        _ = stopped(stop_rx) => None,
        result = ctx.providers.generate(role, &request) => Some(result),
    };

    let exhausted = matches!(generated, Some(Err(_)));
    let end = match generated {
        None => match ctx.coordinator.release(&id) {
            Ok(()) => ClaimEnd::Abandoned,
            Err(e) => {
                warn!(subtask_id = %id, error = %e, "Could not release abandoned claim");
                ClaimEnd::Abandoned
            }
        },
        Some(Err(err)) => {
            warn!(subtask_id = %id, role = %role, error = %err, "Generation failed");
            log_report(&id, ctx.coordinator.fail(&id, subtask.attempt, err).await)
        }
        Some(Ok(generated)) => {
            let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            ctx.monitor
                .record_generation(role, generated.attempts, elapsed)
                .await;
            let artifact = Artifact::new(
                id.clone(),
                role,
                output_path(role, &subtask.file_path),
                generated.text,
            )
            .with_backend(generated.backend);
            let evaluation = ctx.evaluator.evaluate(role, &artifact).await;
            let passed = evaluation.passed;
            let scored = ScoredArtifact {
                artifact,
                evaluation,
            };
            let outcome = if passed {
                Outcome::Accepted(scored)
            } else {
                Outcome::NeedsRework(scored)
            };
            let result = ctx.coordinator.report(&id, subtask.attempt, outcome).await;
            log_report(&id, result)
        }
    };

    ctx.publish(ctx.monitor.finish_subtask(role, end).await);
    // Shown as `error` until the next claim.
    if exhausted {
        ctx.publish(ctx.monitor.record_error(role).await);
    }
}

fn log_report(id: &SubtaskId, result: WorkforgeResult<ReportEffect>) -> ClaimEnd {
    match result {
        Ok(effect) => claim_end(&effect),
        Err(e) => {
            // The subtask vanished under us, e.g. after a reset.
            warn!(subtask_id = %id, error = %e, "Report rejected");
            ClaimEnd::Abandoned
        }
    }
}

/// How a settled report counts in the worker's metrics. A duplicate report
/// settled nothing, so the claim counts as abandoned.
fn claim_end(effect: &ReportEffect) -> ClaimEnd {
    match effect {
        ReportEffect::Accepted(_) => ClaimEnd::Accepted,
        ReportEffect::Requeued(_) => ClaimEnd::Reworked,
        ReportEffect::Failed { .. } => ClaimEnd::Failed,
        ReportEffect::Duplicate { .. } => ClaimEnd::Abandoned,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::types::SubtaskStatus;
    use workforge_core::WorkforgeError;

    #[test]
    fn test_claim_end_per_effect() {
        let task = Box::new(Subtask::executor("a.py", "a"));
        assert_eq!(claim_end(&ReportEffect::Accepted(task.clone())), ClaimEnd::Accepted);
        assert_eq!(claim_end(&ReportEffect::Requeued(task.clone())), ClaimEnd::Reworked);
        assert_eq!(
            claim_end(&ReportEffect::Failed {
                subtask: task,
                ceiling_exceeded: false,
            }),
            ClaimEnd::Failed
        );
        let duplicate = ReportEffect::Duplicate {
            id: "executor:a.py".into(),
            status: SubtaskStatus::Accepted,
        };
        assert_eq!(claim_end(&duplicate), ClaimEnd::Abandoned);
    }

    #[test]
    fn test_rejected_report_is_abandoned() {
        let err = WorkforgeError::UnknownSubtask("executor:a.py".into());
        assert_eq!(log_report(&"executor:a.py".into(), Err(err)), ClaimEnd::Abandoned);
    }
}
