use crate::config::{http_backend_factory, BackendFactory, WorkforgeConfig};
use crate::coordinator::{Coordinator, PersistedArtifact};
use crate::escalation::{EscalationSink, LogEscalation};
use crate::evaluator::{Metric, MetricEvaluator, MetricScorer};
use crate::hub::{StatusEvent, StatusHub, SubtaskView, Subscription, SystemSnapshot};
use crate::monitor::WorkerMonitor;
use crate::persistence::{ArtifactStore, InMemoryArtifactStore};
use crate::progress::Progress;
use crate::task_queue::{RetiredSubtask, TaskQueueManager};
use crate::types::{ControlCommand, SubtaskId, SubtaskStatus};
use crate::worker::WorkerPool;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use workforge_core::{Role, WorkforgeResult};
use workforge_provider::ProviderSet;

/// Assembles an [`Orchestrator`] from configuration and collaborators.
pub struct OrchestratorBuilder {
    config: WorkforgeConfig,
    factory: BackendFactory,
    scorers: HashMap<Metric, Arc<dyn MetricScorer>>,
    store: Option<Arc<dyn ArtifactStore>>,
    escalation: Option<Arc<dyn EscalationSink>>,
}

impl OrchestratorBuilder {
    /// Replace the HTTP backends, e.g. with mocks.
    pub fn with_backend_factory(mut self, factory: BackendFactory) -> Self {
        self.factory = factory;
        self
    }

    pub fn with_scorer(mut self, metric: Metric, scorer: Arc<dyn MetricScorer>) -> Self {
        self.scorers.insert(metric, scorer);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ArtifactStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_escalation(mut self, sink: Arc<dyn EscalationSink>) -> Self {
        self.escalation = Some(sink);
        self
    }

    /// Validate the configuration and wire every component.
    ///
    /// Without an explicit store or escalation sink, artifacts are kept in
    /// memory and escalations are logged.
    pub async fn build(self) -> WorkforgeResult<Orchestrator> {
        self.config.validate()?;
        let evaluation = self.config.evaluation_config()?;
        let mut evaluator = MetricEvaluator::new(evaluation);
        for (metric, scorer) in self.scorers {
            evaluator = evaluator.with_scorer(metric, scorer);
        }
        let evaluator = Arc::new(evaluator);
        let evaluation = evaluator.config();
        for role in Role::ALL {
            for &metric in evaluation.metrics_for(role) {
                if !evaluator.has_scorer(metric) {
                    warn!(role = %role, metric = %metric, "No scorer bound, metric will score 0");
                }
            }
        }

        let providers = Arc::new(ProviderSet::new());
        providers.replace_all(self.config.build_chains(&self.factory)?);

        let limits = &self.config.limits;
        let hub = Arc::new(StatusHub::new(limits.hub_capacity));
        let queue = Arc::new(TaskQueueManager::new(limits.retry_ceiling));
        let coordinator = Arc::new(Coordinator::new(
            queue,
            Arc::clone(&hub),
            self.escalation.unwrap_or_else(|| Arc::new(LogEscalation)),
            self.store
                .unwrap_or_else(|| Arc::new(InMemoryArtifactStore::new())),
            limits.concurrency_ceiling,
        ));
        let monitor = Arc::new(WorkerMonitor::new());
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&coordinator),
            Arc::clone(&providers),
            Arc::clone(&evaluator),
            Arc::clone(&monitor),
            Arc::clone(&hub),
        ));
        for role in Role::ALL {
            pool.configure_role(role, self.config.roles.get(role)).await;
        }

        info!(
            concurrency_ceiling = limits.concurrency_ceiling,
            retry_ceiling = limits.retry_ceiling,
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            config: RwLock::new(self.config),
            factory: self.factory,
            coordinator,
            pool,
            providers,
            evaluator,
            monitor,
            hub,
        })
    }
}

/// Outcome of [`Orchestrator::run`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub goal: String,
    pub summary: String,
    pub progress: Progress,
    pub artifacts: Vec<PersistedArtifact>,
    /// Subtasks that ended `failed`, with their reasons.
    pub failures: Vec<RetiredSubtask>,
    pub escalations: u64,
    pub duration_ms: u64,
}

/// The running system: coordinator, worker pool, providers, evaluator and
/// status hub behind one handle.
pub struct Orchestrator {
    config: RwLock<WorkforgeConfig>,
    factory: BackendFactory,
    coordinator: Arc<Coordinator>,
    pool: Arc<WorkerPool>,
    providers: Arc<ProviderSet>,
    evaluator: Arc<MetricEvaluator>,
    monitor: Arc<WorkerMonitor>,
    hub: Arc<StatusHub>,
}

impl Orchestrator {
    pub fn builder(config: WorkforgeConfig) -> OrchestratorBuilder {
        OrchestratorBuilder {
            config,
            factory: http_backend_factory(),
            scorers: HashMap::new(),
            store: None,
            escalation: None,
        }
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.providers
    }

    pub fn evaluator(&self) -> &Arc<MetricEvaluator> {
        &self.evaluator
    }

    pub fn monitor(&self) -> &Arc<WorkerMonitor> {
        &self.monitor
    }

    pub fn hub(&self) -> &Arc<StatusHub> {
        &self.hub
    }

    pub fn config(&self) -> WorkforgeConfig {
        self.config.read().clone()
    }

    /// Decompose `structure` and start every worker without waiting.
    pub async fn submit(&self, goal: &str, structure: &serde_json::Value) -> WorkforgeResult<Vec<SubtaskId>> {
        let ids = self.coordinator.decompose(goal, structure)?;
        self.pool.start_all().await;
        Ok(ids)
    }

    /// Decompose, process until every known subtask is terminal, then stop
    /// the workers and report.
    pub async fn run(&self, goal: &str, structure: &serde_json::Value) -> WorkforgeResult<RunReport> {
        let start = Instant::now();
        info!(goal = %goal, "Run starting");

        self.submit(goal, structure).await?;
        loop {
            if self.coordinator.is_complete() {
                break;
            }
            let poll = Duration::from_millis(self.config.read().limits.coordinator_poll_ms);
            tokio::time::sleep(poll).await;
        }
        self.pool.stop_all().await;

        let report = self.report(goal, start.elapsed());
        info!(
            duration_ms = report.duration_ms,
            accepted = report.progress.accepted,
            failed = report.progress.failed,
            "Run complete"
        );
        Ok(report)
    }

    fn report(&self, goal: &str, elapsed: Duration) -> RunReport {
        let snapshot = self.coordinator.snapshot();
        let progress = Progress::from_snapshot(&snapshot, self.coordinator.structure_ceiling());
        let failures: Vec<RetiredSubtask> = snapshot
            .retired
            .into_iter()
            .filter(|r| r.status == SubtaskStatus::Failed)
            .collect();
        let summary = format!(
            "{} of {} subtasks accepted, {} failed, {} rework cycles ({:.0}% complete)",
            progress.accepted,
            progress.total_known,
            progress.failed,
            progress.rework_cycles,
            progress.percent
        );
        RunReport {
            goal: goal.to_string(),
            summary,
            progress,
            artifacts: self.coordinator.persisted(),
            failures,
            escalations: self.coordinator.escalation_count(),
            duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Full system state for a newly connected monitor.
    pub async fn full_snapshot(&self) -> SystemSnapshot {
        let queue = self.coordinator.snapshot();
        let progress = Progress::from_snapshot(&queue, self.coordinator.structure_ceiling());
        let goal = self.coordinator.goal();
        SystemSnapshot {
            taken_at: Utc::now(),
            goal: (!goal.is_empty()).then_some(goal),
            queues: queue.queues,
            subtasks: queue.subtasks.iter().map(SubtaskView::from).collect(),
            retired: queue.retired,
            workers: self.monitor.snapshot().await,
            providers: self.providers.health(),
            concurrency_ceiling: self.coordinator.concurrency_ceiling(),
            progress,
        }
    }

    /// Subscribe to live events, paired with the state they start from.
    ///
    /// The receiver is registered before the snapshot is taken, so no change
    /// falls between the two.
    pub async fn subscribe(&self) -> Subscription {
        let events = self.hub.subscribe();
        let snapshot = self.full_snapshot().await;
        Subscription { snapshot, events }
    }

    /// Apply a monitoring command.
    pub async fn apply_command(&self, command: ControlCommand) -> WorkforgeResult<()> {
        info!(command = ?command, "Control command received");
        match &command {
            ControlCommand::Start { role } => {
                self.pool.start(*role).await;
            }
            ControlCommand::Stop { role } => {
                self.pool.stop(*role).await;
            }
            ControlCommand::Reset => self.reset().await,
            ControlCommand::SetConcurrencyCeiling { ceiling } => {
                self.coordinator.set_concurrency_ceiling(*ceiling)?;
            }
            ControlCommand::SetLoadLevel { role, level } => {
                self.pool.set_load_level(*role, *level).await;
            }
            ControlCommand::SetIdleInterval { role, idle_ms } => {
                self.pool
                    .set_idle_interval(*role, Duration::from_millis(*idle_ms))
                    .await;
            }
        }
        self.hub.publish(StatusEvent::Control { command });
        Ok(())
    }

    /// Clear all run state. Workers that were running are restarted on the
    /// empty queues.
    pub async fn reset(&self) {
        let running = self.pool.running_roles().await;
        self.pool.stop_all().await;
        self.coordinator.reset();
        self.monitor.reset_metrics().await;
        for role in running {
            self.pool.start(role).await;
        }
        let snapshot = self.full_snapshot().await;
        self.hub.publish(StatusEvent::Snapshot {
            snapshot: Box::new(snapshot),
        });
    }

    /// Swap in a new configuration without restarting.
    ///
    /// Everything is validated and the provider chains are built before any
    /// of it is applied; on error the running configuration is untouched.
    pub async fn apply_config(&self, config: WorkforgeConfig) -> WorkforgeResult<()> {
        config.validate()?;
        let evaluation = config.evaluation_config()?;
        let chains = config.build_chains(&self.factory)?;

        self.providers.replace_all(chains);
        self.evaluator.reload(evaluation);
        self.coordinator
            .set_concurrency_ceiling(config.limits.concurrency_ceiling)?;
        self.coordinator
            .queue()
            .set_retry_ceiling(config.limits.retry_ceiling);
        for role in Role::ALL {
            self.pool.configure_role(role, config.roles.get(role)).await;
        }

        let previous_capacity = self.config.read().limits.hub_capacity;
        if previous_capacity != config.limits.hub_capacity {
            warn!(
                from = previous_capacity,
                to = config.limits.hub_capacity,
                "hub_capacity only takes effect after a restart"
            );
        }
        *self.config.write() = config;
        info!("Configuration applied");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_run_report_serialization() {
        let report = RunReport {
            goal: "build".into(),
            summary: "Done".into(),
            progress: Progress::default(),
            artifacts: vec![],
            failures: vec![],
            escalations: 0,
            duration_ms: 12,
        };
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("Done"));
        let parsed: RunReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.duration_ms, 12);
    }
}
