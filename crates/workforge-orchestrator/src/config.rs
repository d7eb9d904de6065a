use crate::evaluator::{EvaluationConfig, Metric};
use crate::types::LoadLevels;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use workforge_core::{Role, WorkforgeError, WorkforgeResult};
use workforge_provider::{build_backend, BackendSpec, ChainLink, GenerationBackend, ProviderChain, RetryPolicy};

/// Builds the backend for one spec of a role's chain.
pub type BackendFactory =
    Arc<dyn Fn(Role, &BackendSpec) -> WorkforgeResult<Box<dyn GenerationBackend>> + Send + Sync>;

/// Factory producing the real HTTP backends.
pub fn http_backend_factory() -> BackendFactory {
    Arc::new(|_, spec| build_backend(spec))
}

/// Runtime limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum subtasks in `processing` at once, across all roles.
    #[serde(default = "default_concurrency_ceiling")]
    pub concurrency_ceiling: usize,
    /// Rework cycles allowed per subtask before it fails.
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: u32,
    /// How often `run` checks for completion.
    #[serde(default = "default_poll_ms")]
    pub coordinator_poll_ms: u64,
    /// Events buffered per hub subscriber before the oldest are dropped.
    #[serde(default = "default_hub_capacity")]
    pub hub_capacity: usize,
}

fn default_concurrency_ceiling() -> usize {
    3
}

fn default_retry_ceiling() -> u32 {
    3
}

fn default_poll_ms() -> u64 {
    500
}

fn default_hub_capacity() -> usize {
    256
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            concurrency_ceiling: default_concurrency_ceiling(),
            retry_ceiling: default_retry_ceiling(),
            coordinator_poll_ms: default_poll_ms(),
            hub_capacity: default_hub_capacity(),
        }
    }
}

/// `[metrics]` table, keyed by metric name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_weights")]
    pub weights: BTreeMap<String, f64>,
    #[serde(default = "default_thresholds")]
    pub thresholds: BTreeMap<String, f64>,
}

fn default_weights() -> BTreeMap<String, f64> {
    [
        ("tests_passed", 0.5),
        ("syntax_score", 0.3),
        ("readability", 0.2),
        ("coverage", 0.3),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn default_thresholds() -> BTreeMap<String, f64> {
    [
        ("tests_passed", 0.8),
        ("syntax_score", 0.9),
        ("readability", 0.5),
        ("coverage", 0.6),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            weights: default_weights(),
            thresholds: default_thresholds(),
        }
    }
}

/// `[roles.<role>]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleConfig {
    /// Metrics this role's artifacts are scored on. Defaults per role.
    #[serde(default)]
    pub metrics: Option<Vec<Metric>>,
    #[serde(default = "default_idle_interval_ms")]
    pub idle_interval_ms: u64,
    #[serde(default)]
    pub load_levels: LoadLevels,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Overrides the built-in system prompt.
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Overrides the temperature of every provider in the chain.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Ordered chain, primary first.
    #[serde(default)]
    pub providers: Vec<BackendSpec>,
}

fn default_idle_interval_ms() -> u64 {
    1_000
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            metrics: None,
            idle_interval_ms: default_idle_interval_ms(),
            load_levels: LoadLevels::default(),
            retry: RetryPolicy::default(),
            system_prompt: None,
            temperature: None,
            providers: Vec::new(),
        }
    }
}

/// Metrics a role is scored on when its table names none.
pub fn default_metrics(role: Role) -> Vec<Metric> {
    match role {
        Role::Executor => vec![Metric::SyntaxScore, Metric::Readability],
        Role::Tester => vec![Metric::TestsPassed, Metric::Coverage],
        Role::Documenter => vec![Metric::Readability],
    }
}

impl RoleConfig {
    pub fn metrics_for(&self, role: Role) -> Vec<Metric> {
        self.metrics.clone().unwrap_or_else(|| default_metrics(role))
    }
}

/// One table per role in the closed role set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RolesConfig {
    #[serde(default)]
    pub executor: RoleConfig,
    #[serde(default)]
    pub tester: RoleConfig,
    #[serde(default)]
    pub documenter: RoleConfig,
}

impl RolesConfig {
    pub fn get(&self, role: Role) -> &RoleConfig {
        match role {
            Role::Executor => &self.executor,
            Role::Tester => &self.tester,
            Role::Documenter => &self.documenter,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut RoleConfig {
        match role {
            Role::Executor => &mut self.executor,
            Role::Tester => &mut self.tester,
            Role::Documenter => &mut self.documenter,
        }
    }
}

/// Reloadable coordinator configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkforgeConfig {
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub roles: RolesConfig,
}

impl WorkforgeConfig {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> WorkforgeResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| WorkforgeError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> WorkforgeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkforgeError::Config(format!("Cannot read config {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> WorkforgeResult<()> {
        if self.limits.concurrency_ceiling == 0 {
            return Err(WorkforgeError::Config(
                "limits.concurrency_ceiling must be at least 1".into(),
            ));
        }
        if self.limits.hub_capacity == 0 {
            return Err(WorkforgeError::Config("limits.hub_capacity must be at least 1".into()));
        }
        for role in Role::ALL {
            let rc = self.roles.get(role);
            if rc.providers.is_empty() {
                return Err(WorkforgeError::Config(format!(
                    "roles.{role} needs at least one provider"
                )));
            }
            for spec in &rc.providers {
                spec.validate()?;
            }
            if let Some(t) = rc.temperature {
                if !(0.0..=2.0).contains(&t) {
                    return Err(WorkforgeError::Config(format!(
                        "roles.{role}.temperature {t} outside [0, 2]"
                    )));
                }
            }
            if rc.metrics_for(role).is_empty() {
                return Err(WorkforgeError::Config(format!(
                    "roles.{role} needs at least one metric"
                )));
            }
        }
        self.evaluation_config().map(|_| ())
    }

    /// Weights and thresholds keyed by metric, checked for range.
    pub fn evaluation_config(&self) -> WorkforgeResult<EvaluationConfig> {
        let weights = parse_metric_table("weights", &self.metrics.weights)?;
        let thresholds = parse_metric_table("thresholds", &self.metrics.thresholds)?;
        let role_metrics: BTreeMap<Role, Vec<Metric>> = Role::ALL
            .iter()
            .map(|role| (*role, self.roles.get(*role).metrics_for(*role)))
            .collect();

        for (role, metrics) in &role_metrics {
            for metric in metrics {
                if !weights.contains_key(metric) {
                    return Err(WorkforgeError::Config(format!(
                        "roles.{role} uses metric {metric} which has no weight"
                    )));
                }
                if !thresholds.contains_key(metric) {
                    return Err(WorkforgeError::Config(format!(
                        "roles.{role} uses metric {metric} which has no threshold"
                    )));
                }
            }
        }

        Ok(EvaluationConfig {
            role_metrics,
            weights,
            thresholds,
        })
    }

    /// Build every role's provider chain.
    pub fn build_chains(&self, factory: &BackendFactory) -> WorkforgeResult<Vec<ProviderChain>> {
        Role::ALL
            .iter()
            .map(|role| {
                let rc = self.roles.get(*role);
                let links = rc
                    .providers
                    .iter()
                    .map(|spec| Ok(ChainLink::new(factory(*role, spec)?, spec.pacing_ms, spec.timeout())))
                    .collect::<WorkforgeResult<Vec<_>>>()?;
                ProviderChain::new(*role, links, rc.retry)
            })
            .collect()
    }
}

fn parse_metric_table(table: &str, raw: &BTreeMap<String, f64>) -> WorkforgeResult<BTreeMap<Metric, f64>> {
    raw.iter()
        .map(|(name, value)| {
            let metric: Metric = name.parse()?;
            if !value.is_finite() || !(0.0..=1.0).contains(value) {
                return Err(WorkforgeError::Config(format!(
                    "metrics.{table}.{name} = {value} is outside [0, 1]"
                )));
            }
            Ok((metric, *value))
        })
        .collect()
}
