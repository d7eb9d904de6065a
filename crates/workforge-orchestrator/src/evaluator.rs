use crate::types::Artifact;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// A quality dimension an artifact is scored on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    SyntaxScore,
    Readability,
    TestsPassed,
    Coverage,
}

impl Metric {
    pub const ALL: [Metric; 4] = [
        Metric::SyntaxScore,
        Metric::Readability,
        Metric::TestsPassed,
        Metric::Coverage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Metric::SyntaxScore => "syntax_score",
            Metric::Readability => "readability",
            Metric::TestsPassed => "tests_passed",
            Metric::Coverage => "coverage",
        }
    }
}

impl std::fmt::Display for Metric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Metric {
    type Err = WorkforgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Metric::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| WorkforgeError::Config(format!("Unknown metric: {s}")))
    }
}

/// Produces a score for one metric of an artifact.
///
/// Scores are expected in `[0, 1]`; values outside are clamped. An error, a
/// panic or a non-finite value counts as `0`.
#[async_trait]
pub trait MetricScorer: Send + Sync {
    async fn score(&self, artifact: &Artifact) -> WorkforgeResult<f64>;
}

/// Adapter turning a plain function into a [`MetricScorer`].
pub struct FnScorer<F>(pub F);

#[async_trait]
impl<F> MetricScorer for FnScorer<F>
where
    F: Fn(&Artifact) -> WorkforgeResult<f64> + Send + Sync,
{
    async fn score(&self, artifact: &Artifact) -> WorkforgeResult<f64> {
        (self.0)(artifact)
    }
}

/// Validated weights, thresholds and per-role metric lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationConfig {
    pub role_metrics: BTreeMap<Role, Vec<Metric>>,
    pub weights: BTreeMap<Metric, f64>,
    pub thresholds: BTreeMap<Metric, f64>,
}

impl EvaluationConfig {
    pub fn metrics_for(&self, role: Role) -> &[Metric] {
        self.role_metrics.get(&role).map_or(&[], Vec::as_slice)
    }

    pub fn weight(&self, metric: Metric) -> f64 {
        self.weights.get(&metric).copied().unwrap_or(0.0)
    }

    /// A metric without a configured threshold must score a perfect 1.0.
    pub fn threshold(&self, metric: Metric) -> f64 {
        self.thresholds.get(&metric).copied().unwrap_or(1.0)
    }
}

/// One metric's contribution to an evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricScore {
    pub metric: Metric,
    pub score: f64,
    pub weight: f64,
    pub threshold: f64,
    pub passed: bool,
}

/// Outcome of scoring one artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    pub role: Role,
    pub scores: Vec<MetricScore>,
    /// Weighted mean of the scores. Informational; gating uses `passed`.
    pub confidence: f64,
    /// Every metric met its own threshold.
    pub passed: bool,
}

impl EvaluationResult {
    pub fn score(&self, metric: Metric) -> Option<f64> {
        self.scores.iter().find(|s| s.metric == metric).map(|s| s.score)
    }

    /// Metrics that fell below their threshold.
    pub fn failing(&self) -> Vec<Metric> {
        self.scores
            .iter()
            .filter(|s| !s.passed)
            .map(|s| s.metric)
            .collect()
    }
}

/// Weighted mean of `(score, weight)` pairs; `0` when no weight is set.
pub fn weighted_confidence(scores: &[MetricScore]) -> f64 {
    let total: f64 = scores.iter().map(|s| s.weight).sum();
    if total <= 0.0 {
        return 0.0;
    }
    scores.iter().map(|s| s.score * s.weight).sum::<f64>() / total
}

/// Scores artifacts against the role's metrics and gates them on
/// per-metric thresholds.
pub struct MetricEvaluator {
    config: RwLock<Arc<EvaluationConfig>>,
    scorers: HashMap<Metric, Arc<dyn MetricScorer>>,
}

impl MetricEvaluator {
    pub fn new(config: EvaluationConfig) -> Self {
        Self {
            config: RwLock::new(Arc::new(config)),
            scorers: HashMap::new(),
        }
    }

    pub fn with_scorer(mut self, metric: Metric, scorer: Arc<dyn MetricScorer>) -> Self {
        self.scorers.insert(metric, scorer);
        self
    }

    pub fn config(&self) -> Arc<EvaluationConfig> {
        Arc::clone(&self.config.read())
    }

    /// Swap in new weights and thresholds. Evaluations already running keep
    /// the configuration they started with.
    pub fn reload(&self, config: EvaluationConfig) {
        *self.config.write() = Arc::new(config);
    }

    pub fn has_scorer(&self, metric: Metric) -> bool {
        self.scorers.contains_key(&metric)
    }

    pub async fn evaluate(&self, role: Role, artifact: &Artifact) -> EvaluationResult {
        let config = self.config();
        let mut scores = Vec::new();
        for &metric in config.metrics_for(role) {
            let score = self.score_metric(metric, artifact).await;
            let threshold = config.threshold(metric);
            scores.push(MetricScore {
                metric,
                score,
                weight: config.weight(metric),
                threshold,
                passed: score >= threshold,
            });
        }
        let confidence = weighted_confidence(&scores);
        let passed = !scores.is_empty() && scores.iter().all(|s| s.passed);
        debug!(
            role = %role,
            subtask = %artifact.subtask_id,
            confidence,
            passed,
            "Artifact evaluated"
        );
        EvaluationResult {
            role,
            scores,
            confidence,
            passed,
        }
    }

    async fn score_metric(&self, metric: Metric, artifact: &Artifact) -> f64 {
        let Some(scorer) = self.scorers.get(&metric) else {
            warn!(metric = %metric, "No scorer registered, scoring 0");
            return 0.0;
        };
        match AssertUnwindSafe(scorer.score(artifact)).catch_unwind().await {
            Ok(Ok(score)) if score.is_finite() => score.clamp(0.0, 1.0),
            Ok(Ok(score)) => {
                warn!(metric = %metric, score, "Scorer returned a non-finite value, scoring 0");
                0.0
            }
            Ok(Err(e)) => {
                warn!(metric = %metric, error = %e, "Scorer failed, scoring 0");
                0.0
            }
            Err(_) => {
                warn!(metric = %metric, "Scorer panicked, scoring 0");
                0.0
            }
        }
    }
}
