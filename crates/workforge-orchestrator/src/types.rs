use crate::evaluator::EvaluationResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// Opaque subtask identifier, unique for the lifetime of a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubtaskId(String);

impl SubtaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random identifier for ad hoc subtasks.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Deterministic identifier for the `role` subtask of a file.
    pub fn for_file(role: Role, file_path: &str) -> Self {
        Self(format!("{role}:{file_path}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubtaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubtaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle status of a subtask.
///
/// `pending → processing → {accepted | needs_rework → pending | failed}`;
/// `accepted` and `failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    Pending,
    Processing,
    NeedsRework,
    Accepted,
    Failed,
}

impl SubtaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubtaskStatus::Accepted | SubtaskStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Processing => "processing",
            SubtaskStatus::NeedsRework => "needs_rework",
            SubtaskStatus::Accepted => "accepted",
            SubtaskStatus::Failed => "failed",
        }
    }

    /// Whether `self → next` is an edge of the state machine.
    pub fn can_transition_to(&self, next: SubtaskStatus) -> bool {
        use SubtaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Accepted)
                | (Processing, NeedsRework)
                | (Processing, Failed)
                | (NeedsRework, Pending)
                // abandoned claim on cooperative stop
                | (Processing, Pending)
        )
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Text produced by a worker for a subtask.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub subtask_id: SubtaskId,
    pub role: Role,
    /// Path the artifact is materialized at.
    pub output_path: String,
    pub content: String,
    /// Backend that generated the content, when known.
    pub backend: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Artifact {
    pub fn new(
        subtask_id: SubtaskId,
        role: Role,
        output_path: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            subtask_id,
            role,
            output_path: output_path.into(),
            content: content.into(),
            backend: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }
}

/// An artifact together with its evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredArtifact {
    pub artifact: Artifact,
    pub evaluation: EvaluationResult,
}

impl ScoredArtifact {
    pub fn confidence(&self) -> f64 {
        self.evaluation.confidence
    }
}

/// A unit of work targeting one file under one role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: SubtaskId,
    pub file_path: String,
    pub instruction: String,
    pub role: Role,
    pub status: SubtaskStatus,
    /// Executor subtask this one was spawned from.
    #[serde(default)]
    pub parent: Option<SubtaskId>,
    /// Accepted implementation handed to follow-on roles.
    #[serde(default)]
    pub context: Option<String>,
    /// Completed `needs_rework → pending` cycles.
    #[serde(default)]
    pub rework_count: u32,
    /// Claims taken so far. A report names the claim it answers by this
    /// number; reports for any other claim are ignored.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default)]
    pub failure: Option<String>,
    /// Highest-confidence artifact seen so far.
    #[serde(default)]
    pub best: Option<ScoredArtifact>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subtask {
    pub fn new(
        id: SubtaskId,
        role: Role,
        file_path: impl Into<String>,
        instruction: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            file_path: file_path.into(),
            instruction: instruction.into(),
            role,
            status: SubtaskStatus::Pending,
            parent: None,
            context: None,
            rework_count: 0,
            attempt: 0,
            failure: None,
            best: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The executor subtask for a file.
    pub fn executor(file_path: &str, instruction: impl Into<String>) -> Self {
        Self::new(
            SubtaskId::for_file(Role::Executor, file_path),
            Role::Executor,
            file_path,
            instruction,
        )
    }

    /// A `role` subtask spawned from an accepted parent.
    pub fn follow_on(parent: &Subtask, role: Role, instruction: impl Into<String>) -> Self {
        let mut task = Self::new(
            SubtaskId::for_file(role, &parent.file_path),
            role,
            parent.file_path.clone(),
            instruction,
        );
        task.parent = Some(parent.id.clone());
        task
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Keep `candidate` if it beats the current best on confidence.
    pub fn offer_artifact(&mut self, candidate: ScoredArtifact) {
        let better = match &self.best {
            Some(best) => candidate.confidence() > best.confidence(),
            None => true,
        };
        if better {
            self.best = Some(candidate);
        }
    }

    /// Move along one edge of the state machine.
    pub(crate) fn set_status(&mut self, next: SubtaskStatus) -> WorkforgeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(WorkforgeError::InvalidTransition {
                id: self.id.to_string(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

/// What a worker reports back for a claimed subtask.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Every metric met its threshold.
    Accepted(ScoredArtifact),
    /// At least one metric fell below its threshold.
    NeedsRework(ScoredArtifact),
    /// Unrecoverable failure.
    Failed { reason: String },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Accepted(_) => "accepted",
            Outcome::NeedsRework(_) => "needs_rework",
            Outcome::Failed { .. } => "failed",
        }
    }
}

/// Named idle-interval presets exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    /// Long idle sleeps, for a quiet queue.
    Low,
    Normal,
    /// Short idle sleeps, for a queue near saturation.
    High,
}

/// Idle intervals in milliseconds for each [`LoadLevel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadLevels {
    #[serde(default = "default_low_ms")]
    pub low_ms: u64,
    #[serde(default = "default_normal_ms")]
    pub normal_ms: u64,
    #[serde(default = "default_high_ms")]
    pub high_ms: u64,
}

fn default_low_ms() -> u64 {
    5_000
}

fn default_normal_ms() -> u64 {
    1_000
}

fn default_high_ms() -> u64 {
    200
}

impl Default for LoadLevels {
    fn default() -> Self {
        Self {
            low_ms: default_low_ms(),
            normal_ms: default_normal_ms(),
            high_ms: default_high_ms(),
        }
    }
}

impl LoadLevels {
    pub fn interval_ms(&self, level: LoadLevel) -> u64 {
        match level {
            LoadLevel::Low => self.low_ms,
            LoadLevel::Normal => self.normal_ms,
            LoadLevel::High => self.high_ms,
        }
    }
}

/// Commands a monitoring client may issue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    Start { role: Role },
    Stop { role: Role },
    Reset,
    SetConcurrencyCeiling { ceiling: usize },
    SetLoadLevel { role: Role, level: LoadLevel },
    SetIdleInterval { role: Role, idle_ms: u64 },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::evaluator::EvaluationResult;

    fn scored(confidence: f64, content: &str) -> ScoredArtifact {
        ScoredArtifact {
            artifact: Artifact::new("executor:a.py".into(), Role::Executor, "a.py", content),
            evaluation: EvaluationResult {
                role: Role::Executor,
                scores: vec![],
                confidence,
                passed: false,
            },
        }
    }

    #[test]
    fn test_subtask_creation() {
        let task = Subtask::executor("src/a.py", "Implement a.py");
        assert_eq!(task.id.as_str(), "executor:src/a.py");
        assert_eq!(task.status, SubtaskStatus::Pending);
        assert_eq!(task.role, Role::Executor);
        assert!(task.parent.is_none());
        assert_eq!(task.rework_count, 0);
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn test_follow_on_links_parent() {
        let parent = Subtask::executor("a.py", "Implement a.py");
        let child = Subtask::follow_on(&parent, Role::Tester, "Test a.py").with_context("code");
        assert_eq!(child.id.as_str(), "tester:a.py");
        assert_eq!(child.parent.as_ref(), Some(&parent.id));
        assert_eq!(child.file_path, "a.py");
        assert_eq!(child.context.as_deref(), Some("code"));
    }

    #[test]
    fn test_state_machine_edges() {
        use SubtaskStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Accepted));
        assert!(Processing.can_transition_to(NeedsRework));
        assert!(NeedsRework.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Accepted));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Accepted.can_transition_to(Pending));
        assert!(!Failed.can_transition_to(Processing));
    }

    #[test]
    fn test_set_status_follows_edges() {
        let mut task = Subtask::executor("a.py", "Implement a.py");
        let err = task.set_status(SubtaskStatus::Accepted).unwrap_err();
        assert!(matches!(err, WorkforgeError::InvalidTransition { .. }));
        assert_eq!(task.status, SubtaskStatus::Pending);

        task.set_status(SubtaskStatus::Processing).unwrap();
        task.set_status(SubtaskStatus::NeedsRework).unwrap();
        task.set_status(SubtaskStatus::Pending).unwrap();
        task.set_status(SubtaskStatus::Processing).unwrap();
        task.set_status(SubtaskStatus::Failed).unwrap();
        assert!(task.set_status(SubtaskStatus::Pending).is_err());
        assert_eq!(task.status, SubtaskStatus::Failed);
    }

    #[test]
    fn test_offer_artifact_keeps_best() {
        let mut task = Subtask::executor("a.py", "Implement a.py");
        task.offer_artifact(scored(0.4, "v1"));
        task.offer_artifact(scored(0.7, "v2"));
        task.offer_artifact(scored(0.5, "v3"));
        assert_eq!(task.best.as_ref().unwrap().artifact.content, "v2");
    }

    #[test]
    fn test_control_command_wire_format() {
        let cmd: ControlCommand =
            serde_json::from_str(r#"{"command":"set_load_level","role":"tester","level":"high"}"#)
                .unwrap();
        assert_eq!(
            cmd,
            ControlCommand::SetLoadLevel {
                role: Role::Tester,
                level: LoadLevel::High
            }
        );
        let reset: ControlCommand = serde_json::from_str(r#"{"command":"reset"}"#).unwrap();
        assert_eq!(reset, ControlCommand::Reset);
    }

    #[test]
    fn test_load_levels_default() {
        let levels = LoadLevels::default();
        assert!(levels.interval_ms(LoadLevel::High) < levels.interval_ms(LoadLevel::Normal));
        assert!(levels.interval_ms(LoadLevel::Normal) < levels.interval_ms(LoadLevel::Low));
    }
}
