//! Metric scorers backed by external commands.
//!
//! The artifact content is written to the command's stdin; the first number
//! printed on stdout is the score.

use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use workforge_core::{WorkforgeError, WorkforgeResult};
use workforge_orchestrator::{Artifact, Metric, MetricScorer};

/// `[scorers.<metric>]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

pub struct CommandScorer {
    metric: Metric,
    spec: CommandSpec,
}

impl CommandScorer {
    pub fn new(metric: Metric, spec: CommandSpec) -> Self {
        Self { metric, spec }
    }

    async fn run(&self, artifact: &Artifact) -> WorkforgeResult<String> {
        let mut child = tokio::process::Command::new(&self.spec.command)
            .args(&self.spec.args)
            .env("WORKFORGE_METRIC", self.metric.as_str())
            .env("WORKFORGE_ROLE", artifact.role.as_str())
            .env("WORKFORGE_OUTPUT_PATH", &artifact.output_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WorkforgeError::Scorer(format!("failed to start `{}`: {e}", self.spec.command))
            })?;

        let stdin = child.stdin.take();
        let content = artifact.content.clone().into_bytes();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A scorer may exit without reading everything.
                let _ = stdin.write_all(&content).await;
            }
        };

        let timeout = Duration::from_secs(self.spec.timeout_secs);
        let (_, output) = tokio::time::timeout(timeout, async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| {
            WorkforgeError::Scorer(format!(
                "{} scorer timed out after {}s",
                self.metric, self.spec.timeout_secs
            ))
        })?;
        let output = output.map_err(WorkforgeError::from)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WorkforgeError::Scorer(format!(
                "{} scorer exited with {}: {}",
                self.metric,
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// First token of `stdout` that parses as a finite number.
pub fn parse_score(stdout: &str) -> Option<f64> {
    stdout
        .split(|c: char| c.is_whitespace() || c == ',' || c == ';')
        .filter_map(|token| token.parse::<f64>().ok())
        .find(|score| score.is_finite())
}

#[async_trait]
impl MetricScorer for CommandScorer {
    async fn score(&self, artifact: &Artifact) -> WorkforgeResult<f64> {
        let stdout = self.run(artifact).await?;
        match parse_score(&stdout) {
            Some(score) => {
                debug!(metric = %self.metric, subtask_id = %artifact.subtask_id, score, "Scored");
                Ok(score)
            }
            None => {
                warn!(metric = %self.metric, output = %stdout.trim(), "Scorer printed no number");
                Err(WorkforgeError::Scorer(format!(
                    "{} scorer printed no number",
                    self.metric
                )))
            }
        }
    }
}
