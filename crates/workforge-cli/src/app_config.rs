//! The `workforge.toml` file: the reloadable orchestrator configuration plus
//! the sections only the binary reads.

use crate::scorer::CommandSpec;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use workforge_core::{WorkforgeError, WorkforgeResult};
use workforge_gateway::WebhookConfig;
use workforge_orchestrator::{Metric, WorkforgeConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(flatten)]
    pub orchestrator: WorkforgeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub escalation: EscalationConfig,
    /// External scoring commands keyed by metric name.
    #[serde(default)]
    pub scorers: BTreeMap<String, CommandSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Keys accepted by the gateway. Empty disables auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Debounce for config file reloads.
    #[serde(default = "default_reload_debounce_ms")]
    pub reload_debounce_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
            reload_debounce_ms: default_reload_debounce_ms(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_reload_debounce_ms() -> u64 {
    500
}

/// Where accepted artifacts go. Without a repository they stay in memory.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub repo_path: Option<PathBuf>,
    #[serde(default)]
    pub author: CommitAuthor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitAuthor {
    #[serde(default = "default_author_name")]
    pub name: String,
    #[serde(default = "default_author_email")]
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: default_author_name(),
            email: default_author_email(),
        }
    }
}

fn default_author_name() -> String {
    "workforge".to_string()
}
fn default_author_email() -> String {
    "workforge@localhost".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EscalationConfig {
    #[serde(default)]
    pub webhook: Option<WebhookConfig>,
}

impl AppConfig {
    pub fn from_toml_str(raw: &str) -> WorkforgeResult<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| WorkforgeError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> WorkforgeResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            WorkforgeError::Config(format!("Failed to read config '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> WorkforgeResult<()> {
        self.orchestrator.validate()?;
        for (name, spec) in &self.scorers {
            let _: Metric = name.parse()?;
            if spec.command.trim().is_empty() {
                return Err(WorkforgeError::Config(format!("scorers.{name}.command is empty")));
            }
        }
        Ok(())
    }

    /// Metrics some role is scored on that have no scoring command; they
    /// always score 0.
    pub fn unscored_metrics(&self) -> Vec<Metric> {
        let Ok(evaluation) = self.orchestrator.evaluation_config() else {
            return vec![];
        };
        let mut missing: Vec<Metric> = evaluation
            .role_metrics
            .values()
            .flatten()
            .filter(|m| !self.scorers.contains_key(m.as_str()))
            .copied()
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[limits]
concurrency_ceiling = 2

[server]
port = 8088
api_keys = ["k"]

[persistence]
repo_path = "out"

[escalation.webhook]
url = "https://ops.example.com/hook"
secret = "s"

[scorers.readability]
command = "sh"
args = ["-c", "echo 0.9"]

[scorers.syntax_score]
command = "sh"
args = ["-c", "echo 1"]

[roles.executor]
[[roles.executor.providers]]
name = "local"
kind = "ollama"
model = "qwen2.5-coder"

[roles.tester]
[[roles.tester.providers]]
name = "local"
kind = "ollama"
model = "qwen2.5-coder"

[roles.documenter]
[[roles.documenter.providers]]
name = "local"
kind = "ollama"
model = "llama3"
"#;

    #[test]
    fn test_full_file_parses() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.orchestrator.limits.concurrency_ceiling, 2);
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.server.reload_debounce_ms, 500);
        assert_eq!(config.persistence.repo_path, Some(PathBuf::from("out")));
        assert_eq!(config.persistence.author.name, "workforge");
        assert_eq!(config.escalation.webhook.unwrap().secret.as_deref(), Some("s"));
        assert_eq!(config.scorers.len(), 2);
    }

    #[test]
    fn test_unscored_metrics_listed() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.unscored_metrics(),
            vec![Metric::TestsPassed, Metric::Coverage]
        );
    }

    #[test]
    fn test_unknown_scorer_metric_rejected() {
        let raw = format!("{SAMPLE}\n[scorers.speed]\ncommand = \"true\"\n");
        let err = AppConfig::from_toml_str(&raw).unwrap_err();
        assert!(err.to_string().contains("Unknown metric: speed"));
    }

    #[test]
    fn test_orchestrator_errors_surface() {
        let raw = SAMPLE.replace("concurrency_ceiling = 2", "concurrency_ceiling = 0");
        assert!(AppConfig::from_toml_str(&raw).is_err());
    }
}
