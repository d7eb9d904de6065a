use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use workforge_core::{WorkforgeError, WorkforgeResult};

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    OpenAi,
    OpenRouter,
    /// Groq cloud inference, OpenAI-compatible API with tight free-tier quotas.
    Groq,
    /// Local Ollama server through its OpenAI-compatible endpoint.
    Ollama,
    /// Anthropic Messages API.
    Anthropic,
}

impl BackendKind {
    /// Default API root when a spec does not set `base_url`.
    pub fn default_base_url(&self) -> &'static str {
        match self {
            BackendKind::OpenAi => "https://api.openai.com",
            BackendKind::OpenRouter => "https://openrouter.ai/api",
            BackendKind::Groq => "https://api.groq.com/openai",
            BackendKind::Ollama => "http://localhost:11434",
            BackendKind::Anthropic => "https://api.anthropic.com",
        }
    }
}

/// Inclusive `[min, max]` range in milliseconds for the pre-attempt delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacingRange(pub u64, pub u64);

impl PacingRange {
    /// Create a range; arguments may be given in either order.
    pub fn new(min_ms: u64, max_ms: u64) -> Self {
        Self(min_ms.min(max_ms), min_ms.max(max_ms))
    }

    /// Lower bound in milliseconds.
    pub fn min_ms(&self) -> u64 {
        self.0
    }

    /// Upper bound in milliseconds.
    pub fn max_ms(&self) -> u64 {
        self.1
    }

    /// Draw a delay uniformly from the range.
    pub fn sample(&self) -> Duration {
        if self.0 >= self.1 {
            return Duration::from_millis(self.0);
        }
        let ms = rand::thread_rng().gen_range(self.0..=self.1);
        Duration::from_millis(ms)
    }
}

/// One named generation backend in a role's chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    pub kind: BackendKind,
    pub model: String,
    /// Literal key. Prefer `api_key_env` outside of tests.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    /// Environment variable holding the key.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub pacing_ms: PacingRange,
    /// Hard upper bound for one generation call.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_timeout_secs() -> u64 {
    120
}

impl BackendSpec {
    /// Minimal spec with defaults, used by tests and programmatic setups.
    pub fn new(name: impl Into<String>, kind: BackendKind, model: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            model: model.into(),
            api_key: None,
            api_key_env: None,
            base_url: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            pacing_ms: PacingRange::default(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn base_url(&self) -> &str {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/'),
            None => self.kind.default_base_url(),
        }
    }

    /// Literal key first, then the configured environment variable.
    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(key) = &self.api_key {
            return Some(key.clone());
        }
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|v| !v.is_empty())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject specs that cannot work at call time.
    pub fn validate(&self) -> WorkforgeResult<()> {
        if self.name.trim().is_empty() {
            return Err(WorkforgeError::Config("backend name must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(WorkforgeError::Config(format!(
                "backend '{}' has no model",
                self.name
            )));
        }
        if self.pacing_ms.0 > self.pacing_ms.1 {
            return Err(WorkforgeError::Config(format!(
                "backend '{}' pacing range [{}, {}] has min > max",
                self.name, self.pacing_ms.0, self.pacing_ms.1
            )));
        }
        if self.timeout_secs == 0 {
            return Err(WorkforgeError::Config(format!(
                "backend '{}' timeout_secs must be at least 1",
                self.name
            )));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(WorkforgeError::Config(format!(
                "backend '{}' temperature {} outside [0, 2]",
                self.name, self.temperature
            )));
        }
        Ok(())
    }
}

/// Retry behaviour applied to every backend of a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries per backend after the first attempt, before falling back.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Fixed delay between attempts on the same backend.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

fn default_max_retries() -> u32 {
    2
}

fn default_backoff_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
        }
    }
}

impl RetryPolicy {
    /// Attempts made on one backend before the chain advances.
    pub fn attempts_per_backend(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pacing_sample_stays_in_range() {
        let range = PacingRange::new(10, 20);
        for _ in 0..200 {
            let d = range.sample().as_millis() as u64;
            assert!((10..=20).contains(&d), "sampled {d}");
        }
    }

    #[test]
    fn test_pacing_degenerate_range() {
        assert_eq!(PacingRange::new(0, 0).sample(), Duration::ZERO);
        assert_eq!(PacingRange::new(30, 5), PacingRange(5, 30));
    }

    #[test]
    fn test_spec_from_toml() {
        let spec: BackendSpec = toml::from_str(
            r#"
name = "groq-primary"
kind = "groq"
model = "llama-3.1-70b"
api_key_env = "GROQ_API_KEY"
pacing_ms = [500, 1500]
"#,
        )
        .unwrap();
        assert_eq!(spec.kind, BackendKind::Groq);
        assert_eq!(spec.pacing_ms, PacingRange(500, 1500));
        assert_eq!(spec.timeout_secs, 120);
        assert_eq!(spec.base_url(), "https://api.groq.com/openai");
        spec.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_inverted_pacing() {
        let mut spec = BackendSpec::new("a", BackendKind::OpenAi, "gpt-4o");
        spec.pacing_ms = PacingRange(100, 10);
        let err = spec.validate().unwrap_err().to_string();
        assert!(err.contains("min > max"), "unexpected error: {err}");
    }

    #[test]
    fn test_base_url_override_trims_slash() {
        let mut spec = BackendSpec::new("local", BackendKind::Ollama, "llama3");
        spec.base_url = Some("http://box:11434/".into());
        assert_eq!(spec.base_url(), "http://box:11434");
    }

    #[test]
    fn test_literal_key_wins_over_env() {
        let mut spec = BackendSpec::new("a", BackendKind::OpenAi, "gpt-4o");
        spec.api_key = Some("sk-literal".into());
        spec.api_key_env = Some("WORKFORGE_TEST_UNSET_KEY".into());
        assert_eq!(spec.resolve_api_key().as_deref(), Some("sk-literal"));
    }

    #[test]
    fn test_retry_policy_attempts() {
        let policy = RetryPolicy {
            max_retries: 2,
            backoff_ms: 0,
        };
        assert_eq!(policy.attempts_per_backend(), 3);
    }
}
