pub mod anthropic;
pub mod openai;

use crate::config::{BackendKind, BackendSpec};
use async_trait::async_trait;
use workforge_core::{WorkforgeError, WorkforgeResult};

/// A single generation request, already rendered for a role.
#[derive(Debug, Clone, Default)]
pub struct GenerationRequest {
    pub system_prompt: Option<String>,
    pub prompt: String,
    /// Overrides the backend's configured temperature.
    pub temperature: Option<f32>,
    /// Overrides the backend's configured token budget.
    pub max_tokens: Option<u32>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(system_prompt.into());
        self
    }
}

/// Trait for generation backends.
///
/// Each provider protocol (OpenAI-compatible, Anthropic, ...) implements this
/// trait. Implementations must acquire any connection state inside
/// [`generate`](GenerationBackend::generate) and release it before returning.
///
/// To add a new provider:
/// 1. Create a new module in `backends/`
/// 2. Implement `GenerationBackend` for your struct
/// 3. Add the variant to `BackendKind` in `config.rs`
/// 4. Wire it up in [`build_backend`]
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Name used in logs and health reports.
    fn name(&self) -> &str;

    /// Produce text for the request or fail.
    async fn generate(&self, request: &GenerationRequest) -> WorkforgeResult<String>;
}

/// Construct the backend for a spec.
pub fn build_backend(spec: &BackendSpec) -> WorkforgeResult<Box<dyn GenerationBackend>> {
    spec.validate()?;
    let backend: Box<dyn GenerationBackend> = match spec.kind {
        BackendKind::OpenAi | BackendKind::OpenRouter | BackendKind::Groq | BackendKind::Ollama => {
            Box::new(openai::OpenAiBackend::new(spec.clone()))
        }
        BackendKind::Anthropic => Box::new(anthropic::AnthropicBackend::new(spec.clone())),
    };
    Ok(backend)
}

/// Whether an HTTP status or body signals an exhausted quota / rate limit.
pub fn is_quota_response(status: u16, body: &str) -> bool {
    if status == 429 {
        return true;
    }
    let lower = body.to_lowercase();
    lower.contains("quota") || lower.contains("rate limit") || lower.contains("rate_limit")
}

/// Whether an error produced by a backend was a quota rejection.
pub fn is_quota_error(err: &WorkforgeError) -> bool {
    match err {
        WorkforgeError::ProviderTransient(msg) => msg.starts_with(QUOTA_PREFIX),
        _ => false,
    }
}

pub(crate) const QUOTA_PREFIX: &str = "quota exceeded";

/// Map a non-success HTTP response into a retryable provider error.
pub(crate) fn status_error(backend: &str, status: u16, body: &str) -> WorkforgeError {
    if is_quota_response(status, body) {
        WorkforgeError::ProviderTransient(format!("{QUOTA_PREFIX} on {backend} ({status}): {body}"))
    } else {
        WorkforgeError::ProviderTransient(format!("{backend} API error {status}: {body}"))
    }
}

/// Map a transport error, keeping timeouts distinct.
pub(crate) fn transport_error(spec: &BackendSpec, err: reqwest::Error) -> WorkforgeError {
    if err.is_timeout() {
        WorkforgeError::Timeout(spec.timeout_secs)
    } else {
        WorkforgeError::Http(format!("{}: {err}", spec.name))
    }
}

/// Fresh client for a single call, bounded by the spec's timeout.
pub(crate) fn call_client(spec: &BackendSpec) -> WorkforgeResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(spec.timeout())
        .pool_max_idle_per_host(0)
        .build()
        .map_err(|e| WorkforgeError::Http(format!("failed to build HTTP client: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_detection() {
        assert!(is_quota_response(429, ""));
        assert!(is_quota_response(403, "You exceeded your current quota"));
        assert!(is_quota_response(400, "{\"error\":{\"type\":\"rate_limit_error\"}}"));
        assert!(!is_quota_response(500, "internal error"));
    }

    #[test]
    fn test_status_error_classifies_quota() {
        let err = status_error("groq", 429, "slow down");
        assert!(is_quota_error(&err));
        let err = status_error("groq", 502, "bad gateway");
        assert!(!is_quota_error(&err));
        assert!(err.to_string().contains("502"));
    }

    #[test]
    fn test_build_backend_names() {
        let spec = BackendSpec::new("primary", BackendKind::Anthropic, "claude-sonnet-4");
        let backend = build_backend(&spec).unwrap();
        assert_eq!(backend.name(), "primary");

        let spec = BackendSpec::new("fallback", BackendKind::Ollama, "llama3");
        assert_eq!(build_backend(&spec).unwrap().name(), "fallback");
    }
}
