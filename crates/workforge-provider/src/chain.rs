use crate::backends::{build_backend, is_quota_error, GenerationBackend, GenerationRequest};
use crate::config::{BackendSpec, PacingRange, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, warn};
use workforge_core::{Role, WorkforgeError, WorkforgeResult};

/// Type alias for the injectable sleep function used in tests.
#[cfg(test)]
type SleepFn = Box<
    dyn Fn(Duration) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

/// A backend together with its pacing and hard timeout.
pub struct ChainLink {
    backend: Box<dyn GenerationBackend>,
    pacing: PacingRange,
    timeout: Duration,
}

impl ChainLink {
    pub fn new(backend: Box<dyn GenerationBackend>, pacing: PacingRange, timeout: Duration) -> Self {
        Self {
            backend,
            pacing,
            timeout,
        }
    }

    /// Build the link described by a spec.
    pub fn from_spec(spec: &BackendSpec) -> WorkforgeResult<Self> {
        Ok(Self::new(build_backend(spec)?, spec.pacing_ms, spec.timeout()))
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }
}

/// Running health counters for one backend of a chain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendHealth {
    pub name: String,
    pub successes: u64,
    pub failures: u64,
    pub consecutive_failures: u32,
    pub quota_hits: u64,
    pub last_error: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl BackendHealth {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// No failure since the last success.
    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures == 0
    }
}

/// Text produced by a chain plus where it came from.
#[derive(Debug, Clone)]
pub struct Generated {
    pub text: String,
    pub backend: String,
    /// Attempts made across the chain, including the successful one.
    pub attempts: u32,
}

/// An ordered primary + fallback chain of generation backends for one role.
///
/// For each request it tries backends in order. Before every attempt it waits
/// a delay drawn from the backend's pacing range. A failed attempt (error,
/// quota rejection or timeout) is retried on the same backend after a fixed
/// backoff until the retry ceiling is reached, then the chain advances. When
/// every backend is spent the call fails with
/// [`WorkforgeError::AllProvidersExhausted`].
pub struct ProviderChain {
    role: Role,
    links: Vec<ChainLink>,
    policy: RetryPolicy,
    health: Mutex<Vec<BackendHealth>>,
    /// Injectable sleep function for testing (allows skipping real delays).
    #[cfg(test)]
    sleep_fn: Option<SleepFn>,
}

impl ProviderChain {
    /// Create a chain from prepared links. At least one link is required.
    pub fn new(role: Role, links: Vec<ChainLink>, policy: RetryPolicy) -> WorkforgeResult<Self> {
        if links.is_empty() {
            return Err(WorkforgeError::Config(format!(
                "provider chain for role {role} has no backends"
            )));
        }
        let health = links.iter().map(|l| BackendHealth::new(l.name())).collect();
        Ok(Self {
            role,
            links,
            policy,
            health: Mutex::new(health),
            #[cfg(test)]
            sleep_fn: None,
        })
    }

    /// Build a chain from backend specs, primary first.
    pub fn from_specs(role: Role, specs: &[BackendSpec], policy: RetryPolicy) -> WorkforgeResult<Self> {
        let links = specs
            .iter()
            .map(ChainLink::from_spec)
            .collect::<WorkforgeResult<Vec<_>>>()?;
        Self::new(role, links, policy)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Backend names in fallback order.
    pub fn backend_names(&self) -> Vec<String> {
        self.links.iter().map(|l| l.name().to_string()).collect()
    }

    /// Snapshot of per-backend health counters.
    pub fn health(&self) -> Vec<BackendHealth> {
        self.health.lock().clone()
    }

    async fn do_sleep(&self, delay: Duration) {
        #[cfg(test)]
        if let Some(ref f) = self.sleep_fn {
            f(delay).await;
            return;
        }
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    fn record_success(&self, idx: usize) {
        let mut health = self.health.lock();
        if let Some(h) = health.get_mut(idx) {
            h.successes += 1;
            h.consecutive_failures = 0;
            h.last_success_at = Some(Utc::now());
        }
    }

    fn record_failure(&self, idx: usize, err: &WorkforgeError) {
        let mut health = self.health.lock();
        if let Some(h) = health.get_mut(idx) {
            h.failures += 1;
            h.consecutive_failures = h.consecutive_failures.saturating_add(1);
            if is_quota_error(err) {
                h.quota_hits += 1;
            }
            h.last_error = Some(err.to_string());
        }
    }

    /// Run the request through the chain.
    pub async fn generate(&self, request: &GenerationRequest) -> WorkforgeResult<Generated> {
        let mut attempts: u32 = 0;
        let mut last_err: Option<WorkforgeError> = None;

        for (idx, link) in self.links.iter().enumerate() {
            for attempt in 0..=self.policy.max_retries {
                let pacing = link.pacing.sample();
                self.do_sleep(pacing).await;
                attempts += 1;

                let result = match tokio::time::timeout(link.timeout, link.backend.generate(request)).await {
                    Ok(result) => result,
                    Err(_) => Err(WorkforgeError::Timeout(link.timeout.as_secs())),
                };

                match result {
                    Ok(text) => {
                        self.record_success(idx);
                        if idx > 0 || attempt > 0 {
                            info!(
                                role = %self.role,
                                backend = %link.name(),
                                attempts,
                                "Generation succeeded after retry/fallback"
                            );
                        }
                        return Ok(Generated {
                            text,
                            backend: link.name().to_string(),
                            attempts,
                        });
                    }
                    Err(e) => {
                        self.record_failure(idx, &e);
                        let quota = is_quota_error(&e);
                        if attempt < self.policy.max_retries {
                            info!(
                                role = %self.role,
                                backend = %link.name(),
                                attempt,
                                quota,
                                delay_ms = self.policy.backoff_ms,
                                error = %e,
                                "Generation failed, backing off"
                            );
                            self.do_sleep(Duration::from_millis(self.policy.backoff_ms)).await;
                        } else {
                            warn!(
                                role = %self.role,
                                backend = %link.name(),
                                attempt,
                                quota,
                                error = %e,
                                "Backend retry ceiling reached, moving to next backend"
                            );
                        }
                        last_err = Some(e);
                    }
                }
            }
        }

        let last_error = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no attempt made".to_string());
        Err(WorkforgeError::AllProvidersExhausted {
            role: self.role,
            attempts,
            last_error,
        })
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
