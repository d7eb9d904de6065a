use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{info, warn};
use workforge_core::{WorkforgeError, WorkforgeResult};
use workforge_orchestrator::{EscalationContext, EscalationRecord, EscalationSink};

/// Header carrying the shared secret on outgoing escalations.
pub const SECRET_HEADER: &str = "x-webhook-secret";

/// Outgoing escalation endpoint.
#[derive(Deserialize, Clone, Debug)]
pub struct WebhookConfig {
    pub url: String,
    /// Sent as `X-Webhook-Secret` so the receiver can authenticate us.
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    10
}

/// Posts every escalation as a JSON [`EscalationRecord`].
///
/// Any non-2xx answer is an [`WorkforgeError::Escalation`]; the coordinator
/// logs it and carries on.
pub struct WebhookEscalation {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookEscalation {
    pub fn new(config: WebhookConfig) -> WorkforgeResult<Self> {
        if !(config.url.starts_with("http://") || config.url.starts_with("https://")) {
            return Err(WorkforgeError::Config(format!(
                "escalation webhook url must be http(s), got {}",
                config.url
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| WorkforgeError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }
}

#[async_trait]
impl EscalationSink for WebhookEscalation {
    async fn escalate(&self, error: &WorkforgeError, context: &EscalationContext) -> WorkforgeResult<()> {
        let record = EscalationRecord::new(error, context);
        let mut request = self.client.post(&self.config.url).json(&record);
        if let Some(secret) = &self.config.secret {
            request = request.header(SECRET_HEADER, secret);
        }

        let response = request
            .send()
            .await
            .map_err(|e| WorkforgeError::Escalation(format!("webhook unreachable: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %self.config.url, status = status.as_u16(), "Escalation webhook refused");
            return Err(WorkforgeError::Escalation(format!(
                "webhook answered {status}: {body}"
            )));
        }
        info!(kind = %record.kind, url = %self.config.url, "Escalation delivered");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: WebhookConfig =
            serde_json::from_str(r#"{"url": "https://ops.example.com/hooks/workforge"}"#).unwrap();
        assert_eq!(config.timeout_secs, 10);
        assert!(config.secret.is_none());
    }

    #[test]
    fn test_rejects_non_http_url() {
        let config = WebhookConfig {
            url: "ftp://example.com".into(),
            secret: None,
            timeout_secs: 1,
        };
        assert!(WebhookEscalation::new(config).is_err());
    }
}
