use super::{call_client, status_error, transport_error, GenerationBackend, GenerationRequest};
use crate::config::BackendSpec;
use async_trait::async_trait;
use workforge_core::{WorkforgeError, WorkforgeResult};

const API_VERSION: &str = "2023-06-01";

/// Anthropic Messages API backend.
pub struct AnthropicBackend {
    spec: BackendSpec,
}

impl AnthropicBackend {
    pub fn new(spec: BackendSpec) -> Self {
        Self { spec }
    }

    fn build_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut body = serde_json::json!({
            "model": self.spec.model,
            "max_tokens": request.max_tokens.unwrap_or(self.spec.max_tokens),
            "temperature": request.temperature.unwrap_or(self.spec.temperature),
            "messages": [{ "role": "user", "content": request.prompt }],
        });
        if let Some(sys) = &request.system_prompt {
            body["system"] = serde_json::json!(sys);
        }
        body
    }
}

#[async_trait]
impl GenerationBackend for AnthropicBackend {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn generate(&self, request: &GenerationRequest) -> WorkforgeResult<String> {
        let url = format!("{}/v1/messages", self.spec.base_url());
        let http = call_client(&self.spec)?;

        let mut builder = http
            .post(&url)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json");
        if let Some(key) = self.spec.resolve_api_key() {
            builder = builder.header("x-api-key", key);
        }

        let resp = builder
            .json(&self.build_body(request))
            .send()
            .await
            .map_err(|e| transport_error(&self.spec, e))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| transport_error(&self.spec, e))?;
        if !status.is_success() {
            return Err(status_error(&self.spec.name, status.as_u16(), &text));
        }

        let body: serde_json::Value = serde_json::from_str(&text)?;
        parse_messages_response(&body)
    }
}

/// Concatenate every text block of a Messages API response.
fn parse_messages_response(body: &serde_json::Value) -> WorkforgeResult<String> {
    let blocks = body["content"].as_array().ok_or_else(|| {
        WorkforgeError::ProviderTransient(format!("response has no content array: {body}"))
    })?;

    let text: String = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect::<Vec<_>>()
        .join("");

    if text.trim().is_empty() {
        return Err(WorkforgeError::ProviderTransient(
            "backend returned empty content".into(),
        ));
    }
    Ok(text)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::BackendKind;

    #[test]
    fn test_parse_joins_text_blocks() {
        let body = serde_json::json!({
            "content": [
                { "type": "text", "text": "# Title\n" },
                { "type": "tool_use", "id": "x" },
                { "type": "text", "text": "body" }
            ]
        });
        assert_eq!(parse_messages_response(&body).unwrap(), "# Title\nbody");
    }

    #[test]
    fn test_parse_missing_content() {
        assert!(parse_messages_response(&serde_json::json!({"type": "error"})).is_err());
    }

    #[test]
    fn test_system_prompt_is_top_level() {
        let backend = AnthropicBackend::new(BackendSpec::new(
            "claude",
            BackendKind::Anthropic,
            "claude-sonnet-4",
        ));
        let body = backend.build_body(&GenerationRequest::new("doc it").with_system_prompt("sys"));
        assert_eq!(body["system"], "sys");
        assert_eq!(body["messages"].as_array().unwrap().len(), 1);
    }
}
