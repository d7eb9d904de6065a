use super::{call_client, status_error, transport_error, GenerationBackend, GenerationRequest};
use crate::config::{BackendKind, BackendSpec};
use async_trait::async_trait;
use tracing::debug;
use workforge_core::{WorkforgeError, WorkforgeResult};

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the OpenAI chat completions API.
pub struct OpenAiBackend {
    spec: BackendSpec,
}

impl OpenAiBackend {
    pub fn new(spec: BackendSpec) -> Self {
        Self { spec }
    }

    fn build_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let mut messages = Vec::new();
        if let Some(sys) = &request.system_prompt {
            messages.push(serde_json::json!({ "role": "system", "content": sys }));
        }
        messages.push(serde_json::json!({ "role": "user", "content": request.prompt }));

        serde_json::json!({
            "model": self.spec.model,
            "max_tokens": request.max_tokens.unwrap_or(self.spec.max_tokens),
            "temperature": request.temperature.unwrap_or(self.spec.temperature),
            "messages": messages,
        })
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header("Content-Type", "application/json");
        let request = match self.spec.resolve_api_key() {
            Some(key) => request.header("Authorization", format!("Bearer {key}")),
            None => request,
        };

        // OpenRouter requires extra headers
        if matches!(self.spec.kind, BackendKind::OpenRouter) {
            request.header("X-Title", "Workforge")
        } else {
            request
        }
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn generate(&self, request: &GenerationRequest) -> WorkforgeResult<String> {
        let url = format!("{}/v1/chat/completions", self.spec.base_url());
        let body = self.build_body(request);

        let http = call_client(&self.spec)?;
        let resp = self
            .add_provider_headers(http.post(&url))
            .json(&body)
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

        let resp_body: serde_json::Value = serde_json::from_str(&text)?;
        debug!(backend = %self.spec.name, bytes = text.len(), "Chat completion received");
        parse_openai_response(&resp_body)
    }
}

fn parse_openai_response(body: &serde_json::Value) -> WorkforgeResult<String> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| {
            WorkforgeError::ProviderTransient(format!(
                "response has no choices[0].message.content: {body}"
            ))
        })?;
    if content.trim().is_empty() {
        return Err(WorkforgeError::ProviderTransient(
            "backend returned empty content".into(),
        ));
    }
    Ok(content.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_response() {
        let body = serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "def f(): pass" } }]
        });
        assert_eq!(parse_openai_response(&body).unwrap(), "def f(): pass");
    }

    #[test]
    fn test_parse_response_rejects_empty() {
        let body = serde_json::json!({ "choices": [{ "message": { "content": "  " } }] });
        assert!(parse_openai_response(&body).is_err());
        assert!(parse_openai_response(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_body_uses_overrides() {
        let spec = BackendSpec::new("b", BackendKind::OpenAi, "gpt-4o");
        let backend = OpenAiBackend::new(spec);
        let mut request = GenerationRequest::new("write a.py").with_system_prompt("be terse");
        request.max_tokens = Some(128);
        let body = backend.build_body(&request);
        assert_eq!(body["max_tokens"], 128);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "write a.py");
    }
}
