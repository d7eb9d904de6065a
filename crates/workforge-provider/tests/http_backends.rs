//! HTTP backend and chain tests against a local wiremock server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use workforge_core::{Role, WorkforgeError};
use workforge_provider::backends::is_quota_error;
use workforge_provider::*;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn openai_spec(name: &str, server: &MockServer) -> BackendSpec {
    let mut spec = BackendSpec::new(name, BackendKind::OpenAi, "gpt-4o-mini");
    spec.base_url = Some(server.uri());
    spec.api_key = Some("sk-test".into());
    spec.timeout_secs = 5;
    spec
}

fn instant_policy(max_retries: u32) -> RetryPolicy {
    RetryPolicy {
        max_retries,
        backoff_ms: 0,
    }
}

#[tokio::test]
async fn openai_backend_returns_message_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "role": "assistant", "content": "print('a')" } }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let backend = build_backend(&openai_spec("primary", &server)).unwrap();
    let text = backend
        .generate(&GenerationRequest::new("write a.py"))
        .await
        .unwrap();
    assert_eq!(text, "print('a')");
}

#[tokio::test]
async fn openai_backend_classifies_429_as_quota() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).set_body_string("Too Many Requests"))
        .mount(&server)
        .await;

    let backend = build_backend(&openai_spec("primary", &server)).unwrap();
    let err = backend
        .generate(&GenerationRequest::new("x"))
        .await
        .unwrap_err();
    assert!(is_quota_error(&err), "unexpected error: {err}");
}

#[tokio::test]
async fn anthropic_backend_sends_version_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .and(header("anthropic-version", "2023-06-01"))
        .and(header("x-api-key", "ak-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "content": [{ "type": "text", "text": "# a.py\nDocs." }]
        })))
        .mount(&server)
        .await;

    let mut spec = BackendSpec::new("claude", BackendKind::Anthropic, "claude-sonnet-4");
    spec.base_url = Some(server.uri());
    spec.api_key = Some("ak-test".into());

    let text = build_backend(&spec)
        .unwrap()
        .generate(&GenerationRequest::new("document a.py"))
        .await
        .unwrap();
    assert!(text.starts_with("# a.py"));
}

#[tokio::test]
async fn chain_falls_back_from_quota_limited_primary() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(403).set_body_string("You exceeded your current quota"))
        .expect(2)
        .mount(&primary)
        .await;

    let fallback = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{ "message": { "content": "def test_a(): assert True" } }]
        })))
        .expect(1)
        .mount(&fallback)
        .await;

    let chain = ProviderChain::from_specs(
        Role::Tester,
        &[openai_spec("primary", &primary), openai_spec("fallback", &fallback)],
        instant_policy(1),
    )
    .unwrap();

    let generated = chain.generate(&GenerationRequest::new("test a.py")).await.unwrap();
    assert_eq!(generated.backend, "fallback");
    assert_eq!(generated.attempts, 3);

    let health = chain.health();
    assert_eq!(health[0].quota_hits, 2);
    assert_eq!(health[1].successes, 1);
}

#[tokio::test]
async fn chain_exhausts_when_every_server_fails() {
    let primary = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&primary)
        .await;
    let fallback = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .expect(2)
        .mount(&fallback)
        .await;

    let chain = ProviderChain::from_specs(
        Role::Tester,
        &[openai_spec("primary", &primary), openai_spec("fallback", &fallback)],
        instant_policy(1),
    )
    .unwrap();

    let err = chain.generate(&GenerationRequest::new("x")).await.unwrap_err();
    match err {
        WorkforgeError::AllProvidersExhausted {
            attempts,
            last_error,
            ..
        } => {
            assert_eq!(attempts, 4);
            assert!(last_error.contains("503"));
        }
        other => panic!("Expected AllProvidersExhausted, got {other:?}"),
    }
}
