#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use workforge_core::{Role, WorkforgeError, WorkforgeResult};
use workforge_gateway::{AuthConfig, GatewayServer, WebhookConfig, WebhookEscalation};
use workforge_orchestrator::{
    Artifact, EscalationContext, EscalationSink, FnScorer, Metric, Orchestrator, WorkforgeConfig,
};
use workforge_provider::{BackendKind, BackendSpec, GenerationBackend, GenerationRequest, RetryPolicy};

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct EchoBackend(String);

#[async_trait]
impl GenerationBackend for EchoBackend {
    fn name(&self) -> &str {
        &self.0
    }

    async fn generate(&self, request: &GenerationRequest) -> WorkforgeResult<String> {
        Ok(request.prompt.lines().next().unwrap_or_default().to_string())
    }
}

async fn orchestrator() -> Arc<Orchestrator> {
    let mut config = WorkforgeConfig::default();
    config.limits.coordinator_poll_ms = 5;
    for role in Role::ALL {
        let rc = config.roles.get_mut(role);
        rc.idle_interval_ms = 5;
        rc.retry = RetryPolicy {
            max_retries: 0,
            backoff_ms: 0,
        };
        rc.providers = vec![BackendSpec::new("echo", BackendKind::Ollama, "test-model")];
    }
    let mut builder = Orchestrator::builder(config).with_backend_factory(Arc::new(|_: Role, spec: &BackendSpec| {
        let backend: Box<dyn GenerationBackend> = Box::new(EchoBackend(spec.name.clone()));
        Ok(backend)
    }));
    for metric in Metric::ALL {
        builder = builder.with_scorer(metric, Arc::new(FnScorer(|_: &Artifact| -> WorkforgeResult<f64> { Ok(1.0) })));
    }
    Arc::new(builder.build().await.unwrap())
}

/// Serve the gateway on a random port.
async fn start_server(orchestrator: Arc<Orchestrator>, auth: AuthConfig) -> String {
    let app = GatewayServer::build_with_auth(orchestrator, auth);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    format!("127.0.0.1:{}", addr.port())
}

async fn next_json(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("no message within 5s")
        .unwrap()
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

/// Read until a message of `kind` arrives.
async fn next_of_type(ws: &mut WsStream, kind: &str) -> Value {
    loop {
        let value = next_json(ws).await;
        if value["type"] == kind {
            return value;
        }
    }
}

async fn connect(addr: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

#[tokio::test]
async fn test_health_endpoint() {
    let addr = start_server(orchestrator().await, AuthConfig::default()).await;
    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "workforge");
    assert_eq!(body["progress"]["total_known"], 0);
}

#[tokio::test]
async fn test_health_lists_connected_monitors() {
    let addr = start_server(orchestrator().await, AuthConfig::default()).await;
    let mut ws = connect(&addr).await;
    assert_eq!(next_json(&mut ws).await["type"], "snapshot");

    let body: Value = reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["monitors"], 1);
    let connections = body["connections"].as_array().unwrap();
    assert_eq!(connections.len(), 1);
    assert!(connections[0]["id"].is_string());
    assert!(connections[0]["connected_at"].is_string());
}

#[tokio::test]
async fn test_router_serves_without_a_listener() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    let app = GatewayServer::build(orchestrator().await);
    let resp = app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["monitors"], 0);
    assert_eq!(body["connections"], json!([]));

    let resp = app
        .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_snapshot_endpoint_reflects_decomposition() {
    let orch = orchestrator().await;
    orch.coordinator()
        .decompose("goal", &json!({ "a.py": null, "b.py": null }))
        .unwrap();
    let addr = start_server(orch, AuthConfig::default()).await;

    let body: Value = reqwest::get(format!("http://{addr}/snapshot"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["goal"], "goal");
    assert_eq!(body["subtasks"].as_array().unwrap().len(), 2);
    assert_eq!(body["queues"]["executor"].as_array().unwrap().len(), 2);
    assert_eq!(body["workers"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn test_websocket_sends_snapshot_first() {
    let orch = orchestrator().await;
    orch.coordinator()
        .decompose("goal", &json!({ "a.py": null }))
        .unwrap();
    let addr = start_server(orch, AuthConfig::default()).await;

    let mut ws = connect(&addr).await;
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "snapshot");
    assert_eq!(first["snapshot"]["progress"]["total_known"], 1);
}

#[tokio::test]
async fn test_websocket_streams_live_events() {
    let orch = orchestrator().await;
    let addr = start_server(Arc::clone(&orch), AuthConfig::default()).await;
    let mut ws = connect(&addr).await;
    assert_eq!(next_json(&mut ws).await["type"], "snapshot");

    orch.submit("goal", &json!({ "a.py": null })).await.unwrap();

    loop {
        let event = next_of_type(&mut ws, "subtask_status").await;
        if event["to"] == "accepted" && event["role"] == "executor" {
            assert_eq!(event["file_path"], "a.py");
            break;
        }
    }
    orch.pool().stop_all().await;
}

#[tokio::test]
async fn test_websocket_command_is_applied_and_acknowledged() {
    let orch = orchestrator().await;
    let addr = start_server(Arc::clone(&orch), AuthConfig::default()).await;
    let mut ws = connect(&addr).await;
    next_json(&mut ws).await;

    let cmd = json!({ "command": "set_concurrency_ceiling", "ceiling": 4 });
    ws.send(Message::Text(cmd.to_string())).await.unwrap();

    let ack = next_of_type(&mut ws, "ack").await;
    assert_eq!(ack["command"]["command"], "set_concurrency_ceiling");
    assert_eq!(orch.coordinator().concurrency_ceiling(), 4);

    let cmd = json!({ "command": "start", "role": "tester" });
    ws.send(Message::Text(cmd.to_string())).await.unwrap();
    next_of_type(&mut ws, "ack").await;
    assert!(orch.pool().is_running(Role::Tester).await);
    orch.pool().stop_all().await;
}

#[tokio::test]
async fn test_websocket_bad_command_gets_error() {
    let addr = start_server(orchestrator().await, AuthConfig::default()).await;
    let mut ws = connect(&addr).await;
    next_json(&mut ws).await;

    ws.send(Message::Text(r#"{"command":"explode"}"#.into()))
        .await
        .unwrap();
    let reply = next_of_type(&mut ws, "error").await;
    assert!(reply["message"].as_str().unwrap().contains("Invalid command"));

    let zero = json!({ "command": "set_concurrency_ceiling", "ceiling": 0 });
    ws.send(Message::Text(zero.to_string())).await.unwrap();
    let reply = next_of_type(&mut ws, "error").await;
    assert!(reply["message"].as_str().unwrap().contains("at least 1"));
}

#[tokio::test]
async fn test_auth_required_when_keys_configured() {
    let addr = start_server(orchestrator().await, AuthConfig::new(vec!["k1".into()])).await;

    let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
    assert_eq!(resp.status(), 401);

    let resp = reqwest::get(format!("http://{addr}/health?api_key=wrong"))
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = reqwest::Client::new()
        .get(format!("http://{addr}/snapshot"))
        .bearer_auth("k1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?api_key=k1"))
        .await
        .unwrap();
    assert_eq!(next_json(&mut ws).await["type"], "snapshot");
}

fn exhausted() -> WorkforgeError {
    WorkforgeError::AllProvidersExhausted {
        role: Role::Executor,
        attempts: 4,
        last_error: "quota exceeded".into(),
    }
}

#[tokio::test]
async fn test_webhook_escalation_posts_record_with_secret() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks/workforge"))
        .and(header("x-webhook-secret", "s3cret"))
        .and(body_partial_json(json!({
            "kind": "all_providers_exhausted",
            "context": { "goal": "build" }
        })))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let sink = WebhookEscalation::new(WebhookConfig {
        url: format!("{}/hooks/workforge", server.uri()),
        secret: Some("s3cret".into()),
        timeout_secs: 5,
    })
    .unwrap();
    sink.escalate(&exhausted(), &EscalationContext::for_goal("build"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_webhook_escalation_surfaces_refusal() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let sink = WebhookEscalation::new(WebhookConfig {
        url: server.uri(),
        secret: None,
        timeout_secs: 5,
    })
    .unwrap();
    let err = sink
        .escalate(&exhausted(), &EscalationContext::for_goal("build"))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkforgeError::Escalation(_)));
    assert!(err.to_string().contains("500"));
}
