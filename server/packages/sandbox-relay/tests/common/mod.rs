#![allow(dead_code)]

pub mod fake_backend;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tower::util::ServiceExt;

use sandbox_relay::config::RelayConfig;
use sandbox_relay::provider::SandboxBackend;
use sandbox_relay::router::{build_router_with_state, AppState, AuthConfig};

pub struct TestApp {
    pub app: Router,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn new(backend: Arc<dyn SandboxBackend>) -> Self {
        Self::with_auth(backend, AuthConfig::disabled())
    }

    pub fn with_auth(backend: Arc<dyn SandboxBackend>, auth: AuthConfig) -> Self {
        let mut config = RelayConfig::default();
        config.run.cancel_grace_ms = 200;
        config.provisioning.backoff_base_ms = 10;
        config.provisioning.backoff_cap_ms = 20;
        config.provisioning.transient_backoff_base_ms = 10;
        config.provisioning.transient_backoff_cap_ms = 20;
        let state = Arc::new(AppState::new(auth, config, backend));
        let (app, state) = build_router_with_state(state);
        Self { app, state }
    }
}

pub fn json_request(method: Method, path: &str, body: Option<Value>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(
            body.map(|value| value.to_string()).unwrap_or_default(),
        ))
        .expect("request")
}

pub async fn send_json(
    app: &Router,
    method: Method,
    path: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let (status, _, bytes) = send_raw(app, json_request(method, path, body)).await;
    let payload = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, payload)
}

pub async fn send_raw(app: &Router, request: Request<Body>) -> (StatusCode, String, Vec<u8>) {
    let response = app.clone().oneshot(request).await.expect("response");
    let status = response.status();
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes()
        .to_vec();
    (status, content_type, bytes)
}

/// JSON payloads of every `data:` line in an event-stream body.
pub fn sse_payloads(body: &[u8]) -> Vec<Value> {
    String::from_utf8_lossy(body)
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| serde_json::from_str(data.trim()).expect("sse json"))
        .collect()
}

pub fn kinds(events: &[Value]) -> Vec<String> {
    events
        .iter()
        .map(|event| event["type"].as_str().unwrap_or_default().to_string())
        .collect()
}

pub fn agent_frames() -> Vec<String> {
    [
        r#"{"type":"system","subtype":"init","session_id":"s-1"}"#,
        r#"{"type":"assistant","message":{"content":[{"type":"thinking","thinking":"Look at the layout first."}]}}"#,
        r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"Bash","input":{"command":"npm run build"}}]}}"#,
        r#"{"type":"user","message":{"content":[{"type":"tool_result","content":"ok"}]}}"#,
        r#"{"type":"assistant","message":{"content":[{"type":"text","text":"The build passes."}]}}"#,
        r#"{"type":"result","duration_ms":1500}"#,
    ]
    .iter()
    .map(|payload| format!("data: {payload}\n\n"))
    .collect()
}
