mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use sandbox_relay::project_state::PROJECT_STATE_PATH;
use sandbox_relay::provider::mock::{MockBackend, MockStep};
use sandbox_relay::relay::{AGENT_DONE_MARKER, AGENT_PID_FILE};
use sandbox_relay::router::{AgentInfo, AuthConfig};
use serde_json::{json, Value};

use common::*;

const EXISTING: &str = "sbx-existing-01";

#[tokio::test]
async fn health_and_root_are_served() {
    let test_app = TestApp::new(Arc::new(MockBackend::new()));

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"status": "ok"}));

    let (status, _, bytes) = send_raw(
        &test_app.app,
        Request::builder().uri("/").body(Body::empty()).expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(String::from_utf8_lossy(&bytes).contains("Sandbox Relay server"));
}

#[tokio::test]
async fn agent_catalog_lists_models_and_limits() {
    let test_app = TestApp::new(Arc::new(MockBackend::new()));

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/agents", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["defaultDurationSecs"], json!(1200));
    assert_eq!(body["maxDurationSecs"], json!(1200));

    let ids: Vec<&str> = body["agents"]
        .as_array()
        .expect("agents")
        .iter()
        .filter_map(|agent| agent["id"].as_str())
        .collect();
    assert_eq!(ids, vec!["claude", "codex", "gemini", "cursor"]);

    let first: AgentInfo = serde_json::from_value(body["agents"][0].clone()).expect("agent info");
    insta::assert_json_snapshot!(first, @r###"
    {
      "id": "claude",
      "name": "Claude Code",
      "models": [
        "sonnet",
        "opus",
        "haiku"
      ],
      "defaultModel": "sonnet"
    }
    "###);
}

#[tokio::test]
async fn openapi_document_lists_routes() {
    let test_app = TestApp::new(Arc::new(MockBackend::new()));

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    let paths = body["paths"].as_object().expect("paths");
    for path in [
        "/v1/health",
        "/v1/agents",
        "/v1/sandboxes",
        "/v1/sandboxes/{sandbox_id}",
        "/v1/sandboxes/{sandbox_id}/state",
        "/v1/agent/run",
        "/v1/agent/cancel",
    ] {
        assert!(paths.contains_key(path), "missing {path}");
    }
}

#[tokio::test]
async fn unknown_routes_return_problem_details() {
    let test_app = TestApp::new(Arc::new(MockBackend::new()));

    let (status, content_type, bytes) = send_raw(
        &test_app.app,
        Request::builder()
            .uri("/v1/does-not-exist")
            .body(Body::empty())
            .expect("request"),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(content_type, "application/problem+json");
    let problem: Value = serde_json::from_slice(&bytes).expect("problem json");
    assert_eq!(problem["status"], json!(404));
}

#[tokio::test]
async fn token_is_required_except_for_health() {
    let test_app = TestApp::with_auth(
        Arc::new(MockBackend::new()),
        AuthConfig::with_token("relay-token".to_string()),
    );

    let (status, _) = send_json(&test_app.app, Method::GET, "/v1/health", None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send_json(&test_app.app, Method::GET, "/v1/agents", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["type"], json!("urn:sandbox-relay:error:token_invalid"));

    let authorized = Request::builder()
        .uri("/v1/agents")
        .header(header::AUTHORIZATION, "Bearer relay-token")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = send_raw(&test_app.app, authorized).await;
    assert_eq!(status, StatusCode::OK);

    let wrong = Request::builder()
        .uri("/v1/agents")
        .header(header::AUTHORIZATION, "Bearer nope")
        .body(Body::empty())
        .expect("request");
    let (status, _, _) = send_raw(&test_app.app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn create_provisions_then_restores_by_id() {
    let backend = MockBackend::new();
    let test_app = TestApp::new(Arc::new(backend.clone()));

    let (status, created) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sandboxes",
        Some(json!({"projectId": "bakery-site"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{created}");
    assert_eq!(created["sandboxId"], json!("mock-sbx-000001"));
    assert_eq!(created["backend"], json!("mock"));
    assert_eq!(created["restored"], json!(false));
    assert_eq!(created["attempts"], json!(1));

    let sandbox = backend.sandbox("mock-sbx-000001").expect("sandbox");
    let stored: Value =
        serde_json::from_str(&sandbox.file(PROJECT_STATE_PATH).expect("state")).expect("json");
    assert_eq!(stored["projectId"], json!("bakery-site"));

    let (status, restored) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sandboxes",
        Some(json!({"sandboxId": "mock-sbx-000001"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(restored["sandboxId"], json!("mock-sbx-000001"));
    assert_eq!(restored["restored"], json!(true));
    assert_eq!(restored["attempts"], json!(0));
    assert_eq!(backend.create_calls(), 1);

    // A sandbox the backend no longer knows falls through to a fresh one.
    let (status, replaced) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/sandboxes",
        Some(json!({"sandboxId": "sbx-long-gone-7"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(replaced["sandboxId"], json!("mock-sbx-000002"));
    assert_eq!(replaced["restored"], json!(false));
}

#[tokio::test]
async fn exhausted_provisioning_reports_attempts() {
    let backend = MockBackend::new().with_create_plan(
        std::iter::repeat(MockStep::Fail("quota exceeded for project".to_string())).take(5),
    );
    let test_app = TestApp::new(Arc::new(backend.clone()));

    let (status, problem) =
        send_json(&test_app.app, Method::POST, "/v1/sandboxes", Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(
        problem["type"],
        json!("urn:sandbox-relay:error:provisioning_failed")
    );
    assert_eq!(problem["details"]["attempts"], json!(5));
    assert!(problem["details"]["lastError"]
        .as_str()
        .expect("last error")
        .contains("quota exceeded"));
    assert_eq!(backend.create_calls(), 5);
    assert!(backend.live_ids().is_empty());
}

#[tokio::test]
async fn invalid_sandbox_ids_are_rejected() {
    let test_app = TestApp::new(Arc::new(MockBackend::new()));

    let (status, problem) = send_json(&test_app.app, Method::GET, "/v1/sandboxes/abc", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(problem["type"], json!("urn:sandbox-relay:error:invalid_request"));
}

#[tokio::test]
async fn describe_and_terminate_sandbox() {
    let backend = MockBackend::new();
    backend.insert_existing(EXISTING);
    let test_app = TestApp::new(Arc::new(backend.clone()));

    let path = format!("/v1/sandboxes/{EXISTING}");
    let (status, info) = send_json(&test_app.app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["sandboxId"], json!(EXISTING));

    let (status, _) = send_json(&test_app.app, Method::DELETE, &path, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(backend.terminated_ids(), vec![EXISTING.to_string()]);

    let (status, problem) = send_json(&test_app.app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(problem["sandboxId"], json!(EXISTING));

    let (status, _) = send_json(&test_app.app, Method::DELETE, &path, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn project_state_defaults_then_persists_normalized() {
    let backend = MockBackend::new();
    let sandbox = backend.insert_existing(EXISTING);
    let test_app = TestApp::new(Arc::new(backend.clone()));
    let path = format!("/v1/sandboxes/{EXISTING}/state");

    let (status, initial) = send_json(&test_app.app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(initial["projectId"], json!(EXISTING));
    assert_eq!(initial["messages"], json!([]));
    assert_eq!(initial["devServer"]["port"], json!(5173));

    let messages: Vec<Value> = (0..250)
        .map(|index| json!({"role": "user", "content": format!("message {index}")}))
        .collect();
    let (status, saved) = send_json(
        &test_app.app,
        Method::PUT,
        &path,
        Some(json!({
            "projectId": "bakery-site",
            "messages": messages,
            "devServer": {"command": "pnpm dev", "port": 3000, "processMatch": "next"},
            "checkpoints": "not a list"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let saved_messages = saved["messages"].as_array().expect("messages");
    assert_eq!(saved_messages.len(), 200);
    assert_eq!(saved_messages[0]["content"], json!("message 50"));
    assert_eq!(saved["checkpoints"], json!([]));
    assert_eq!(saved["devServer"]["port"], json!(3000));

    let (status, reread) = send_json(&test_app.app, Method::GET, &path, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reread, saved);
    assert!(sandbox.file(PROJECT_STATE_PATH).is_some());
}

#[tokio::test]
async fn unknown_agent_is_rejected_with_valid_choices() {
    let backend = MockBackend::new();
    backend.insert_existing(EXISTING);
    let test_app = TestApp::new(Arc::new(backend.clone()));

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/agent/run",
        Some(json!({
            "sandboxId": EXISTING,
            "agent": "not-a-real-agent",
            "prompt": "Add a pricing table"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        problem["type"],
        json!("urn:sandbox-relay:error:unsupported_agent")
    );
    assert_eq!(
        problem["validChoices"],
        json!(["claude", "codex", "gemini", "cursor"])
    );
    assert_eq!(backend.attach_calls(), 0);
}

#[tokio::test]
async fn unknown_model_lists_the_agents_models() {
    let backend = MockBackend::new();
    backend.insert_existing(EXISTING);
    let test_app = TestApp::new(Arc::new(backend));

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/agent/run",
        Some(json!({
            "sandboxId": EXISTING,
            "agent": "gemini",
            "model": "sonnet",
            "prompt": "Add a pricing table"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(
        problem["validChoices"],
        json!(["gemini-2.5-pro", "gemini-2.5-flash"])
    );
}

#[tokio::test]
async fn run_streams_classified_events_over_sse() {
    let backend = MockBackend::new().with_agent_frames(agent_frames());
    backend.insert_existing(EXISTING);
    let test_app = TestApp::new(Arc::new(backend));

    let (status, content_type, bytes) = send_raw(
        &test_app.app,
        json_request(
            Method::POST,
            "/v1/agent/run",
            Some(json!({
                "sandboxId": EXISTING,
                "agent": "claude",
                "prompt": "Make sure the build passes"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(content_type.starts_with("text/event-stream"));

    let events = sse_payloads(&bytes);
    assert_eq!(kinds(&events), vec!["thinking", "tool", "message", "status"]);
    assert_eq!(events[2]["content"], json!("The build passes."));
    assert_eq!(events[3]["content"], json!("Completed in 1.5s"));
}

#[tokio::test]
async fn raw_run_forwards_upstream_frames() {
    let backend = MockBackend::new().with_agent_frames(agent_frames());
    backend.insert_existing(EXISTING);
    let test_app = TestApp::new(Arc::new(backend));

    let (status, content_type, bytes) = send_raw(
        &test_app.app,
        json_request(
            Method::POST,
            "/v1/agent/run?raw=true",
            Some(json!({
                "sandboxId": EXISTING,
                "agent": "claude",
                "prompt": "Make sure the build passes"
            })),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(content_type, "text/event-stream");
    assert_eq!(String::from_utf8_lossy(&bytes), agent_frames().concat());
}

#[tokio::test]
async fn run_on_missing_sandbox_is_not_found() {
    let test_app = TestApp::new(Arc::new(MockBackend::new()));

    let (status, problem) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/agent/run",
        Some(json!({
            "sandboxId": "sbx-never-made",
            "agent": "codex",
            "prompt": "hello"
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(
        problem["type"],
        json!("urn:sandbox-relay:error:sandbox_not_found")
    );
}

#[tokio::test]
async fn cancel_without_active_run_signals_recorded_pid() {
    let backend = MockBackend::new();
    let sandbox = backend.insert_existing(EXISTING);
    sandbox.put_file(AGENT_PID_FILE, "5150\n");
    let test_app = TestApp::new(Arc::new(backend));

    let (status, body) = send_json(
        &test_app.app,
        Method::POST,
        "/v1/agent/cancel",
        Some(json!({"sandboxId": EXISTING})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["wasRunning"], json!(false));
    assert_eq!(body["graceMs"], json!(200));
    assert!(sandbox
        .commands()
        .iter()
        .any(|command| command == "kill -TERM 5150 2>/dev/null; true"));
    assert_eq!(
        sandbox.file(AGENT_DONE_MARKER).as_deref(),
        Some("cancelled\n")
    );
}
