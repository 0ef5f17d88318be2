//! In-process HTTP stand-in for the remote sandbox backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

pub const BACKEND_TOKEN: &str = "backend-secret";

#[derive(Debug, Default)]
pub struct FakeBackendState {
    files: Mutex<HashMap<String, HashMap<String, String>>>,
    next_id: AtomicU64,
    commands: Mutex<Vec<(String, String)>>,
    agent_runs: Mutex<Vec<Value>>,
    frames: Mutex<Vec<String>>,
    rejection: Mutex<Option<(u16, String)>>,
    hold_open: AtomicBool,
    requests: AtomicUsize,
}

impl FakeBackendState {
    pub fn with_frames(self, frames: Vec<String>) -> Self {
        *self.frames.lock().expect("frames") = frames;
        self
    }

    pub fn with_rejection(self, status: u16, body: &str) -> Self {
        *self.rejection.lock().expect("rejection") = Some((status, body.to_string()));
        self
    }

    pub fn hold_open(self) -> Self {
        self.hold_open.store(true, Ordering::SeqCst);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn sandbox_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.files.lock().expect("files").keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn commands_for(&self, sandbox_id: &str) -> Vec<String> {
        self.commands
            .lock()
            .expect("commands")
            .iter()
            .filter(|(id, _)| id == sandbox_id)
            .map(|(_, command)| command.clone())
            .collect()
    }

    pub fn file(&self, sandbox_id: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .expect("files")
            .get(sandbox_id)
            .and_then(|files| files.get(path).cloned())
    }

    pub fn agent_runs(&self) -> Vec<Value> {
        self.agent_runs.lock().expect("runs").clone()
    }

    fn exists(&self, sandbox_id: &str) -> bool {
        self.files.lock().expect("files").contains_key(sandbox_id)
    }
}

pub struct FakeBackend {
    pub base_url: String,
    pub state: Arc<FakeBackendState>,
}

impl FakeBackend {
    pub async fn start(state: FakeBackendState) -> Self {
        let state = Arc::new(state);
        let api = Router::new()
            .route("/sandboxes", post(create))
            .route("/sandboxes/:id", get(describe).delete(terminate))
            .route("/sandboxes/:id/commands", post(command))
            .route("/sandboxes/:id/files", get(read_file).put(write_file))
            .route("/sandboxes/:id/packages", post(packages))
            .route("/sandboxes/:id/agent/run", post(agent_run))
            .with_state(state.clone());
        let app = Router::new().nest("/api", api);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake backend");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Self {
            base_url: format!("http://{addr}/api"),
            state,
        }
    }
}

type Shared = State<Arc<FakeBackendState>>;

fn authorized(state: &FakeBackendState, headers: &HeaderMap) -> bool {
    state.requests.fetch_add(1, Ordering::SeqCst);
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        == Some(format!("Bearer {BACKEND_TOKEN}").as_str())
}

fn record(id: &str) -> Value {
    json!({ "sandboxId": id, "url": format!("https://{id}.fake.test") })
}

async fn create(State(state): Shared, headers: HeaderMap) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let id = format!("remote-sbx-{:04}", state.next_id.fetch_add(1, Ordering::SeqCst) + 1);
    state
        .files
        .lock()
        .expect("files")
        .insert(id.clone(), HashMap::new());
    (StatusCode::CREATED, Json(record(&id))).into_response()
}

async fn describe(State(state): Shared, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.exists(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(record(&id)).into_response()
}

async fn terminate(State(state): Shared, headers: HeaderMap, Path(id): Path<String>) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.files.lock().expect("files").remove(&id) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct CommandRequest {
    command: String,
}

async fn command(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !state.exists(&id) {
        return StatusCode::NOT_FOUND.into_response();
    }
    let command = request.command.trim().to_string();
    state
        .commands
        .lock()
        .expect("commands")
        .push((id.clone(), command.clone()));

    let stdout = if let Some(text) = command.strip_prefix("echo ") {
        format!("{}\n", text.trim_matches(|c| c == '\'' || c == '"'))
    } else if let Some(paths) = command.strip_prefix("rm -f ") {
        if let Some(files) = state.files.lock().expect("files").get_mut(&id) {
            for path in paths.split_whitespace() {
                files.remove(path);
            }
        }
        String::new()
    } else {
        String::new()
    };
    Json(json!({ "exitCode": 0, "stdout": stdout, "stderr": "" })).into_response()
}

#[derive(Deserialize)]
struct FileQuery {
    path: String,
}

async fn read_file(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    match state.file(&id, &query.path) {
        Some(content) => content.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn write_file(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<FileQuery>,
    body: String,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let stored = match state.files.lock().expect("files").get_mut(&id) {
        Some(files) => {
            files.insert(query.path, body);
            true
        }
        None => false,
    };
    if !stored {
        return StatusCode::NOT_FOUND.into_response();
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn packages(
    State(state): Shared,
    headers: HeaderMap,
    Path(_id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let count = body["packages"].as_array().map(Vec::len).unwrap_or(0);
    Json(json!({ "success": true, "stdout": format!("added {count} packages\n"), "stderr": "" }))
        .into_response()
}

async fn agent_run(
    State(state): Shared,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(invocation): Json<Value>,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if let Some((status, body)) = state.rejection.lock().expect("rejection").clone() {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
        return (status, body).into_response();
    }
    state.agent_runs.lock().expect("runs").push(invocation.clone());

    let pid_file = invocation["pidFile"].as_str().unwrap_or_default().to_string();
    let done_marker = invocation["doneMarker"].as_str().unwrap_or_default().to_string();
    if let Some(files) = state.files.lock().expect("files").get_mut(&id) {
        files.insert(pid_file, "31337".to_string());
    }

    let frames = state.frames.lock().expect("frames").clone();
    let hold_open = state.hold_open.load(Ordering::SeqCst);
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(16);
    let runner = state.clone();
    tokio::spawn(async move {
        for frame in frames {
            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        if hold_open {
            while runner.file(&id, &done_marker).is_none() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(20)) => {}
                    _ = tx.closed() => return,
                }
            }
        }
    });

    (
        [(header::CONTENT_TYPE, "text/event-stream")],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}
