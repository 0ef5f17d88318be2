use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive};
use axum::response::{IntoResponse, Response, Sse};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use base64::Engine;
use futures::StreamExt;
use sandbox_relay_agent_stream::ClassifiedEvent;
use sandbox_relay_error::{ErrorType, ProblemDetails, SandboxError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{IntoParams, Modify, OpenApi, ToSchema};

use crate::config::RelayConfig;
use crate::project_state::{ConversationContext, DevServer, ProjectState, ProjectStateStore};
use crate::provider::{BackendKind, SandboxBackend, SandboxInfo};
use crate::provisioning::{Provisioner, ProvisioningPolicy};
use crate::registry::SandboxRegistry;
use crate::relay::{AgentRelay, AgentRunRequest, CancelOutcome};

mod support;
mod types;

use self::support::*;
pub use self::types::*;

const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug)]
pub struct AppState {
    auth: AuthConfig,
    config: Arc<RelayConfig>,
    registry: Arc<SandboxRegistry>,
    provisioner: Provisioner,
    relay: AgentRelay,
    state_store: ProjectStateStore,
}

impl AppState {
    pub fn new(auth: AuthConfig, config: RelayConfig, backend: Arc<dyn SandboxBackend>) -> Self {
        let config = Arc::new(config);
        let registry = Arc::new(SandboxRegistry::new(backend));
        let state_store = ProjectStateStore::default();
        let provisioner = Provisioner::new(
            registry.clone(),
            state_store.clone(),
            ProvisioningPolicy::from(&config.provisioning),
        );
        let relay = AgentRelay::new(registry.clone(), config.clone(), state_store.clone());
        Self {
            auth,
            config,
            registry,
            provisioner,
            relay,
            state_store,
        }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }
}

#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub token: Option<String>,
}

impl AuthConfig {
    pub fn disabled() -> Self {
        Self { token: None }
    }

    pub fn with_token(token: String) -> Self {
        Self { token: Some(token) }
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let mut v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/agents", get(list_agents))
        .route("/sandboxes", post(create_sandbox))
        .route(
            "/sandboxes/:sandbox_id",
            get(get_sandbox).delete(terminate_sandbox),
        )
        .route(
            "/sandboxes/:sandbox_id/state",
            get(get_project_state).put(put_project_state),
        )
        .route("/agent/run", post(run_agent))
        .route("/agent/cancel", post(cancel_agent))
        .with_state(shared.clone());

    if shared.auth.token.is_some() {
        v1_router = v1_router.layer(axum::middleware::from_fn_with_state(
            shared.clone(),
            require_token,
        ));
    }

    let mut router = Router::new()
        .route("/", get(get_root))
        .nest("/v1", v1_router)
        .fallback(not_found);

    if http_logging_enabled() {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!(
                    "http.request",
                    method = %req.method(),
                    uri = %req.uri()
                )
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

/// Terminates every sandbox this process still tracks.
pub async fn shutdown_sandboxes(state: &Arc<AppState>) {
    let ids = state.registry.sandbox_ids().await;
    tracing::info!(count = ids.len(), "shutdown: terminating sandboxes");
    state.registry.terminate_all().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_agents,
        create_sandbox,
        get_sandbox,
        terminate_sandbox,
        get_project_state,
        put_project_state,
        run_agent,
        cancel_agent
    ),
    components(
        schemas(
            HealthResponse,
            AgentInfo,
            AgentListResponse,
            CreateSandboxRequest,
            CreateSandboxResponse,
            SandboxInfo,
            BackendKind,
            ProjectState,
            ConversationContext,
            DevServer,
            AgentRunRequest,
            RunAgentQuery,
            CancelAgentRequest,
            CancelAgentResponse,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "sandboxes", description = "Sandbox lifecycle and project state"),
        (name = "agent", description = "Agent execution")
    ),
    modifiers(&ServerAddon)
)]
pub struct ApiDoc;

struct ServerAddon;

impl Modify for ServerAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.servers = Some(vec![utoipa::openapi::Server::new("http://localhost:2468")]);
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem = match &self {
            ApiError::Sandbox(err) => err.to_problem_details(),
        };
        problem_response(problem)
    }
}

const SERVER_INFO: &str = "\
This is a Sandbox Relay server. Available endpoints:\n\
  - GET  /                  - Server info\n\
  - GET  /v1/health         - Health check\n\
  - GET  /v1/openapi.json   - OpenAPI document";

async fn get_root() -> &'static str {
    SERVER_INFO
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/agents",
    responses((status = 200, body = AgentListResponse)),
    tag = "agent"
)]
async fn list_agents(State(state): State<Arc<AppState>>) -> Json<AgentListResponse> {
    let agents = state
        .config
        .agents
        .iter()
        .map(|agent| AgentInfo {
            id: agent.id.clone(),
            name: agent.name.clone(),
            models: agent.models.clone(),
            default_model: agent.default_model().map(str::to_string),
        })
        .collect();
    Json(AgentListResponse {
        agents,
        default_duration_secs: state.config.run.default_duration_ms / 1000,
        max_duration_secs: state.config.run.max_duration_ms / 1000,
    })
}

#[utoipa::path(
    post,
    path = "/v1/sandboxes",
    request_body = CreateSandboxRequest,
    responses(
        (status = 200, body = CreateSandboxResponse),
        (status = 400, body = ProblemDetails),
        (status = 502, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateSandboxRequest>,
) -> Result<Json<CreateSandboxResponse>, ApiError> {
    if let Some(sandbox_id) = request.sandbox_id.as_deref() {
        if let Some(provider) = state.registry.get_or_create(sandbox_id).await? {
            let info = provider.info().clone();
            tracing::info!(sandbox_id = %info.sandbox_id, "sandboxes: restored");
            return Ok(Json(CreateSandboxResponse {
                sandbox_id: info.sandbox_id,
                url: info.url,
                backend: info.backend,
                restored: true,
                attempts: 0,
            }));
        }
        tracing::info!(sandbox_id, "sandboxes: restore target gone, provisioning a new sandbox");
    }

    let provisioned = state
        .provisioner
        .provision(request.project_id.as_deref())
        .await?;
    let attempts = provisioned.failed_attempts.len() as u32 + 1;
    let info = provisioned.info;
    Ok(Json(CreateSandboxResponse {
        sandbox_id: info.sandbox_id,
        url: info.url,
        backend: info.backend,
        restored: false,
        attempts,
    }))
}

#[utoipa::path(
    get,
    path = "/v1/sandboxes/{sandbox_id}",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 200, body = SandboxInfo),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<SandboxInfo>, ApiError> {
    let provider = state.registry.resolve(&sandbox_id).await?;
    let described = provider.describe().await.map_err(SandboxError::from)?;
    match described {
        Some(info) => Ok(Json(info)),
        None => Err(SandboxError::SandboxNotFound { sandbox_id }.into()),
    }
}

#[utoipa::path(
    delete,
    path = "/v1/sandboxes/{sandbox_id}",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 204, description = "Sandbox terminated"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn terminate_sandbox(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    // Reattach first so sandboxes created by an earlier process can be torn down too.
    state.registry.resolve(&sandbox_id).await?;
    if !state.registry.terminate(&sandbox_id).await? {
        return Err(SandboxError::SandboxNotFound { sandbox_id }.into());
    }
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/sandboxes/{sandbox_id}/state",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    responses(
        (status = 200, body = ProjectState),
        (status = 404, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn get_project_state(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
) -> Result<Json<ProjectState>, ApiError> {
    let provider = state.registry.resolve(&sandbox_id).await?;
    let project = state.state_store.read(provider.as_ref(), &sandbox_id).await;
    Ok(Json(project))
}

#[utoipa::path(
    put,
    path = "/v1/sandboxes/{sandbox_id}/state",
    params(("sandbox_id" = String, Path, description = "Sandbox id")),
    request_body = ProjectState,
    responses(
        (status = 200, body = ProjectState, description = "The document as persisted"),
        (status = 404, body = ProblemDetails),
        (status = 500, body = ProblemDetails)
    ),
    tag = "sandboxes"
)]
async fn put_project_state(
    State(state): State<Arc<AppState>>,
    Path(sandbox_id): Path<String>,
    Json(candidate): Json<Value>,
) -> Result<Json<ProjectState>, ApiError> {
    let provider = state.registry.resolve(&sandbox_id).await?;
    let project = state
        .state_store
        .write(provider.as_ref(), &sandbox_id, &candidate)
        .await?;
    Ok(Json(project))
}

#[utoipa::path(
    post,
    path = "/v1/agent/run",
    request_body = AgentRunRequest,
    params(RunAgentQuery),
    responses(
        (status = 200, description = "SSE stream of classified events, or the raw upstream stream"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails),
        (status = 409, body = ProblemDetails)
    ),
    tag = "agent"
)]
async fn run_agent(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunAgentQuery>,
    Json(request): Json<AgentRunRequest>,
) -> Result<Response, ApiError> {
    let run = state.relay.start(request).await?;

    if query.raw.unwrap_or(false) {
        let body = Body::from_stream(run.into_raw());
        return Ok((
            [
                (header::CONTENT_TYPE, "text/event-stream"),
                (header::CACHE_CONTROL, "no-cache"),
            ],
            body,
        )
            .into_response());
    }

    let stream = run
        .into_classified()
        .map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));
    Ok(Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
        .into_response())
}

#[utoipa::path(
    post,
    path = "/v1/agent/cancel",
    request_body = CancelAgentRequest,
    responses(
        (status = 200, body = CancelAgentResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "agent"
)]
async fn cancel_agent(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CancelAgentRequest>,
) -> Result<Json<CancelAgentResponse>, ApiError> {
    let outcome = state.relay.cancel(&request.sandbox_id).await?;
    Ok(Json(outcome.into()))
}
