use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use reqwest::blocking::Client as HttpClient;
use reqwest::Method;
use sandbox_relay_agent_stream::{ClassifiedEvent, FrameReassembler};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{ConfigError, RelayConfig};
use crate::provider::mock::MockBackend;
use crate::provider::remote::{RemoteBackend, RemoteBackendConfig};
use crate::provider::{ProviderError, SandboxBackend};
use crate::relay::AgentRunRequest;
use crate::router::{build_router_with_state, shutdown_sandboxes, AppState, AuthConfig};
use crate::router::{
    AgentListResponse, CancelAgentRequest, CancelAgentResponse, CreateSandboxRequest,
    CreateSandboxResponse,
};

const API_PREFIX: &str = "/v1";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 2468;
const BACKEND_TOKEN_ENV: &str = "SANDBOX_RELAY_BACKEND_TOKEN";

#[derive(Parser, Debug)]
#[command(name = "sandbox-relay", bin_name = "sandbox-relay")]
#[command(about = "Provision coding sandboxes and relay agent runs", version)]
#[command(arg_required_else_help = true)]
pub struct SandboxRelayCli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, short = 't', global = true)]
    token: Option<String>,

    #[arg(long, short = 'n', global = true)]
    no_token: bool,

    /// JSON config file layered over the built-in defaults.
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the sandbox relay HTTP server.
    Server(ServerArgs),
    /// Call the HTTP API without writing client code.
    Api(ApiArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum BackendChoice {
    Remote,
    Mock,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'H', default_value = DEFAULT_HOST)]
    host: String,

    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    port: u16,

    #[arg(long, value_enum, default_value_t = BackendChoice::Remote)]
    backend: BackendChoice,

    /// Base URL of the remote sandbox backend.
    #[arg(long)]
    backend_url: Option<String>,

    /// Bearer token for the remote sandbox backend. Falls back to SANDBOX_RELAY_BACKEND_TOKEN.
    #[arg(long)]
    backend_token: Option<String>,

    #[arg(long = "cors-allow-origin", short = 'O')]
    cors_allow_origin: Vec<String>,

    #[arg(long = "cors-allow-method", short = 'M')]
    cors_allow_method: Vec<String>,

    #[arg(long = "cors-allow-header", short = 'A')]
    cors_allow_header: Vec<String>,

    #[arg(long = "cors-allow-credentials", short = 'C')]
    cors_allow_credentials: bool,
}

#[derive(Args, Debug)]
pub struct ApiArgs {
    #[command(subcommand)]
    command: ApiCommand,
}

#[derive(Subcommand, Debug)]
pub enum ApiCommand {
    /// List agents, their models and run duration limits.
    Agents(ClientArgs),
    /// Create a sandbox, or restore one by id.
    Create(CreateArgs),
    /// Run an agent and print classified events as they arrive.
    Run(RunArgs),
    /// Cancel the agent running in a sandbox.
    Cancel(CancelArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    #[arg(long, short = 'e')]
    endpoint: Option<String>,
}

#[derive(Args, Debug)]
pub struct CreateArgs {
    /// Existing sandbox to restore.
    #[arg(long, short = 's')]
    sandbox_id: Option<String>,
    #[arg(long)]
    project_id: Option<String>,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    sandbox_id: String,
    #[arg(long, short = 'a')]
    agent: String,
    #[arg(long, short = 'm')]
    model: Option<String>,
    #[arg(long, short = 'P')]
    prompt: String,
    #[arg(long, short = 'd')]
    duration_secs: Option<u64>,
    /// Print the upstream stream verbatim.
    #[arg(long)]
    raw: bool,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Args, Debug)]
pub struct CancelArgs {
    sandbox_id: String,
    #[command(flatten)]
    client: ClientArgs,
}

#[derive(Debug, Error)]
pub enum CliError {
    #[error("invalid cors origin: {0}")]
    InvalidCorsOrigin(String),
    #[error("invalid cors method: {0}")]
    InvalidCorsMethod(String),
    #[error("invalid cors header: {0}")]
    InvalidCorsHeader(String),
    #[error("missing --backend-url for the remote backend")]
    MissingBackendUrl,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(#[from] ProviderError),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("server error: {0}")]
    Server(String),
    #[error("unexpected http status: {0}")]
    HttpStatus(reqwest::StatusCode),
}

pub struct CliConfig {
    pub token: Option<String>,
    pub no_token: bool,
    pub config_path: Option<PathBuf>,
}

pub fn run_sandbox_relay() -> Result<(), CliError> {
    let cli = SandboxRelayCli::parse();
    let SandboxRelayCli {
        command,
        token,
        no_token,
        config,
    } = cli;
    let config = CliConfig {
        token,
        no_token,
        config_path: config,
    };
    if let Err(err) = init_logging() {
        eprintln!("failed to init logging: {err}");
        return Err(err);
    }
    run_command(&command, &config)
}

pub fn init_logging() -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_logfmt::builder()
                .layer()
                .with_writer(std::io::stderr),
        )
        .try_init()
        .map_err(|err| CliError::Server(format!("logging already initialized: {err}")))?;
    Ok(())
}

pub fn run_command(command: &Command, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        Command::Server(args) => run_server(cli, args),
        Command::Api(subcommand) => run_api(&subcommand.command, cli),
    }
}

fn run_server(cli: &CliConfig, server: &ServerArgs) -> Result<(), CliError> {
    let auth = if let Some(token) = cli.token.clone() {
        AuthConfig::with_token(token)
    } else {
        AuthConfig::disabled()
    };

    let config = RelayConfig::load(cli.config_path.as_deref())?;
    let backend = build_backend(server, &config)?;
    let backend_kind = backend.kind();
    let state = Arc::new(AppState::new(auth, config, backend));
    let (mut router, state) = build_router_with_state(state);

    let cors = build_cors_layer(server)?;
    router = router.layer(cors);

    let addr = format!("{}:{}", server.host, server.port);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| CliError::Server(err.to_string()))?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, backend = %backend_kind, "server listening");
        let shutdown_state = state.clone();
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                shutdown_sandboxes(&shutdown_state).await;
            })
            .await
            .map_err(|err| CliError::Server(err.to_string()))
    })
}

fn build_backend(
    server: &ServerArgs,
    config: &RelayConfig,
) -> Result<Arc<dyn SandboxBackend>, CliError> {
    match server.backend {
        BackendChoice::Mock => {
            tracing::warn!("using the in-process mock backend; sandboxes are not real");
            Ok(Arc::new(MockBackend::new()))
        }
        BackendChoice::Remote => {
            let base_url = server
                .backend_url
                .clone()
                .ok_or(CliError::MissingBackendUrl)?;
            let token = server
                .backend_token
                .clone()
                .or_else(|| std::env::var(BACKEND_TOKEN_ENV).ok());
            let backend = RemoteBackend::new(RemoteBackendConfig {
                base_url,
                token,
                setup_command: config.sandbox.setup_command.clone(),
                request_timeout: Duration::from_millis(config.sandbox.request_timeout_ms),
            })?;
            Ok(Arc::new(backend))
        }
    }
}

fn run_api(command: &ApiCommand, cli: &CliConfig) -> Result<(), CliError> {
    match command {
        ApiCommand::Agents(args) => {
            let ctx = ClientContext::new(cli, args)?;
            let response = ctx.get(&format!("{API_PREFIX}/agents"))?;
            print_json_response::<AgentListResponse>(response)
        }
        ApiCommand::Create(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let body = CreateSandboxRequest {
                sandbox_id: args.sandbox_id.clone(),
                project_id: args.project_id.clone(),
            };
            let response = ctx.post(&format!("{API_PREFIX}/sandboxes"), &body)?;
            print_json_response::<CreateSandboxResponse>(response)
        }
        ApiCommand::Run(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let body = AgentRunRequest {
                sandbox_id: args.sandbox_id.clone(),
                agent: args.agent.clone(),
                model: args.model.clone(),
                prompt: args.prompt.clone(),
                duration_secs: args.duration_secs,
            };
            let query = [("raw", args.raw.then(|| "true".to_string()))];
            let response = ctx.post_with_query(&format!("{API_PREFIX}/agent/run"), &body, &query)?;
            if args.raw {
                copy_stream(response)
            } else {
                print_classified_stream(response)
            }
        }
        ApiCommand::Cancel(args) => {
            let ctx = ClientContext::new(cli, &args.client)?;
            let body = CancelAgentRequest {
                sandbox_id: args.sandbox_id.clone(),
            };
            let response = ctx.post(&format!("{API_PREFIX}/agent/cancel"), &body)?;
            print_json_response::<CancelAgentResponse>(response)
        }
    }
}

fn build_cors_layer(server: &ServerArgs) -> Result<CorsLayer, CliError> {
    let mut cors = CorsLayer::new();

    let mut origins = Vec::new();
    for origin in &server.cors_allow_origin {
        let value = origin
            .parse()
            .map_err(|_| CliError::InvalidCorsOrigin(origin.clone()))?;
        origins.push(value);
    }
    if origins.is_empty() {
        cors = cors.allow_origin(tower_http::cors::AllowOrigin::predicate(|_, _| false));
    } else {
        cors = cors.allow_origin(origins);
    }

    if server.cors_allow_method.is_empty() {
        cors = cors.allow_methods(Any);
    } else {
        let mut methods = Vec::new();
        for method in &server.cors_allow_method {
            let parsed = method
                .parse()
                .map_err(|_| CliError::InvalidCorsMethod(method.clone()))?;
            methods.push(parsed);
        }
        cors = cors.allow_methods(methods);
    }

    if server.cors_allow_header.is_empty() {
        cors = cors.allow_headers(Any);
    } else {
        let mut headers = Vec::new();
        for header in &server.cors_allow_header {
            let parsed = header
                .parse()
                .map_err(|_| CliError::InvalidCorsHeader(header.clone()))?;
            headers.push(parsed);
        }
        cors = cors.allow_headers(headers);
    }

    if server.cors_allow_credentials {
        cors = cors.allow_credentials(true);
    }

    Ok(cors)
}

struct ClientContext {
    endpoint: String,
    token: Option<String>,
    client: HttpClient,
}

impl ClientContext {
    fn new(cli: &CliConfig, args: &ClientArgs) -> Result<Self, CliError> {
        let endpoint = args
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", DEFAULT_HOST, DEFAULT_PORT));
        let token = if cli.no_token {
            None
        } else {
            cli.token.clone()
        };
        // Agent runs stream for up to their whole budget.
        let client = HttpClient::builder().timeout(None).build()?;
        Ok(Self {
            endpoint,
            token,
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::blocking::RequestBuilder {
        let url = self.url(path);
        let mut builder = self.client.request(method, url);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    fn get(&self, path: &str) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::GET, path).send()?)
    }

    fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<reqwest::blocking::Response, CliError> {
        Ok(self.request(Method::POST, path).json(body).send()?)
    }

    fn post_with_query<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        query: &[(&str, Option<String>)],
    ) -> Result<reqwest::blocking::Response, CliError> {
        let mut request = self.request(Method::POST, path).json(body);
        for (key, value) in query {
            if let Some(value) = value {
                request = request.query(&[(key, value)]);
            }
        }
        Ok(request.send()?)
    }
}

fn print_json_response<T: serde::de::DeserializeOwned + Serialize>(
    response: reqwest::blocking::Response,
) -> Result<(), CliError> {
    let status = response.status();
    let text = response.text()?;

    if !status.is_success() {
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let parsed: T = serde_json::from_str(&text)?;
    let pretty = serde_json::to_string_pretty(&parsed)?;
    write_stdout_line(&pretty)?;
    Ok(())
}

fn copy_stream(mut response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text()?;
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }
    let mut out = std::io::stdout();
    response.copy_to(&mut out)?;
    out.flush()?;
    Ok(())
}

fn print_classified_stream(mut response: reqwest::blocking::Response) -> Result<(), CliError> {
    let status = response.status();
    if !status.is_success() {
        let text = response.text()?;
        print_error_body(&text)?;
        return Err(CliError::HttpStatus(status));
    }

    let mut reassembler = FrameReassembler::new();
    let mut buf = [0u8; 8192];
    loop {
        let read = response.read(&mut buf)?;
        let batch = if read == 0 {
            reassembler.flush()
        } else {
            reassembler.push_bytes(&buf[..read])
        };
        for payload in batch.payloads {
            print_classified(payload)?;
        }
        if read == 0 {
            return Ok(());
        }
    }
}

fn print_classified(payload: Value) -> Result<(), CliError> {
    match serde_json::from_value::<ClassifiedEvent>(payload.clone()) {
        Ok(event) => {
            let content = event.content().unwrap_or_default();
            write_stdout_line(&format!("[{}] {content}", event.kind()))
        }
        Err(_) => write_stdout_line(&payload.to_string()),
    }
}

fn print_error_body(text: &str) -> Result<(), CliError> {
    if let Ok(json) = serde_json::from_str::<Value>(text) {
        let pretty = serde_json::to_string_pretty(&json)?;
        write_stderr_line(&pretty)?;
    } else {
        write_stderr_line(text)?;
    }
    Ok(())
}

fn write_stdout_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}

fn write_stderr_line(text: &str) -> Result<(), CliError> {
    let mut out = std::io::stderr();
    out.write_all(text.as_bytes())?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
