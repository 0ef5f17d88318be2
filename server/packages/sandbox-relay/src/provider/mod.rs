//! Capability interface over sandbox backends.
//!
//! A [`SandboxBackend`] creates sandboxes or re-attaches to existing ones by id. Each live
//! sandbox is driven through a [`SandboxProvider`], which stops working once terminated.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use futures::Stream;
use sandbox_relay_error::SandboxError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;

pub mod mock;
pub mod remote;

pub type ProviderFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ProviderError>> + Send>>;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, ToSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Remote,
    Mock,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Remote => "remote",
            BackendKind::Mock => "mock",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "remote" => Some(BackendKind::Remote),
            "mock" => Some(BackendKind::Mock),
            _ => None,
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxInfo {
    pub sandbox_id: String,
    pub url: String,
    pub backend: BackendKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub exit_code: i32,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageInstallOutput {
    pub success: bool,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Request body for the sandbox-side agent runner.
///
/// The runner writes the agent's pid to `pid_file` and ends its stream once the process
/// exits or `done_marker` appears.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInvocation {
    pub agent: String,
    pub model: String,
    pub prompt: String,
    pub pid_file: String,
    pub done_marker: String,
    pub timeout_secs: u64,
}

pub enum AgentStreamStart {
    Streaming(ByteStream),
    Rejected { status: u16, body: String },
}

impl fmt::Debug for AgentStreamStart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Streaming(_) => f.write_str("Streaming(..)"),
            Self::Rejected { status, body } => f
                .debug_struct("Rejected")
                .field("status", status)
                .field("body", body)
                .finish(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("file not found: {path}")]
    NotFound { path: String },
    #[error("sandbox {sandbox_id} has been terminated")]
    Terminated { sandbox_id: String },
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("invalid backend response: {0}")]
    InvalidResponse(String),
    #[error("{0}")]
    Backend(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProviderError::NotFound { .. })
    }
}

impl From<ProviderError> for SandboxError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Terminated { sandbox_id } => SandboxError::SandboxNotFound { sandbox_id },
            ProviderError::Status { status, body } => SandboxError::Upstream { status, body },
            ProviderError::Http(err) if err.is_timeout() => SandboxError::Timeout {
                message: Some(err.to_string()),
            },
            ProviderError::NotFound { path } => SandboxError::Persistence {
                message: format!("file not found: {path}"),
            },
            other => SandboxError::StreamError {
                message: other.to_string(),
            },
        }
    }
}

/// Factory side of a backend: creates fresh sandboxes and re-attaches by id.
pub trait SandboxBackend: Send + Sync + fmt::Debug {
    fn kind(&self) -> BackendKind;

    fn create_sandbox(&self) -> ProviderFuture<'_, Arc<dyn SandboxProvider>>;

    /// Looks a sandbox up by id. `Ok(None)` means the backend no longer knows it.
    fn attach<'a>(
        &'a self,
        sandbox_id: &'a str,
    ) -> ProviderFuture<'a, Option<Arc<dyn SandboxProvider>>>;
}

pub trait SandboxProvider: Send + Sync + fmt::Debug {
    fn info(&self) -> &SandboxInfo;

    fn sandbox_id(&self) -> &str {
        &self.info().sandbox_id
    }

    fn is_terminated(&self) -> bool;

    /// Prepares a freshly created sandbox (working directory, base tooling).
    fn setup(&self) -> ProviderFuture<'_, ()>;

    fn run_command<'a>(&'a self, command: &'a str) -> ProviderFuture<'a, CommandOutput>;

    fn read_file<'a>(&'a self, path: &'a str) -> ProviderFuture<'a, String>;

    fn write_file<'a>(&'a self, path: &'a str, content: &'a str) -> ProviderFuture<'a, ()>;

    fn install_packages<'a>(
        &'a self,
        packages: &'a [String],
    ) -> ProviderFuture<'a, PackageInstallOutput>;

    /// Fresh description from the backend, `None` once the sandbox is gone.
    fn describe(&self) -> ProviderFuture<'_, Option<SandboxInfo>>;

    /// Starts the agent runner and hands back its event stream without buffering it.
    fn run_agent<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
        timeout: Duration,
    ) -> ProviderFuture<'a, AgentStreamStart>;

    fn terminate(&self) -> ProviderFuture<'_, ()>;
}

pub(crate) fn ensure_live(provider: &dyn SandboxProvider) -> Result<(), ProviderError> {
    if provider.is_terminated() {
        return Err(ProviderError::Terminated {
            sandbox_id: provider.sandbox_id().to_string(),
        });
    }
    Ok(())
}
