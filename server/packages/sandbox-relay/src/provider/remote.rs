//! HTTP client for a remote sandbox backend.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use url::Url;

use super::{
    ensure_live, AgentInvocation, AgentStreamStart, BackendKind, CommandOutput,
    PackageInstallOutput, ProviderError, ProviderFuture, SandboxBackend, SandboxInfo,
    SandboxProvider,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RemoteBackendConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub setup_command: Option<String>,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct RemoteBackend {
    shared: Arc<RemoteShared>,
}

#[derive(Debug)]
struct RemoteShared {
    client: Client,
    base_url: Url,
    token: Option<String>,
    setup_command: Option<String>,
    request_timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SandboxRecord {
    sandbox_id: String,
    url: String,
}

#[derive(Debug, Serialize)]
struct CommandBody<'a> {
    command: &'a str,
}

impl RemoteBackend {
    pub fn new(config: RemoteBackendConfig) -> Result<Self, ProviderError> {
        let mut base_url = Url::parse(&config.base_url).map_err(|err| {
            ProviderError::Backend(format!("invalid backend url '{}': {err}", config.base_url))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Backend(format!(
                "backend url '{}' cannot carry a path",
                config.base_url
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            shared: Arc::new(RemoteShared {
                client,
                base_url,
                token: config.token,
                setup_command: config.setup_command,
                request_timeout: config.request_timeout,
            }),
        })
    }

    fn provider_for(&self, record: SandboxRecord) -> Arc<dyn SandboxProvider> {
        Arc::new(RemoteSandbox {
            shared: self.shared.clone(),
            info: SandboxInfo {
                sandbox_id: record.sandbox_id,
                url: record.url,
                backend: BackendKind::Remote,
            },
            terminated: AtomicBool::new(false),
        })
    }
}

impl RemoteShared {
    fn endpoint(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                ProviderError::Backend(format!("backend url cannot be a base: {}", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let mut builder = self
            .client
            .request(method, url)
            .timeout(self.request_timeout);
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }
}

async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ProviderError::Status {
        status: status.as_u16(),
        body,
    })
}

impl SandboxBackend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn create_sandbox(&self) -> ProviderFuture<'_, Arc<dyn SandboxProvider>> {
        Box::pin(async move {
            let url = self.shared.endpoint(&["sandboxes"])?;
            let response = self
                .shared
                .request(Method::POST, url)
                .json(&json!({}))
                .send()
                .await?;
            let record: SandboxRecord = check_status(response).await?.json().await?;
            tracing::info!(sandbox_id = %record.sandbox_id, "remote: sandbox created");
            Ok(self.provider_for(record))
        })
    }

    fn attach<'a>(
        &'a self,
        sandbox_id: &'a str,
    ) -> ProviderFuture<'a, Option<Arc<dyn SandboxProvider>>> {
        Box::pin(async move {
            let url = self.shared.endpoint(&["sandboxes", sandbox_id])?;
            let response = self.shared.request(Method::GET, url).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let record: SandboxRecord = check_status(response).await?.json().await?;
            Ok(Some(self.provider_for(record)))
        })
    }
}

#[derive(Debug)]
pub struct RemoteSandbox {
    shared: Arc<RemoteShared>,
    info: SandboxInfo,
    terminated: AtomicBool,
}

impl RemoteSandbox {
    fn endpoint(&self, tail: &[&str]) -> Result<Url, ProviderError> {
        let mut segments = vec!["sandboxes", self.info.sandbox_id.as_str()];
        segments.extend_from_slice(tail);
        self.shared.endpoint(&segments)
    }
}

impl SandboxProvider for RemoteSandbox {
    fn info(&self) -> &SandboxInfo {
        &self.info
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn setup(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            let Some(command) = self.shared.setup_command.as_deref() else {
                return Ok(());
            };
            let output = self.run_command(command).await?;
            if !output.success() {
                return Err(ProviderError::Backend(format!(
                    "setup command exited with {}: {}",
                    output.exit_code,
                    output.stderr.trim()
                )));
            }
            Ok(())
        })
    }

    fn run_command<'a>(&'a self, command: &'a str) -> ProviderFuture<'a, CommandOutput> {
        Box::pin(async move {
            ensure_live(self)?;
            let url = self.endpoint(&["commands"])?;
            let response = self
                .shared
                .request(Method::POST, url)
                .json(&CommandBody { command })
                .send()
                .await?;
            Ok(check_status(response).await?.json().await?)
        })
    }

    fn read_file<'a>(&'a self, path: &'a str) -> ProviderFuture<'a, String> {
        Box::pin(async move {
            ensure_live(self)?;
            let url = self.endpoint(&["files"])?;
            let response = self
                .shared
                .request(Method::GET, url)
                .query(&[("path", path)])
                .send()
                .await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Err(ProviderError::NotFound {
                    path: path.to_string(),
                });
            }
            Ok(check_status(response).await?.text().await?)
        })
    }

    fn write_file<'a>(&'a self, path: &'a str, content: &'a str) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            ensure_live(self)?;
            let url = self.endpoint(&["files"])?;
            let response = self
                .shared
                .request(Method::PUT, url)
                .query(&[("path", path)])
                .body(content.to_string())
                .send()
                .await?;
            check_status(response).await?;
            Ok(())
        })
    }

    fn install_packages<'a>(
        &'a self,
        packages: &'a [String],
    ) -> ProviderFuture<'a, PackageInstallOutput> {
        Box::pin(async move {
            ensure_live(self)?;
            let url = self.endpoint(&["packages"])?;
            let response = self
                .shared
                .request(Method::POST, url)
                .json(&json!({ "packages": packages }))
                .send()
                .await?;
            Ok(check_status(response).await?.json().await?)
        })
    }

    fn describe(&self) -> ProviderFuture<'_, Option<SandboxInfo>> {
        Box::pin(async move {
            if self.is_terminated() {
                return Ok(None);
            }
            let url = self.endpoint(&[])?;
            let response = self.shared.request(Method::GET, url).send().await?;
            if response.status() == StatusCode::NOT_FOUND {
                return Ok(None);
            }
            let record: SandboxRecord = check_status(response).await?.json().await?;
            Ok(Some(SandboxInfo {
                sandbox_id: record.sandbox_id,
                url: record.url,
                backend: BackendKind::Remote,
            }))
        })
    }

    fn run_agent<'a>(
        &'a self,
        invocation: &'a AgentInvocation,
        timeout: Duration,
    ) -> ProviderFuture<'a, AgentStreamStart> {
        Box::pin(async move {
            ensure_live(self)?;
            let url = self.endpoint(&["agent", "run"])?;
            let response = self
                .shared
                .request(Method::POST, url)
                .timeout(timeout)
                .header(reqwest::header::ACCEPT, "text/event-stream")
                .json(invocation)
                .send()
                .await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Ok(AgentStreamStart::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }
            let stream = response.bytes_stream().map_err(ProviderError::from);
            Ok(AgentStreamStart::Streaming(Box::pin(stream)))
        })
    }

    fn terminate(&self) -> ProviderFuture<'_, ()> {
        Box::pin(async move {
            if self.terminated.swap(true, Ordering::SeqCst) {
                return Ok(());
            }
            let url = self.endpoint(&[])?;
            let response = self.shared.request(Method::DELETE, url).send().await?;
            if response.status() != StatusCode::NOT_FOUND {
                check_status(response).await?;
            }
            tracing::info!(sandbox_id = %self.info.sandbox_id, "remote: sandbox terminated");
            Ok(())
        })
    }
}
