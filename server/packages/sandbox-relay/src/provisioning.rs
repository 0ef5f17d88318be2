use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use sandbox_relay_error::SandboxError;
use serde::Serialize;
use tokio::time::Instant;

use crate::config::ProvisioningConfig;
use crate::project_state::ProjectStateStore;
use crate::provider::{ProviderError, SandboxInfo, SandboxProvider};
use crate::registry::SandboxRegistry;

pub const HEALTH_TOKEN: &str = "sandbox-ready";
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Substrings (lowercased) that mark an infrastructure hiccup worth more patience.
const TRANSIENT_PATTERNS: &[&str] = &[
    "econnreset",
    "econnrefused",
    "etimedout",
    "eai_again",
    "connection reset",
    "connection refused",
    "connection closed",
    "operation timed out",
    "dns error",
    "temporary failure in name resolution",
    "bad gateway",
    "service unavailable",
    "gateway timeout",
    "und_err_headers_timeout",
    "headers timeout",
];

const GATEWAY_STATUSES: &[&str] = &["502", "503", "504"];
const STATUS_PREFIXES: &[&str] = &["returned ", "status ", "status: ", "status code ", "http "];

/// Matches `returned 503`, `status: 502` and similar, but not `5030` or an id containing `503`.
fn mentions_gateway_status(lower: &str) -> bool {
    STATUS_PREFIXES.iter().any(|prefix| {
        GATEWAY_STATUSES.iter().any(|status| {
            let needle = format!("{prefix}{status}");
            lower.match_indices(&needle).any(|(at, _)| {
                let after = lower[at + needle.len()..].chars().next();
                let before = lower[..at].chars().next_back();
                !after.is_some_and(|c| c.is_ascii_alphanumeric())
                    && !before.is_some_and(|c| c.is_ascii_alphanumeric())
            })
        })
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    NonTransient,
}

pub fn classify_failure(message: &str) -> FailureClass {
    let lower = message.to_ascii_lowercase();
    if TRANSIENT_PATTERNS
        .iter()
        .any(|pattern| lower.contains(pattern))
        || mentions_gateway_status(&lower)
    {
        FailureClass::Transient
    } else {
        FailureClass::NonTransient
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub cap: Duration,
}

impl Backoff {
    /// Delay after the given (1-based) failed attempt: `base * 2^(attempt-1)`, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct ProvisioningPolicy {
    pub max_attempts: u32,
    pub create_timeout: Duration,
    pub setup_timeout: Duration,
    pub health_timeout: Duration,
    pub transient_backoff: Backoff,
    pub backoff: Backoff,
    /// Whether failures outside the transient set are retried at all.
    pub retry_non_transient: bool,
}

impl From<&ProvisioningConfig> for ProvisioningPolicy {
    fn from(config: &ProvisioningConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            create_timeout: Duration::from_millis(config.create_timeout_ms),
            setup_timeout: Duration::from_millis(config.setup_timeout_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
            transient_backoff: Backoff {
                base: Duration::from_millis(config.transient_backoff_base_ms),
                cap: Duration::from_millis(config.transient_backoff_cap_ms),
            },
            backoff: Backoff {
                base: Duration::from_millis(config.backoff_base_ms),
                cap: Duration::from_millis(config.backoff_cap_ms),
            },
            retry_non_transient: config.retry_non_transient,
        }
    }
}

impl Default for ProvisioningPolicy {
    fn default() -> Self {
        Self::from(&ProvisioningConfig::default())
    }
}

impl ProvisioningPolicy {
    pub fn backoff_for(&self, class: FailureClass) -> Backoff {
        match class {
            FailureClass::Transient => self.transient_backoff,
            FailureClass::NonTransient => self.backoff,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Create,
    Setup,
    HealthCheck,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Create => "create",
            Stage::Setup => "setup",
            Stage::HealthCheck => "health check",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub attempt: u32,
    pub elapsed_ms: u64,
    pub stage: Stage,
    pub class: FailureClass,
    pub error: String,
}

#[derive(Debug)]
pub struct Provisioned {
    pub provider: Arc<dyn SandboxProvider>,
    pub info: SandboxInfo,
    pub failed_attempts: Vec<AttemptRecord>,
}

struct AttemptFailure {
    stage: Stage,
    message: String,
    created: Option<Arc<dyn SandboxProvider>>,
}

/// Drives create → setup → health check with per-stage deadlines, retries and rollback.
#[derive(Debug, Clone)]
pub struct Provisioner {
    registry: Arc<SandboxRegistry>,
    state_store: ProjectStateStore,
    policy: ProvisioningPolicy,
}

async fn run_stage<T, F>(stage: Stage, deadline: Duration, operation: F) -> Result<T, String>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    // Dropping the operation on timeout cancels the in-flight backend request.
    match tokio::time::timeout(deadline, operation).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(format!("{stage} failed: {err}")),
        Err(_) => Err(format!("{stage} timed out after {}ms", deadline.as_millis())),
    }
}

impl Provisioner {
    pub fn new(
        registry: Arc<SandboxRegistry>,
        state_store: ProjectStateStore,
        policy: ProvisioningPolicy,
    ) -> Self {
        Self {
            registry,
            state_store,
            policy,
        }
    }

    pub fn policy(&self) -> &ProvisioningPolicy {
        &self.policy
    }

    /// Provisions a sandbox, registers it and seeds its project state.
    ///
    /// `project_id` names the project document; the sandbox id is used when absent.
    pub async fn provision(&self, project_id: Option<&str>) -> Result<Provisioned, SandboxError> {
        let started = Instant::now();
        let mut failures: Vec<AttemptRecord> = Vec::new();

        for attempt in 1..=self.policy.max_attempts {
            let attempt_started = Instant::now();
            let failure = match self.attempt().await {
                Ok(provider) => {
                    let info = provider.info().clone();
                    if let Err(err) = self.registry.register(&info.sandbox_id, provider.clone()).await {
                        self.rollback(&*provider).await;
                        return Err(err);
                    }
                    tracing::info!(
                        sandbox_id = %info.sandbox_id,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "provisioning: sandbox ready"
                    );

                    let project_id = project_id.unwrap_or(&info.sandbox_id);
                    if let Err(err) = self.state_store.initialize(&*provider, project_id).await {
                        tracing::warn!(
                            sandbox_id = %info.sandbox_id,
                            error = %err,
                            "provisioning: initial project state not persisted"
                        );
                    }
                    return Ok(Provisioned {
                        provider,
                        info,
                        failed_attempts: failures,
                    });
                }
                Err(failure) => failure,
            };

            if let Some(created) = &failure.created {
                self.rollback(&**created).await;
            }

            let class = classify_failure(&failure.message);
            tracing::warn!(
                attempt,
                max_attempts = self.policy.max_attempts,
                stage = %failure.stage,
                class = ?class,
                error = %failure.message,
                "provisioning: attempt failed"
            );
            failures.push(AttemptRecord {
                attempt,
                elapsed_ms: attempt_started.elapsed().as_millis() as u64,
                stage: failure.stage,
                class,
                error: failure.message,
            });

            if attempt == self.policy.max_attempts {
                break;
            }
            if class == FailureClass::NonTransient && !self.policy.retry_non_transient {
                break;
            }
            let delay = self.policy.backoff_for(class).delay(attempt);
            tracing::info!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                "provisioning: backing off"
            );
            tokio::time::sleep(delay).await;
        }

        let attempts = failures.len() as u32;
        let message = failures
            .pop()
            .map(|record| record.error)
            .unwrap_or_else(|| "no provisioning attempt was made".to_string());
        Err(SandboxError::ProvisioningFailed { attempts, message })
    }

    async fn attempt(&self) -> Result<Arc<dyn SandboxProvider>, AttemptFailure> {
        let backend = self.registry.backend();
        let provider = run_stage(Stage::Create, self.policy.create_timeout, backend.create_sandbox())
            .await
            .map_err(|message| AttemptFailure {
                stage: Stage::Create,
                message,
                created: None,
            })?;

        let fail = |stage: Stage, message: String| AttemptFailure {
            stage,
            message,
            created: Some(provider.clone()),
        };

        run_stage(Stage::Setup, self.policy.setup_timeout, provider.setup())
            .await
            .map_err(|message| fail(Stage::Setup, message))?;

        let command = format!("echo {HEALTH_TOKEN}");
        let output = run_stage(
            Stage::HealthCheck,
            self.policy.health_timeout,
            provider.run_command(&command),
        )
        .await
        .map_err(|message| fail(Stage::HealthCheck, message))?;
        if !output.success() || output.stdout.trim() != HEALTH_TOKEN {
            return Err(fail(
                Stage::HealthCheck,
                format!(
                    "health check failed: exit code {}, output {:?}",
                    output.exit_code,
                    output.stdout.trim()
                ),
            ));
        }

        Ok(provider)
    }

    async fn rollback(&self, provider: &dyn SandboxProvider) {
        let sandbox_id = provider.sandbox_id().to_string();
        match tokio::time::timeout(ROLLBACK_TIMEOUT, provider.terminate()).await {
            Ok(Ok(())) => {
                tracing::info!(sandbox_id = %sandbox_id, "provisioning: rolled back partial sandbox");
            }
            Ok(Err(err)) => {
                tracing::error!(sandbox_id = %sandbox_id, error = %err, "provisioning: rollback failed");
            }
            Err(_) => {
                tracing::error!(sandbox_id = %sandbox_id, "provisioning: rollback timed out");
            }
        }
    }
}
