use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox_relay_error::SandboxError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ENV_PREFIX: &str = "SANDBOX_RELAY_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Json {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentSpec {
    pub id: String,
    pub name: String,
    pub models: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

impl AgentSpec {
    fn new(id: &str, name: &str, models: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            models: models.iter().map(|model| model.to_string()).collect(),
            default_model: models.first().map(|model| model.to_string()),
        }
    }

    pub fn default_model(&self) -> Option<&str> {
        self.default_model
            .as_deref()
            .or_else(|| self.models.first().map(String::as_str))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunLimits {
    pub default_duration_ms: u64,
    pub max_duration_ms: u64,
    pub min_duration_ms: u64,
    pub cancel_grace_ms: u64,
}

impl Default for RunLimits {
    fn default() -> Self {
        Self {
            default_duration_ms: 20 * 60 * 1000,
            max_duration_ms: 20 * 60 * 1000,
            min_duration_ms: 1000,
            cancel_grace_ms: 5000,
        }
    }
}

impl RunLimits {
    /// Budget for one agent run: the requested seconds (or the default), kept within bounds.
    pub fn run_budget(&self, requested_secs: Option<u64>) -> Duration {
        let requested = requested_secs
            .map(|secs| secs.saturating_mul(1000))
            .unwrap_or(self.default_duration_ms);
        let floor = self.min_duration_ms.min(self.max_duration_ms);
        Duration::from_millis(requested.clamp(floor, self.max_duration_ms))
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProvisioningConfig {
    pub max_attempts: u32,
    pub create_timeout_ms: u64,
    pub setup_timeout_ms: u64,
    pub health_timeout_ms: u64,
    pub transient_backoff_base_ms: u64,
    pub transient_backoff_cap_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    pub retry_non_transient: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            create_timeout_ms: 120_000,
            setup_timeout_ms: 300_000,
            health_timeout_ms: 10_000,
            transient_backoff_base_ms: 5_000,
            transient_backoff_cap_ms: 30_000,
            backoff_base_ms: 2_000,
            backoff_cap_ms: 10_000,
            retry_non_transient: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxLayout {
    /// Command run once in every freshly created sandbox.
    pub setup_command: Option<String>,
    pub request_timeout_ms: u64,
}

impl Default for SandboxLayout {
    fn default() -> Self {
        Self {
            setup_command: Some(
                "mkdir -p /workspace/.sandbox-relay /tmp/sandbox-relay".to_string(),
            ),
            request_timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub agents: Vec<AgentSpec>,
    pub run: RunLimits,
    pub provisioning: ProvisioningConfig,
    pub sandbox: SandboxLayout,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            agents: vec![
                AgentSpec::new("claude", "Claude Code", &["sonnet", "opus", "haiku"]),
                AgentSpec::new("codex", "Codex", &["gpt-5-codex", "gpt-5", "o4-mini"]),
                AgentSpec::new("gemini", "Gemini CLI", &["gemini-2.5-pro", "gemini-2.5-flash"]),
                AgentSpec::new("cursor", "Cursor Agent", &["auto", "sonnet-4", "gpt-5"]),
            ],
            run: RunLimits::default(),
            provisioning: ProvisioningConfig::default(),
            sandbox: SandboxLayout::default(),
        }
    }
}

impl RelayConfig {
    /// Defaults, then the optional JSON file, then `SANDBOX_RELAY_*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        let run = &mut self.run;
        run.default_duration_ms = ms_from_env("DEFAULT_DURATION_MS", run.default_duration_ms);
        run.max_duration_ms = ms_from_env("MAX_DURATION_MS", run.max_duration_ms);
        run.cancel_grace_ms = ms_from_env("CANCEL_GRACE_MS", run.cancel_grace_ms);

        let provisioning = &mut self.provisioning;
        provisioning.create_timeout_ms =
            ms_from_env("CREATE_TIMEOUT_MS", provisioning.create_timeout_ms);
        provisioning.setup_timeout_ms =
            ms_from_env("SETUP_TIMEOUT_MS", provisioning.setup_timeout_ms);
        provisioning.health_timeout_ms =
            ms_from_env("HEALTH_TIMEOUT_MS", provisioning.health_timeout_ms);
        if let Some(attempts) = env_value("MAX_ATTEMPTS").and_then(|raw| raw.parse().ok()) {
            provisioning.max_attempts = attempts;
        }
        if let Some(flag) = env_value("RETRY_NON_TRANSIENT") {
            provisioning.retry_non_transient = parse_flag(&flag);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agents.is_empty() {
            return Err(ConfigError::Invalid("at least one agent is required".to_string()));
        }
        if let Some(agent) = self.agents.iter().find(|agent| agent.models.is_empty()) {
            return Err(ConfigError::Invalid(format!(
                "agent '{}' lists no models",
                agent.id
            )));
        }
        if self.provisioning.max_attempts == 0 {
            return Err(ConfigError::Invalid("provisioning.maxAttempts must be at least 1".to_string()));
        }
        if self.run.max_duration_ms == 0 {
            return Err(ConfigError::Invalid("run.maxDurationMs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn agent_ids(&self) -> Vec<String> {
        self.agents.iter().map(|agent| agent.id.clone()).collect()
    }

    /// Checks an agent/model pair against the allow-lists, returning the resolved model.
    pub fn resolve_agent(
        &self,
        agent: &str,
        model: Option<&str>,
    ) -> Result<(&AgentSpec, String), SandboxError> {
        let spec = self
            .agents
            .iter()
            .find(|spec| spec.id == agent)
            .ok_or_else(|| SandboxError::UnsupportedAgent {
                agent: agent.to_string(),
                valid: self.agent_ids(),
            })?;

        let model = match model.map(str::trim).filter(|model| !model.is_empty()) {
            Some(model) => model,
            None => spec.default_model().ok_or_else(|| SandboxError::InvalidRequest {
                message: format!("agent '{agent}' has no default model"),
            })?,
        };
        if !spec.models.iter().any(|candidate| candidate == model) {
            return Err(SandboxError::UnsupportedModel {
                agent: agent.to_string(),
                model: model.to_string(),
                valid: spec.models.clone(),
            });
        }
        Ok((spec, model.to_string()))
    }
}

fn env_value(key: &str) -> Option<String> {
    std::env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn ms_from_env(key: &str, default: u64) -> u64 {
    env_value(key)
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn parse_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}
