use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    UnsupportedAgent,
    UnsupportedModel,
    SandboxNotFound,
    SandboxBusy,
    ProvisioningFailed,
    TransientInfrastructure,
    StreamError,
    UpstreamError,
    Timeout,
    PersistenceError,
    TokenInvalid,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:sandbox-relay:error:invalid_request",
            Self::UnsupportedAgent => "urn:sandbox-relay:error:unsupported_agent",
            Self::UnsupportedModel => "urn:sandbox-relay:error:unsupported_model",
            Self::SandboxNotFound => "urn:sandbox-relay:error:sandbox_not_found",
            Self::SandboxBusy => "urn:sandbox-relay:error:sandbox_busy",
            Self::ProvisioningFailed => "urn:sandbox-relay:error:provisioning_failed",
            Self::TransientInfrastructure => "urn:sandbox-relay:error:transient_infrastructure",
            Self::StreamError => "urn:sandbox-relay:error:stream_error",
            Self::UpstreamError => "urn:sandbox-relay:error:upstream_error",
            Self::Timeout => "urn:sandbox-relay:error:timeout",
            Self::PersistenceError => "urn:sandbox-relay:error:persistence_error",
            Self::TokenInvalid => "urn:sandbox-relay:error:token_invalid",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::UnsupportedAgent => "Unsupported Agent",
            Self::UnsupportedModel => "Unsupported Model",
            Self::SandboxNotFound => "Sandbox Not Found",
            Self::SandboxBusy => "Sandbox Busy",
            Self::ProvisioningFailed => "Provisioning Failed",
            Self::TransientInfrastructure => "Transient Infrastructure Error",
            Self::StreamError => "Stream Error",
            Self::UpstreamError => "Upstream Error",
            Self::Timeout => "Timeout",
            Self::PersistenceError => "Persistence Error",
            Self::TokenInvalid => "Token Invalid",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::UnsupportedAgent => 400,
            Self::UnsupportedModel => 400,
            Self::SandboxNotFound => 404,
            Self::SandboxBusy => 409,
            Self::ProvisioningFailed => 502,
            Self::TransientInfrastructure => 503,
            Self::StreamError => 502,
            Self::UpstreamError => 502,
            Self::Timeout => 504,
            Self::PersistenceError => 500,
            Self::TokenInvalid => 401,
        }
    }

    /// Validation errors are never retried and always list what would have been accepted.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest | Self::UnsupportedAgent | Self::UnsupportedModel
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

/// Flattened error shape shared by HTTP problem responses and in-stream error events.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub type_: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_choices: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("unsupported agent: {agent}")]
    UnsupportedAgent { agent: String, valid: Vec<String> },
    #[error("unsupported model for {agent}: {model}")]
    UnsupportedModel {
        agent: String,
        model: String,
        valid: Vec<String>,
    },
    #[error("sandbox not found: {sandbox_id}")]
    SandboxNotFound { sandbox_id: String },
    #[error("sandbox busy: {sandbox_id} already has an active agent run")]
    SandboxBusy { sandbox_id: String },
    #[error("provisioning failed after {attempts} attempts: {message}")]
    ProvisioningFailed { attempts: u32, message: String },
    #[error("transient infrastructure error: {message}")]
    TransientInfrastructure { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("upstream returned {status}")]
    Upstream { status: u16, body: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("persistence error: {message}")]
    Persistence { message: String },
    #[error("token invalid")]
    TokenInvalid { message: Option<String> },
}

impl SandboxError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::UnsupportedAgent { .. } => ErrorType::UnsupportedAgent,
            Self::UnsupportedModel { .. } => ErrorType::UnsupportedModel,
            Self::SandboxNotFound { .. } => ErrorType::SandboxNotFound,
            Self::SandboxBusy { .. } => ErrorType::SandboxBusy,
            Self::ProvisioningFailed { .. } => ErrorType::ProvisioningFailed,
            Self::TransientInfrastructure { .. } => ErrorType::TransientInfrastructure,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Upstream { .. } => ErrorType::UpstreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Persistence { .. } => ErrorType::PersistenceError,
            Self::TokenInvalid { .. } => ErrorType::TokenInvalid,
        }
    }

    /// HTTP status for this error. Upstream failures keep the status the backend returned.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } if (400..600).contains(status) => *status,
            other => other.error_type().status_code(),
        }
    }

    pub fn to_error_report(&self) -> ErrorReport {
        let (sandbox_id, valid_choices, details) = match self {
            Self::InvalidRequest { .. } => (None, None, None),
            Self::UnsupportedAgent { valid, .. } => (None, Some(valid.clone()), None),
            Self::UnsupportedModel { agent, valid, .. } => {
                let mut map = Map::new();
                map.insert("agent".to_string(), Value::String(agent.clone()));
                (None, Some(valid.clone()), Some(Value::Object(map)))
            }
            Self::SandboxNotFound { sandbox_id } | Self::SandboxBusy { sandbox_id } => {
                (Some(sandbox_id.clone()), None, None)
            }
            Self::ProvisioningFailed { attempts, message } => {
                let mut map = Map::new();
                map.insert("attempts".to_string(), Value::from(*attempts));
                map.insert("lastError".to_string(), Value::String(message.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::TransientInfrastructure { message }
            | Self::StreamError { message }
            | Self::Persistence { message } => {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(message.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::Upstream { status, body } => {
                let mut map = Map::new();
                map.insert("status".to_string(), Value::from(*status));
                map.insert("body".to_string(), Value::String(body.clone()));
                (None, None, Some(Value::Object(map)))
            }
            Self::Timeout { message } | Self::TokenInvalid { message } => {
                let details = message.as_ref().map(|msg| {
                    let mut map = Map::new();
                    map.insert("message".to_string(), Value::String(msg.clone()));
                    Value::Object(map)
                });
                (None, None, details)
            }
        };

        ErrorReport {
            type_: self.error_type(),
            message: self.to_string(),
            sandbox_id,
            valid_choices,
            details,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        problem.status = self.status_code();
        if let Self::Upstream { body, .. } = self {
            if !body.trim().is_empty() {
                problem.detail = Some(body.clone());
            }
        }
        let report = self.to_error_report();

        let mut extensions = Map::new();
        if let Some(sandbox_id) = report.sandbox_id {
            extensions.insert("sandboxId".to_string(), Value::String(sandbox_id));
        }
        if let Some(valid) = report.valid_choices {
            extensions.insert(
                "validChoices".to_string(),
                Value::Array(valid.into_iter().map(Value::String).collect()),
            );
        }
        if let Some(details) = report.details {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<SandboxError> for ProblemDetails {
    fn from(value: SandboxError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SandboxError> for ProblemDetails {
    fn from(value: &SandboxError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SandboxError> for ErrorReport {
    fn from(value: &SandboxError) -> Self {
        value.to_error_report()
    }
}
