//! Small JSON document kept inside each sandbox describing the project living there.
//!
//! Plain reads never fail: a missing or malformed document yields defaults. Updates refuse to
//! overwrite a document the backend failed to return. Writes normalize the candidate first, so
//! callers always get back exactly what was persisted.

use chrono::{DateTime, SecondsFormat, Utc};
use sandbox_relay_error::SandboxError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use utoipa::ToSchema;

use crate::provider::{ProviderError, SandboxProvider};

pub const PROJECT_STATE_PATH: &str = "/workspace/.sandbox-relay/project-state.json";
pub const MAX_MESSAGES: usize = 200;

const DEFAULT_DEV_COMMAND: &str = "npm run dev";
const DEFAULT_DEV_PORT: u16 = 5173;
const DEFAULT_PROCESS_MATCH: &str = "vite";
const DEFAULT_PROJECT_LABEL: &str = "untitled";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectState {
    pub project_id: String,
    pub created_at: String,
    pub updated_at: String,
    pub messages: Vec<Value>,
    pub conversation_context: ConversationContext,
    pub checkpoints: Vec<Value>,
    pub dev_server: DevServer,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hosting_site: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub scraped_sources: Vec<Value>,
    pub generated_components: Vec<Value>,
    pub applied_code: Vec<Value>,
    pub current_project: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_generated_code: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DevServer {
    pub command: String,
    pub port: u16,
    pub process_match: String,
}

impl Default for ConversationContext {
    fn default() -> Self {
        Self {
            scraped_sources: Vec::new(),
            generated_components: Vec::new(),
            applied_code: Vec::new(),
            current_project: DEFAULT_PROJECT_LABEL.to_string(),
            last_generated_code: None,
        }
    }
}

impl Default for DevServer {
    fn default() -> Self {
        Self {
            command: DEFAULT_DEV_COMMAND.to_string(),
            port: DEFAULT_DEV_PORT,
            process_match: DEFAULT_PROCESS_MATCH.to_string(),
        }
    }
}

pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

impl ProjectState {
    pub fn new(project_id: &str, now: &str) -> Self {
        Self {
            project_id: project_id.to_string(),
            created_at: now.to_string(),
            updated_at: now.to_string(),
            messages: Vec::new(),
            conversation_context: ConversationContext::default(),
            checkpoints: Vec::new(),
            dev_server: DevServer::default(),
            repository: None,
            hosting_site: None,
        }
    }

    /// Coerces any JSON value into a well-formed document.
    ///
    /// Lists that are missing or not arrays become empty, bad scalars take their defaults,
    /// and only the newest [`MAX_MESSAGES`] messages are kept. Older documents that stored
    /// messages under `conversationHistory` are accepted too.
    pub fn normalize(candidate: &Value, project_id: &str, now: &str) -> Self {
        let empty = Map::new();
        let doc = candidate.as_object().unwrap_or(&empty);

        let messages = match doc.get("messages") {
            Some(value) => array_field(Some(value)),
            None => array_field(doc.get("conversationHistory")),
        };

        Self {
            project_id: string_field(doc.get("projectId")).unwrap_or_else(|| project_id.to_string()),
            created_at: timestamp_field(doc.get("createdAt")).unwrap_or_else(|| now.to_string()),
            updated_at: timestamp_field(doc.get("updatedAt")).unwrap_or_else(|| now.to_string()),
            messages: keep_newest(messages, MAX_MESSAGES),
            conversation_context: ConversationContext::normalize(doc.get("conversationContext")),
            checkpoints: array_field(doc.get("checkpoints")),
            dev_server: DevServer::normalize(doc.get("devServer")),
            repository: object_field(doc.get("repository")),
            hosting_site: object_field(doc.get("hostingSite")),
        }
    }

    pub fn to_pretty_json(&self) -> Result<String, SandboxError> {
        serde_json::to_string_pretty(self).map_err(|err| SandboxError::Persistence {
            message: format!("failed to encode project state: {err}"),
        })
    }
}

impl ConversationContext {
    fn normalize(value: Option<&Value>) -> Self {
        let Some(obj) = value.and_then(Value::as_object) else {
            return Self::default();
        };
        Self {
            scraped_sources: array_field(obj.get("scrapedSources")),
            generated_components: array_field(obj.get("generatedComponents")),
            applied_code: array_field(obj.get("appliedCode")),
            current_project: string_field(obj.get("currentProject"))
                .unwrap_or_else(|| DEFAULT_PROJECT_LABEL.to_string()),
            last_generated_code: obj.get("lastGeneratedCode").filter(|v| !v.is_null()).cloned(),
        }
    }
}

impl DevServer {
    fn normalize(value: Option<&Value>) -> Self {
        let defaults = Self::default();
        let Some(obj) = value.and_then(Value::as_object) else {
            return defaults;
        };
        Self {
            command: string_field(obj.get("command")).unwrap_or(defaults.command),
            port: obj
                .get("port")
                .and_then(Value::as_u64)
                .and_then(|port| u16::try_from(port).ok())
                .filter(|port| *port > 0)
                .unwrap_or(defaults.port),
            process_match: string_field(obj.get("processMatch")).unwrap_or(defaults.process_match),
        }
    }
}

fn array_field(value: Option<&Value>) -> Vec<Value> {
    value
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn string_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn object_field(value: Option<&Value>) -> Option<Value> {
    value.filter(|value| value.is_object()).cloned()
}

fn timestamp_field(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .filter(|raw| DateTime::parse_from_rfc3339(raw).is_ok())
        .map(str::to_string)
}

fn keep_newest(mut items: Vec<Value>, limit: usize) -> Vec<Value> {
    if items.len() > limit {
        items.drain(..items.len() - limit);
    }
    items
}

#[derive(Debug, Clone)]
pub struct ProjectStateStore {
    path: String,
}

impl Default for ProjectStateStore {
    fn default() -> Self {
        Self::new(PROJECT_STATE_PATH)
    }
}

impl ProjectStateStore {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn read(&self, provider: &dyn SandboxProvider, project_id: &str) -> ProjectState {
        match self.try_read(provider, project_id).await {
            Ok(state) => state,
            Err(err) => {
                tracing::warn!(
                    sandbox_id = provider.sandbox_id(),
                    error = %err,
                    "project_state: read failed, using defaults"
                );
                ProjectState::new(project_id, &timestamp_now())
            }
        }
    }

    /// Like [`Self::read`], except that a backend failure other than a missing file is returned.
    pub async fn try_read(
        &self,
        provider: &dyn SandboxProvider,
        project_id: &str,
    ) -> Result<ProjectState, ProviderError> {
        let now = timestamp_now();
        let raw = match provider.read_file(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.is_not_found() => return Ok(ProjectState::new(project_id, &now)),
            Err(err) => return Err(err),
        };
        match serde_json::from_str::<Value>(&raw) {
            Ok(value) => Ok(ProjectState::normalize(&value, project_id, &now)),
            Err(err) => {
                tracing::warn!(
                    sandbox_id = provider.sandbox_id(),
                    error = %err,
                    "project_state: stored document is not JSON, using defaults"
                );
                Ok(ProjectState::new(project_id, &now))
            }
        }
    }

    pub async fn write(
        &self,
        provider: &dyn SandboxProvider,
        project_id: &str,
        candidate: &Value,
    ) -> Result<ProjectState, SandboxError> {
        let now = timestamp_now();
        let mut state = ProjectState::normalize(candidate, project_id, &now);
        state.updated_at = now;
        let body = state.to_pretty_json()?;
        provider
            .write_file(&self.path, &body)
            .await
            .map_err(|err| SandboxError::Persistence {
                message: format!("failed to write {}: {err}", self.path),
            })?;
        Ok(state)
    }

    /// Writes a fresh default document, as done right after provisioning.
    pub async fn initialize(
        &self,
        provider: &dyn SandboxProvider,
        project_id: &str,
    ) -> Result<ProjectState, SandboxError> {
        self.write(provider, project_id, &Value::Null).await
    }

    /// Read-modify-write helper for state-affecting operations.
    ///
    /// Nothing is written when the current document could not be read.
    pub async fn update<F>(
        &self,
        provider: &dyn SandboxProvider,
        project_id: &str,
        apply: F,
    ) -> Result<ProjectState, SandboxError>
    where
        F: FnOnce(&mut ProjectState) + Send,
    {
        let mut state = self
            .try_read(provider, project_id)
            .await
            .map_err(|err| SandboxError::Persistence {
                message: format!("failed to read {}: {err}", self.path),
            })?;
        apply(&mut state);
        let candidate = serde_json::to_value(&state).map_err(|err| SandboxError::Persistence {
            message: format!("failed to encode project state: {err}"),
        })?;
        self.write(provider, project_id, &candidate).await
    }
}
