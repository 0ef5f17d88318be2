use serde::{Deserialize, Serialize};

pub mod classify;
pub mod frames;
pub mod text;

pub use classify::{classify_payload, classify_value, COMMAND_PREVIEW_CHARS};
pub use frames::{FrameBatch, FrameReassembler};
pub use text::{classify_text, strip_ansi};

/// Presentation-neutral interpretation of one piece of agent output.
///
/// `Skip` carries nothing and is never forwarded to callers; see [`ClassifiedEvent::is_displayable`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClassifiedEvent {
    Message {
        content: String,
    },
    Status {
        content: String,
    },
    Thinking {
        content: String,
    },
    Tool {
        content: String,
        tool: String,
        #[serde(rename = "filePath", default, skip_serializing_if = "Option::is_none")]
        file_path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    Error {
        content: String,
    },
    Skip,
}

impl ClassifiedEvent {
    pub fn message(content: impl Into<String>) -> Self {
        Self::Message {
            content: content.into(),
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::Status {
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::Error {
            content: content.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Status { .. } => "status",
            Self::Thinking { .. } => "thinking",
            Self::Tool { .. } => "tool",
            Self::Error { .. } => "error",
            Self::Skip => "skip",
        }
    }

    pub fn content(&self) -> Option<&str> {
        match self {
            Self::Message { content }
            | Self::Status { content }
            | Self::Thinking { content }
            | Self::Tool { content, .. }
            | Self::Error { content } => Some(content.as_str()),
            Self::Skip => None,
        }
    }

    /// True when the event may reach a caller: not `Skip` and not blank after cleaning.
    pub fn is_displayable(&self) -> bool {
        self.content()
            .map(|content| !content.trim().is_empty())
            .unwrap_or(false)
    }
}
