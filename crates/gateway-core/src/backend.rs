use std::path::PathBuf;
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::oneshot;

use crate::errors::BackendError;
use crate::ids::{SessionId, ToolCallId};
use crate::session::PermissionMode;

/// One invocation of the agent backend: a prompt plus how to run it.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    pub prompt: String,
    /// Backend session to attach to. `None` starts a fresh conversation.
    pub resume: Option<SessionId>,
    pub permission: BackendPermission,
    pub cwd: PathBuf,
}

/// Permission vocabulary understood by the backend.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendPermission {
    AcceptEdits,
    BypassPermissions,
}

impl BackendPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AcceptEdits => "acceptEdits",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

impl From<PermissionMode> for BackendPermission {
    fn from(mode: PermissionMode) -> Self {
        match mode {
            PermissionMode::Default => Self::AcceptEdits,
            PermissionMode::DangerouslySkip => Self::BypassPermissions,
        }
    }
}

/// A message as emitted by the backend, before normalisation.
///
/// Only the kinds the gateway reacts to are modelled; everything else lands
/// in [`RawMessage::Other`].
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    StreamEvent {
        event: RawStreamEvent,
    },
    ToolUseSummary {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        preceding_tool_use_ids: Vec<String>,
    },
    Result {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Other,
}

impl RawMessage {
    pub fn init(session_id: impl Into<String>) -> Self {
        Self::System {
            subtype: Some("init".into()),
            session_id: Some(session_id.into()),
        }
    }

    pub fn tool_start(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self::StreamEvent {
            event: RawStreamEvent::ContentBlockStart {
                content_block: ContentBlock::ToolUse {
                    id: id.into(),
                    name: name.into(),
                },
            },
        }
    }

    pub fn text_block_start() -> Self {
        Self::StreamEvent {
            event: RawStreamEvent::ContentBlockStart {
                content_block: ContentBlock::Other,
            },
        }
    }

    pub fn text_delta(text: impl Into<String>) -> Self {
        Self::StreamEvent {
            event: RawStreamEvent::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text: text.into() },
            },
        }
    }

    pub fn input_delta(partial_json: impl Into<String>) -> Self {
        Self::StreamEvent {
            event: RawStreamEvent::ContentBlockDelta {
                delta: BlockDelta::InputJsonDelta {
                    partial_json: partial_json.into(),
                },
            },
        }
    }

    pub fn block_stop() -> Self {
        Self::StreamEvent {
            event: RawStreamEvent::ContentBlockStop,
        }
    }

    pub fn tool_summary(summary: impl Into<String>, ids: &[&str]) -> Self {
        Self::ToolUseSummary {
            summary: summary.into(),
            preceding_tool_use_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn result() -> Self {
        Self::Result {
            subtype: Some("success".into()),
            is_error: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RawStreamEvent {
    ContentBlockStart { content_block: ContentBlock },
    ContentBlockDelta { delta: BlockDelta },
    ContentBlockStop,
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    ToolUse { id: String, name: String },
    #[serde(other)]
    Other,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    #[serde(other)]
    Other,
}

/// The backend is asking whether a tool call may run.
///
/// Sending `true` on `reply` allows it; sending `false` or dropping the
/// sender denies it.
#[derive(Debug)]
pub struct ApprovalRequest {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub input: serde_json::Value,
    pub reply: oneshot::Sender<bool>,
}

#[derive(Debug)]
pub enum BackendEvent {
    Message(RawMessage),
    Approval(ApprovalRequest),
}

pub type BackendStream = Pin<Box<dyn Stream<Item = Result<BackendEvent, BackendError>> + Send>>;

/// An external conversational agent that can run one turn at a time.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Start a turn. Errors returned here mean the turn never started;
    /// failures after that arrive as `Err` items on the stream.
    async fn query(&self, request: QueryRequest) -> Result<BackendStream, BackendError>;
}
