use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, ToolCallId};

/// Lifecycle status of a tool call as seen by the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Complete,
    Error,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TextDelta {
    pub text: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCallEvent {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    pub status: ToolCallStatus,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalEvent {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub input: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoneEvent {
    pub session_id: SessionId,
}

/// Canonical, transport-agnostic event produced for every turn.
///
/// On the wire each variant becomes an SSE frame whose `event:` field is
/// [`StreamEvent::event_type`] and whose `data:` field is the payload alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamEvent {
    TextDelta(TextDelta),
    ToolCallStart(ToolCallEvent),
    ToolCallDelta(ToolCallEvent),
    ToolCallEnd(ToolCallEvent),
    ToolResult(ToolCallEvent),
    ApprovalRequired(ApprovalEvent),
    Error(ErrorEvent),
    Done(DoneEvent),
}

impl StreamEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextDelta(TextDelta { text: text.into() })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorEvent {
            message: message.into(),
            code: None,
        })
    }

    pub fn done(session_id: SessionId) -> Self {
        Self::Done(DoneEvent { session_id })
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TextDelta(_) => "text_delta",
            Self::ToolCallStart(_) => "tool_call_start",
            Self::ToolCallDelta(_) => "tool_call_delta",
            Self::ToolCallEnd(_) => "tool_call_end",
            Self::ToolResult(_) => "tool_result",
            Self::ApprovalRequired(_) => "approval_required",
            Self::Error(_) => "error",
            Self::Done(_) => "done",
        }
    }

    /// `done` and `error` end a turn; nothing follows them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done(_) | Self::Error(_))
    }

    pub fn tool_call(&self) -> Option<&ToolCallEvent> {
        match self {
            Self::ToolCallStart(t)
            | Self::ToolCallDelta(t)
            | Self::ToolCallEnd(t)
            | Self::ToolResult(t) => Some(t),
            _ => None,
        }
    }

    /// JSON of the payload without the tag, as carried in an SSE `data:` line.
    pub fn payload_json(&self) -> serde_json::Result<String> {
        match self {
            Self::TextDelta(p) => serde_json::to_string(p),
            Self::ToolCallStart(p)
            | Self::ToolCallDelta(p)
            | Self::ToolCallEnd(p)
            | Self::ToolResult(p) => serde_json::to_string(p),
            Self::ApprovalRequired(p) => serde_json::to_string(p),
            Self::Error(p) => serde_json::to_string(p),
            Self::Done(p) => serde_json::to_string(p),
        }
    }

    /// Rebuild an event from an SSE frame's event name and data line.
    pub fn from_frame(event_type: &str, data: &str) -> serde_json::Result<Self> {
        let payload: serde_json::Value = serde_json::from_str(data)?;
        serde_json::from_value(serde_json::json!({ "type": event_type, "data": payload }))
    }
}
