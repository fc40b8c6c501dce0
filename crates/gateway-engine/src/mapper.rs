//! Per-turn translation of raw backend messages into canonical events.
//!
//! [`step`] is a pure function: the caller threads [`MapperState`] through
//! successive calls, so concurrent turns never share tool state.

use gateway_core::backend::{BlockDelta, ContentBlock, RawMessage, RawStreamEvent};
use gateway_core::events::{StreamEvent, ToolCallEvent, ToolCallStatus};
use gateway_core::ids::{SessionId, ToolCallId};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct MapperState {
    pub in_tool: bool,
    pub current_tool_id: Option<ToolCallId>,
    pub current_tool_name: String,
}

impl MapperState {
    fn tool_event(&self, input: Option<String>, status: ToolCallStatus) -> ToolCallEvent {
        ToolCallEvent {
            tool_call_id: self.current_tool_id.clone().unwrap_or_else(|| ToolCallId::from_raw("")),
            tool_name: self.current_tool_name.clone(),
            input,
            result: None,
            status,
        }
    }
}

/// Outcome of mapping one raw message.
#[derive(Debug, PartialEq)]
pub struct Step {
    pub state: MapperState,
    pub events: Vec<StreamEvent>,
    /// Set when the message announced the backend's session id.
    pub backend_session_id: Option<SessionId>,
}

impl Step {
    fn emit(state: MapperState, events: Vec<StreamEvent>) -> Self {
        Self {
            state,
            events,
            backend_session_id: None,
        }
    }
}

/// Map one raw message. `session_id` is the id reported in `done`.
pub fn step(state: MapperState, msg: &RawMessage, session_id: &SessionId) -> Step {
    match msg {
        RawMessage::System {
            subtype,
            session_id: Some(assigned),
        } if subtype.as_deref() == Some("init") => Step {
            state,
            events: Vec::new(),
            backend_session_id: Some(SessionId::from_raw(assigned.as_str())),
        },

        RawMessage::StreamEvent { event } => map_stream_event(state, event),

        RawMessage::ToolUseSummary {
            summary,
            preceding_tool_use_ids,
        } => {
            let events = preceding_tool_use_ids
                .iter()
                .map(|id| {
                    StreamEvent::ToolResult(ToolCallEvent {
                        tool_call_id: ToolCallId::from_raw(id.as_str()),
                        tool_name: String::new(),
                        input: None,
                        result: Some(summary.clone()),
                        status: ToolCallStatus::Complete,
                    })
                })
                .collect();
            Step::emit(state, events)
        }

        RawMessage::Result { .. } => {
            Step::emit(state, vec![StreamEvent::done(session_id.clone())])
        }

        _ => Step::emit(state, Vec::new()),
    }
}

fn map_stream_event(state: MapperState, event: &RawStreamEvent) -> Step {
    match event {
        RawStreamEvent::ContentBlockStart {
            content_block: ContentBlock::ToolUse { id, name },
        } => {
            let state = MapperState {
                in_tool: true,
                current_tool_id: Some(ToolCallId::from_raw(id.as_str())),
                current_tool_name: name.clone(),
            };
            let start = StreamEvent::ToolCallStart(state.tool_event(None, ToolCallStatus::Running));
            Step::emit(state, vec![start])
        }

        RawStreamEvent::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } if !state.in_tool => Step::emit(state, vec![StreamEvent::text(text.as_str())]),

        RawStreamEvent::ContentBlockDelta {
            delta: BlockDelta::InputJsonDelta { partial_json },
        } if state.in_tool => {
            let delta = StreamEvent::ToolCallDelta(
                state.tool_event(Some(partial_json.clone()), ToolCallStatus::Running),
            );
            Step::emit(state, vec![delta])
        }

        RawStreamEvent::ContentBlockStop if state.in_tool => {
            let end = StreamEvent::ToolCallEnd(state.tool_event(None, ToolCallStatus::Complete));
            Step::emit(MapperState::default(), vec![end])
        }

        _ => Step::emit(state, Vec::new()),
    }
}
