use gateway_core::events::{StreamEvent, ToolCallEvent, ToolCallStatus};
use gateway_core::ids::ToolCallId;

/// What one turn knows about a tool call it has started.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCallState {
    pub tool_call_id: ToolCallId,
    pub tool_name: String,
    pub input: String,
    pub result: Option<String>,
    pub status: ToolCallStatus,
}

/// Per-turn record of tool calls, fed with every outgoing event.
///
/// Entries are only created by `tool_call_start`; results for calls started
/// in an earlier turn pass through untouched.
#[derive(Debug, Default)]
pub struct ToolLedger {
    calls: Vec<ToolCallState>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ToolSummary {
    pub started: usize,
    pub complete: usize,
    pub failed: usize,
}

impl ToolLedger {
    pub fn get(&self, id: &ToolCallId) -> Option<&ToolCallState> {
        self.calls.iter().find(|c| c.tool_call_id == *id)
    }

    fn get_mut(&mut self, id: &ToolCallId) -> Option<&mut ToolCallState> {
        self.calls.iter_mut().find(|c| c.tool_call_id == *id)
    }

    /// Update state from an event about to be sent. `tool_result` events
    /// get their `toolName` filled in when the call is known.
    pub fn observe(&mut self, event: &mut StreamEvent) {
        match event {
            StreamEvent::ToolCallStart(t) => {
                self.calls.push(ToolCallState {
                    tool_call_id: t.tool_call_id.clone(),
                    tool_name: t.tool_name.clone(),
                    input: String::new(),
                    result: None,
                    status: ToolCallStatus::Running,
                });
            }
            StreamEvent::ToolCallDelta(t) => {
                if let Some(call) = self.get_mut(&t.tool_call_id) {
                    call.input.push_str(t.input.as_deref().unwrap_or_default());
                }
            }
            StreamEvent::ToolCallEnd(t) => {
                if let Some(call) = self.get_mut(&t.tool_call_id) {
                    call.status = t.status;
                }
            }
            StreamEvent::ToolResult(t) => {
                if let Some(call) = self.get_mut(&t.tool_call_id) {
                    call.result = t.result.clone();
                    call.status = ToolCallStatus::Complete;
                    if t.tool_name.is_empty() {
                        t.tool_name = call.tool_name.clone();
                    }
                }
            }
            // A call whose `tool_call_end` was already sent keeps its status.
            StreamEvent::ApprovalRequired(a) => {
                if let Some(call) = self.get_mut(&a.tool_call_id) {
                    if call.status == ToolCallStatus::Running {
                        call.status = ToolCallStatus::Pending;
                    }
                }
            }
            _ => {}
        }
    }

    /// Mark every call that has not yet had its `tool_call_end` as failed
    /// and return the matching `tool_call_end` events, in start order.
    pub fn fail_unfinished(&mut self) -> Vec<StreamEvent> {
        self.calls
            .iter_mut()
            .filter(|c| matches!(c.status, ToolCallStatus::Running | ToolCallStatus::Pending))
            .map(|c| {
                c.status = ToolCallStatus::Error;
                StreamEvent::ToolCallEnd(ToolCallEvent {
                    tool_call_id: c.tool_call_id.clone(),
                    tool_name: c.tool_name.clone(),
                    input: None,
                    result: None,
                    status: ToolCallStatus::Error,
                })
            })
            .collect()
    }

    pub fn summary(&self) -> ToolSummary {
        ToolSummary {
            started: self.calls.len(),
            complete: self
                .calls
                .iter()
                .filter(|c| c.status == ToolCallStatus::Complete)
                .count(),
            failed: self
                .calls
                .iter()
                .filter(|c| c.status == ToolCallStatus::Error)
                .count(),
        }
    }
}
