use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;

use gateway_core::ids::ToolCallId;
use gateway_core::session::{
    HistoryMessage, HistoryToolCall, HistoryToolStatus, PermissionMode, Role,
};

const TITLE_MAX_CHARS: usize = 80;
const PREVIEW_MAX_CHARS: usize = 100;

static SYSTEM_REMINDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<system-reminder>.*?</system-reminder>").unwrap());

/// One record of the backend's NDJSON transcript. Only the fields the
/// gateway reads are modelled.
#[derive(Debug, Deserialize)]
pub struct TranscriptLine {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub message: Option<LineMessage>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(rename = "permissionMode", default)]
    pub permission_mode: Option<String>,
    #[serde(default)]
    pub subtype: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LineMessage {
    #[serde(default)]
    pub content: MessageContent,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

#[derive(Debug, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl MessageContent {
    /// Text blocks joined with newlines; plain string content as-is.
    fn text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.kind == "text")
                .filter_map(|b| b.text.as_deref())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Non-empty lines that parse; truncated or corrupt lines are dropped.
fn parse_lines(content: &str) -> impl Iterator<Item = TranscriptLine> + '_ {
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
}

fn is_control_marker(text: &str) -> bool {
    text.starts_with("<local-command") || text.starts_with("<command-name>")
}

fn strip_system_tags(text: &str) -> String {
    SYSTEM_REMINDER.replace_all(text, "").trim().to_string()
}

/// The user-visible text of a user line, or `None` for control traffic and
/// lines that are empty once reminders are removed.
fn user_text(message: &LineMessage) -> Option<String> {
    let text = message.content.text();
    if is_control_marker(&text) {
        return None;
    }
    let clean = strip_system_tags(&text);
    (!clean.is_empty()).then_some(clean)
}

fn truncate_chars(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Fields derived from the leading window of a transcript.
#[derive(Debug, Default, PartialEq)]
pub struct SessionMeta {
    pub first_timestamp: Option<DateTime<Utc>>,
    pub permission_mode: PermissionMode,
    pub first_user_message: Option<String>,
    pub last_user_message: Option<String>,
}

impl SessionMeta {
    pub fn title(&self, session_id: &str) -> String {
        match &self.first_user_message {
            Some(msg) => truncate_chars(msg, TITLE_MAX_CHARS),
            None => format!("Session {}", session_id.chars().take(8).collect::<String>()),
        }
    }

    pub fn preview(&self) -> Option<String> {
        self.last_user_message
            .as_deref()
            .map(|m| truncate_chars(m, PREVIEW_MAX_CHARS))
    }
}

pub fn extract_meta(content: &str) -> SessionMeta {
    let mut meta = SessionMeta::default();

    for line in parse_lines(content) {
        if line.kind == "system" && line.subtype.as_deref() == Some("init") {
            if let Some(mode) = &line.permission_mode {
                meta.permission_mode = PermissionMode::from_backend(mode);
            }
        }

        if meta.first_timestamp.is_none() {
            meta.first_timestamp = line
                .timestamp
                .as_deref()
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc));
        }

        if line.kind == "user" {
            if let Some(text) = line.message.as_ref().and_then(user_text) {
                if meta.first_user_message.is_none() {
                    meta.first_user_message = Some(text.clone());
                }
                meta.last_user_message = Some(text);
            }
        }
    }

    meta
}

/// Rebuild the conversation history from a complete transcript.
pub fn parse_history(content: &str) -> Vec<HistoryMessage> {
    let mut messages = Vec::new();

    for line in parse_lines(content) {
        let Some(message) = &line.message else {
            continue;
        };
        let id = line
            .uuid
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        match line.kind.as_str() {
            "user" => {
                let Some(text) = user_text(message) else {
                    continue;
                };
                messages.push(HistoryMessage {
                    id,
                    role: Role::User,
                    content: text,
                    tool_calls: Vec::new(),
                    timestamp: line.timestamp.clone(),
                });
            }
            "assistant" => {
                let MessageContent::Blocks(blocks) = &message.content else {
                    continue;
                };
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();
                for block in blocks {
                    match (block.kind.as_str(), &block.id, &block.name) {
                        ("text", _, _) => {
                            if let Some(text) = block.text.as_deref().filter(|t| !t.is_empty()) {
                                text_parts.push(text);
                            }
                        }
                        ("tool_use", Some(id), Some(name)) => tool_calls.push(HistoryToolCall {
                            tool_call_id: ToolCallId::from_raw(id.as_str()),
                            tool_name: name.clone(),
                            status: HistoryToolStatus::Complete,
                        }),
                        _ => {}
                    }
                }

                let text = text_parts.join("\n").trim().to_string();
                if text.is_empty() && tool_calls.is_empty() {
                    continue;
                }
                messages.push(HistoryMessage {
                    id,
                    role: Role::Assistant,
                    content: text,
                    tool_calls,
                    timestamp: line.timestamp.clone(),
                });
            }
            _ => {}
        }
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;

    const HI_HELLO: &str = concat!(
        r#"{"type":"user","message":{"role":"user","content":"Hi"}}"#,
        "\n",
        r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"Hello"},{"type":"tool_use","id":"t1","name":"Read","input":{"path":"a"}}]}}"#,
        "\n",
    );

    #[test]
    fn history_of_user_and_assistant_with_tool() {
        let history = parse_history(HI_HELLO);
        assert_eq!(history.len(), 2);

        assert_eq!(history[0].role, Role::User);
        assert_eq!(history[0].content, "Hi");
        assert!(history[0].tool_calls.is_empty());

        assert_eq!(history[1].role, Role::Assistant);
        assert_eq!(history[1].content, "Hello");
        assert_eq!(
            history[1].tool_calls,
            vec![HistoryToolCall {
                tool_call_id: ToolCallId::from_raw("t1"),
                tool_name: "Read".into(),
                status: HistoryToolStatus::Complete,
            }]
        );
    }

    #[test]
    fn system_only_log_has_no_history() {
        let log = concat!(
            r#"{"type":"system","subtype":"init","session_id":"s","permissionMode":"default"}"#,
            "\n",
            r#"{"type":"result","subtype":"success"}"#,
            "\n",
            r#"{"type":"summary","summary":"Greeting"}"#,
        );
        assert!(parse_history(log).is_empty());
    }

    #[test]
    fn truncated_and_garbage_lines_are_skipped() {
        let log = format!(
            "{HI_HELLO}not json at all\n{}",
            r#"{"type":"user","message":{"role":"user","content":"cut of"#
        );
        assert_eq!(parse_history(&log).len(), 2);
    }

    #[test]
    fn control_markers_and_reminders() {
        let log = concat!(
            r#"{"type":"user","message":{"content":"<command-name>/clear</command-name>"}}"#,
            "\n",
            r#"{"type":"user","message":{"content":"<local-command-stdout></local-command-stdout>"}}"#,
            "\n",
            r#"{"type":"user","message":{"content":"<system-reminder>\nbe nice\n</system-reminder>"}}"#,
            "\n",
            r#"{"type":"user","uuid":"u9","message":{"content":[{"type":"text","text":"fix it"},{"type":"text","text":"<system-reminder>ctx</system-reminder>"}]}}"#,
        );
        let history = parse_history(log);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].id, "u9");
        assert_eq!(history[0].content, "fix it");
    }

    #[test]
    fn tool_result_user_lines_are_not_messages() {
        let log = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":"file body"}]}}"#;
        assert!(parse_history(log).is_empty());
    }

    #[test]
    fn assistant_text_blocks_are_joined() {
        let log = r#"{"type":"assistant","uuid":"a1","timestamp":"2025-01-01T00:00:00Z","message":{"content":[{"type":"text","text":"one"},{"type":"thinking","thinking":"hm"},{"type":"text","text":"two"}]}}"#;
        let history = parse_history(log);
        assert_eq!(history[0].content, "one\ntwo");
        assert_eq!(history[0].timestamp.as_deref(), Some("2025-01-01T00:00:00Z"));
    }

    #[test]
    fn missing_uuid_gets_generated_id() {
        let history = parse_history(HI_HELLO);
        assert!(uuid::Uuid::parse_str(&history[0].id).is_ok());
        assert_ne!(history[0].id, history[1].id);
    }

    #[test]
    fn meta_from_window() {
        let log = concat!(
            r#"{"type":"system","subtype":"init","permissionMode":"bypassPermissions","timestamp":"2025-03-01T10:00:00.000Z"}"#,
            "\n",
            r#"{"type":"user","message":{"content":"<command-name>/init</command-name>"}}"#,
            "\n",
            r#"{"type":"user","message":{"content":"first question"}}"#,
            "\n",
            r#"{"type":"user","message":{"content":"second question"}}"#,
        );
        let meta = extract_meta(log);
        assert_eq!(meta.permission_mode, PermissionMode::DangerouslySkip);
        assert_eq!(
            meta.first_timestamp.unwrap().to_rfc3339(),
            "2025-03-01T10:00:00+00:00"
        );
        assert_eq!(meta.title("abc"), "first question");
        assert_eq!(meta.preview().as_deref(), Some("second question"));
    }

    #[test]
    fn title_truncates_at_80_chars() {
        let meta = SessionMeta {
            first_user_message: Some("é".repeat(100)),
            ..Default::default()
        };
        let title = meta.title("x");
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), 83);

        let short = SessionMeta {
            first_user_message: Some("a".repeat(80)),
            ..Default::default()
        };
        assert_eq!(short.title("x"), "a".repeat(80));
    }

    #[test]
    fn fallback_title_uses_id_prefix() {
        let meta = extract_meta("");
        assert_eq!(meta.title("0b9c1f2e-1111-4222"), "Session 0b9c1f2e");
        assert_eq!(meta.permission_mode, PermissionMode::Default);
        assert!(meta.preview().is_none());
    }
}
