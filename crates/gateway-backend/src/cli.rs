use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use gateway_core::backend::{
    AgentBackend, ApprovalRequest, BackendEvent, BackendPermission, BackendStream, QueryRequest,
    RawMessage,
};
use gateway_core::errors::BackendError;
use gateway_core::ids::ToolCallId;

const STDERR_TAIL_LINES: usize = 20;

#[derive(Clone, Debug)]
pub struct ClaudeCliConfig {
    /// Executable to launch.
    pub binary: PathBuf,
    /// Arguments placed before the gateway's own flags (e.g. a package
    /// runner's target).
    pub binary_args: Vec<String>,
}

impl Default for ClaudeCliConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("claude"),
            binary_args: Vec::new(),
        }
    }
}

/// Agent backend that runs one `claude -p` process per turn and speaks the
/// stream-json protocol over its stdio.
pub struct ClaudeCliBackend {
    config: ClaudeCliConfig,
}

impl ClaudeCliBackend {
    pub fn new(config: ClaudeCliConfig) -> Self {
        Self { config }
    }

    fn build_args(&self, request: &QueryRequest) -> Vec<String> {
        let mut args = self.config.binary_args.clone();
        args.extend(
            [
                "-p",
                "--output-format",
                "stream-json",
                "--input-format",
                "stream-json",
                "--verbose",
                "--include-partial-messages",
                "--permission-mode",
                request.permission.as_str(),
            ]
            .map(String::from),
        );
        match request.permission {
            BackendPermission::BypassPermissions => {
                args.push("--dangerously-skip-permissions".into());
            }
            BackendPermission::AcceptEdits => {
                args.push("--permission-prompt-tool".into());
                args.push("stdio".into());
            }
        }
        if let Some(resume) = &request.resume {
            args.push("--resume".into());
            args.push(resume.to_string());
        }
        args
    }
}

#[async_trait]
impl AgentBackend for ClaudeCliBackend {
    fn name(&self) -> &str {
        "claude-cli"
    }

    async fn query(&self, request: QueryRequest) -> Result<BackendStream, BackendError> {
        let args = self.build_args(&request);
        let mut cmd = Command::new(&self.config.binary);
        cmd.args(&args)
            .current_dir(&request.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            BackendError::Spawn(format!("{}: {e}", self.config.binary.display()))
        })?;
        info!(
            binary = %self.config.binary.display(),
            pid = child.id().unwrap_or_default(),
            resume = ?request.resume.as_ref().map(|id| id.as_str()),
            permission = request.permission.as_str(),
            "backend process started"
        );

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Spawn("backend missing stdin pipe".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Spawn("backend missing stdout pipe".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| BackendError::Spawn("backend missing stderr pipe".into()))?;

        let stderr_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                debug!("backend stderr: {line}");
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail).join("\n")
        });

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(16);
        tokio::spawn(stdin_writer(stdin, stdin_rx));
        stdin_tx
            .send(user_message_line(&request.prompt))
            .await
            .map_err(|_| BackendError::Io("backend stdin closed before prompt".into()))?;

        let stream = async_stream::stream! {
            let mut child = child;
            // Held until the terminal `result`; dropping it closes stdin so the
            // process exits instead of waiting for another user message.
            let mut stdin_tx = Some(stdin_tx);
            let mut saw_result = false;
            let mut lines = BufReader::new(stdout).lines();

            loop {
                let line = match lines.next_line().await {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(BackendError::Io(e.to_string()));
                        break;
                    }
                };
                match decode_line(&line) {
                    Ok(Some(CliLine::Message(msg))) => {
                        if matches!(msg, RawMessage::Result { .. }) {
                            saw_result = true;
                            stdin_tx = None;
                        }
                        yield Ok(BackendEvent::Message(msg));
                    }
                    Ok(Some(CliLine::Control { request_id, request })) => match request {
                        ControlRequest::CanUseTool { tool_name, input, tool_use_id } => {
                            let (reply, decision) = oneshot::channel();
                            if let Some(tx) = stdin_tx.clone() {
                                tokio::spawn(answer_permission(
                                    tx,
                                    request_id.clone(),
                                    input.clone(),
                                    decision,
                                ));
                            }
                            let tool_call_id = ToolCallId::from_raw(tool_use_id.unwrap_or(request_id));
                            yield Ok(BackendEvent::Approval(ApprovalRequest {
                                tool_call_id,
                                tool_name,
                                input,
                                reply,
                            }));
                        }
                        ControlRequest::Other => {
                            debug!(request_id = %request_id, "unsupported control request");
                            if let Some(tx) = &stdin_tx {
                                let _ = tx.send(control_error_line(&request_id)).await;
                            }
                        }
                    },
                    Ok(None) => {}
                    Err(e) => debug!(error = %e, "skipping undecodable backend line"),
                }
            }

            drop(stdin_tx);
            let status = child.wait().await;
            let stderr_tail = stderr_task.await.unwrap_or_default();
            match status {
                Ok(status) if status.success() || saw_result => {
                    debug!(%status, "backend process exited");
                }
                Ok(status) => {
                    warn!(%status, "backend process failed");
                    yield Err(BackendError::Exited {
                        status: status.to_string(),
                        stderr: stderr_tail,
                    });
                }
                Err(e) => {
                    if !saw_result {
                        yield Err(e.into());
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}

async fn stdin_writer(mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = write_line(&mut stdin, &line).await {
            debug!(error = %e, "backend stdin write failed");
            break;
        }
    }
}

async fn write_line(stdin: &mut ChildStdin, line: &str) -> std::io::Result<()> {
    stdin.write_all(line.as_bytes()).await?;
    stdin.write_all(b"\n").await?;
    stdin.flush().await
}

async fn answer_permission(
    tx: mpsc::Sender<String>,
    request_id: String,
    input: Value,
    decision: oneshot::Receiver<bool>,
) {
    // A dropped reply slot means nobody will ever approve: deny.
    let allowed = decision.await.unwrap_or(false);
    debug!(request_id = %request_id, allowed, "answering permission request");
    let _ = tx.send(permission_response_line(&request_id, allowed, input)).await;
}

fn user_message_line(prompt: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
    })
    .to_string()
}

fn permission_response_line(request_id: &str, allowed: bool, input: Value) -> String {
    let decision = if allowed {
        json!({ "behavior": "allow", "updatedInput": input })
    } else {
        json!({ "behavior": "deny", "message": "Denied by user" })
    };
    json!({
        "type": "control_response",
        "response": {
            "subtype": "success",
            "request_id": request_id,
            "response": decision,
        },
    })
    .to_string()
}

fn control_error_line(request_id: &str) -> String {
    json!({
        "type": "control_response",
        "response": {
            "subtype": "error",
            "request_id": request_id,
            "error": "unsupported control request",
        },
    })
    .to_string()
}

#[derive(Debug)]
enum CliLine {
    Message(RawMessage),
    Control {
        request_id: String,
        request: ControlRequest,
    },
}

#[derive(Deserialize)]
struct ControlEnvelope {
    request_id: String,
    request: ControlRequest,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
enum ControlRequest {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Other,
}

fn decode_line(line: &str) -> serde_json::Result<Option<CliLine>> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(trimmed)?;
    if value.get("type").and_then(Value::as_str) == Some("control_request") {
        let envelope: ControlEnvelope = serde_json::from_value(value)?;
        return Ok(Some(CliLine::Control {
            request_id: envelope.request_id,
            request: envelope.request,
        }));
    }
    serde_json::from_value(value).map(|msg| Some(CliLine::Message(msg)))
}
