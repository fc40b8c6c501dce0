//! Turn execution: one user message in, one finite event stream out.
//!
//! A turn holds its session's turn lock from the moment it is accepted until
//! its stream is finished or dropped. Every turn that is not cancelled ends
//! in exactly one terminal event (`error` or `done`), and nothing follows it.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gateway_core::backend::{AgentBackend, BackendEvent, BackendStream, QueryRequest};
use gateway_core::errors::BackendError;
use gateway_core::events::{ApprovalEvent, ErrorEvent, StreamEvent};
use gateway_core::ids::SessionId;
use gateway_core::session::PermissionMode;
use gateway_store::TranscriptStore;

use crate::error::EngineError;
use crate::mapper::{self, MapperState};
use crate::registry::{SessionOptions, SessionRegistry, TurnTicket};
use crate::tools::ToolLedger;

pub type TurnStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// How long a finished backend is given to exit on its own before it is
/// dropped (and killed).
const BACKEND_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone, Debug)]
pub struct TurnRequest {
    pub session_id: SessionId,
    pub content: String,
    /// Overrides the session's permission mode for this turn only.
    pub permission_mode: Option<PermissionMode>,
}

impl TurnRequest {
    pub fn new(session_id: SessionId, content: impl Into<String>) -> Self {
        Self {
            session_id,
            content: content.into(),
            permission_mode: None,
        }
    }
}

/// Releases everything a turn holds, whichever way the turn ends: normal
/// completion, abort, or the client dropping the stream.
struct TurnGuard {
    session_id: SessionId,
    registry: Arc<SessionRegistry>,
    active_runs: Arc<DashMap<SessionId, CancellationToken>>,
    _ticket: TurnTicket,
}

impl Drop for TurnGuard {
    fn drop(&mut self) {
        self.active_runs.remove(&self.session_id);
        self.registry.finish_turn(&self.session_id);
    }
}

pub struct TurnExecutor {
    backend: Arc<dyn AgentBackend>,
    registry: Arc<SessionRegistry>,
    store: Arc<TranscriptStore>,
    cwd: PathBuf,
    active_runs: Arc<DashMap<SessionId, CancellationToken>>,
}

impl TurnExecutor {
    pub fn new(
        backend: Arc<dyn AgentBackend>,
        registry: Arc<SessionRegistry>,
        store: Arc<TranscriptStore>,
        cwd: PathBuf,
    ) -> Self {
        Self {
            backend,
            registry,
            store,
            cwd,
            active_runs: Arc::new(DashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<TranscriptStore> {
        &self.store
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    pub fn is_running(&self, session_id: &SessionId) -> bool {
        self.active_runs.contains_key(session_id)
    }

    pub fn active_turns(&self) -> usize {
        self.active_runs.len()
    }

    /// Cancel the session's in-flight turn. Its stream stops without a
    /// `done` event.
    pub fn abort(&self, session_id: &SessionId) -> bool {
        match self.active_runs.get(session_id) {
            Some(token) => {
                token.cancel();
                info!(session_id = %session_id, "turn aborted");
                true
            }
            None => false,
        }
    }

    pub fn abort_all(&self) -> usize {
        let mut count = 0;
        for entry in self.active_runs.iter() {
            entry.value().cancel();
            count += 1;
        }
        count
    }

    /// Start a turn. The returned stream is lazy and single-use; events are
    /// produced as the backend delivers them.
    pub async fn send_message(&self, request: TurnRequest) -> Result<TurnStream, EngineError> {
        if request.content.trim().is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        let session_id = request.session_id;

        // Unknown ids may name a conversation the backend already has on
        // disk; those resume rather than start fresh.
        let mut opts = SessionOptions {
            permission_mode: request.permission_mode.unwrap_or_default(),
            has_started: false,
        };
        if !self.registry.has_session(&session_id) {
            opts.has_started = self.store.exists(&session_id).await;
        }

        let ticket = self.registry.begin_turn(&session_id, opts)?;
        let permission = request.permission_mode.unwrap_or(ticket.permission_mode);
        let query = QueryRequest {
            prompt: request.content,
            resume: ticket
                .has_started
                .then(|| ticket.backend_session_id.clone()),
            permission: permission.into(),
            cwd: self.cwd.clone(),
        };
        let backend_session_id = ticket.backend_session_id.clone();

        let cancel = CancellationToken::new();
        self.active_runs.insert(session_id.clone(), cancel.clone());
        let guard = TurnGuard {
            session_id: session_id.clone(),
            registry: self.registry.clone(),
            active_runs: self.active_runs.clone(),
            _ticket: ticket,
        };

        info!(
            session_id = %session_id,
            resume = ?query.resume.as_ref().map(|id| id.as_str()),
            mode = %permission,
            backend = self.backend.name(),
            "turn started"
        );

        Ok(run_turn(
            self.backend.clone(),
            self.registry.clone(),
            session_id,
            backend_session_id,
            query,
            cancel,
            guard,
        ))
    }
}

fn run_turn(
    backend: Arc<dyn AgentBackend>,
    registry: Arc<SessionRegistry>,
    session_id: SessionId,
    mut backend_session_id: SessionId,
    query: QueryRequest,
    cancel: CancellationToken,
    guard: TurnGuard,
) -> TurnStream {
    Box::pin(async_stream::stream! {
        let _guard = guard;
        let started = Instant::now();
        let mut ledger = ToolLedger::default();
        let mut state = MapperState::default();

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            opened = backend.query(query) => Some(opened),
        };
        let mut raw = match opened {
            None => {
                info!(session_id = %session_id, "turn cancelled before backend started");
                return;
            }
            Some(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "backend failed to start");
                yield error_event(&e);
                return;
            }
            Some(Ok(raw)) => raw,
        };

        let mut failure: Option<BackendError> = None;
        let mut finished = false;

        'turn: loop {
            let item = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let summary = ledger.summary();
                    info!(
                        session_id = %session_id,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        tools = summary.started,
                        "turn cancelled"
                    );
                    return;
                }
                item = raw.next() => item,
            };

            match item {
                None => break,
                Some(Ok(BackendEvent::Message(msg))) => {
                    let step = mapper::step(state, &msg, &backend_session_id);
                    state = step.state;
                    if let Some(assigned) = step.backend_session_id {
                        if registry.record_init(&session_id, assigned.clone()) {
                            info!(session_id = %session_id, backend_session_id = %assigned, "backend assigned session id");
                        }
                        if let Some(current) = registry.backend_session_id(&session_id) {
                            backend_session_id = current;
                        }
                    }
                    for mut event in step.events {
                        ledger.observe(&mut event);
                        let done = matches!(event, StreamEvent::Done(_));
                        yield event;
                        if done {
                            finished = true;
                            break 'turn;
                        }
                    }
                }
                Some(Ok(BackendEvent::Approval(request))) => {
                    let mut event = StreamEvent::ApprovalRequired(ApprovalEvent {
                        tool_call_id: request.tool_call_id.clone(),
                        tool_name: request.tool_name.clone(),
                        input: request.input.to_string(),
                    });
                    if !registry.set_pending_approval(&session_id, request.tool_call_id, request.reply) {
                        warn!(session_id = %session_id, "session no longer registered; tool denied");
                    }
                    ledger.observe(&mut event);
                    yield event;
                }
                Some(Err(e)) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        let summary = ledger.summary();
        if let Some(e) = failure {
            let unfinished = ledger.fail_unfinished();
            warn!(
                session_id = %session_id,
                error = %e,
                tools = summary.started,
                tools_failed = summary.failed + unfinished.len(),
                "turn failed"
            );
            for end in unfinished {
                yield end;
            }
            yield error_event(&e);
        } else {
            if finished {
                tokio::spawn(drain_backend(session_id.clone(), raw));
            } else {
                yield StreamEvent::done(backend_session_id.clone());
            }
            info!(
                session_id = %session_id,
                backend_session_id = %backend_session_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                tools = summary.started,
                tools_complete = summary.complete,
                "turn finished"
            );
        }
    })
}

fn error_event(e: &BackendError) -> StreamEvent {
    StreamEvent::Error(ErrorEvent {
        message: e.to_string(),
        code: Some(e.code().to_string()),
    })
}

/// Let a backend that already reported its result exit cleanly.
async fn drain_backend(session_id: SessionId, mut raw: BackendStream) {
    let drained = tokio::time::timeout(BACKEND_DRAIN_TIMEOUT, async {
        let mut leftover = 0usize;
        while let Some(item) = raw.next().await {
            leftover += 1;
            if let Err(e) = item {
                debug!(session_id = %session_id, error = %e, "backend error after result");
            }
        }
        leftover
    })
    .await;
    match drained {
        Ok(0) => {}
        Ok(n) => debug!(session_id = %session_id, leftover = n, "ignored backend output after result"),
        Err(_) => warn!(session_id = %session_id, "backend did not exit after result"),
    }
}
