use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use gateway_core::ids::{SessionId, ToolCallId};
use gateway_core::session::PermissionMode;

use crate::error::EngineError;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Clone, Copy, Debug, Default)]
pub struct SessionOptions {
    pub permission_mode: PermissionMode,
    /// The backend already knows this id (its transcript exists), so the
    /// first turn resumes instead of starting fresh.
    pub has_started: bool,
}

struct PendingApproval {
    tool_call_id: ToolCallId,
    reply: oneshot::Sender<bool>,
}

struct SessionEntry {
    backend_session_id: SessionId,
    permission_mode: PermissionMode,
    last_activity: Instant,
    has_started: bool,
    pending_approval: Option<PendingApproval>,
    turn_lock: Arc<tokio::sync::Mutex<()>>,
}

impl SessionEntry {
    fn is_busy(&self) -> bool {
        self.turn_lock.try_lock().is_err()
    }
}

/// Point-in-time copy of a registry entry.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    pub backend_session_id: SessionId,
    pub permission_mode: PermissionMode,
    pub has_started: bool,
    pub idle_for: Duration,
    pub busy: bool,
    pub pending_approval: Option<ToolCallId>,
}

/// Exclusive right to run one turn on a session, plus what the turn needs
/// to invoke the backend. The session stays locked until this is dropped.
pub struct TurnTicket {
    pub backend_session_id: SessionId,
    pub has_started: bool,
    pub permission_mode: PermissionMode,
    _guard: OwnedMutexGuard<()>,
}

/// In-memory directory of live sessions, keyed by the client-facing id.
///
/// Every operation takes the single map lock for its whole duration, so
/// operations are atomic with respect to each other.
pub struct SessionRegistry {
    sessions: Mutex<HashMap<SessionId, SessionEntry>>,
    idle_timeout: Duration,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_IDLE_TIMEOUT)
    }
}

impl SessionRegistry {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            idle_timeout,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Create the entry if absent. Returns whether it was created; an
    /// existing entry is left untouched.
    pub fn ensure_session(&self, id: &SessionId, opts: SessionOptions) -> bool {
        let mut sessions = self.sessions.lock();
        Self::insert_if_absent(&mut sessions, id, opts)
    }

    fn insert_if_absent(
        sessions: &mut HashMap<SessionId, SessionEntry>,
        id: &SessionId,
        opts: SessionOptions,
    ) -> bool {
        if sessions.contains_key(id) {
            return false;
        }
        sessions.insert(
            id.clone(),
            SessionEntry {
                backend_session_id: id.clone(),
                permission_mode: opts.permission_mode,
                last_activity: Instant::now(),
                has_started: opts.has_started,
                pending_approval: None,
                turn_lock: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
        info!(session_id = %id, mode = %opts.permission_mode, resumed = opts.has_started, "session registered");
        true
    }

    pub fn has_session(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    pub fn backend_session_id(&self, id: &SessionId) -> Option<SessionId> {
        self.sessions
            .lock()
            .get(id)
            .map(|e| e.backend_session_id.clone())
    }

    pub fn snapshot(&self, id: &SessionId) -> Option<SessionSnapshot> {
        self.sessions.lock().get(id).map(|e| SessionSnapshot {
            id: id.clone(),
            backend_session_id: e.backend_session_id.clone(),
            permission_mode: e.permission_mode,
            has_started: e.has_started,
            idle_for: e.last_activity.elapsed(),
            busy: e.is_busy(),
            pending_approval: e.pending_approval.as_ref().map(|p| p.tool_call_id.clone()),
        })
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Lock the session for a turn, registering it with `opts` first if it
    /// is unknown. Fails if a turn is already running.
    pub fn begin_turn(&self, id: &SessionId, opts: SessionOptions) -> Result<TurnTicket, EngineError> {
        let mut sessions = self.sessions.lock();
        Self::insert_if_absent(&mut sessions, id, opts);
        let Some(entry) = sessions.get_mut(id) else {
            return Err(EngineError::TurnInProgress(id.clone()));
        };
        let guard = entry
            .turn_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| EngineError::TurnInProgress(id.clone()))?;
        entry.last_activity = Instant::now();
        Ok(TurnTicket {
            backend_session_id: entry.backend_session_id.clone(),
            has_started: entry.has_started,
            permission_mode: entry.permission_mode,
            _guard: guard,
        })
    }

    /// Record the id the backend announced in its init message. Only the
    /// first init of a session is taken; returns whether this one was.
    pub fn record_init(&self, id: &SessionId, backend_session_id: SessionId) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        if entry.has_started {
            return false;
        }
        debug!(session_id = %id, backend_session_id = %backend_session_id, "backend session assigned");
        entry.backend_session_id = backend_session_id;
        entry.has_started = true;
        true
    }

    /// Park an approval reply slot on the session. If the session is gone
    /// the slot is dropped, which the backend reads as a denial. A slot
    /// already parked is replaced and so denied.
    pub fn set_pending_approval(
        &self,
        id: &SessionId,
        tool_call_id: ToolCallId,
        reply: oneshot::Sender<bool>,
    ) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        let replaced = entry.pending_approval.replace(PendingApproval {
            tool_call_id: tool_call_id.clone(),
            reply,
        });
        if let Some(previous) = replaced {
            warn!(
                session_id = %id,
                denied = %previous.tool_call_id,
                tool_call_id = %tool_call_id,
                "pending approval replaced; earlier request denied"
            );
        }
        entry.last_activity = Instant::now();
        true
    }

    /// Resolve the session's pending approval. Returns false, changing
    /// nothing, when there is no pending approval or `tool_call_id` names a
    /// different call. An empty `tool_call_id` matches whatever is pending.
    pub fn approve_tool(&self, id: &SessionId, tool_call_id: &ToolCallId, approved: bool) -> bool {
        let mut sessions = self.sessions.lock();
        let Some(entry) = sessions.get_mut(id) else {
            return false;
        };
        let matches = entry
            .pending_approval
            .as_ref()
            .is_some_and(|p| tool_call_id.is_empty() || p.tool_call_id == *tool_call_id);
        if !matches {
            return false;
        }
        let Some(pending) = entry.pending_approval.take() else {
            return false;
        };
        entry.last_activity = Instant::now();
        if pending.reply.send(approved).is_err() {
            debug!(session_id = %id, "approval answered after the turn ended");
        }
        info!(session_id = %id, tool_call_id = %pending.tool_call_id, approved, "tool approval resolved");
        true
    }

    /// Called when a turn ends by any path: stamps activity and drops any
    /// unanswered approval.
    pub fn finish_turn(&self, id: &SessionId) {
        if let Some(entry) = self.sessions.lock().get_mut(id) {
            entry.last_activity = Instant::now();
            entry.pending_approval = None;
        }
    }

    /// Evict sessions idle for longer than the timeout. Sessions with a
    /// turn in flight are never evicted. Returns the evicted ids.
    pub fn check_session_health(&self) -> Vec<SessionId> {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.sessions.lock().retain(|id, entry| {
            let idle = now.saturating_duration_since(entry.last_activity);
            let keep = idle <= self.idle_timeout || entry.is_busy();
            if !keep {
                evicted.push(id.clone());
            }
            keep
        });
        evicted
    }
}
