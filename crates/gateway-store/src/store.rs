use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tracing::debug;

use gateway_core::ids::SessionId;
use gateway_core::session::{HistoryMessage, SessionSummary};

use crate::error::StoreError;
use crate::paths::{default_transcripts_dir, is_valid_session_id};
use crate::transcript::{extract_meta, parse_history};

pub const DEFAULT_META_WINDOW: usize = 64 * 1024;

const TRANSCRIPT_EXT: &str = "jsonl";

struct CacheEntry {
    modified: SystemTime,
    summary: SessionSummary,
}

/// Read-only view over the backend's per-session transcript files.
///
/// Summaries produced by [`list_sessions`](Self::list_sessions) are cached
/// per file and reused only while the file's modification time is exactly
/// the one recorded.
pub struct TranscriptStore {
    dir: PathBuf,
    window: usize,
    cache: Mutex<HashMap<SessionId, CacheEntry>>,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>, window: usize) -> Self {
        Self {
            dir: dir.into(),
            window: window.max(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Store for a workspace root, using the backend's default location
    /// unless `dir_override` is given.
    pub fn for_workspace(root: &Path, dir_override: Option<PathBuf>, window: usize) -> Self {
        let dir = dir_override.unwrap_or_else(|| default_transcripts_dir(root));
        Self::new(dir, window)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn transcript_path(&self, id: &SessionId) -> Result<PathBuf, StoreError> {
        if !is_valid_session_id(id.as_str()) {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(self.dir.join(format!("{}.{TRANSCRIPT_EXT}", id.as_str())))
    }

    /// Whether the backend has written a transcript for this id.
    pub async fn exists(&self, id: &SessionId) -> bool {
        match self.transcript_path(id) {
            Ok(path) => tokio::fs::try_exists(&path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Every session with a transcript, most recently modified first.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let files = match self.transcript_files().await {
            Ok(files) => files,
            Err(e) => {
                debug!(dir = %self.dir.display(), error = %e, "no transcripts listed");
                return Vec::new();
            }
        };

        let mut seen = HashSet::with_capacity(files.len());
        let mut sessions = Vec::with_capacity(files.len());
        for (id, path) in files {
            seen.insert(id.clone());
            match self.cached_summary(&id, &path).await {
                Ok(summary) => sessions.push(summary),
                Err(e) => debug!(session_id = %id, error = %e, "skipping unreadable transcript"),
            }
        }

        self.cache.lock().retain(|id, _| seen.contains(id));

        sessions.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.id.as_str().cmp(b.id.as_str()))
        });
        sessions
    }

    /// Summary of one session, read fresh from disk.
    pub async fn get_session(&self, id: &SessionId) -> Option<SessionSummary> {
        let path = self.transcript_path(id).ok()?;
        match self.summarize(id, &path).await {
            Ok((summary, _)) => Some(summary),
            Err(e) => {
                debug!(session_id = %id, error = %e, "session not readable");
                None
            }
        }
    }

    /// Full conversation history. A missing transcript is an empty history.
    pub async fn read_transcript(&self, id: &SessionId) -> Vec<HistoryMessage> {
        let Ok(path) = self.transcript_path(id) else {
            return Vec::new();
        };
        match tokio::fs::read(&path).await {
            Ok(bytes) => parse_history(&String::from_utf8_lossy(&bytes)),
            Err(e) => {
                debug!(session_id = %id, error = %e, "no transcript to read");
                Vec::new()
            }
        }
    }

    pub fn cached_sessions(&self) -> usize {
        self.cache.lock().len()
    }

    async fn transcript_files(&self) -> Result<Vec<(SessionId, PathBuf)>, StoreError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TRANSCRIPT_EXT) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            files.push((SessionId::from_raw(stem), path));
        }
        Ok(files)
    }

    async fn cached_summary(
        &self,
        id: &SessionId,
        path: &Path,
    ) -> Result<SessionSummary, StoreError> {
        let modified = tokio::fs::metadata(path).await?.modified()?;
        let cached = self
            .cache
            .lock()
            .get(id)
            .filter(|entry| entry.modified == modified)
            .map(|entry| entry.summary.clone());
        if let Some(summary) = cached {
            return Ok(summary);
        }

        debug!(session_id = %id, "metadata cache miss");
        let (summary, modified) = self.summarize(id, path).await?;
        self.cache.lock().insert(
            id.clone(),
            CacheEntry {
                modified,
                summary: summary.clone(),
            },
        );
        Ok(summary)
    }

    /// Derive a summary from the file's leading window and its timestamps.
    async fn summarize(
        &self,
        id: &SessionId,
        path: &Path,
    ) -> Result<(SessionSummary, SystemTime), StoreError> {
        let file = tokio::fs::File::open(path).await?;
        let metadata = file.metadata().await?;
        let modified = metadata.modified()?;

        let mut window = Vec::with_capacity(self.window.min(metadata.len() as usize));
        file.take(self.window as u64).read_to_end(&mut window).await?;
        let meta = extract_meta(&String::from_utf8_lossy(&window));

        let updated_at = DateTime::<Utc>::from(modified);
        let created_at = meta.first_timestamp.unwrap_or_else(|| {
            metadata
                .created()
                .map(DateTime::<Utc>::from)
                .unwrap_or(updated_at)
        });
        if metadata.len() as usize > self.window {
            debug!(session_id = %id, size = metadata.len(), "summarized leading window only");
        }

        let summary = SessionSummary {
            id: id.clone(),
            title: meta.title(id.as_str()),
            created_at,
            updated_at,
            last_message_preview: meta.preview(),
            permission_mode: meta.permission_mode,
        };
        Ok((summary, modified))
    }
}

impl std::fmt::Debug for TranscriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriptStore")
            .field("dir", &self.dir)
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::{File, FileTimes};
    use std::io::Write;
    use std::time::Duration;

    use gateway_core::session::PermissionMode;

    fn user_line(text: &str) -> String {
        serde_json::json!({"type": "user", "message": {"role": "user", "content": text}})
            .to_string()
    }

    fn write_transcript(dir: &Path, id: &str, lines: &[String], mtime_secs: u64) -> PathBuf {
        let path = dir.join(format!("{id}.jsonl"));
        let mut file = File::create(&path).unwrap();
        for line in lines {
            writeln!(file, "{line}").unwrap();
        }
        set_mtime(&path, mtime_secs);
        path
    }

    fn set_mtime(path: &Path, secs: u64) {
        let file = File::options().write(true).open(path).unwrap();
        let time = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        file.set_times(FileTimes::new().set_modified(time)).unwrap();
    }

    #[tokio::test]
    async fn missing_directory_lists_nothing() {
        let store = TranscriptStore::new("/nonexistent/gateway/transcripts", DEFAULT_META_WINDOW);
        assert!(store.list_sessions().await.is_empty());
        assert!(store.get_session(&SessionId::from_raw("x")).await.is_none());
        assert!(store.read_transcript(&SessionId::from_raw("x")).await.is_empty());
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        write_transcript(dir.path(), "old", &[user_line("old question")], 1_700_000_000);
        write_transcript(dir.path(), "new", &[user_line("new question")], 1_700_000_500);
        write_transcript(dir.path(), "mid", &[user_line("mid question")], 1_700_000_100);
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        let ids: Vec<_> = store
            .list_sessions()
            .await
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn cache_hit_matches_fresh_parse() {
        let dir = tempfile::tempdir().unwrap();
        write_transcript(dir.path(), "s1", &[user_line("hello there")], 1_700_000_000);

        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        let first = store.list_sessions().await;
        let second = store.list_sessions().await;
        assert_eq!(first, second);
        assert_eq!(store.cached_sessions(), 1);

        let fresh = store.get_session(&SessionId::from_raw("s1")).await.unwrap();
        assert_eq!(second[0], fresh);
    }

    #[tokio::test]
    async fn unchanged_mtime_serves_cached_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(dir.path(), "s1", &[user_line("original")], 1_700_000_000);
        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        assert_eq!(store.list_sessions().await[0].title, "original");

        // Rewrite the content but pin the modification time back.
        std::fs::write(&path, format!("{}\n", user_line("rewritten"))).unwrap();
        set_mtime(&path, 1_700_000_000);
        assert_eq!(store.list_sessions().await[0].title, "original");
    }

    #[tokio::test]
    async fn changed_mtime_rederives() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_transcript(dir.path(), "s1", &[user_line("original")], 1_700_000_000);
        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        assert_eq!(store.list_sessions().await[0].title, "original");

        std::fs::write(&path, format!("{}\n", user_line("rewritten"))).unwrap();
        set_mtime(&path, 1_700_000_001);
        let listed = store.list_sessions().await;
        assert_eq!(listed[0].title, "rewritten");
        assert_eq!(listed[0].updated_at.timestamp(), 1_700_000_001);
    }

    #[tokio::test]
    async fn deleted_files_are_pruned_from_cache() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_transcript(dir.path(), "a", &[user_line("a")], 1_700_000_000);
        write_transcript(dir.path(), "b", &[user_line("b")], 1_700_000_001);
        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        store.list_sessions().await;
        assert_eq!(store.cached_sessions(), 2);

        std::fs::remove_file(a).unwrap();
        assert_eq!(store.list_sessions().await.len(), 1);
        assert_eq!(store.cached_sessions(), 1);
    }

    #[tokio::test]
    async fn summary_reads_only_the_leading_window() {
        let dir = tempfile::tempdir().unwrap();
        let mut lines = vec![user_line("early")];
        lines.extend((0..50).map(|i| user_line(&format!("padding message number {i}"))));
        lines.push(user_line("late"));
        write_transcript(dir.path(), "big", &lines, 1_700_000_000);

        let store = TranscriptStore::new(dir.path(), 256);
        let summary = store.get_session(&SessionId::from_raw("big")).await.unwrap();
        assert_eq!(summary.title, "early");
        assert_ne!(summary.last_message_preview.as_deref(), Some("late"));

        // History always reads the whole file.
        let history = store.read_transcript(&SessionId::from_raw("big")).await;
        assert_eq!(history.last().unwrap().content, "late");
    }

    #[tokio::test]
    async fn summary_fields() {
        let dir = tempfile::tempdir().unwrap();
        let init = serde_json::json!({
            "type": "system", "subtype": "init", "permissionMode": "bypassPermissions",
            "timestamp": "2025-01-02T03:04:05Z"
        })
        .to_string();
        write_transcript(dir.path(), "0b9c1f2e-aaaa", &[init], 1_700_000_000);

        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        let s = store.get_session(&SessionId::from_raw("0b9c1f2e-aaaa")).await.unwrap();
        assert_eq!(s.title, "Session 0b9c1f2e");
        assert_eq!(s.permission_mode, PermissionMode::DangerouslySkip);
        assert_eq!(s.created_at.to_rfc3339(), "2025-01-02T03:04:05+00:00");
        assert_eq!(s.updated_at.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn path_like_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        let id = SessionId::from_raw("../escape");
        assert!(store.transcript_path(&id).is_err());
        assert!(store.get_session(&id).await.is_none());
        assert!(!store.exists(&id).await);
    }

    #[tokio::test]
    async fn exists_tracks_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TranscriptStore::new(dir.path(), DEFAULT_META_WINDOW);
        let id = SessionId::from_raw("s1");
        assert!(!store.exists(&id).await);
        write_transcript(dir.path(), "s1", &[], 1_700_000_000);
        assert!(store.exists(&id).await);
    }
}
