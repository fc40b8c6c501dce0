//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Sessions currently held in the registry.
    pub active_sessions: usize,
    /// Turns currently streaming.
    pub active_turns: usize,
}

pub fn health_check(start_time: Instant, sessions: usize, turns: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
        uptime_secs: start_time.elapsed().as_secs(),
        active_sessions: sessions,
        active_turns: turns,
    }
}
