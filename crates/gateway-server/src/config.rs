//! Gateway configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use gateway_engine::DEFAULT_SWEEP_INTERVAL;

/// Configuration for the gateway server and the components it wires up.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `8787`, `0` for auto-assign).
    pub port: u16,
    /// Working directory the backend runs in; also selects the transcript
    /// directory.
    pub workspace: PathBuf,
    /// Read transcripts from here instead of the backend's default location.
    pub transcripts_dir: Option<PathBuf>,
    /// Agent CLI executable.
    pub backend_binary: PathBuf,
    /// Sessions idle for longer than this are evicted.
    pub idle_timeout_secs: u64,
    /// How often the idle sweep runs.
    pub sweep_interval_secs: u64,
    /// Leading bytes of a transcript read to summarize it.
    pub meta_window_bytes: usize,
    pub default_list_limit: usize,
    pub max_list_limit: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            workspace: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            transcripts_dir: None,
            backend_binary: PathBuf::from("claude"),
            idle_timeout_secs: 30 * 60,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL.as_secs(),
            meta_window_bytes: 64 * 1024,
            default_list_limit: 200,
            max_list_limit: 500,
        }
    }
}

impl GatewayConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    /// Resolve a `?limit=` value: absent, unparsable or zero falls back to
    /// the default; anything else is capped at the maximum.
    pub fn list_limit(&self, requested: Option<&str>) -> usize {
        requested
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|n| *n > 0)
            .unwrap_or(self.default_list_limit)
            .min(self.max_list_limit)
    }
}
