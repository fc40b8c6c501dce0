use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::registry::SessionRegistry;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Spawn the periodic idle-session sweep. Runs until `shutdown` fires.
pub fn start_health_reaper(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = registry.check_session_health();
                    if !evicted.is_empty() {
                        tracing::info!(
                            removed = evicted.len(),
                            remaining = registry.len(),
                            "idle session sweep"
                        );
                    }
                }
            }
        }
        tracing::debug!("session reaper stopped");
    })
}
