use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use gateway_backend::{ClaudeCliBackend, ClaudeCliConfig};
use gateway_engine::{start_health_reaper, SessionRegistry, TurnExecutor};
use gateway_server::{AppState, GatewayConfig};
use gateway_store::TranscriptStore;
use gateway_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser, Debug)]
#[command(name = "gateway")]
#[command(version)]
#[command(about = "HTTP + SSE session gateway for the claude agent CLI", long_about = None)]
struct Args {
    /// Address to bind.
    #[arg(long, env = "GATEWAY_HOST", default_value = "127.0.0.1")]
    host: String,

    /// Port to bind (0 picks a free port).
    #[arg(short, long, env = "GATEWAY_PORT", default_value_t = 8787)]
    port: u16,

    /// Project directory the agent works in [default: current directory].
    #[arg(short, long, env = "GATEWAY_WORKSPACE")]
    workspace: Option<PathBuf>,

    /// Transcript directory [default: ~/.claude/projects/<workspace slug>].
    #[arg(long, env = "GATEWAY_TRANSCRIPTS_DIR")]
    transcripts_dir: Option<PathBuf>,

    /// Agent CLI executable.
    #[arg(long, env = "CLAUDE_BIN", default_value = "claude")]
    claude_bin: PathBuf,

    /// Minutes a session may sit idle before it is evicted.
    #[arg(long, default_value_t = 30)]
    idle_minutes: u64,

    /// Emit logs as JSON lines.
    #[arg(long, env = "GATEWAY_LOG_JSON")]
    log_json: bool,
}

impl Args {
    fn into_config(self) -> anyhow::Result<GatewayConfig> {
        let defaults = GatewayConfig::default();
        let workspace = match self.workspace {
            Some(dir) => dir,
            None => std::env::current_dir().context("cannot determine current directory")?,
        };
        let workspace = std::fs::canonicalize(&workspace)
            .with_context(|| format!("workspace {} is not accessible", workspace.display()))?;

        Ok(GatewayConfig {
            host: self.host,
            port: self.port,
            workspace,
            transcripts_dir: self.transcripts_dir,
            backend_binary: self.claude_bin,
            idle_timeout_secs: self.idle_minutes * 60,
            ..defaults
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let telemetry = init_telemetry(TelemetryConfig {
        json: args.log_json,
        ..Default::default()
    });
    tracing::debug!(filter = telemetry.filter(), "telemetry initialized");

    let config = args.into_config()?;

    let store = Arc::new(TranscriptStore::for_workspace(
        &config.workspace,
        config.transcripts_dir.clone(),
        config.meta_window_bytes,
    ));
    let registry = Arc::new(SessionRegistry::new(config.idle_timeout()));
    let backend = Arc::new(ClaudeCliBackend::new(ClaudeCliConfig {
        binary: config.backend_binary.clone(),
        ..Default::default()
    }));
    let executor = Arc::new(TurnExecutor::new(
        backend,
        registry.clone(),
        store.clone(),
        config.workspace.clone(),
    ));

    tracing::info!(
        workspace = %config.workspace.display(),
        transcripts = %store.dir().display(),
        backend = executor.backend_name(),
        binary = %config.backend_binary.display(),
        "starting gateway"
    );

    let shutdown = CancellationToken::new();
    let reaper = start_health_reaper(registry, config.sweep_interval(), shutdown.clone());
    let server = gateway_server::start(AppState::new(executor.clone(), config), shutdown.clone())
        .await
        .context("failed to start server")?;

    tracing::info!(port = server.port, "gateway ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    tracing::info!("shutting down");
    let aborted = executor.abort_all();
    if aborted > 0 {
        tracing::info!(turns = aborted, "aborted in-flight turns");
    }
    shutdown.cancel();
    server.join().await;
    if let Err(e) = reaper.await {
        tracing::warn!(error = %e, "reaper task ended abnormally");
    }
    Ok(())
}
