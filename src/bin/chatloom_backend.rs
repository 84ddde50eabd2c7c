use anyhow::{Context, Result};
use chatloom::config::EngineConfig;
use chatloom::runtime::EngineRuntime;
use chatloom::server::serve_backend;
use flume::unbounded;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,chatloom=debug")),
        )
        .init();

    let config = EngineConfig::load();
    let (event_tx, event_rx) = unbounded();
    let runtime = EngineRuntime::bootstrap(config, event_tx)
        .context("failed to bootstrap engine runtime")?;

    tracing::info!(
        "Starting chatloom backend (set CHATLOOM_BACKEND_TOKEN + optional CHATLOOM_BACKEND_BIND; auth mode via CHATLOOM_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(runtime, event_rx))
}
