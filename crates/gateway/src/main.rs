//! `maestro` — multi-agent conversation orchestrator gateway.

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use ms_domain::config::Config;
use ms_gateway::api;
use ms_gateway::state::AppState;

#[derive(Parser, Debug)]
#[command(name = "maestro", about = "Multi-agent conversation orchestrator")]
struct Cli {
    /// Path to the TOML config file (default: ./maestro.toml if present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Bind address override (e.g. 127.0.0.1:8765).
    #[arg(long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    let state = AppState::new(config)?;
    let bind = state.config.server.bind.clone();

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!(addr = %bind, "maestro listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;
    Ok(())
}

/// Wait for ctrl-c, then stop every subprocess handle. This is the one
/// place that drives CLI shutdown directly; everywhere else the
/// subprocess exits when its handle is dropped.
async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
    state.pool.shutdown();
}
