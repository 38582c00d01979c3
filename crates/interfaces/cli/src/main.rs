use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use maestro_config::AppConfig;
use maestro_llm::LlmRouter;
use maestro_runtime::{AgentWrapper, ServerDeps, run_server};
use maestro_session::{EventBus, SessionStore};
use maestro_tools::default_registry;

#[derive(Debug, Parser)]
#[command(name = "maestro", about = "Conversational multi-agent orchestrator server")]
struct Args {
    /// Path to the TOML config file.
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,

    /// Override the bind address from the config.
    #[arg(long)]
    bind: Option<String>,

    /// Override the log filter (RUST_LOG syntax).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut config = AppConfig::load_from(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind_addr = bind;
    }

    let filter = args
        .log_level
        .clone()
        .unwrap_or_else(|| config.telemetry.log_level.clone());
    let file_appender = tracing_appender::rolling::daily(&config.telemetry.logs_dir, "maestro.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::registry()
        .with(EnvFilter::try_new(&filter).unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file_writer))
        .init();

    info!(config = %args.config.display(), "starting");

    let bus = Arc::new(EventBus::new());
    let store = Arc::new(SessionStore::new());
    let router = Arc::new(LlmRouter::new(config.llm.clone()));
    let registry = Arc::new(default_registry(&config.tools));
    info!(tools = registry.len(), "tool registry built");

    let wrapper = Arc::new(AgentWrapper::with_router(
        bus.clone(),
        store.clone(),
        router,
        registry,
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    // Idle-session sweep.
    {
        let store = store.clone();
        let max_idle = std::time::Duration::from_secs(config.server.session_idle_secs.max(60));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(600));
            loop {
                interval.tick().await;
                let expired = store.sweep_idle(max_idle);
                if !expired.is_empty() {
                    info!(count = expired.len(), "idle sessions expired");
                }
            }
        });
    }

    run_server(
        &config.server.bind_addr,
        ServerDeps { bus, store, wrapper },
        shutdown_rx,
    )
    .await
}
