use anyhow::Result;
use std::sync::Arc;
use tabdock::config::Config;
use tabdock::server;
use tabdock::service::Workspace;
use tabdock::session::local::LocalSessionEngine;
use tabdock::terminal::pty::NativePtyBackend;
use tabdock::terminal::tmux::Tmux;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(format!("tabdock={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting tabdock server");
    tracing::debug!("Loaded configuration: {:?}", config);
    if config.agent_command.is_none() {
        tracing::warn!("AGENT_COMMAND is not set. Prompt execution will fail until an agent is configured.");
    }

    let multiplexer = Arc::new(Tmux::new(&config.tmux_binary));
    let engine = Arc::new(LocalSessionEngine::new(&config));
    let workspace = Workspace::new(config, engine, Arc::new(NativePtyBackend), multiplexer).await;

    match workspace.persistent.orphans().await {
        Ok(orphans) if !orphans.is_empty() => {
            tracing::warn!(?orphans, "Multiplexer sessions without a terminal record; opening the matching terminal id adopts them")
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Persistent terminals unavailable"),
    }

    let result = server::serve(workspace.clone()).await;
    workspace.pty.close_all();
    tracing::info!("Server stopped");
    result
}
