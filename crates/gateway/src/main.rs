use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sd_gateway::bootstrap::build_app_state;
use sd_gateway::cli::{load_config, Cli, Command};
use sd_gateway::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            let config = load_config(&cli.config)?;
            run_server(Arc::new(config)).await
        }
        Some(Command::ConfigShow) => {
            let config = load_config(&cli.config)?;
            println!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("SPRITEDECK_LOG")
                .unwrap_or_else(|_| EnvFilter::new("info,sd_gateway=debug")),
        )
        .init();
}

async fn run_server(config: Arc<sd_domain::config::Config>) -> anyhow::Result<()> {
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "SpriteDeck starting");

    let state = build_app_state(config.clone()).await?;
    let router = sd_gateway::api::build_router(state.clone());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!(%addr, "listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(state))
        .await
        .context("server error")?;

    Ok(())
}

/// Wait for ctrl-c, then stop every live supervisor so allocations and
/// repo locks are released before the process exits.
async fn shutdown_signal(state: AppState) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown requested; stopping sessions");
    for handle in state.registry.all() {
        handle.terminate().await;
    }
    // Give cleanup a moment to release locks and pkill agents.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
}
