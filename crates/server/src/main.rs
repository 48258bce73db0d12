mod bootstrap;
mod health;
mod webhook;

use std::sync::Arc;

use anyhow::Result;
use axum::Router;
use tally_core::config::{AppConfig, LoadOptions};

use crate::bootstrap::Application;

fn init_logging(config: &AppConfig) {
    use tally_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

fn router(app: &Application) -> Router {
    let events = webhook::router(&app.config.server.events_path, Arc::clone(&app.receiver));
    health::router().merge(events)
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Config errors are reported by anyhow; no subscriber exists yet.
    let config = AppConfig::load(LoadOptions { load_dotenv: true, ..LoadOptions::default() })?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config)?;
    let address = app.config.listen_address();
    let listener = tokio::net::TcpListener::bind(&address).await?;

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        events_path = %app.config.server.events_path,
        "tally-server listening"
    );

    axum::serve(listener, router(&app)).with_graceful_shutdown(wait_for_shutdown()).await?;

    let drained = app.receiver.drain().await;
    tracing::info!(
        event_name = "system.server.drained",
        correlation_id = "shutdown",
        drained,
        "in-flight shortcut dispatches finished"
    );

    tracing::info!(
        event_name = "system.server.stopped",
        correlation_id = "shutdown",
        "tally-server stopped"
    );

    Ok(())
}

async fn wait_for_shutdown() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::warn!(
            event_name = "system.server.signal_error",
            correlation_id = "shutdown",
            error = %error,
            "failed to listen for ctrl-c; shutting down"
        );
        return;
    }
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "tally-server stopping"
    );
}
