use anyhow::{Context, Result};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::app::{self, Runtime};
use crate::cli::ServeArgs;
use crate::config::AppConfig;
use crate::server::{build_router, init_tracing};

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

pub async fn execute_serve(config_path: Option<&Path>, args: ServeArgs) -> Result<()> {
    let mut config = AppConfig::load(config_path)?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    init_tracing(config.server.json_logs || args.json_logs);

    let Runtime {
        fleet,
        escalations,
        janitor,
    } = app::from_config(&config).await?;

    if let Some(rx) = escalations {
        tokio::spawn(fleet.orchestrator.clone().run(rx));
    }
    tokio::spawn(janitor.run(JANITOR_INTERVAL));

    let listener = tokio::net::TcpListener::bind(config.server.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.listen))?;
    info!(addr = %config.server.listen, "fleetwatch listening");

    axum::serve(listener, build_router(fleet))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("fleetwatch stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
