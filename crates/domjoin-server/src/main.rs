// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domjoin Server - HTTP front end for the join orchestrator.

use tracing::{info, warn};

use domjoin_core::{Config, JoinRuntime};
use domjoin_server::{ServerConfig, router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "domjoin_server=info,domjoin_core=info,tower_http=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    let server_config = ServerConfig::from_env()?;

    info!(
        bind_addr = %server_config.bind_addr,
        scripts_dir = %config.scripts_dir.display(),
        state_path = %config.state_path.display(),
        "Starting Domjoin Server"
    );

    let runtime = JoinRuntime::builder().config(config).build()?.start().await?;

    let app = router(runtime.orchestrator().clone());
    let listener = tokio::net::TcpListener::bind(server_config.bind_addr).await?;
    info!(addr = %server_config.bind_addr, "Domjoin server ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    runtime.shutdown().await?;
    info!("Domjoin server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Received shutdown signal");
}
