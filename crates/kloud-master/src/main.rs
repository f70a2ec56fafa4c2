// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kloud Master - Game Server Orchestrator
//!
//! Runs the orchestrator against a local Docker engine and a Redis instance:
//! - Template and image registry (JSON files, defaults written on first run)
//! - Server lifecycle (create, stop, restart, update)
//! - Dynamic scaling and dead-container sweeps
//! - Lifecycle events on Redis pub/sub

use std::sync::Arc;
use tracing::{info, warn};

use kloud_core::RedisStore;
use kloud_master::config::Config;
use kloud_master::runner::{ContainerRuntime, DockerRuntime};
use kloud_master::runtime::KloudRuntime;
use kloud_master::template_registry::TemplateRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kloud_master=info,kloud_core=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;

    info!(
        redis_url = %config.redis_url,
        templates_file = %config.templates_file.display(),
        images_file = %config.images_file.display(),
        network = %config.network,
        "Starting Kloud Master"
    );

    let registry = TemplateRegistry::load(
        &config.templates_file,
        &config.images_file,
        &config.templates_dir,
    )
    .await?;

    let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
    info!("Connected to Redis");

    let docker = Arc::new(DockerRuntime::connect()?);
    docker.ping().await?;

    let runtime = KloudRuntime::builder()
        .config(&config)
        .registry(registry)
        .container_runtime(docker)
        .store(store.clone())
        .bus(store)
        .build()?
        .start()
        .await?;

    info!("Kloud Master ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    runtime.shutdown().await?;

    info!("Kloud Master shut down");

    Ok(())
}
