// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for kloud-master.
//!
//! [`KloudRuntime`] wires the registry, container runtime, launcher, state
//! store, event bus and orchestrator together and owns the background tasks.
//! The binary uses it, and tests embed it with mock backends.
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use kloud_core::RedisStore;
//! use kloud_master::runner::DockerRuntime;
//! use kloud_master::runtime::KloudRuntime;
//! use kloud_master::template_registry::TemplateRegistry;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = TemplateRegistry::load("templates.json", "images.json", "templates").await?;
//!     let store = Arc::new(RedisStore::connect("redis://localhost:6379").await?);
//!
//!     let runtime = KloudRuntime::builder()
//!         .registry(registry)
//!         .container_runtime(Arc::new(DockerRuntime::connect()?))
//!         .store(store.clone())
//!         .bus(store)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... serve requests through runtime.state() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use kloud_core::{EventBus, StateStore};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::event_listener::EventListener;
use crate::handlers::KloudHandlerState;
use crate::orchestrator::ServerOrchestrator;
use crate::runner::{
    ContainerRuntime, LauncherConfig, PortAllocator, PortProbe, ServerLauncher, Workspace,
};
use crate::template_registry::TemplateRegistry;

/// Builder for creating a [`KloudRuntime`].
pub struct KloudRuntimeBuilder {
    registry: Option<TemplateRegistry>,
    container_runtime: Option<Arc<dyn ContainerRuntime>>,
    store: Option<Arc<dyn StateStore>>,
    bus: Option<Arc<dyn EventBus>>,
    templates_dir: PathBuf,
    running_dir: PathBuf,
    launcher: LauncherConfig,
    port_base: u16,
    port_window: u16,
    port_probe: Option<PortProbe>,
    reconcile_interval: Duration,
}

impl Default for KloudRuntimeBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            container_runtime: None,
            store: None,
            bus: None,
            templates_dir: PathBuf::from("templates"),
            running_dir: PathBuf::from("running"),
            launcher: LauncherConfig::default(),
            port_base: 25565,
            port_window: 100,
            port_probe: None,
            reconcile_interval: Duration::from_secs(10),
        }
    }
}

impl KloudRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the settings from a loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.templates_dir = config.templates_dir.clone();
        self.running_dir = config.running_dir.clone();
        self.launcher = LauncherConfig {
            network: config.network.clone(),
            redis_host: config.redis_host.clone(),
            redis_port: config.redis_port,
            api_port: config.api_port,
        };
        self.port_base = config.port_base;
        self.port_window = config.port_window;
        self.reconcile_interval = config.reconcile_interval;
        self
    }

    /// Set the template registry (required).
    pub fn registry(mut self, registry: TemplateRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Set the container runtime (required).
    pub fn container_runtime(mut self, runtime: Arc<dyn ContainerRuntime>) -> Self {
        self.container_runtime = Some(runtime);
        self
    }

    /// Set the state store (required).
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the event bus (required).
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    /// Set the root of template trees and static volumes.
    ///
    /// Default: `templates`
    pub fn templates_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.templates_dir = path.into();
        self
    }

    /// Set the root of per-instance working directories.
    ///
    /// Default: `running`
    pub fn running_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.running_dir = path.into();
        self
    }

    /// Set the settings injected into containers.
    pub fn launcher_config(mut self, config: LauncherConfig) -> Self {
        self.launcher = config;
        self
    }

    /// Set the host port window.
    ///
    /// Default: 25565 ± 100
    pub fn ports(mut self, base: u16, window: u16) -> Self {
        self.port_base = base;
        self.port_window = window;
        self
    }

    /// Replace the host port availability check.
    pub fn port_probe(mut self, probe: PortProbe) -> Self {
        self.port_probe = Some(probe);
        self
    }

    /// Set the reconciliation interval.
    ///
    /// Default: 10 seconds
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<KloudRuntimeConfig> {
        let registry = self
            .registry
            .ok_or_else(|| anyhow::anyhow!("registry is required"))?;
        let container_runtime = self
            .container_runtime
            .ok_or_else(|| anyhow::anyhow!("container_runtime is required"))?;
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("store is required"))?;
        let bus = self.bus.ok_or_else(|| anyhow::anyhow!("bus is required"))?;

        if self.reconcile_interval.is_zero() {
            anyhow::bail!("reconcile_interval must be positive");
        }

        let ports = match self.port_probe {
            Some(probe) => PortAllocator::with_probe(self.port_base, self.port_window, probe),
            None => PortAllocator::new(self.port_base, self.port_window),
        };

        Ok(KloudRuntimeConfig {
            registry: Arc::new(registry),
            container_runtime,
            store,
            bus,
            workspace: Workspace::new(self.templates_dir, self.running_dir),
            ports,
            launcher: self.launcher,
            reconcile_interval: self.reconcile_interval,
        })
    }
}

/// Configuration for a [`KloudRuntime`].
pub struct KloudRuntimeConfig {
    registry: Arc<TemplateRegistry>,
    container_runtime: Arc<dyn ContainerRuntime>,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    workspace: Workspace,
    ports: PortAllocator,
    launcher: LauncherConfig,
    reconcile_interval: Duration,
}

impl KloudRuntimeConfig {
    /// Prepare the runtime, run the startup protocol and spawn the event
    /// listener.
    pub async fn start(self) -> Result<KloudRuntime> {
        let launcher = Arc::new(ServerLauncher::new(
            self.container_runtime.clone(),
            self.registry.clone(),
            self.ports,
            self.workspace,
            self.launcher,
        ));
        launcher.prepare().await?;
        info!(
            runtime_type = self.container_runtime.runtime_type(),
            "Container runtime prepared"
        );

        let orchestrator = Arc::new(ServerOrchestrator::new(
            self.registry.clone(),
            launcher,
            self.store.clone(),
            self.bus.clone(),
            self.reconcile_interval,
        ));

        let listener = EventListener::new(orchestrator.clone(), self.bus.clone());
        let listener_shutdown = listener.shutdown_handle();
        let listener_handle = tokio::spawn(async move {
            if let Err(e) = listener.run().await {
                error!(error = %e, "Event listener failed");
            }
        });

        if let Err(e) = orchestrator.startup().await {
            listener_shutdown.notify_one();
            if let Err(join) = listener_handle.await {
                error!("Event listener task panicked: {}", join);
            }
            return Err(e.into());
        }

        let state = Arc::new(KloudHandlerState::new(orchestrator.clone()));

        Ok(KloudRuntime {
            orchestrator,
            state,
            listener_handle,
            listener_shutdown,
        })
    }
}

/// Running orchestrator with its background tasks.
pub struct KloudRuntime {
    orchestrator: Arc<ServerOrchestrator>,
    state: Arc<KloudHandlerState>,
    listener_handle: JoinHandle<()>,
    listener_shutdown: Arc<Notify>,
}

impl KloudRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> KloudRuntimeBuilder {
        KloudRuntimeBuilder::new()
    }

    /// Get the orchestrator.
    pub fn orchestrator(&self) -> &Arc<ServerOrchestrator> {
        &self.orchestrator
    }

    /// Get a reference to the shared handler state.
    pub fn state(&self) -> &Arc<KloudHandlerState> {
        &self.state
    }

    /// Check if the event listener is still running.
    pub fn is_running(&self) -> bool {
        !self.listener_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the reconciler and the event listener, announces shutdown and
    /// stops every recorded instance.
    pub async fn shutdown(self) -> Result<()> {
        info!("KloudRuntime shutting down...");

        self.listener_shutdown.notify_one();
        if let Err(e) = self.listener_handle.await {
            error!("Event listener task panicked: {}", e);
        }

        self.orchestrator.shutdown().await?;

        info!("KloudRuntime shutdown complete");
        Ok(())
    }
}
