// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime trait definitions.
//!
//! Defines the abstract interface over the container engine.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Label marking containers created by this orchestrator.
pub const LABEL_MANAGED: &str = "kloud.managed";
/// Label holding the template name.
pub const LABEL_TEMPLATE: &str = "kloud.template";
/// Label holding the routing name.
pub const LABEL_SERVER_NAME: &str = "kloud.server-name";
/// Label holding the internal ID.
pub const LABEL_INTERNAL_ID: &str = "kloud.internal-id";

/// Errors from container runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum RuntimeError {
    /// The Docker Engine API returned an error.
    #[error("Docker error: {0}")]
    Docker(#[from] bollard::errors::Error),

    /// Container does not exist.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Image could not be pulled at startup.
    #[error("Image unavailable: {0}")]
    ImageUnavailable(String),

    /// Every port in the allocation window is taken.
    #[error("No free port within {window} of {base}")]
    NoPortAvailable {
        /// Centre of the window.
        base: u16,
        /// Ports probed on each side.
        window: u16,
    },

    /// A forced port is already claimed by another instance.
    #[error("Port already in use: {0}")]
    PortInUse(u16),

    /// Preparing or removing a working directory failed.
    #[error("Workspace error: {0}")]
    Workspace(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Storage mounted at the server's data path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mount {
    /// Named persistent volume.
    Volume {
        /// Volume name.
        name: String,
        /// Path inside the container.
        target: String,
    },
    /// Host directory.
    Bind {
        /// Absolute host path.
        source: PathBuf,
        /// Path inside the container.
        target: String,
    },
}

impl Mount {
    /// Docker `binds` entry for this mount.
    pub fn to_bind(&self) -> String {
        match self {
            Mount::Volume { name, target } => format!("{}:{}", name, target),
            Mount::Bind { source, target } => format!("{}:{}", source.display(), target),
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name
    pub name: String,
    /// Full `repository:tag` reference
    pub image: String,
    /// Environment as `KEY=VALUE` entries
    pub env: Vec<String>,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Port the server listens on inside the container
    pub internal_port: u16,
    /// Host port mapped to `internal_port`
    pub host_port: u16,
    /// Data mount
    pub mount: Mount,
    /// Network to join, `None` for the default bridge
    pub network: Option<String>,
}

/// Observed container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerStatus {
    /// Container process is running.
    pub running: bool,
    /// Container is being restarted by the engine.
    pub restarting: bool,
}

impl ContainerStatus {
    /// Whether the container counts as alive.
    pub fn is_alive(&self) -> bool {
        self.running || self.restarting
    }
}

/// A container carrying the managed label.
#[derive(Debug, Clone)]
pub struct ManagedContainer {
    /// Container ID
    pub id: String,
    /// Container labels
    pub labels: HashMap<String, String>,
}

impl ManagedContainer {
    /// Internal ID label, if present.
    pub fn internal_id(&self) -> Option<&str> {
        self.labels.get(LABEL_INTERNAL_ID).map(String::as_str)
    }
}

/// Trait for container runtimes.
///
/// Runtimes are pure infrastructure: they do NOT touch the state store and
/// apply no orchestration policy. Errors are returned to the caller without
/// retrying.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime type identifier (e.g., "docker", "mock")
    fn runtime_type(&self) -> &'static str;

    /// Check that the engine is reachable.
    async fn ping(&self) -> Result<()>;

    /// Create the bridge network if it does not exist.
    async fn ensure_network(&self, name: &str) -> Result<()>;

    /// Create a named volume backed by `host_path` if it does not exist.
    async fn ensure_volume(&self, name: &str, host_path: &std::path::Path) -> Result<()>;

    /// Pull an image reference.
    async fn pull_image(&self, reference: &str) -> Result<()>;

    /// All containers carrying the managed label, running or not.
    async fn list_managed(&self) -> Result<Vec<ManagedContainer>>;

    /// Status of a container, `None` if it does not exist.
    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerStatus>>;

    /// Create a container. Returns the container ID.
    async fn create(&self, spec: &ContainerSpec) -> Result<String>;

    /// Start a created container.
    async fn start(&self, container_id: &str) -> Result<()>;

    /// Stop a running container.
    async fn stop(&self, container_id: &str) -> Result<()>;

    /// Remove a container. Removing a missing container succeeds.
    async fn remove(&self, container_id: &str, force: bool) -> Result<()>;

    /// Follow the container's combined output, one line per message.
    ///
    /// The channel closes when the container exits.
    async fn follow_logs(&self, container_id: &str) -> Result<mpsc::Receiver<String>>;
}
