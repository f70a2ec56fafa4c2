// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server launcher.
//!
//! Turns a template into a running container: allocates the host port,
//! prepares storage, composes the environment, creates and starts the
//! container and watches its output for the readiness line. It applies no
//! orchestration policy and never touches the state store.
//!
//! # Environment Layering
//!
//! Later layers win:
//!
//! 1. Built-in defaults (`EULA=TRUE`, `ENABLE_RCON=false`)
//! 2. Image environment
//! 3. Template environment
//! 4. `ONLINE_MODE=FALSE` for proxied servers
//! 5. Operational variables (`KLOUD_*`); overriding a configured value is logged

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use kloud_core::template::DEFAULT_STARTED_PATTERN;
use kloud_core::{Image, ServerInstance, ServerKind, Template};
use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::ports::PortAllocator;
use super::traits::*;
use super::workspace::Workspace;
use crate::template_registry::{TemplateRegistry, references_by_image};

/// Settings injected into every container.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Bridge network non-standalone containers join.
    pub network: String,
    /// Redis host as seen by this process.
    pub redis_host: String,
    /// Redis port.
    pub redis_port: u16,
    /// API port announced to servers.
    pub api_port: u16,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            network: "kcloud_network".to_string(),
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            api_port: 8080,
        }
    }
}

/// What to launch.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    /// Orchestrator-assigned ID.
    pub internal_id: &'a str,
    /// Routing name.
    pub server_name: &'a str,
    /// Template snapshot.
    pub template: &'a Template,
}

/// A created, not yet started, container.
#[derive(Debug, Clone)]
pub struct LaunchedServer {
    /// Runtime-assigned container ID.
    pub container_id: String,
    /// Host port bound to the server.
    pub port: u16,
    /// When the container was created.
    pub created_at: DateTime<Utc>,
}

/// Completes once the server printed its readiness line.
pub struct Readiness {
    rx: oneshot::Receiver<()>,
}

impl Readiness {
    /// Wait for readiness. Returns `false` if the log stream ended first.
    pub async fn wait(self) -> bool {
        self.rx.await.is_ok()
    }
}

/// Launches and tears down server containers.
pub struct ServerLauncher {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<TemplateRegistry>,
    ports: PortAllocator,
    workspace: Workspace,
    config: LauncherConfig,
    unavailable_images: RwLock<HashSet<String>>,
}

impl ServerLauncher {
    /// Create a new launcher.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<TemplateRegistry>,
        ports: PortAllocator,
        workspace: Workspace,
        config: LauncherConfig,
    ) -> Self {
        Self {
            runtime,
            registry,
            ports,
            workspace,
            config,
            unavailable_images: RwLock::new(HashSet::new()),
        }
    }

    /// Underlying container runtime.
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Port allocator.
    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Working directory manager.
    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Create the network and static volumes, then pull every image reference.
    ///
    /// Pull failures are logged and mark the reference unavailable; they do not
    /// fail preparation.
    pub async fn prepare(&self) -> Result<()> {
        self.runtime.ensure_network(&self.config.network).await?;

        for template in self.registry.static_templates() {
            let path = self.workspace.absolute_template_dir(&template.name)?;
            tokio::fs::create_dir_all(&path).await?;
            self.runtime
                .ensure_volume(&volume_name(&template.name), &path)
                .await?;
        }

        for (image, references) in references_by_image(&self.registry) {
            for reference in references {
                if let Err(e) = self.runtime.pull_image(&reference).await {
                    warn!(image = %image, reference = %reference, error = %e, "Failed to pull image");
                    self.unavailable_images
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(reference);
                }
            }
        }

        Ok(())
    }

    fn is_unavailable(&self, reference: &str) -> bool {
        self.unavailable_images
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(reference)
    }

    /// Create the container for a request. Nothing is started yet.
    ///
    /// On failure every resource claimed on the way is released again.
    pub async fn launch(&self, request: &LaunchRequest<'_>) -> Result<LaunchedServer> {
        let template = request.template;
        let image = self
            .registry
            .resolve_image(template)
            .map_err(|_| RuntimeError::ImageUnavailable(template.build.image.clone()))?;

        let reference = template.image_reference(image);
        if self.is_unavailable(&reference) {
            return Err(RuntimeError::ImageUnavailable(reference));
        }

        let port = match template.forced_port.filter(|_| template.is_static()) {
            Some(forced) => self.ports.claim(forced)?,
            None => self.ports.allocate()?,
        };

        match self.create_container(request, image, reference, port).await {
            Ok(container_id) => {
                info!(
                    instance_id = %request.internal_id,
                    server_name = %request.server_name,
                    container_id = %container_id,
                    port,
                    "Container created"
                );
                Ok(LaunchedServer {
                    container_id,
                    port,
                    created_at: Utc::now(),
                })
            }
            Err(e) => {
                self.ports.release(port);
                if template.is_dynamic()
                    && let Err(cleanup) = self.workspace.remove(request.internal_id).await
                {
                    warn!(instance_id = %request.internal_id, error = %cleanup, "Failed to remove working directory");
                }
                Err(e)
            }
        }
    }

    async fn create_container(
        &self,
        request: &LaunchRequest<'_>,
        image: &Image,
        reference: String,
        port: u16,
    ) -> Result<String> {
        let template = request.template;
        let target = data_path(template.kind).to_string();

        let mount = if template.is_static() {
            Mount::Volume {
                name: volume_name(&template.name),
                target,
            }
        } else {
            let source = self
                .workspace
                .materialize(
                    request.internal_id,
                    &image.name,
                    &template.name,
                    template.extra_directories(),
                )
                .await?;
            Mount::Bind { source, target }
        };

        let operational = self.operational_environment(request, port);
        let env = compose_environment(image, template, &operational);

        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_TEMPLATE.to_string(), template.name.clone()),
            (LABEL_SERVER_NAME.to_string(), request.server_name.to_string()),
            (LABEL_INTERNAL_ID.to_string(), request.internal_id.to_string()),
        ]);

        let network = (template.kind != ServerKind::StandaloneServer)
            .then(|| self.config.network.clone());

        let spec = ContainerSpec {
            name: format!("kloud-{}", request.internal_id),
            image: reference,
            env: env.into_iter().map(|(k, v)| format!("{}={}", k, v)).collect(),
            labels,
            internal_port: image.default_internal_port,
            host_port: port,
            mount,
            network,
        };

        self.runtime.create(&spec).await
    }

    fn operational_environment(
        &self,
        request: &LaunchRequest<'_>,
        port: u16,
    ) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("KLOUD_ID".to_string(), request.internal_id.to_string()),
            ("KLOUD_TEMPLATE".to_string(), request.template.name.clone()),
            (
                "KLOUD_SERVER_NAME".to_string(),
                request.server_name.to_string(),
            ),
            ("KLOUD_SERVER_PORT".to_string(), port.to_string()),
            (
                "KLOUD_REDIS_HOST".to_string(),
                container_redis_host(&self.config.redis_host),
            ),
            (
                "KLOUD_REDIS_PORT".to_string(),
                self.config.redis_port.to_string(),
            ),
            ("KLOUD_API_PORT".to_string(), self.config.api_port.to_string()),
        ])
    }

    /// Start a created container and watch its output for readiness.
    pub async fn start_and_watch(&self, server: &ServerInstance) -> Result<Readiness> {
        let pattern = self
            .registry
            .get_image(&server.template.build.image)
            .map(|image| image.started_message_pattern.as_str())
            .unwrap_or(DEFAULT_STARTED_PATTERN);
        let pattern = Regex::new(pattern)
            .map_err(|e| RuntimeError::Other(format!("invalid readiness pattern: {}", e)))?;

        self.runtime.start(&server.container_id).await?;
        let logs = self.runtime.follow_logs(&server.container_id).await?;
        debug!(instance_id = %server.internal_id, "Container started, watching for readiness");

        let (tx, rx) = oneshot::channel();
        tokio::spawn(watch_for_ready(logs, pattern, tx));
        Ok(Readiness { rx })
    }

    /// Stop a container. A container that is already gone counts as stopped.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        match self.runtime.stop(container_id).await {
            Ok(()) | Err(RuntimeError::ContainerNotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Release the port and working directory of an instance.
    pub async fn teardown(&self, server: &ServerInstance) {
        self.ports.release(server.connection_port);
        if server.is_dynamic()
            && let Err(e) = self.workspace.remove(&server.internal_id).await
        {
            warn!(instance_id = %server.internal_id, error = %e, "Failed to remove working directory");
        }
    }

    /// Create a container in the background, then run `then` with the outcome.
    pub fn launch_in_background<F, Fut>(
        self: &Arc<Self>,
        internal_id: String,
        server_name: String,
        template: Template,
        then: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<LaunchedServer>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            let request = LaunchRequest {
                internal_id: &internal_id,
                server_name: &server_name,
                template: &template,
            };
            let result = launcher.launch(&request).await;
            then(result).await;
        })
    }

    /// Start a container in the background, then run `then` with the outcome.
    pub fn start_in_background<F, Fut>(
        self: &Arc<Self>,
        server: ServerInstance,
        then: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(ServerInstance, Result<Readiness>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            let result = launcher.start_and_watch(&server).await;
            then(server, result).await;
        })
    }

    /// Stop a container in the background, then run `then` with the outcome.
    pub fn stop_in_background<F, Fut>(self: &Arc<Self>, container_id: String, then: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            let result = launcher.stop(&container_id).await;
            then(result).await;
        })
    }

    /// Force-remove a container in the background, then run `then` with the outcome.
    pub fn remove_in_background<F, Fut>(
        self: &Arc<Self>,
        container_id: String,
        then: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<()>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let launcher = Arc::clone(self);
        tokio::spawn(async move {
            let result = launcher.runtime.remove(&container_id, true).await;
            then(result).await;
        })
    }
}

/// Name of a static template's persistent volume.
pub fn volume_name(template: &str) -> String {
    format!("kloud-{}", template)
}

/// Data path inside the container.
pub fn data_path(kind: ServerKind) -> &'static str {
    match kind {
        ServerKind::Proxy => "/server",
        ServerKind::ProxiedServer | ServerKind::StandaloneServer => "/data",
    }
}

/// Containers reach a Redis on the host loopback through the Docker host alias.
fn container_redis_host(host: &str) -> String {
    match host {
        "localhost" | "127.0.0.1" => "host.docker.internal".to_string(),
        other => other.to_string(),
    }
}

/// Merge the environment layers for a container.
pub fn compose_environment(
    image: &Image,
    template: &Template,
    operational: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::from([
        ("EULA".to_string(), "TRUE".to_string()),
        ("ENABLE_RCON".to_string(), "false".to_string()),
    ]);
    env.extend(image.environment.clone());
    env.extend(template.environment.clone());

    if template.kind == ServerKind::ProxiedServer {
        env.insert("ONLINE_MODE".to_string(), "FALSE".to_string());
    }

    for (key, value) in operational {
        if let Some(previous) = env.get(key)
            && previous != value
        {
            warn!(
                template = %template.name,
                key = %key,
                configured = %previous,
                "Operational variable overrides configured value"
            );
        }
        env.insert(key.clone(), value.clone());
    }

    env
}

/// Whether a log line signals readiness.
///
/// Lines are tried as a whole and with a leading `[time level]: ` prefix
/// stripped, so anchored patterns match prefixed server output.
pub fn is_ready_line(pattern: &Regex, line: &str) -> bool {
    let line = line.trim_end();
    pattern.is_match(line)
        || line
            .split_once("]: ")
            .is_some_and(|(_, message)| pattern.is_match(message))
}

async fn watch_for_ready(mut logs: mpsc::Receiver<String>, pattern: Regex, tx: oneshot::Sender<()>) {
    while let Some(line) = logs.recv().await {
        if is_ready_line(&pattern, &line) {
            let _ = tx.send(());
            return;
        }
    }
}
