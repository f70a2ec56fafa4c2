// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker runtime.
//!
//! Talks to the Docker Engine API over the local socket (or `DOCKER_HOST`)
//! through bollard.
//!
//! # Container Shape
//!
//! | Aspect      | Value                                                     |
//! |-------------|-----------------------------------------------------------|
//! | Name        | `kloud-{internal_id}`                                     |
//! | Labels      | `kloud.managed=true`, template, server name, internal ID  |
//! | Ports       | `{host_port}:{internal_port}/tcp`                         |
//! | Mount       | named volume (static) or bind mount (dynamic)             |
//! | Network     | bridge network unless standalone                          |
//! | Auto-remove | always, so a stopped container disappears                 |

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::network::{CreateNetworkOptions, InspectNetworkOptions};
use bollard::volume::CreateVolumeOptions;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::traits::*;

/// Seconds the engine waits for a graceful stop before killing.
const STOP_TIMEOUT_SECS: i64 = 30;

/// Buffered log lines per follower.
const LOG_BUFFER: usize = 1024;

/// Container runtime backed by a Docker Engine.
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect using the platform defaults (`DOCKER_HOST` or the local socket).
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Wrap an existing client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn status_code(err: &DockerError) -> Option<u16> {
    match err {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

/// Split `repo[:tag]` into repository and tag, ignoring registry ports.
fn split_reference(reference: &str) -> (&str, &str) {
    match reference.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (reference, "latest"),
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    fn runtime_type(&self) -> &'static str {
        "docker"
    }

    async fn ping(&self) -> Result<()> {
        self.docker.ping().await?;
        let version = self.docker.version().await?;
        info!(
            version = version.version.as_deref().unwrap_or("unknown"),
            api_version = version.api_version.as_deref().unwrap_or("unknown"),
            "Docker engine reachable"
        );
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        match self
            .docker
            .inspect_network(name, None::<InspectNetworkOptions<String>>)
            .await
        {
            Ok(_) => {
                debug!(network = %name, "Network already exists");
                return Ok(());
            }
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(e.into()),
        }

        self.docker
            .create_network(CreateNetworkOptions {
                name: name.to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await?;
        info!(network = %name, "Created network");
        Ok(())
    }

    async fn ensure_volume(&self, name: &str, host_path: &Path) -> Result<()> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => {
                debug!(volume = %name, "Volume already exists");
                return Ok(());
            }
            Err(e) if status_code(&e) == Some(404) => {}
            Err(e) => return Err(e.into()),
        }

        let driver_opts = HashMap::from([
            ("type".to_string(), "none".to_string()),
            ("o".to_string(), "bind".to_string()),
            ("device".to_string(), host_path.display().to_string()),
        ]);
        let labels = HashMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]);

        self.docker
            .create_volume(CreateVolumeOptions {
                name: name.to_string(),
                driver: "local".to_string(),
                driver_opts,
                labels,
            })
            .await?;
        info!(volume = %name, path = %host_path.display(), "Created volume");
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        let (repo, tag) = split_reference(reference);
        let mut progress = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: repo,
                tag,
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(item) = progress.next().await {
            let info = item?;
            if let Some(error) = info.error {
                return Err(RuntimeError::ImageUnavailable(format!(
                    "{}: {}",
                    reference, error
                )));
            }
        }
        info!(image = %reference, "Pulled image");
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}=true", LABEL_MANAGED)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ManagedContainer {
                    id: c.id?,
                    labels: c.labels.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerStatus>> {
        match self
            .docker
            .inspect_container(container_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => {
                let state = response.state.unwrap_or_default();
                Ok(Some(ContainerStatus {
                    running: state.running.unwrap_or(false),
                    restarting: state.restarting.unwrap_or(false),
                }))
            }
            Err(e) if status_code(&e) == Some(404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let container_port = format!("{}/tcp", spec.internal_port);
        let port_bindings = HashMap::from([(
            container_port.clone(),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: Some(spec.host_port.to_string()),
            }]),
        )]);
        let exposed_ports = HashMap::from([(container_port, HashMap::new())]);

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: Some(vec![spec.mount.to_bind()]),
            network_mode: spec.network.clone(),
            auto_remove: Some(true),
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: spec.name.clone(),
                    platform: None,
                }),
                config,
            )
            .await?;

        for warning in &response.warnings {
            warn!(container = %spec.name, warning = %warning, "Docker create warning");
        }
        debug!(container = %spec.name, container_id = %response.id, "Created container");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                Err(RuntimeError::ContainerNotFound(container_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        match self
            .docker
            .stop_container(
                container_id,
                Some(StopContainerOptions {
                    t: STOP_TIMEOUT_SECS,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) if status_code(&e) == Some(404) => {
                Err(RuntimeError::ContainerNotFound(container_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, container_id: &str, force: bool) -> Result<()> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Gone already, or auto-remove is in progress.
            Err(e) if matches!(status_code(&e), Some(404) | Some(409)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn follow_logs(&self, container_id: &str) -> Result<mpsc::Receiver<String>> {
        let (tx, rx) = mpsc::channel(LOG_BUFFER);
        let docker = self.docker.clone();
        let id = container_id.to_string();
        tokio::spawn(async move {
            let mut stream = docker.logs(
                &id,
                Some(LogsOptions::<String> {
                    follow: true,
                    stdout: true,
                    stderr: true,
                    ..Default::default()
                }),
            );
            let mut pending = String::new();
            while let Some(chunk) = stream.next().await {
                let output = match chunk {
                    Ok(output) => output,
                    Err(e) => {
                        debug!(container_id = %id, error = %e, "Log stream ended with error");
                        break;
                    }
                };
                pending.push_str(&String::from_utf8_lossy(&output.into_bytes()));
                while let Some(pos) = pending.find('\n') {
                    let line: String = pending.drain(..=pos).collect();
                    let line = line.trim_end_matches(['\r', '\n']).to_string();
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
            if !pending.is_empty() {
                let _ = tx.send(pending).await;
            }
        });

        Ok(rx)
    }
}
