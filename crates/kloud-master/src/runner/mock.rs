// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock runtime for testing.
//!
//! Simulates a container engine in memory. Containers behave like
//! auto-removed Docker containers: stopping or killing one makes it vanish.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify, mpsc};

use super::traits::*;

/// Log line a Paper server prints once it accepts players.
pub const READY_LINE: &str = r#"[21:16:26 INFO]: Done (19.342s)! For help, type "help""#;

/// Mock container state.
#[derive(Debug, Clone)]
struct MockContainer {
    spec: Option<ContainerSpec>,
    labels: HashMap<String, String>,
    running: bool,
}

/// Mock runtime for testing.
pub struct MockRuntime {
    containers: Arc<Mutex<HashMap<String, MockContainer>>>,
    operations: Arc<Mutex<Vec<String>>>,
    networks: Arc<Mutex<HashSet<String>>>,
    volumes: Arc<Mutex<HashSet<String>>>,
    unpullable: Arc<Mutex<HashSet<String>>>,
    next_id: AtomicU64,
    /// When set, every `stop` waits for a permit before acting.
    stop_gate: Mutex<Option<Arc<Notify>>>,
    /// If true, `create` fails.
    fail_create: AtomicBool,
    /// If true, `start` fails.
    fail_start: AtomicBool,
    /// If true, started containers print [`READY_LINE`].
    emit_ready: AtomicBool,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    /// Create a mock runtime whose containers become ready right away.
    pub fn new() -> Self {
        Self {
            containers: Arc::new(Mutex::new(HashMap::new())),
            operations: Arc::new(Mutex::new(Vec::new())),
            networks: Arc::new(Mutex::new(HashSet::new())),
            volumes: Arc::new(Mutex::new(HashSet::new())),
            unpullable: Arc::new(Mutex::new(HashSet::new())),
            next_id: AtomicU64::new(1),
            stop_gate: Mutex::new(None),
            fail_create: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            emit_ready: AtomicBool::new(true),
        }
    }

    /// Create a mock runtime where every `create` fails.
    pub fn failing() -> Self {
        let runtime = Self::new();
        runtime.fail_create.store(true, Ordering::SeqCst);
        runtime
    }

    /// Toggle `create` failures.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    /// Toggle `start` failures.
    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// Toggle whether started containers print the readiness line.
    pub fn set_emit_ready(&self, emit: bool) {
        self.emit_ready.store(emit, Ordering::SeqCst);
    }

    /// Hold every subsequent `stop` until the returned handle is notified.
    pub async fn hold_stops(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.stop_gate.lock().await = Some(Arc::clone(&gate));
        gate
    }

    /// Make pulls of `reference` fail.
    pub async fn refuse_pull(&self, reference: &str) {
        self.unpullable.lock().await.insert(reference.to_string());
    }

    /// Simulate a container dying outside the orchestrator's control.
    pub async fn kill(&self, container_id: &str) -> bool {
        self.containers.lock().await.remove(container_id).is_some()
    }

    /// Mark a container as exited without removing it.
    pub async fn exit(&self, container_id: &str) {
        if let Some(container) = self.containers.lock().await.get_mut(container_id) {
            container.running = false;
        }
    }

    /// Add a running managed container that this runtime did not create.
    pub async fn insert_managed(&self, container_id: &str, internal_id: &str) {
        let labels = HashMap::from([
            (LABEL_MANAGED.to_string(), "true".to_string()),
            (LABEL_INTERNAL_ID.to_string(), internal_id.to_string()),
        ]);
        self.containers.lock().await.insert(
            container_id.to_string(),
            MockContainer {
                spec: None,
                labels,
                running: true,
            },
        );
    }

    /// IDs of existing containers.
    pub async fn container_ids(&self) -> Vec<String> {
        self.containers.lock().await.keys().cloned().collect()
    }

    /// Number of running containers.
    pub async fn running_count(&self) -> usize {
        self.containers
            .lock()
            .await
            .values()
            .filter(|c| c.running)
            .count()
    }

    /// The [`ContainerSpec`] a container was created with.
    pub async fn spec(&self, container_id: &str) -> Option<ContainerSpec> {
        self.containers
            .lock()
            .await
            .get(container_id)
            .and_then(|c| c.spec.clone())
    }

    /// Mutating operations performed so far, as `op:target`.
    pub async fn operations(&self) -> Vec<String> {
        self.operations.lock().await.clone()
    }

    /// Networks created so far.
    pub async fn networks(&self) -> Vec<String> {
        self.networks.lock().await.iter().cloned().collect()
    }

    /// Volumes created so far.
    pub async fn volumes(&self) -> Vec<String> {
        self.volumes.lock().await.iter().cloned().collect()
    }

    async fn record(&self, op: &str, target: &str) {
        self.operations.lock().await.push(format!("{}:{}", op, target));
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn runtime_type(&self) -> &'static str {
        "mock"
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn ensure_network(&self, name: &str) -> Result<()> {
        self.networks.lock().await.insert(name.to_string());
        Ok(())
    }

    async fn ensure_volume(&self, name: &str, _host_path: &Path) -> Result<()> {
        self.volumes.lock().await.insert(name.to_string());
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> Result<()> {
        if self.unpullable.lock().await.contains(reference) {
            return Err(RuntimeError::ImageUnavailable(reference.to_string()));
        }
        Ok(())
    }

    async fn list_managed(&self) -> Result<Vec<ManagedContainer>> {
        Ok(self
            .containers
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.labels.get(LABEL_MANAGED).is_some_and(|v| v == "true"))
            .map(|(id, c)| ManagedContainer {
                id: id.clone(),
                labels: c.labels.clone(),
            })
            .collect())
    }

    async fn inspect(&self, container_id: &str) -> Result<Option<ContainerStatus>> {
        Ok(self
            .containers
            .lock()
            .await
            .get(container_id)
            .map(|c| ContainerStatus {
                running: c.running,
                restarting: false,
            }))
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String> {
        self.record("create", &spec.name).await;
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("Mock create failure".to_string()));
        }

        let id = format!("mock_{:04}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.containers.lock().await.insert(
            id.clone(),
            MockContainer {
                spec: Some(spec.clone()),
                labels: spec.labels.clone(),
                running: false,
            },
        );
        Ok(id)
    }

    async fn start(&self, container_id: &str) -> Result<()> {
        self.record("start", container_id).await;
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(RuntimeError::Other("Mock start failure".to_string()));
        }

        let mut containers = self.containers.lock().await;
        let container = containers
            .get_mut(container_id)
            .ok_or_else(|| RuntimeError::ContainerNotFound(container_id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn stop(&self, container_id: &str) -> Result<()> {
        let gate = self.stop_gate.lock().await.clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.record("stop", container_id).await;
        // Auto-remove: a stopped container disappears.
        match self.containers.lock().await.remove(container_id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::ContainerNotFound(container_id.to_string())),
        }
    }

    async fn remove(&self, container_id: &str, _force: bool) -> Result<()> {
        self.record("remove", container_id).await;
        self.containers.lock().await.remove(container_id);
        Ok(())
    }

    async fn follow_logs(&self, container_id: &str) -> Result<mpsc::Receiver<String>> {
        if !self.containers.lock().await.contains_key(container_id) {
            return Err(RuntimeError::ContainerNotFound(container_id.to_string()));
        }

        let (tx, rx) = mpsc::channel(16);
        let _ = tx
            .send("[21:16:07 INFO]: Starting minecraft server version 1.21".to_string())
            .await;
        if self.emit_ready.load(Ordering::SeqCst) {
            let _ = tx.send(READY_LINE.to_string()).await;
            // The server keeps logging after it is ready.
            let _ = tx.send(READY_LINE.to_string()).await;
            drop(tx);
        } else {
            // Keep the stream open without ever becoming ready.
            tokio::spawn(async move {
                tx.closed().await;
            });
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.to_string(),
            image: "itzg/minecraft-server:latest".to_string(),
            env: vec!["EULA=TRUE".to_string()],
            labels: HashMap::from([(LABEL_MANAGED.to_string(), "true".to_string())]),
            internal_port: 25565,
            host_port: 25566,
            mount: Mount::Volume {
                name: "kloud-survival".to_string(),
                target: "/data".to_string(),
            },
            network: Some("kcloud_network".to_string()),
        }
    }

    #[tokio::test]
    async fn test_container_lifecycle() {
        let runtime = MockRuntime::new();
        let id = runtime.create(&spec("kloud-a")).await.unwrap();

        let status = runtime.inspect(&id).await.unwrap().unwrap();
        assert!(!status.is_alive());

        runtime.start(&id).await.unwrap();
        assert!(runtime.inspect(&id).await.unwrap().unwrap().running);
        assert_eq!(runtime.list_managed().await.unwrap().len(), 1);

        runtime.stop(&id).await.unwrap();
        assert!(runtime.inspect(&id).await.unwrap().is_none());
        assert!(matches!(
            runtime.stop(&id).await,
            Err(RuntimeError::ContainerNotFound(_))
        ));
        runtime.remove(&id, true).await.unwrap();

        assert_eq!(
            runtime.operations().await,
            [
                "create:kloud-a".to_string(),
                format!("start:{}", id),
                format!("stop:{}", id),
                format!("stop:{}", id),
                format!("remove:{}", id),
            ]
        );
    }

    #[tokio::test]
    async fn test_failing_create() {
        let runtime = MockRuntime::failing();
        assert!(runtime.create(&spec("kloud-a")).await.is_err());
        assert!(runtime.container_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_logs_emit_ready_line() {
        let runtime = MockRuntime::new();
        let id = runtime.create(&spec("kloud-a")).await.unwrap();
        let mut logs = runtime.follow_logs(&id).await.unwrap();

        let mut lines = Vec::new();
        while let Some(line) = logs.recv().await {
            lines.push(line);
        }
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], READY_LINE);
    }

    #[tokio::test]
    async fn test_refused_pull() {
        let runtime = MockRuntime::new();
        runtime.refuse_pull("itzg/mc-proxy:latest").await;
        assert!(matches!(
            runtime.pull_image("itzg/mc-proxy:latest").await,
            Err(RuntimeError::ImageUnavailable(_))
        ));
        runtime.pull_image("itzg/minecraft-server:latest").await.unwrap();
    }
}
