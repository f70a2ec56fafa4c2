// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for kloud-master integration tests.
//!
//! Provides TestContext wiring an orchestrator to the mock container runtime
//! and the in-memory store, with working directories in a temp dir.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use kloud_core::{
    BuildSettings, Channel, CloudEvent, DynamicTemplate, InMemoryStore, ServerInstance,
    ServerKind, ServerState, StateStore, Template,
};
use kloud_master::orchestrator::ServerOrchestrator;
use kloud_master::runner::{LauncherConfig, MockRuntime, PortAllocator, ServerLauncher, Workspace};
use kloud_master::template_registry::{TemplateRegistry, default_images};

/// Reconciler interval long enough that it never fires during a test.
pub const IDLE_RECONCILE: Duration = Duration::from_secs(3600);

/// Orchestrator over mock backends.
pub struct TestContext {
    pub orchestrator: Arc<ServerOrchestrator>,
    pub runtime: Arc<MockRuntime>,
    pub store: Arc<InMemoryStore>,
    pub templates_dir: PathBuf,
    pub running_dir: PathBuf,
    _temp_dir: tempfile::TempDir,
}

impl TestContext {
    /// Create a context serving the given templates.
    pub fn new(templates: Vec<Template>) -> Self {
        Self::with_runtime(templates, MockRuntime::new())
    }

    /// Create a context with a preconfigured mock runtime.
    pub fn with_runtime(templates: Vec<Template>, runtime: MockRuntime) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let templates_dir = temp_dir.path().join("templates");
        let running_dir = temp_dir.path().join("running");

        let registry = Arc::new(
            TemplateRegistry::from_parts(templates, default_images())
                .expect("Invalid test registry"),
        );
        let runtime = Arc::new(runtime);
        let store = Arc::new(InMemoryStore::new());

        let launcher = Arc::new(ServerLauncher::new(
            runtime.clone(),
            registry.clone(),
            PortAllocator::with_probe(30000, 200, Arc::new(|_| true)),
            Workspace::new(&templates_dir, &running_dir),
            LauncherConfig::default(),
        ));

        let orchestrator = Arc::new(ServerOrchestrator::new(
            registry,
            launcher,
            store.clone(),
            store.clone(),
            IDLE_RECONCILE,
        ));

        Self {
            orchestrator,
            runtime,
            store,
            templates_dir,
            running_dir,
            _temp_dir: temp_dir,
        }
    }

    /// Template by name from the registry.
    pub fn template(&self, name: &str) -> Template {
        self.orchestrator
            .registry()
            .get_template(name)
            .cloned()
            .expect("Unknown template")
    }

    /// Records currently in the store, sorted by server name.
    pub async fn records(&self) -> Vec<ServerInstance> {
        let mut records = self.store.get_all().await.expect("store read failed");
        records.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        records
    }

    /// States published for one instance, in order.
    pub async fn states_of(&self, internal_id: &str) -> Vec<ServerState> {
        self.store
            .published()
            .await
            .into_iter()
            .filter_map(|(channel, event)| match event {
                CloudEvent::ServerStateChanged { server, state }
                    if channel == Channel::Servers && server.internal_id == internal_id =>
                {
                    Some(state)
                }
                _ => None,
            })
            .collect()
    }

    /// Wait until the orchestrator announced `state` for an instance.
    pub async fn wait_for_state(&self, internal_id: &str, state: ServerState) -> bool {
        wait_for(Duration::from_secs(5), || async move {
            self.orchestrator.state_of(internal_id).await == Some(state)
        })
        .await
    }

    /// Wait until the record of an instance is gone.
    pub async fn wait_for_removal(&self, internal_id: &str) -> bool {
        wait_for(Duration::from_secs(5), || async move {
            self.orchestrator
                .store()
                .get(internal_id)
                .await
                .map(|r| r.is_none())
                .unwrap_or(false)
        })
        .await
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn wait_for<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Static template on the paper image.
pub fn static_template(name: &str, kind: ServerKind) -> Template {
    Template {
        name: name.to_string(),
        build: BuildSettings {
            image: if kind.is_proxy() { "velocity" } else { "paper" }.to_string(),
            version: None,
        },
        environment: BTreeMap::new(),
        lobby: false,
        kind,
        required_permissions: vec![],
        priority: 0,
        dynamic: None,
        forced_port: None,
    }
}

/// Dynamic proxied template on the paper image.
pub fn dynamic_template(name: &str, min: u32, max: u32) -> Template {
    Template {
        name: name.to_string(),
        build: BuildSettings {
            image: "paper".to_string(),
            version: None,
        },
        environment: BTreeMap::new(),
        lobby: false,
        kind: ServerKind::ProxiedServer,
        required_permissions: vec![],
        priority: 0,
        dynamic: Some(DynamicTemplate {
            min_instances: min,
            max_instances: max,
            extra_directories: vec![],
        }),
        forced_port: None,
    }
}
