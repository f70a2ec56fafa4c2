// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Server orchestrator.
//!
//! Decides when servers are created, restarted and stopped, keeps the state
//! store in line with the container runtime and announces every lifecycle
//! transition on the event bus.
//!
//! # Creation Ledger
//!
//! Admission of new instances is single-writer: the per-template pending
//! counters, the suffixes reserved by in-flight dynamic creations and the set
//! of instances still being launched all live in one [`Ledger`] behind one
//! async mutex. A creation holds the lock while it checks limits and reserves
//! its slot, and again while it commits the record to the store.
//!
//! ```text
//!  create_server ──► admit (lock) ──► launch container ──► commit (lock)
//!                        │                  │ error            │
//!                        │                  ▼                  ▼
//!                        │          roll back pending    save record,
//!                        │          and suffix           emit STARTING
//!                        ▼                                     │
//!              AlreadyExists / LimitReached                    ▼
//!                                                  start + watch logs (task)
//!                                                              │ ready
//!                                                              ▼
//!                                                        emit RUNNING
//! ```
//!
//! # Reconciliation
//!
//! Each pass first sweeps dead instances (record present, container absent or
//! neither running nor restarting) and then tops dynamic templates up to their
//! minimum. Scale-up never stops servers; the maximum is only enforced when a
//! server is created.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use kloud_core::{
    Channel, CloudEvent, EventBus, ServerData, ServerInstance, ServerState, StateStore, Template,
};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::reconciler::{Reconciler, ReconcilerConfig};
use crate::runner::{LaunchRequest, Readiness, Result as RuntimeResult, ServerLauncher};
use crate::template_registry::TemplateRegistry;

/// In-flight creation bookkeeping.
#[derive(Debug, Default)]
struct Ledger {
    /// Creations admitted but not yet committed, per template.
    pending: HashMap<String, usize>,
    /// Suffixes claimed by in-flight dynamic creations, per template.
    reserved: HashMap<String, BTreeSet<u32>>,
    /// Instances created but not yet started.
    launching: HashSet<String>,
}

impl Ledger {
    fn pending(&self, template: &str) -> usize {
        self.pending.get(template).copied().unwrap_or(0)
    }

    fn admit(&mut self, template: &str, suffix: Option<u32>) {
        *self.pending.entry(template.to_string()).or_default() += 1;
        if let Some(n) = suffix {
            self.reserved.entry(template.to_string()).or_default().insert(n);
        }
    }

    /// Undo an admission. Used both on failure and on commit.
    fn settle(&mut self, template: &str, suffix: Option<u32>) {
        if let Some(count) = self.pending.get_mut(template) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.pending.remove(template);
            }
        }
        if let Some(n) = suffix
            && let Some(reserved) = self.reserved.get_mut(template)
        {
            reserved.remove(&n);
            if reserved.is_empty() {
                self.reserved.remove(template);
            }
        }
    }

    /// Lowest positive suffix not used by a live record nor reserved.
    fn next_suffix(&self, template: &str, existing: &[ServerInstance]) -> u32 {
        let mut used: HashSet<u32> = existing.iter().filter_map(|s| s.name_suffix()).collect();
        if let Some(reserved) = self.reserved.get(template) {
            used.extend(reserved.iter().copied());
        }
        (1..).find(|n| !used.contains(n)).unwrap_or(1)
    }
}

/// Number of torn down instances remembered to reject late transitions.
const RETIRED_CAPACITY: usize = 1024;

/// Last announced state per live instance.
///
/// Instances leave the map once `GONE` is announced and move to a bounded
/// set of retired IDs, so the tracker does not grow with churn.
#[derive(Debug, Default)]
struct Lifecycle {
    states: HashMap<String, ServerState>,
    retired: HashSet<String>,
    retired_order: VecDeque<String>,
}

impl Lifecycle {
    fn state_of(&self, internal_id: &str) -> Option<ServerState> {
        match self.states.get(internal_id) {
            Some(state) => Some(*state),
            None if self.retired.contains(internal_id) => Some(ServerState::Gone),
            None => None,
        }
    }

    /// Record a transition. Returns `false` if it would move backwards.
    fn advance(&mut self, internal_id: &str, state: ServerState) -> bool {
        if self.retired.contains(internal_id) {
            return false;
        }
        let allowed = match self.states.get(internal_id) {
            Some(current) => current.can_transition_to(state),
            None => matches!(state, ServerState::Starting | ServerState::Gone),
        };
        if !allowed {
            return false;
        }

        if state.is_terminal() {
            self.states.remove(internal_id);
            self.retire(internal_id);
        } else {
            self.states.insert(internal_id.to_string(), state);
        }
        true
    }

    fn retire(&mut self, internal_id: &str) {
        if !self.retired.insert(internal_id.to_string()) {
            return;
        }
        self.retired_order.push_back(internal_id.to_string());
        while self.retired_order.len() > RETIRED_CAPACITY {
            if let Some(oldest) = self.retired_order.pop_front() {
                self.retired.remove(&oldest);
            }
        }
    }
}

struct ReconcilerHandle {
    shutdown: Arc<Notify>,
    task: JoinHandle<()>,
}

/// Drives the server lifecycle.
pub struct ServerOrchestrator {
    registry: Arc<TemplateRegistry>,
    launcher: Arc<ServerLauncher>,
    store: Arc<dyn StateStore>,
    bus: Arc<dyn EventBus>,
    ledger: Mutex<Ledger>,
    lifecycle: Mutex<Lifecycle>,
    reconciler: Mutex<Option<ReconcilerHandle>>,
    reconcile_interval: Duration,
}

impl ServerOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        registry: Arc<TemplateRegistry>,
        launcher: Arc<ServerLauncher>,
        store: Arc<dyn StateStore>,
        bus: Arc<dyn EventBus>,
        reconcile_interval: Duration,
    ) -> Self {
        Self {
            registry,
            launcher,
            store,
            bus,
            ledger: Mutex::new(Ledger::default()),
            lifecycle: Mutex::new(Lifecycle::default()),
            reconciler: Mutex::new(None),
            reconcile_interval,
        }
    }

    /// Template registry.
    pub fn registry(&self) -> &Arc<TemplateRegistry> {
        &self.registry
    }

    /// Server launcher.
    pub fn launcher(&self) -> &Arc<ServerLauncher> {
        &self.launcher
    }

    /// State store.
    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Creations admitted but not yet committed for a template.
    pub async fn pending(&self, template: &str) -> usize {
        self.ledger.lock().await.pending(template)
    }

    /// Last announced state of an instance.
    ///
    /// Recently torn down instances report `GONE`; older ones are forgotten.
    pub async fn state_of(&self, internal_id: &str) -> Option<ServerState> {
        self.lifecycle.lock().await.state_of(internal_id)
    }

    /// Number of instances whose lifecycle is still tracked.
    pub async fn tracked_instances(&self) -> usize {
        self.lifecycle.lock().await.states.len()
    }

    // ========================================================================
    // Startup / Shutdown
    // ========================================================================

    /// Run the startup protocol.
    ///
    /// Clears in-memory state, removes every managed container and every
    /// record left over from a previous run, restarts the reconciler and
    /// launches one instance per static template.
    pub async fn startup(self: &Arc<Self>) -> Result<()> {
        info!("Orchestrator starting");

        *self.ledger.lock().await = Ledger::default();
        *self.lifecycle.lock().await = Lifecycle::default();
        self.launcher.ports().reset();

        let runtime = self.launcher.runtime();
        let containers = runtime.list_managed().await?;
        for container in &containers {
            debug!(
                container_id = %container.id,
                instance_id = container.internal_id().unwrap_or("unknown"),
                "Removing leftover container"
            );
            if let Err(e) = self.launcher.stop(&container.id).await {
                warn!(container_id = %container.id, error = %e, "Failed to stop leftover container");
            }
            if let Err(e) = runtime.remove(&container.id, true).await {
                warn!(container_id = %container.id, error = %e, "Failed to remove leftover container");
            }
        }

        let records = self.store.get_all().await?;
        for server in &records {
            self.store.remove(&server.internal_id).await?;
            self.publish(
                Channel::Servers,
                &CloudEvent::state_changed(server, ServerState::Gone),
            )
            .await;
        }

        if let Err(e) = self.launcher.workspace().sweep().await {
            warn!(error = %e, "Failed to sweep working directories");
        }

        info!(
            containers = containers.len(),
            records = records.len(),
            "Cleared state from previous run"
        );

        self.start_reconciler().await;

        for template in self.registry.static_templates() {
            if let Err(e) = self.create_server(template, ServerData::default()).await {
                error!(template = %template.name, error = %e, "Failed to create static server");
            }
        }

        self.publish(Channel::Cloud, &CloudEvent::CloudStarted).await;
        info!("Orchestrator started");
        Ok(())
    }

    /// Stop the reconciler, announce shutdown and stop every instance.
    pub async fn shutdown(self: &Arc<Self>) -> Result<()> {
        info!("Orchestrator shutting down");
        self.stop_reconciler().await;
        self.publish(Channel::Cloud, &CloudEvent::CloudStopped).await;

        for server in self.store.get_all().await? {
            self.transition(&server, ServerState::Stopping).await;
            if let Err(e) = self.launcher.stop(&server.container_id).await {
                warn!(instance_id = %server.internal_id, error = %e, "Failed to stop container");
            }
            self.finish_teardown(&server).await;
        }

        info!("Orchestrator stopped");
        Ok(())
    }

    async fn start_reconciler(self: &Arc<Self>) {
        self.stop_reconciler().await;

        let reconciler = Reconciler::new(
            Arc::downgrade(self),
            ReconcilerConfig {
                interval: self.reconcile_interval,
            },
        );
        let shutdown = reconciler.shutdown_handle();
        let task = tokio::spawn(async move {
            reconciler.run().await;
        });

        *self.reconciler.lock().await = Some(ReconcilerHandle { shutdown, task });
    }

    async fn stop_reconciler(&self) {
        let previous = self.reconciler.lock().await.take();
        if let Some(handle) = previous {
            handle.shutdown.notify_one();
            if let Err(e) = handle.task.await {
                error!("Reconciler task panicked: {}", e);
            }
        }
    }

    // ========================================================================
    // Server Operations
    // ========================================================================

    /// Create a server from a template. Returns the new internal ID.
    ///
    /// Returns once the container exists and the record is stored; starting
    /// and readiness detection continue in the background.
    pub async fn create_server(
        self: &Arc<Self>,
        template: &Template,
        server_data: ServerData,
    ) -> Result<String> {
        let internal_id = Uuid::new_v4().to_string();

        let (server_name, suffix) = {
            let mut ledger = self.ledger.lock().await;
            let existing = self.store.get_by_template(&template.name).await?;
            let pending = ledger.pending(&template.name);

            if template.is_static() {
                if !existing.is_empty() || pending > 0 {
                    return Err(Error::AlreadyExists(template.name.clone()));
                }
                ledger.admit(&template.name, None);
                (template.name.clone(), None)
            } else {
                let max = template.max_instances();
                if existing.len() + pending >= max as usize {
                    return Err(Error::LimitReached {
                        template: template.name.clone(),
                        max,
                    });
                }
                let n = ledger.next_suffix(&template.name, &existing);
                ledger.admit(&template.name, Some(n));
                (format!("{}-{}", template.name, n), Some(n))
            }
        };

        let request = LaunchRequest {
            internal_id: &internal_id,
            server_name: &server_name,
            template,
        };
        let launched = match self.launcher.launch(&request).await {
            Ok(launched) => launched,
            Err(e) => {
                self.ledger.lock().await.settle(&template.name, suffix);
                warn!(template = %template.name, server_name = %server_name, error = %e, "Failed to create server");
                return Err(e.into());
            }
        };

        let server = ServerInstance {
            internal_id: internal_id.clone(),
            container_id: launched.container_id,
            server_name,
            template: template.clone(),
            server_data,
            connection_port: launched.port,
        };

        {
            let mut ledger = self.ledger.lock().await;
            ledger.settle(&template.name, suffix);
            if let Err(e) = self.store.save(&server).await {
                drop(ledger);
                error!(instance_id = %internal_id, error = %e, "Failed to persist server record");
                if let Err(remove) = self
                    .launcher
                    .runtime()
                    .remove(&server.container_id, true)
                    .await
                {
                    warn!(container_id = %server.container_id, error = %remove, "Failed to remove container");
                }
                self.launcher.teardown(&server).await;
                return Err(e.into());
            }
            ledger.launching.insert(internal_id.clone());
        }

        info!(
            instance_id = %internal_id,
            server_name = %server.server_name,
            kind = %server.kind(),
            lobby = server.is_lobby(),
            port = server.connection_port,
            created_at = %launched.created_at,
            "Server created"
        );
        self.transition(&server, ServerState::Starting).await;

        let this = Arc::clone(self);
        self.launcher
            .start_in_background(server, move |server, readiness| async move {
                this.on_started(server, readiness).await;
            });

        Ok(internal_id)
    }

    async fn on_started(&self, server: ServerInstance, readiness: RuntimeResult<Readiness>) {
        self.ledger
            .lock()
            .await
            .launching
            .remove(&server.internal_id);

        match readiness {
            Ok(readiness) => {
                if readiness.wait().await {
                    info!(instance_id = %server.internal_id, server_name = %server.server_name, "Server ready");
                    self.transition(&server, ServerState::Running).await;
                } else {
                    debug!(instance_id = %server.internal_id, "Log stream ended before readiness");
                }
            }
            Err(e) => {
                error!(instance_id = %server.internal_id, error = %e, "Failed to start server");
                self.remove_container_in_background(&server);
                self.finish_teardown(&server).await;
            }
        }
    }

    /// Stop a server. The record is removed once the container stopped.
    pub async fn stop_server(self: &Arc<Self>, internal_id: &str) -> Result<()> {
        let server = self.require(internal_id).await?;
        self.transition(&server, ServerState::Stopping).await;

        let this = Arc::clone(self);
        self.launcher
            .stop_in_background(server.container_id.clone(), move |result| async move {
                if let Err(e) = result {
                    warn!(instance_id = %server.internal_id, error = %e, "Failed to stop container");
                    this.remove_container_in_background(&server);
                }
                this.finish_teardown(&server).await;
            });
        Ok(())
    }

    /// Stop a server and create a fresh one from the same template snapshot
    /// and server data once teardown completed.
    pub async fn restart_server(self: &Arc<Self>, internal_id: &str) -> Result<()> {
        let server = self.require(internal_id).await?;
        self.transition(&server, ServerState::Stopping).await;
        info!(instance_id = %internal_id, server_name = %server.server_name, "Restarting server");

        let this = Arc::clone(self);
        self.launcher
            .stop_in_background(server.container_id.clone(), move |result| async move {
                if let Err(e) = result {
                    warn!(instance_id = %server.internal_id, error = %e, "Failed to stop container");
                    this.remove_container_in_background(&server);
                }
                this.finish_teardown(&server).await;
                match this
                    .create_server(&server.template, server.server_data.clone())
                    .await
                {
                    Ok(new_id) => {
                        info!(old_id = %server.internal_id, new_id = %new_id, "Server restarted")
                    }
                    Err(e) => {
                        error!(instance_id = %server.internal_id, error = %e, "Failed to recreate server")
                    }
                }
            });
        Ok(())
    }

    /// Replace a server's data. No container operation.
    pub async fn update_server(
        &self,
        internal_id: &str,
        server_data: ServerData,
    ) -> Result<ServerInstance> {
        let mut server = self.require(internal_id).await?;
        server.server_data = server_data;
        self.store.save(&server).await?;
        debug!(instance_id = %internal_id, "Server data updated");
        Ok(server)
    }

    async fn require(&self, internal_id: &str) -> Result<ServerInstance> {
        self.store
            .get(internal_id)
            .await?
            .ok_or_else(|| Error::InstanceNotFound(internal_id.to_string()))
    }

    /// Remove the record, release resources and announce `GONE`.
    ///
    /// Only the caller that actually removes the record releases the port and
    /// working directory, so a second teardown of the same instance (a stop
    /// racing the dead-instance sweep) never frees a port that was handed out
    /// again in between. A record that could not be removed is left for the
    /// sweep.
    async fn finish_teardown(&self, server: &ServerInstance) {
        self.ledger
            .lock()
            .await
            .launching
            .remove(&server.internal_id);

        match self.store.remove(&server.internal_id).await {
            Ok(true) => {
                self.launcher.teardown(server).await;
                self.transition(server, ServerState::Gone).await;
            }
            Ok(false) => {
                debug!(instance_id = %server.internal_id, "Server already torn down");
            }
            Err(e) => {
                error!(instance_id = %server.internal_id, error = %e, "Failed to remove server record");
            }
        }
    }

    fn remove_container_in_background(&self, server: &ServerInstance) {
        let container_id = server.container_id.clone();
        self.launcher
            .remove_in_background(server.container_id.clone(), move |result| async move {
                if let Err(e) = result {
                    debug!(container_id = %container_id, error = %e, "Best-effort container removal failed");
                }
            });
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// One reconciliation pass: dead-instance sweep, then scale-up.
    ///
    /// Returns the handles of the creations issued by scale-up.
    pub async fn reconcile_once(
        self: &Arc<Self>,
    ) -> Result<Vec<JoinHandle<Result<String>>>> {
        let removed = self.sweep_dead_instances().await?;
        if removed > 0 {
            info!(removed, "Removed dead servers");
        }
        self.scale_up().await
    }

    /// Remove records whose container is gone or stopped.
    ///
    /// Returns the number of records removed by this call.
    pub async fn sweep_dead_instances(&self) -> Result<usize> {
        let records = self.store.get_all().await?;
        let launching = self.ledger.lock().await.launching.clone();
        let runtime = self.launcher.runtime();
        let mut removed = 0;

        for server in records {
            if launching.contains(&server.internal_id) {
                continue;
            }

            let alive = match runtime.inspect(&server.container_id).await {
                Ok(status) => status.is_some_and(|s| s.is_alive()),
                Err(e) => {
                    warn!(instance_id = %server.internal_id, error = %e, "Failed to inspect container");
                    continue;
                }
            };
            if alive {
                continue;
            }

            if !self.store.remove(&server.internal_id).await? {
                continue;
            }

            info!(
                instance_id = %server.internal_id,
                server_name = %server.server_name,
                "Server container is gone"
            );
            self.launcher.teardown(&server).await;
            self.transition(&server, ServerState::Gone).await;
            self.remove_container_in_background(&server);
            removed += 1;
        }

        Ok(removed)
    }

    /// Issue creations for dynamic templates below their minimum.
    pub async fn scale_up(self: &Arc<Self>) -> Result<Vec<JoinHandle<Result<String>>>> {
        let records = self.store.get_all().await?;
        let (launching, pending) = {
            let ledger = self.ledger.lock().await;
            (ledger.launching.clone(), ledger.pending.clone())
        };
        let runtime = self.launcher.runtime();
        let mut issued = Vec::new();

        for template in self.registry.dynamic_templates() {
            let mut running = 0usize;
            for server in records.iter().filter(|s| s.template_name() == template.name) {
                if launching.contains(&server.internal_id) {
                    running += 1;
                    continue;
                }
                if let Ok(Some(status)) = runtime.inspect(&server.container_id).await
                    && status.running
                {
                    running += 1;
                }
            }

            let queued = pending.get(&template.name).copied().unwrap_or(0);
            let min = template.min_instances() as usize;
            if running + queued >= min {
                continue;
            }

            let missing = min - running - queued;
            info!(
                template = %template.name,
                running,
                queued,
                min,
                missing,
                "Scaling up"
            );
            for _ in 0..missing {
                let this = Arc::clone(self);
                let template = template.clone();
                issued.push(tokio::spawn(async move {
                    let result = this.create_server(&template, ServerData::default()).await;
                    if let Err(e) = &result {
                        warn!(template = %template.name, error = %e, "Scale-up creation failed");
                    }
                    result
                }));
            }
        }

        Ok(issued)
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Record a lifecycle transition and announce it. Backward transitions
    /// are dropped.
    async fn transition(&self, server: &ServerInstance, state: ServerState) -> bool {
        if !self
            .lifecycle
            .lock()
            .await
            .advance(&server.internal_id, state)
        {
            debug!(
                instance_id = %server.internal_id,
                state = %state,
                "Ignoring out-of-order transition"
            );
            return false;
        }

        self.publish(Channel::Servers, &CloudEvent::state_changed(server, state))
            .await;
        true
    }

    async fn publish(&self, channel: Channel, event: &CloudEvent) {
        if let Err(e) = self.bus.publish(channel, event).await {
            warn!(channel = %channel, error = %e, "Failed to publish event");
        }
    }
}
