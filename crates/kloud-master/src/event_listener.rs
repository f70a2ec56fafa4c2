// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listens on the servers channel for creation requests.
//!
//! Game servers and plugins ask for new instances by publishing a
//! `CREATE_SERVER` event naming a template. Other event types on the channel
//! are ignored, including the orchestrator's own state changes.

use std::sync::Arc;

use kloud_core::{Channel, CloudEvent, EventBus, ServerData};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::orchestrator::ServerOrchestrator;

/// Background worker turning `CREATE_SERVER` events into creations.
pub struct EventListener {
    orchestrator: Arc<ServerOrchestrator>,
    bus: Arc<dyn EventBus>,
    shutdown: Arc<Notify>,
}

impl EventListener {
    /// Create a new listener.
    pub fn new(orchestrator: Arc<ServerOrchestrator>, bus: Arc<dyn EventBus>) -> Self {
        Self {
            orchestrator,
            bus,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Subscribe and dispatch events until shutdown or until the
    /// subscription closes.
    pub async fn run(&self) -> crate::error::Result<()> {
        let mut subscription = self.bus.subscribe(Channel::Servers).await?;
        info!(channel = %subscription.channel(), "Event listener started");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Event listener received shutdown signal");
                    break;
                }

                event = subscription.recv() => {
                    match event {
                        Some(event) => self.dispatch(event),
                        None => {
                            warn!("Event subscription closed");
                            break;
                        }
                    }
                }
            }
        }

        info!("Event listener stopped");
        Ok(())
    }

    fn dispatch(&self, event: CloudEvent) {
        let CloudEvent::CreateServer { template } = event else {
            return;
        };

        let Some(template) = self.orchestrator.registry().get_template(&template).cloned() else {
            warn!(template = %template, "Create request for unknown template");
            return;
        };

        debug!(template = %template.name, "Create request received");
        let orchestrator = self.orchestrator.clone();
        tokio::spawn(async move {
            match orchestrator
                .create_server(&template, ServerData::default())
                .await
            {
                Ok(internal_id) => {
                    info!(template = %template.name, instance_id = %internal_id, "Created server on request")
                }
                Err(e) => warn!(template = %template.name, error = %e, "Requested creation failed"),
            }
        });
    }
}
