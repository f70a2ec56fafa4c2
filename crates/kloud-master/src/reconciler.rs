// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker that keeps the fleet at its declared shape.
//!
//! Every tick it asks the orchestrator for one reconciliation pass: records
//! whose container died are removed and dynamic templates below their minimum
//! are topped up. The worker holds only a weak reference, so it never keeps
//! the orchestrator alive on its own.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, error, info};

use crate::orchestrator::ServerOrchestrator;

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Time between passes.
    pub interval: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

/// Periodic reconciliation worker.
pub struct Reconciler {
    orchestrator: Weak<ServerOrchestrator>,
    config: ReconcilerConfig,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(orchestrator: Weak<ServerOrchestrator>, config: ReconcilerConfig) -> Self {
        Self {
            orchestrator,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled or the
    /// orchestrator is dropped.
    pub async fn run(&self) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    let Some(orchestrator) = self.orchestrator.upgrade() else {
                        debug!("Orchestrator dropped, reconciler exiting");
                        break;
                    };
                    match orchestrator.reconcile_once().await {
                        Ok(issued) if !issued.is_empty() => {
                            debug!(creations = issued.len(), "Reconciliation issued creations");
                        }
                        Ok(_) => {}
                        Err(e) => error!(error = %e, "Reconciliation pass failed"),
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }
}
