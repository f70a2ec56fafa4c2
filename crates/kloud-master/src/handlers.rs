// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inbound request handlers.
//!
//! Plain async functions the RPC layer calls. Each one validates its input,
//! delegates to the [`ServerOrchestrator`] and maps the outcome to a response
//! or an [`Error`](crate::error::Error).

use std::collections::BTreeMap;
use std::sync::Arc;

use kloud_core::{PrivateGame, ServerData, ServerInstance, Template};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::orchestrator::ServerOrchestrator;

/// Shared state for request handlers.
pub struct KloudHandlerState {
    /// Orchestrator all mutations go through.
    pub orchestrator: Arc<ServerOrchestrator>,
    /// When the process started (for uptime calculation).
    pub start_time: std::time::Instant,
    /// Server version string.
    pub version: String,
}

impl KloudHandlerState {
    /// Create handler state for an orchestrator.
    pub fn new(orchestrator: Arc<ServerOrchestrator>) -> Self {
        Self {
            orchestrator,
            start_time: std::time::Instant::now(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// Get the uptime in milliseconds.
    pub fn uptime_ms(&self) -> i64 {
        self.start_time.elapsed().as_millis() as i64
    }
}

// ============================================================================
// Health Check
// ============================================================================

/// Handle health check request.
pub async fn handle_health_check(state: &KloudHandlerState) -> Result<HealthCheckResponse> {
    let store_healthy = state.orchestrator.store().get_all().await.is_ok();
    let runtime_healthy = state
        .orchestrator
        .launcher()
        .runtime()
        .ping()
        .await
        .is_ok();

    Ok(HealthCheckResponse {
        healthy: store_healthy && runtime_healthy,
        version: state.version.clone(),
        uptime_ms: state.uptime_ms(),
    })
}

/// Health check response.
#[derive(Debug)]
pub struct HealthCheckResponse {
    /// Whether both the state store and the container runtime respond.
    pub healthy: bool,
    /// Server version.
    pub version: String,
    /// Uptime in milliseconds.
    pub uptime_ms: i64,
}

// ============================================================================
// Server Creation
// ============================================================================

/// Request to create a server.
#[derive(Debug, Clone, Default)]
pub struct CreateServerRequest {
    /// Template name.
    pub template_id: String,
    /// Owner of a private game, if any.
    pub private_game_host: Option<Uuid>,
    /// Free-form data attached to the instance.
    pub extra_data: BTreeMap<String, String>,
}

/// Response to a successful creation.
#[derive(Debug, Clone)]
pub struct CreateServerResponse {
    /// Internal ID of the new instance.
    pub internal_id: String,
}

/// Handle create server request.
pub async fn handle_create_server(
    state: &KloudHandlerState,
    request: CreateServerRequest,
) -> Result<CreateServerResponse> {
    let template = state
        .orchestrator
        .registry()
        .get_template(&request.template_id)
        .cloned()
        .ok_or_else(|| Error::TemplateNotFound(request.template_id.clone()))?;

    let server_data = ServerData {
        private_game: request.private_game_host.map(|host| PrivateGame { host }),
        extra_data: request.extra_data,
    };

    let internal_id = state
        .orchestrator
        .create_server(&template, server_data)
        .await?;
    info!(template = %template.name, instance_id = %internal_id, "Create request served");

    Ok(CreateServerResponse { internal_id })
}

// ============================================================================
// Server Lifecycle
// ============================================================================

/// Request to replace a server's data.
#[derive(Debug, Clone)]
pub struct UpdateServerRequest {
    /// Internal ID of the instance.
    pub internal_id: String,
    /// New data, replacing the old one entirely.
    pub server_data: ServerData,
}

/// Handle update server request.
pub async fn handle_update_server(
    state: &KloudHandlerState,
    request: UpdateServerRequest,
) -> Result<ServerInstance> {
    debug!(instance_id = %request.internal_id, "Update request");
    state
        .orchestrator
        .update_server(&request.internal_id, request.server_data)
        .await
}

/// Handle restart server request.
pub async fn handle_restart_server(state: &KloudHandlerState, internal_id: &str) -> Result<()> {
    debug!(instance_id = %internal_id, "Restart request");
    state.orchestrator.restart_server(internal_id).await
}

/// Handle stop server request.
pub async fn handle_stop_server(state: &KloudHandlerState, internal_id: &str) -> Result<()> {
    debug!(instance_id = %internal_id, "Stop request");
    state.orchestrator.stop_server(internal_id).await
}

// ============================================================================
// Listing
// ============================================================================

/// Handle list templates request.
pub async fn handle_list_templates(state: &KloudHandlerState) -> Result<Vec<Template>> {
    Ok(state
        .orchestrator
        .registry()
        .list_templates()
        .into_iter()
        .cloned()
        .collect())
}

/// Handle list servers request. Servers are ordered by name.
pub async fn handle_list_servers(state: &KloudHandlerState) -> Result<Vec<ServerInstance>> {
    let mut servers = state.orchestrator.store().get_all().await?;
    servers.sort_by(|a, b| a.server_name.cmp(&b.server_name));
    Ok(servers)
}
