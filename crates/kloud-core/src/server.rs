// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Live server records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::template::{ServerKind, Template};

/// Ownership token of a private game.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateGame {
    /// Player that owns the game.
    pub host: Uuid,
}

/// Mutable metadata attached to a server instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerData {
    /// Set when the instance is a private game.
    #[serde(default)]
    pub private_game: Option<PrivateGame>,
    /// Free-form data for consumers.
    #[serde(default)]
    pub extra_data: BTreeMap<String, String>,
}

/// One live server instance as persisted in the state store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInstance {
    /// Orchestrator-assigned stable identity.
    pub internal_id: String,
    /// Runtime-assigned container ID.
    pub container_id: String,
    /// Routing name (`{template}` or `{template}-{n}`).
    pub server_name: String,
    /// Snapshot of the template at creation time.
    pub template: Template,
    /// Mutable metadata.
    #[serde(default)]
    pub server_data: ServerData,
    /// Host port players (or the proxy) connect to.
    pub connection_port: u16,
}

impl ServerInstance {
    /// Name of the template this instance was created from.
    pub fn template_name(&self) -> &str {
        &self.template.name
    }

    /// Server role.
    pub fn kind(&self) -> ServerKind {
        self.template.kind
    }

    /// Whether the instance is a default landing point.
    pub fn is_lobby(&self) -> bool {
        self.template.lobby
    }

    /// Whether the instance belongs to a dynamic template.
    pub fn is_dynamic(&self) -> bool {
        self.template.is_dynamic()
    }

    /// Numeric suffix of a dynamic instance's name (`lobby-3` → 3).
    pub fn name_suffix(&self) -> Option<u32> {
        self.server_name
            .strip_prefix(&self.template.name)?
            .strip_prefix('-')?
            .parse()
            .ok()
    }
}
