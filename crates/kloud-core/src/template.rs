// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Templates and images.
//!
//! A [`Template`] describes a class of server. Templates without a
//! [`DynamicTemplate`] section are static: exactly one long-lived instance whose
//! identity is the template name. An [`Image`] describes the container image a
//! template is built from, including the log line that signals readiness.
//!
//! Both are loaded from JSON files at startup and never change afterwards. A
//! [`ServerInstance`](crate::ServerInstance) embeds a snapshot of its template.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Default internal port of Minecraft-style server images.
pub const DEFAULT_INTERNAL_PORT: u16 = 25565;

/// Default readiness pattern for Paper-style server logs.
pub const DEFAULT_STARTED_PATTERN: &str = r#"^Done \(\d+\.\d+s\)! For help, type "help"$"#;

/// Role a server plays in the network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerKind {
    /// Entry point players connect to; routes them to proxied servers.
    Proxy,
    /// Game server reachable only through a proxy.
    #[default]
    ProxiedServer,
    /// Game server players connect to directly.
    StandaloneServer,
}

impl ServerKind {
    /// Whether this is the proxy kind.
    pub fn is_proxy(&self) -> bool {
        matches!(self, ServerKind::Proxy)
    }
}

impl fmt::Display for ServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerKind::Proxy => write!(f, "proxy"),
            ServerKind::ProxiedServer => write!(f, "proxied_server"),
            ServerKind::StandaloneServer => write!(f, "standalone_server"),
        }
    }
}

/// Which image a template is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildSettings {
    /// Name of an [`Image`] known to the registry.
    pub image: String,
    /// Image tag. Falls back to the image's default version when absent.
    #[serde(default, alias = "imageVersion", skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Scaling bounds of a dynamic template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DynamicTemplate {
    /// Instances the reconciler keeps alive at all times.
    #[serde(alias = "minServers")]
    pub min_instances: u32,
    /// Upper bound enforced when creating instances.
    #[serde(alias = "maxServers")]
    pub max_instances: u32,
    /// Extra directories (relative to the templates root) layered into each
    /// instance's working directory.
    #[serde(default, alias = "extraDataDirectories")]
    pub extra_directories: Vec<String>,
}

/// Declarative description of a class of server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Unique template name.
    pub name: String,
    /// Image reference.
    pub build: BuildSettings,
    /// Environment overrides, applied on top of the image defaults.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Whether instances are default landing points for players.
    #[serde(default)]
    pub lobby: bool,
    /// Server role.
    #[serde(default, rename = "type")]
    pub kind: ServerKind,
    /// Permissions consumers must check before sending players here.
    #[serde(default)]
    pub required_permissions: Vec<String>,
    /// Higher values are provisioned first during scale-up.
    #[serde(default)]
    pub priority: i32,
    /// Scaling bounds; `None` makes the template static.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic: Option<DynamicTemplate>,
    /// Fixed host port, only honoured for static templates.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forced_port: Option<u16>,
}

impl Template {
    /// Whether this template scales between min/max bounds.
    pub fn is_dynamic(&self) -> bool {
        self.dynamic.is_some()
    }

    /// Whether this template has exactly one long-lived instance.
    pub fn is_static(&self) -> bool {
        self.dynamic.is_none()
    }

    /// Minimum number of instances (1 for static templates).
    pub fn min_instances(&self) -> u32 {
        self.dynamic.as_ref().map_or(1, |d| d.min_instances)
    }

    /// Maximum number of instances (1 for static templates).
    pub fn max_instances(&self) -> u32 {
        self.dynamic.as_ref().map_or(1, |d| d.max_instances)
    }

    /// Extra directories to layer into working directories.
    pub fn extra_directories(&self) -> &[String] {
        self.dynamic
            .as_ref()
            .map(|d| d.extra_directories.as_slice())
            .unwrap_or_default()
    }

    /// Full `repository:tag` reference for this template's image.
    pub fn image_reference(&self, image: &Image) -> String {
        let version = self
            .build
            .version
            .as_deref()
            .unwrap_or(&image.default_version);
        format!("{}:{}", image.image, version)
    }
}

fn default_version() -> String {
    "latest".to_string()
}

fn default_internal_port() -> u16 {
    DEFAULT_INTERNAL_PORT
}

fn default_started_pattern() -> String {
    DEFAULT_STARTED_PATTERN.to_string()
}

/// A named container image descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    /// Unique image name templates refer to.
    pub name: String,
    /// Repository reference, e.g. `itzg/minecraft-server`.
    pub image: String,
    /// Tag used when a template does not pin one.
    #[serde(default = "default_version")]
    pub default_version: String,
    /// Port the server listens on inside the container.
    #[serde(default = "default_internal_port")]
    pub default_internal_port: u16,
    /// Regular expression matched against each log line to detect readiness.
    #[serde(default = "default_started_pattern", alias = "startedMessageRegex")]
    pub started_message_pattern: String,
    /// Environment defaults for every template using this image.
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}
