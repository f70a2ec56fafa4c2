// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for kloud-master.

use std::path::PathBuf;
use std::time::Duration;

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis connection URL
    pub redis_url: String,
    /// Redis host as seen from this process (rewritten for containers)
    pub redis_host: String,
    /// Redis port
    pub redis_port: u16,
    /// Template definitions file
    pub templates_file: PathBuf,
    /// Image definitions file
    pub images_file: PathBuf,
    /// Root of template trees and static volumes
    pub templates_dir: PathBuf,
    /// Root of ephemeral instance directories
    pub running_dir: PathBuf,
    /// Bridge network non-standalone containers join
    pub network: String,
    /// Period of the reconciliation loop
    pub reconcile_interval: Duration,
    /// Centre of the host port allocation window
    pub port_base: u16,
    /// Ports probed on each side of `port_base`
    pub port_window: u16,
    /// API port injected into containers
    pub api_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let redis_host = std::env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string());
        let redis_port = parse_port("REDIS_PORT", 6379)?;
        let redis_url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| format!("redis://{}:{}", redis_host, redis_port));

        let templates_file = PathBuf::from(
            std::env::var("KLOUD_TEMPLATES_FILE").unwrap_or_else(|_| "templates.json".to_string()),
        );
        let images_file = PathBuf::from(
            std::env::var("KLOUD_IMAGES_FILE").unwrap_or_else(|_| "images.json".to_string()),
        );
        let templates_dir = PathBuf::from(
            std::env::var("KLOUD_TEMPLATES_DIR").unwrap_or_else(|_| "templates".to_string()),
        );
        let running_dir = PathBuf::from(
            std::env::var("KLOUD_RUNNING_DIR").unwrap_or_else(|_| "running".to_string()),
        );

        let network =
            std::env::var("KLOUD_NETWORK").unwrap_or_else(|_| "kcloud_network".to_string());

        let reconcile_secs: u64 = match std::env::var("KLOUD_RECONCILE_INTERVAL_SECS") {
            Ok(v) => v
                .parse()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or(ConfigError::InvalidValue("KLOUD_RECONCILE_INTERVAL_SECS"))?,
            Err(_) => 10,
        };

        let port_base = parse_port("KLOUD_PORT_BASE", 25565)?;
        let port_window = parse_port("KLOUD_PORT_WINDOW", 100)?;
        let api_port = parse_port("KLOUD_API_PORT", 8080)?;

        Ok(Self {
            redis_url,
            redis_host,
            redis_port,
            templates_file,
            images_file,
            templates_dir,
            running_dir,
            network,
            reconcile_interval: Duration::from_secs(reconcile_secs),
            port_base,
            port_window,
            api_port,
        })
    }
}

fn parse_port(var: &'static str, default: u16) -> Result<u16, ConfigError> {
    match std::env::var(var) {
        Ok(v) => v.parse().map_err(|_| ConfigError::InvalidPort(var)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A port variable does not hold a valid port number.
    #[error("Invalid port number in {0}")]
    InvalidPort(&'static str),
    /// A variable holds a value that cannot be used.
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(&'static str),
}
