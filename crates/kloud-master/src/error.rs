// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kloud-master.

use thiserror::Error;

/// Orchestrator errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Template or image definitions are invalid.
    #[error("Registry error: {0}")]
    Registry(#[from] crate::template_registry::RegistryError),

    /// State store or event bus operation failed.
    #[error("Store error: {0}")]
    Store(#[from] kloud_core::CoreError),

    /// Container runtime operation failed.
    #[error("Runtime error: {0}")]
    Runtime(#[from] crate::runner::RuntimeError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Template was not found.
    #[error("Template not found: {0}")]
    TemplateNotFound(String),

    /// Server instance was not found.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// A static template already has an instance or one is being created.
    #[error("Server already exists for template: {0}")]
    AlreadyExists(String),

    /// A dynamic template reached its instance limit.
    #[error("Instance limit reached for template {template} (max {max})")]
    LimitReached {
        /// Template name.
        template: String,
        /// Configured maximum.
        max: u32,
    },

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;
