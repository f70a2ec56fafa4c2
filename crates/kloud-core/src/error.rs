// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for kloud-core.

use thiserror::Error;

/// Errors from the state store and event bus.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Redis command or connection failed.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type using CoreError.
pub type Result<T> = std::result::Result<T, CoreError>;
