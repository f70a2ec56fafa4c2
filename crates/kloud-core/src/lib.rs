// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kloud Core - shared model and state layer
//!
//! This crate holds everything that more than one process of a kloud deployment
//! needs to agree on: the template and image model, the live server record,
//! lifecycle events, and the shared state store they are exchanged through.
//!
//! The orchestrator (`kloud-master`) is the only writer. The routing proxy and
//! other listeners read the store and subscribe to events.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   HSET / HDEL    ┌───────────────────────────┐
//! │     kloud-master     │ ───────────────► │   Redis hash `servers`    │
//! │    (orchestrator)    │                  │  internalId → JSON record │
//! └──────────┬───────────┘                  └─────────────┬─────────────┘
//!            │ PUBLISH                                    │ HGETALL
//!            ▼                                            ▼
//! ┌──────────────────────┐   SUBSCRIBE      ┌───────────────────────────┐
//! │ channels `servers`,  │ ───────────────► │  routing proxy, API layer │
//! │        `cloud`       │                  │       other listeners     │
//! └──────────────────────┘                  └───────────────────────────┘
//! ```
//!
//! # Event Delivery
//!
//! Events are notifications, not data. Delivery is at-most-once and unordered
//! relative to store writes, so consumers re-read the store when an event
//! arrives instead of trusting the payload as current state.
//!
//! # Modules
//!
//! - [`error`]: Error types for store and bus operations
//! - [`events`]: Lifecycle states and the tagged event union
//! - [`server`]: The live server record and its mutable data
//! - [`store`]: `StateStore` / `EventBus` traits with Redis and in-memory backends
//! - [`template`]: Templates, build settings and image descriptors

#![deny(missing_docs)]

/// Error types for store and bus operations.
pub mod error;

/// Lifecycle states and events broadcast to listeners.
pub mod events;

/// Live server records.
pub mod server;

/// Shared state store and event bus.
pub mod store;

/// Server templates and container images.
pub mod template;

pub use error::CoreError;
pub use events::{Channel, CloudEvent, ServerState};
pub use server::{PrivateGame, ServerData, ServerInstance};
pub use store::{EventBus, EventSubscription, InMemoryStore, RedisStore, StateStore};
pub use template::{BuildSettings, DynamicTemplate, Image, ServerKind, Template};
