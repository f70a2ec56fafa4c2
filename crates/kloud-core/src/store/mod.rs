// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! State store and event bus abstractions.
//!
//! The store is a single hash keyed by internal ID whose values are JSON
//! encoded [`ServerInstance`] records. The bus carries [`CloudEvent`]s on named
//! channels. Both are implemented by [`RedisStore`] for production and by
//! [`InMemoryStore`] for tests and single-process deployments.

mod memory;
mod redis;

pub use memory::InMemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::events::{Channel, CloudEvent};
use crate::server::ServerInstance;

/// Hash holding every live server record.
pub const SERVERS_KEY: &str = "servers";

/// Buffer size of subscription channels.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Shared key/value view of live servers.
///
/// Readers may observe a record before or after its matching event; records
/// that fail to decode are skipped by listing operations.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// All live server records.
    async fn get_all(&self) -> Result<Vec<ServerInstance>>;

    /// Record by internal ID.
    async fn get(&self, internal_id: &str) -> Result<Option<ServerInstance>>;

    /// Records created from the named template.
    async fn get_by_template(&self, template: &str) -> Result<Vec<ServerInstance>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .filter(|s| s.template_name() == template)
            .collect())
    }

    /// Record by container ID.
    async fn get_by_container(&self, container_id: &str) -> Result<Option<ServerInstance>> {
        Ok(self
            .get_all()
            .await?
            .into_iter()
            .find(|s| s.container_id == container_id))
    }

    /// Insert or overwrite a record.
    async fn save(&self, server: &ServerInstance) -> Result<()>;

    /// Delete a record. Returns whether it existed.
    async fn remove(&self, internal_id: &str) -> Result<bool>;
}

/// Fire-and-forget publish/subscribe.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event on a channel. Delivery is at-most-once.
    async fn publish(&self, channel: Channel, event: &CloudEvent) -> Result<()>;

    /// Subscribe to a channel.
    async fn subscribe(&self, channel: Channel) -> Result<EventSubscription>;
}

/// Stream of events from one channel.
pub struct EventSubscription {
    channel: Channel,
    rx: mpsc::Receiver<CloudEvent>,
}

impl EventSubscription {
    /// Wrap a receiver fed by a backend.
    pub fn new(channel: Channel, rx: mpsc::Receiver<CloudEvent>) -> Self {
        Self { channel, rx }
    }

    /// Channel this subscription listens on.
    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Next event, or `None` once the backend closed the subscription.
    pub async fn recv(&mut self) -> Option<CloudEvent> {
        self.rx.recv().await
    }
}

/// Decode a stored record, logging and skipping malformed values.
pub(crate) fn decode_record(key: &str, raw: &str) -> Option<ServerInstance> {
    match serde_json::from_str(raw) {
        Ok(server) => Some(server),
        Err(e) => {
            tracing::warn!(internal_id = %key, error = %e, "Skipping undecodable server record");
            None
        }
    }
}

/// Decode a published payload, logging and skipping malformed values.
pub(crate) fn decode_event(channel: Channel, raw: &str) -> Option<CloudEvent> {
    match serde_json::from_str(raw) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::debug!(channel = %channel, error = %e, "Ignoring unknown event payload");
            None
        }
    }
}
