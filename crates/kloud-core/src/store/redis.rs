// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Redis-backed state store and event bus.

use std::collections::HashMap;

use ::redis::aio::ConnectionManager;
use ::redis::{AsyncCommands, Client};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    EventBus, EventSubscription, SERVERS_KEY, StateStore, SUBSCRIPTION_BUFFER, decode_event,
    decode_record,
};
use crate::error::Result;
use crate::events::{Channel, CloudEvent};
use crate::server::ServerInstance;

/// Store and bus backed by a single Redis deployment.
///
/// Commands go through a [`ConnectionManager`] that reconnects on failure.
/// Each subscription opens its own pub/sub connection.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    manager: ConnectionManager,
}

impl RedisStore {
    /// Connect to Redis at `url` (e.g. `redis://localhost:6379`).
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        info!(url = %url, "Connected to Redis");
        Ok(Self { client, manager })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn get_all(&self) -> Result<Vec<ServerInstance>> {
        let mut conn = self.manager.clone();
        let raw: HashMap<String, String> = conn.hgetall(SERVERS_KEY).await?;
        Ok(raw
            .iter()
            .filter_map(|(key, value)| decode_record(key, value))
            .collect())
    }

    async fn get(&self, internal_id: &str) -> Result<Option<ServerInstance>> {
        let mut conn = self.manager.clone();
        let raw: Option<String> = conn.hget(SERVERS_KEY, internal_id).await?;
        Ok(raw.and_then(|value| decode_record(internal_id, &value)))
    }

    async fn save(&self, server: &ServerInstance) -> Result<()> {
        let json = serde_json::to_string(server)?;
        let mut conn = self.manager.clone();
        let _: () = conn.hset(SERVERS_KEY, &server.internal_id, json).await?;
        Ok(())
    }

    async fn remove(&self, internal_id: &str) -> Result<bool> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.hdel(SERVERS_KEY, internal_id).await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl EventBus for RedisStore {
    async fn publish(&self, channel: Channel, event: &CloudEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        let mut conn = self.manager.clone();
        let receivers: i64 = conn.publish(channel.as_str(), json).await?;
        debug!(channel = %channel, receivers, "Published event");
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<EventSubscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel.as_str()).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!(channel = %channel, error = %e, "Dropping non-text message");
                        continue;
                    }
                };
                let Some(event) = decode_event(channel, &payload) else {
                    continue;
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            debug!(channel = %channel, "Subscription closed");
        });

        info!(channel = %channel, "Subscribed to channel");
        Ok(EventSubscription::new(channel, rx))
    }
}
