// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process store and bus.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock, mpsc};

use super::{EventBus, EventSubscription, StateStore, SUBSCRIPTION_BUFFER, decode_record};
use crate::error::Result;
use crate::events::{Channel, CloudEvent};
use crate::server::ServerInstance;

/// Number of published events kept for inspection.
pub const PUBLISHED_LOG_CAPACITY: usize = 4096;

/// Store and bus kept in process memory.
///
/// Records are held in their JSON encoding so the same serialization path as
/// the Redis backend is exercised. The most recent published events are also
/// kept in a bounded log that tests can inspect.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    records: Arc<RwLock<HashMap<String, String>>>,
    subscribers: Arc<Mutex<HashMap<Channel, Vec<mpsc::Sender<CloudEvent>>>>>,
    published: Arc<Mutex<VecDeque<(Channel, CloudEvent)>>>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a raw value under `key`, bypassing encoding.
    pub async fn insert_raw(&self, key: &str, value: &str) {
        self.records
            .write()
            .await
            .insert(key.to_string(), value.to_string());
    }

    /// The most recently published events, oldest first.
    pub async fn published(&self) -> Vec<(Channel, CloudEvent)> {
        self.published.lock().await.iter().cloned().collect()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn get_all(&self) -> Result<Vec<ServerInstance>> {
        let records = self.records.read().await;
        Ok(records
            .iter()
            .filter_map(|(key, value)| decode_record(key, value))
            .collect())
    }

    async fn get(&self, internal_id: &str) -> Result<Option<ServerInstance>> {
        let records = self.records.read().await;
        Ok(records
            .get(internal_id)
            .and_then(|value| decode_record(internal_id, value)))
    }

    async fn save(&self, server: &ServerInstance) -> Result<()> {
        let json = serde_json::to_string(server)?;
        self.records
            .write()
            .await
            .insert(server.internal_id.clone(), json);
        Ok(())
    }

    async fn remove(&self, internal_id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(internal_id).is_some())
    }
}

#[async_trait]
impl EventBus for InMemoryStore {
    async fn publish(&self, channel: Channel, event: &CloudEvent) -> Result<()> {
        {
            let mut published = self.published.lock().await;
            if published.len() == PUBLISHED_LOG_CAPACITY {
                published.pop_front();
            }
            published.push_back((channel, event.clone()));
        }

        let mut subscribers = self.subscribers.lock().await;
        if let Some(senders) = subscribers.get_mut(&channel) {
            // Slow subscribers lose events; closed ones are dropped.
            senders.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(_)) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            });
        }
        Ok(())
    }

    async fn subscribe(&self, channel: Channel) -> Result<EventSubscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        self.subscribers
            .lock()
            .await
            .entry(channel)
            .or_default()
            .push(tx);
        Ok(EventSubscription::new(channel, rx))
    }
}
