// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Lifecycle states and events.
//!
//! # Server State Machine
//!
//! ```text
//!   ┌──────────┐  ready   ┌─────────┐  stop   ┌──────────┐
//!   │ STARTING │ ───────► │ RUNNING │ ──────► │ STOPPING │
//!   └────┬─────┘          └────┬────┘         └────┬─────┘
//!        │                     │                   │
//!        └─────────────────────┴─────────┬─────────┘
//!                                        ▼
//!                                    ┌──────┐
//!                                    │ GONE │  (record removed)
//!                                    └──────┘
//! ```
//!
//! Transitions only move forward. A restart is a teardown followed by a fresh
//! creation with a new internal ID.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::server::ServerInstance;

/// Lifecycle state of a server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerState {
    /// Container created, service not yet ready.
    Starting,
    /// Readiness signal observed.
    Running,
    /// Graceful stop requested.
    Stopping,
    /// Container gone, record removed.
    Gone,
}

impl ServerState {
    fn rank(self) -> u8 {
        match self {
            ServerState::Starting => 0,
            ServerState::Running => 1,
            ServerState::Stopping => 2,
            ServerState::Gone => 3,
        }
    }

    /// Whether `next` is a legal transition from this state.
    pub fn can_transition_to(self, next: ServerState) -> bool {
        next.rank() > self.rank()
    }

    /// Whether this is the terminal state.
    pub fn is_terminal(self) -> bool {
        matches!(self, ServerState::Gone)
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerState::Starting => write!(f, "starting"),
            ServerState::Running => write!(f, "running"),
            ServerState::Stopping => write!(f, "stopping"),
            ServerState::Gone => write!(f, "gone"),
        }
    }
}

/// Pub/sub channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Server lifecycle events and creation requests.
    Servers,
    /// Orchestrator lifecycle announcements.
    Cloud,
}

impl Channel {
    /// Wire name of the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Servers => "servers",
            Channel::Cloud => "cloud",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events exchanged over the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "camelCase")]
pub enum CloudEvent {
    /// A server changed lifecycle state. Carries the full record snapshot.
    ServerStateChanged {
        /// Snapshot of the instance at the time of the transition.
        server: Box<ServerInstance>,
        /// New state.
        state: ServerState,
    },
    /// The orchestrator finished its startup protocol.
    CloudStarted,
    /// The orchestrator is shutting down.
    CloudStopped,
    /// Another process asks the orchestrator to create a server.
    CreateServer {
        /// Template name.
        template: String,
    },
}

impl CloudEvent {
    /// Build a state-change event.
    pub fn state_changed(server: &ServerInstance, state: ServerState) -> Self {
        CloudEvent::ServerStateChanged {
            server: Box::new(server.clone()),
            state,
        }
    }

    /// Channel this event is published on.
    pub fn channel(&self) -> Channel {
        match self {
            CloudEvent::ServerStateChanged { .. } | CloudEvent::CreateServer { .. } => {
                Channel::Servers
            }
            CloudEvent::CloudStarted | CloudEvent::CloudStopped => Channel::Cloud,
        }
    }
}
