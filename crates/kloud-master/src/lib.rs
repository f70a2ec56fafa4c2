// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kloud Master - Game Server Orchestrator
//!
//! This crate runs a fleet of game-server containers (a proxy, lobbies,
//! minigame instances) on a single Docker host. It creates containers from
//! templates, keeps dynamic templates within their instance bounds, removes
//! servers whose containers died and announces every lifecycle change to the
//! rest of the network through Redis.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                              kloud-master                                │
//! │                                                                          │
//! │  ┌────────────────┐   ┌───────────────────┐   ┌───────────────────────┐  │
//! │  │    handlers    │──►│ ServerOrchestrator│◄──│      Reconciler       │  │
//! │  │ (RPC surface)  │   │  ledger, events   │   │  sweep + scale-up     │  │
//! │  └────────────────┘   └─────────┬─────────┘   └───────────────────────┘  │
//! │  ┌────────────────┐             │                                        │
//! │  │ EventListener  │─────────────┤                                        │
//! │  │ CREATE_SERVER  │             ▼                                        │
//! │  └────────────────┘   ┌───────────────────┐   ┌───────────────────────┐  │
//! │                       │  ServerLauncher   │──►│  PortAllocator,       │  │
//! │                       │                   │   │  Workspace            │  │
//! │                       └─────────┬─────────┘   └───────────────────────┘  │
//! └─────────────────────────────────┼────────────────────────────────────────┘
//!                                   ▼
//!              ┌───────────────────────────────────────────┐
//!              │ ContainerRuntime (DockerRuntime / Mock)   │
//!              └───────────────────────────────────────────┘
//! ```
//!
//! # Handler Operations
//!
//! | Operation               | Description                                      |
//! |-------------------------|--------------------------------------------------|
//! | `handle_create_server`  | Create a server from a template                  |
//! | `handle_update_server`  | Replace a server's data                          |
//! | `handle_restart_server` | Stop a server and recreate it from its snapshot  |
//! | `handle_stop_server`    | Stop a server and remove its record              |
//! | `handle_list_templates` | List configured templates                        |
//! | `handle_list_servers`   | List live servers                                |
//! | `handle_health_check`   | Store and container runtime reachability         |
//!
//! # Server Lifecycle
//!
//! ```text
//!            create
//!              │
//!              ▼
//!         ┌──────────┐  readiness line  ┌──────────┐
//!         │ STARTING │ ───────────────► │ RUNNING  │
//!         └────┬─────┘                  └────┬─────┘
//!              │ stop / restart              │ stop / restart
//!              ▼                             ▼
//!         ┌──────────┐ ◄─────────────────────┘
//!         │ STOPPING │
//!         └────┬─────┘
//!              │ container gone
//!              ▼
//!         ┌──────────┐
//!         │   GONE   │ ◄── dead-container sweep (from any state)
//!         └──────────┘
//! ```
//!
//! States only move forward. Every transition is published on the `servers`
//! channel; `CLOUD_STARTED` and `CLOUD_STOPPED` go to `cloud`.
//!
//! # Configuration
//!
//! | Variable                        | Default           |
//! |---------------------------------|-------------------|
//! | `REDIS_HOST` / `REDIS_PORT`     | `localhost:6379`  |
//! | `REDIS_URL`                     | from host/port    |
//! | `KLOUD_TEMPLATES_FILE`          | `templates.json`  |
//! | `KLOUD_IMAGES_FILE`             | `images.json`     |
//! | `KLOUD_TEMPLATES_DIR`           | `templates`       |
//! | `KLOUD_RUNNING_DIR`             | `running`         |
//! | `KLOUD_NETWORK`                 | `kcloud_network`  |
//! | `KLOUD_RECONCILE_INTERVAL_SECS` | `10`              |
//! | `KLOUD_PORT_BASE`               | `25565`           |
//! | `KLOUD_PORT_WINDOW`             | `100`             |
//! | `KLOUD_API_PORT`                | `8080`            |

#![deny(missing_docs)]

/// Configuration loaded from environment variables.
pub mod config;

/// Error types.
pub mod error;

/// Listener for creation requests on the event bus.
pub mod event_listener;

/// Inbound request handlers.
pub mod handlers;

/// Server lifecycle orchestration.
pub mod orchestrator;

/// Periodic reconciliation worker.
pub mod reconciler;

/// Container runtime adapter.
pub mod runner;

/// Embeddable runtime for running the orchestrator in-process.
pub mod runtime;

/// Template and image definitions.
pub mod template_registry;

pub use error::{Error, Result};
pub use orchestrator::ServerOrchestrator;
pub use runtime::KloudRuntime;
