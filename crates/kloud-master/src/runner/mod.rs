// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Container runtime adapter.
//!
//! [`ContainerRuntime`] abstracts the engine; [`DockerRuntime`] talks to Docker
//! and [`MockRuntime`] simulates it for tests. [`ServerLauncher`] builds on a
//! runtime with port allocation, working directories and readiness detection.

pub mod docker;
pub mod launcher;
pub mod mock;
pub mod ports;
mod traits;
pub mod workspace;

pub use docker::DockerRuntime;
pub use launcher::{LaunchRequest, LaunchedServer, LauncherConfig, Readiness, ServerLauncher};
pub use mock::MockRuntime;
pub use ports::{PortAllocator, PortProbe};
pub use traits::*;
pub use workspace::Workspace;
