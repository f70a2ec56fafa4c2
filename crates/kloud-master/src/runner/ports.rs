// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Host port allocation.

use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex};

use tracing::debug;

use super::traits::{Result, RuntimeError};

/// Checks whether a host port can be bound.
pub type PortProbe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Allocates host ports nearest to a base port.
///
/// Candidates are probed in order `base, base+1, base-1, base+2, ...` up to
/// `window` ports on each side. Ports already handed out by this allocator
/// are skipped even if the probe reports them free, since a created but not
/// yet started container does not hold its port.
pub struct PortAllocator {
    base: u16,
    window: u16,
    claimed: Mutex<HashSet<u16>>,
    probe: PortProbe,
}

impl PortAllocator {
    /// Create an allocator probing the host with a TCP bind.
    pub fn new(base: u16, window: u16) -> Self {
        Self::with_probe(
            base,
            window,
            Arc::new(|port| TcpListener::bind(("0.0.0.0", port)).is_ok()),
        )
    }

    /// Create an allocator with a custom probe.
    pub fn with_probe(base: u16, window: u16, probe: PortProbe) -> Self {
        Self {
            base,
            window,
            claimed: Mutex::new(HashSet::new()),
            probe,
        }
    }

    fn candidates(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.base).chain((1..=self.window).flat_map(move |offset| {
            let above = self.base.checked_add(offset);
            let below = self.base.checked_sub(offset).filter(|p| *p > 0);
            above.into_iter().chain(below)
        }))
    }

    /// Allocate the nearest free port.
    ///
    /// A candidate is claimed before it is probed and the lock is not held
    /// while probing, so concurrent callers never pick the same port and never
    /// wait on each other's probes. The default probe is a single
    /// non-blocking `bind`, cheap enough to run on the async caller's thread.
    pub fn allocate(&self) -> Result<u16> {
        for port in self.candidates() {
            if !self.try_claim(port) {
                continue;
            }
            if !(self.probe)(port) {
                self.unclaim(port);
                continue;
            }
            debug!(port, "Allocated host port");
            return Ok(port);
        }
        Err(RuntimeError::NoPortAvailable {
            base: self.base,
            window: self.window,
        })
    }

    fn try_claim(&self, port: u16) -> bool {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(port)
    }

    fn unclaim(&self, port: u16) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
    }

    /// Claim a specific port.
    pub fn claim(&self, port: u16) -> Result<u16> {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(port) {
            return Err(RuntimeError::PortInUse(port));
        }
        Ok(port)
    }

    /// Return a port to the pool.
    pub fn release(&self, port: u16) {
        let mut claimed = self.claimed.lock().unwrap_or_else(|e| e.into_inner());
        if claimed.remove(&port) {
            debug!(port, "Released host port");
        }
    }

    /// Forget every claim.
    pub fn reset(&self) {
        self.claimed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_free() -> PortProbe {
        Arc::new(|_| true)
    }

    #[test]
    fn test_nearest_first() {
        let ports = PortAllocator::with_probe(25565, 10, always_free());
        assert_eq!(ports.allocate().unwrap(), 25565);
        assert_eq!(ports.allocate().unwrap(), 25566);
        assert_eq!(ports.allocate().unwrap(), 25564);
        assert_eq!(ports.allocate().unwrap(), 25567);
    }

    #[test]
    fn test_skips_ports_in_use_on_host() {
        let ports = PortAllocator::with_probe(25565, 10, Arc::new(|p| p != 25565 && p != 25566));
        assert_eq!(ports.allocate().unwrap(), 25564);
    }

    #[test]
    fn test_busy_host_port_is_not_left_claimed() {
        let ports = PortAllocator::with_probe(25565, 10, Arc::new(|p| p != 25565));
        assert_eq!(ports.allocate().unwrap(), 25566);
        assert_eq!(ports.claim(25565).unwrap(), 25565);
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let ports = Arc::new(PortAllocator::with_probe(25565, 50, always_free()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..10)
                        .map(|_| ports.allocate().unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<u16> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 80);
    }

    #[test]
    fn test_exhausted_window() {
        let ports = PortAllocator::with_probe(25565, 1, always_free());
        ports.allocate().unwrap();
        ports.allocate().unwrap();
        ports.allocate().unwrap();
        assert!(matches!(
            ports.allocate(),
            Err(RuntimeError::NoPortAvailable {
                base: 25565,
                window: 1
            })
        ));
    }

    #[test]
    fn test_release_makes_port_available_again() {
        let ports = PortAllocator::with_probe(25565, 5, always_free());
        let first = ports.allocate().unwrap();
        ports.release(first);
        assert_eq!(ports.allocate().unwrap(), first);
    }

    #[test]
    fn test_claim_forced_port() {
        let ports = PortAllocator::with_probe(25565, 5, always_free());
        assert_eq!(ports.claim(25565).unwrap(), 25565);
        assert!(matches!(ports.claim(25565), Err(RuntimeError::PortInUse(25565))));
        assert_eq!(ports.allocate().unwrap(), 25566);
    }

    #[test]
    fn test_window_clamped_at_zero() {
        let ports = PortAllocator::with_probe(1, 3, always_free());
        let all: Vec<u16> = ports.candidates().collect();
        assert_eq!(all, [1, 2, 3, 4]);
    }
}
