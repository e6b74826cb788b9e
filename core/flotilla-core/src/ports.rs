//! Ephemeral-port pool with per-terminal-key assignment tracking.
//!
//! The allocator hands out ports in the dynamic range [16384, 65535] only,
//! so managed instances never collide with well-known services. Check and
//! reserve happen inside a single lock acquisition, so two concurrent
//! allocations can never select the same port.
//!
//! Terminal keys map to ports one-to-one: `assign_port_to_terminal` is
//! idempotent per key, and no two keys ever hold the same port.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use rand::Rng;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::store::InstanceStore;

/// Inclusive lower bound of the managed ephemeral range.
pub const PORT_RANGE_START: u16 = 16384;
/// Inclusive upper bound of the managed ephemeral range.
pub const PORT_RANGE_END: u16 = 65535;
/// Random probes attempted before falling back to a linear scan.
const RANDOM_PROBE_ATTEMPTS: u32 = 100;

#[derive(Default)]
struct AllocatorInner {
    reserved: HashSet<u16>,
    by_terminal: HashMap<String, u16>,
}

/// Process-wide ephemeral-port pool manager.
///
/// Optionally wired to an [`InstanceStore`] so availability checks also see
/// ports claimed by live instance runtimes that this pool never reserved
/// (e.g. after a restart, before re-reservation).
pub struct PortAllocator {
    inner: Mutex<AllocatorInner>,
    store: Option<Arc<InstanceStore>>,
}

impl PortAllocator {
    pub fn new() -> Self {
        PortAllocator {
            inner: Mutex::new(AllocatorInner::default()),
            store: None,
        }
    }

    /// Create an allocator that also treats live instance runtime ports as
    /// unavailable.
    pub fn with_store(store: Arc<InstanceStore>) -> Self {
        PortAllocator {
            inner: Mutex::new(AllocatorInner::default()),
            store: Some(store),
        }
    }

    /// Reserve a free port: up to 100 random probes, then a linear scan.
    pub fn get_available_port(&self) -> Result<u16> {
        let mut inner = self.inner.lock().expect("allocator lock poisoned");
        let mut rng = rand::thread_rng();

        for _ in 0..RANDOM_PROBE_ATTEMPTS {
            let candidate = rng.gen_range(PORT_RANGE_START..=PORT_RANGE_END);
            if self.is_free_locked(&inner, candidate) {
                inner.reserved.insert(candidate);
                debug!(port = candidate, "allocated port (random probe)");
                return Ok(candidate);
            }
        }

        for candidate in PORT_RANGE_START..=PORT_RANGE_END {
            if self.is_free_locked(&inner, candidate) {
                inner.reserved.insert(candidate);
                debug!(port = candidate, "allocated port (linear scan)");
                return Ok(candidate);
            }
        }

        Err(EngineError::PortsExhausted)
    }

    /// Reserve a specific port.
    pub fn reserve_port(&self, port: u16) -> Result<()> {
        let mut inner = self.inner.lock().expect("allocator lock poisoned");
        if !Self::in_range(port) {
            return Err(EngineError::PortOutOfRange(port));
        }
        if !self.is_free_locked(&inner, port) {
            return Err(EngineError::PortInUse(port));
        }
        inner.reserved.insert(port);
        Ok(())
    }

    /// Release a port. Idempotent; also clears any terminal-key mapping
    /// pointing at it.
    pub fn release_port(&self, port: u16) {
        let mut inner = self.inner.lock().expect("allocator lock poisoned");
        inner.reserved.remove(&port);
        inner.by_terminal.retain(|_, assigned| *assigned != port);
    }

    /// Assign a port to a terminal key.
    ///
    /// Idempotent per key: a second call returns the already-assigned port
    /// even when a different explicit port is requested. An explicit port is
    /// validated and reserved; otherwise a fresh port is allocated.
    pub fn assign_port_to_terminal(&self, key: &str, port: Option<u16>) -> Result<u16> {
        {
            let inner = self.inner.lock().expect("allocator lock poisoned");
            if let Some(existing) = inner.by_terminal.get(key) {
                return Ok(*existing);
            }
        }

        let assigned = match port {
            Some(explicit) => {
                self.reserve_port(explicit)?;
                explicit
            }
            None => self.get_available_port()?,
        };

        let mut inner = self.inner.lock().expect("allocator lock poisoned");
        // A racing call may have assigned the key while we reserved; the
        // earlier assignment wins and ours is rolled back.
        if let Some(existing) = inner.by_terminal.get(key) {
            let existing = *existing;
            inner.reserved.remove(&assigned);
            return Ok(existing);
        }
        inner.by_terminal.insert(key.to_string(), assigned);
        debug!(terminal_key = %key, port = assigned, "assigned port to terminal");
        Ok(assigned)
    }

    /// Port currently assigned to a terminal key, if any.
    pub fn port_for_terminal(&self, key: &str) -> Option<u16> {
        let inner = self.inner.lock().expect("allocator lock poisoned");
        inner.by_terminal.get(key).copied()
    }

    /// Release whatever port a terminal key holds. Idempotent.
    pub fn release_terminal_ports(&self, key: &str) {
        let mut inner = self.inner.lock().expect("allocator lock poisoned");
        if let Some(port) = inner.by_terminal.remove(key) {
            inner.reserved.remove(&port);
            debug!(terminal_key = %key, port, "released terminal port");
        }
    }

    /// True when `port` is in range, not locally reserved, and not claimed by
    /// any live instance runtime (when wired to a store).
    pub fn is_port_available(&self, port: u16) -> bool {
        let inner = self.inner.lock().expect("allocator lock poisoned");
        Self::in_range(port) && self.is_free_locked(&inner, port)
    }

    fn in_range(port: u16) -> bool {
        port >= PORT_RANGE_START
    }

    fn is_free_locked(&self, inner: &AllocatorInner, port: u16) -> bool {
        if inner.reserved.contains(&port) {
            return false;
        }
        if let Some(store) = &self.store {
            let claimed = store
                .get_all()
                .iter()
                .any(|record| record.runtime.port == Some(port));
            if claimed {
                return false;
            }
        }
        true
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        PortAllocator::new()
    }
}
