//! Four-tier connection resolution.
//!
//! `resolve` produces a verified-healthy port for an instance, trying
//! strategies in order and degrading gracefully:
//!
//! 1. **Stored endpoint** — the runtime port, falling back to the configured
//!    preferred port.
//! 2. **Health verification** — probe the tier-1 port; success persists
//!    runtime + state and short-circuits the remaining tiers.
//! 3. **Process discovery** — ask the discovery collaborator for candidate
//!    endpoints and pick the one whose workspace path matches.
//! 4. **Auto-spawn** — when a controller is wired in, spawn the instance and
//!    verify the port it was assigned.
//!
//! Resolution never throws outward: tier-local failures are caught, logged,
//! and treated as "this tier failed". Only the final `None` signals total
//! failure.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::controller::SpawnCapability;
use crate::error::Result;
use crate::paths::paths_match;
use crate::store::InstanceStore;
use crate::types::InstanceState;

/// One candidate endpoint reported by process discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredInstance {
    pub pid: u32,
    pub port: u16,
    pub workspace_path: Option<String>,
}

/// External process enumeration + health pre-filtering; opaque to the
/// resolver.
pub trait InstanceDiscovery: Send + Sync {
    fn discover_instances(&self) -> Result<Vec<DiscoveredInstance>>;
}

/// Supplies the host's open workspace paths, used as the fallback target when
/// an instance has no configured workspace.
pub trait WorkspaceProvider: Send + Sync {
    fn open_workspaces(&self) -> Vec<String>;
}

/// Resolves a verified-healthy port for instances in the store.
pub struct ConnectionResolver {
    store: Arc<InstanceStore>,
    clients: Arc<dyn ClientFactory>,
    discovery: Option<Arc<dyn InstanceDiscovery>>,
    workspaces: Option<Arc<dyn WorkspaceProvider>>,
    // Set after construction to break the controller↔resolver cycle.
    controller: Mutex<Option<Arc<dyn SpawnCapability>>>,
}

impl ConnectionResolver {
    pub fn new(
        store: Arc<InstanceStore>,
        clients: Arc<dyn ClientFactory>,
        discovery: Option<Arc<dyn InstanceDiscovery>>,
        workspaces: Option<Arc<dyn WorkspaceProvider>>,
    ) -> Self {
        ConnectionResolver {
            store,
            clients,
            discovery,
            workspaces,
            controller: Mutex::new(None),
        }
    }

    /// Wire in the controller that tier 4 delegates spawning to.
    pub fn set_controller(&self, controller: Arc<dyn SpawnCapability>) {
        *self.controller.lock().expect("resolver lock poisoned") = Some(controller);
    }

    /// Resolve a verified-healthy port for `instance_id`.
    ///
    /// Returns `None` when every tier failed; never propagates an error.
    pub fn resolve(&self, instance_id: &str) -> Option<u16> {
        let Some(record) = self.store.get(instance_id) else {
            warn!(instance_id = %instance_id, "resolve requested for unknown instance");
            return None;
        };
        if !record.config.http_enabled {
            debug!(instance_id = %instance_id, "instance has no control API; nothing to resolve");
            return None;
        }

        // Tier 1: stored endpoint (runtime port, else preferred port).
        let stored_port = record.runtime.port.or(record.config.preferred_port);

        // Tier 2: verify the stored endpoint and short-circuit on success.
        if let Some(port) = stored_port {
            if self.verify_and_persist(instance_id, port, record.runtime.pid) {
                info!(instance_id = %instance_id, port, tier = 1, "resolved via stored endpoint");
                return Some(port);
            }
            debug!(instance_id = %instance_id, port, "stored endpoint failed health check");
        }

        // Tier 3: process discovery.
        if let Some(port) = self.try_discovery(instance_id) {
            info!(instance_id = %instance_id, port, tier = 3, "resolved via discovery");
            return Some(port);
        }

        // Tier 4: auto-spawn through the controller, when configured.
        if let Some(port) = self.try_spawn(instance_id) {
            info!(instance_id = %instance_id, port, tier = 4, "resolved via auto-spawn");
            return Some(port);
        }

        warn!(instance_id = %instance_id, "all resolution tiers failed");
        None
    }

    fn try_discovery(&self, instance_id: &str) -> Option<u16> {
        let discovery = self.discovery.as_ref()?;

        let candidates = match discovery.discover_instances() {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(instance_id = %instance_id, error = %err, "discovery failed");
                return None;
            }
        };
        if candidates.is_empty() {
            debug!(instance_id = %instance_id, "discovery returned no candidates");
            return None;
        }

        let record = self.store.get(instance_id)?;
        let target = record.config.workspace_path.clone().or_else(|| {
            self.workspaces
                .as_ref()
                .and_then(|provider| provider.open_workspaces().into_iter().next())
        });

        let selected = match &target {
            None => candidates.first().cloned(),
            Some(target_path) => candidates
                .iter()
                .find(|candidate| {
                    candidate
                        .workspace_path
                        .as_deref()
                        .is_some_and(|path| paths_match(path, target_path))
                })
                .cloned(),
        };

        let candidate = selected?;
        debug!(
            instance_id = %instance_id,
            pid = candidate.pid,
            port = candidate.port,
            "discovery selected candidate"
        );

        if self.verify_and_persist(instance_id, candidate.port, Some(candidate.pid)) {
            Some(candidate.port)
        } else {
            None
        }
    }

    fn try_spawn(&self, instance_id: &str) -> Option<u16> {
        let controller = {
            let guard = self.controller.lock().expect("resolver lock poisoned");
            guard.clone()
        }?;

        let preferred = self
            .store
            .get(instance_id)
            .and_then(|record| record.config.preferred_port);

        if let Err(err) = controller.spawn_for_resolution(instance_id, preferred) {
            warn!(instance_id = %instance_id, error = %err, "auto-spawn failed");
            return None;
        }

        // The controller records the assigned port into runtime; re-read it.
        let runtime = self.store.get(instance_id)?.runtime;
        let Some(port) = runtime.port else {
            warn!(instance_id = %instance_id, "spawn completed without an assigned port");
            return None;
        };

        if self.verify_and_persist(instance_id, port, runtime.pid) {
            Some(port)
        } else {
            None
        }
    }

    /// Probe `port`; on success persist runtime facts, mark the instance
    /// `connected`, and clear any error. Returns whether the probe passed.
    fn verify_and_persist(&self, instance_id: &str, port: u16, pid: Option<u32>) -> bool {
        let client = self.clients.client_for(instance_id, port);
        let health = match client.check_health() {
            Ok(health) => health,
            Err(err) => {
                debug!(instance_id = %instance_id, port, error = %err, "health probe failed");
                return false;
            }
        };

        let Some(mut record) = self.store.get(instance_id) else {
            return false;
        };
        record.runtime.port = Some(port);
        if pid.is_some() {
            record.runtime.pid = pid;
        }
        record.runtime.last_seen_at = Some(Utc::now());
        record.state = InstanceState::Connected;
        record.error = None;
        record.merge_health(&health);
        self.store.upsert(record);
        true
    }
}

/// Capability interface the controller consumes for its `resolve` operation.
pub trait ResolveCapability: Send + Sync {
    fn resolve_port(&self, instance_id: &str) -> Option<u16>;
}

impl ResolveCapability for ConnectionResolver {
    fn resolve_port(&self, instance_id: &str) -> Option<u16> {
        self.resolve(instance_id)
    }
}
