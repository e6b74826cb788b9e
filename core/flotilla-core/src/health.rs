//! Background health monitoring with failure-threshold transitions.
//!
//! One worker thread polls each monitored instance at a fixed interval. A
//! probe failure increments a per-instance counter; at the threshold the
//! instance is moved from `connected` to `error` (and only from `connected` —
//! a disconnected instance never becomes `error` no matter how many probes
//! fail). A success resets the counter and recovers an `error` instance back
//! to `connected`.
//!
//! `poll_once` holds the whole tick logic and is public so tests (and
//! embedders with their own scheduler) can drive it without threads; the
//! worker threads are a thin timer around it. Stopping the monitor sets the
//! worker's stop flag and joins it, so a disposed monitor never mutates
//! state afterwards.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::ClientFactory;
use crate::store::InstanceStore;
use crate::types::{InstanceHealth, InstanceState};

/// Consecutive failures before a `connected` instance is marked `error`.
pub const FAILURE_THRESHOLD: u32 = 3;
/// Error message recorded when the threshold is reached.
pub const FAILURE_MESSAGE: &str = "Health check failed 3 consecutive times";
/// Default polling interval.
const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;
/// Stop-flag check granularity while sleeping between ticks.
const SLEEP_SLICE_MS: u64 = 50;

struct Worker {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct MonitorShared {
    store: Arc<InstanceStore>,
    clients: Arc<dyn ClientFactory>,
    failure_counts: Mutex<HashMap<String, u32>>,
}

/// Per-instance background poller applying failure-threshold transitions.
pub struct HealthMonitor {
    shared: Arc<MonitorShared>,
    interval: Duration,
    workers: Arc<Mutex<HashMap<String, Worker>>>,
}

impl HealthMonitor {
    pub fn new(store: Arc<InstanceStore>, clients: Arc<dyn ClientFactory>) -> Self {
        Self::with_interval(store, clients, Duration::from_millis(DEFAULT_POLL_INTERVAL_MS))
    }

    pub fn with_interval(
        store: Arc<InstanceStore>,
        clients: Arc<dyn ClientFactory>,
        interval: Duration,
    ) -> Self {
        HealthMonitor {
            shared: Arc::new(MonitorShared {
                store,
                clients,
                failure_counts: Mutex::new(HashMap::new()),
            }),
            interval,
            workers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Begin periodic checking for an instance.
    ///
    /// No-op when the instance is unknown, currently in a transient state
    /// (`spawning`/`stopping`), or already being polled.
    pub fn start(&self, id: &str) {
        let Some(record) = self.shared.store.get(id) else {
            debug!(instance_id = %id, "not starting health monitor: unknown instance");
            return;
        };
        if record.state.is_transient() {
            debug!(
                instance_id = %id,
                state = %record.state,
                "not starting health monitor: transient state"
            );
            return;
        }

        let mut workers = self.workers.lock().expect("monitor lock poisoned");
        if workers.contains_key(id) {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::clone(&self.shared);
        let interval = self.interval;
        let instance_id = id.to_string();
        let stop_flag = Arc::clone(&stop);
        let worker_map = Arc::clone(&self.workers);

        let handle = std::thread::spawn(move || {
            while !stop_flag.load(Ordering::SeqCst) {
                if !poll_once(&shared, &instance_id) {
                    // The instance was removed from the store; retire this
                    // worker rather than ticking against a ghost forever.
                    debug!(instance_id = %instance_id, "instance removed; health worker retiring");
                    worker_map
                        .lock()
                        .expect("monitor lock poisoned")
                        .remove(&instance_id);
                    shared
                        .failure_counts
                        .lock()
                        .expect("monitor lock poisoned")
                        .remove(&instance_id);
                    return;
                }
                // Sleep in slices so stop() is observed promptly.
                let mut slept = Duration::ZERO;
                while slept < interval && !stop_flag.load(Ordering::SeqCst) {
                    let slice = Duration::from_millis(SLEEP_SLICE_MS).min(interval - slept);
                    std::thread::sleep(slice);
                    slept += slice;
                }
            }
        });

        workers.insert(id.to_string(), Worker { stop, handle });
        info!(instance_id = %id, "health monitor started");
    }

    /// Run one probe cycle for an instance, outside of any worker thread.
    pub fn poll_once(&self, id: &str) {
        poll_once(&self.shared, id);
    }

    /// Consecutive-failure count for an instance (0 when unknown).
    pub fn failure_count(&self, id: &str) -> u32 {
        self.shared
            .failure_counts
            .lock()
            .expect("monitor lock poisoned")
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    /// Cancel polling for an instance and reset its failure counter.
    pub fn stop(&self, id: &str) {
        let worker = self.workers.lock().expect("monitor lock poisoned").remove(id);
        if let Some(worker) = worker {
            worker.stop.store(true, Ordering::SeqCst);
            if worker.handle.join().is_err() {
                warn!(instance_id = %id, "health worker panicked");
            }
            info!(instance_id = %id, "health monitor stopped");
        }
        self.shared
            .failure_counts
            .lock()
            .expect("monitor lock poisoned")
            .remove(id);
    }

    /// Cancel all polling and reset every failure counter.
    pub fn stop_all(&self) {
        let ids: Vec<String> = self
            .workers
            .lock()
            .expect("monitor lock poisoned")
            .keys()
            .cloned()
            .collect();
        for id in ids {
            self.stop(&id);
        }
    }

    pub fn dispose(&self) {
        self.stop_all();
    }

    /// Whether an instance currently has a polling worker.
    pub fn is_monitoring(&self, id: &str) -> bool {
        self.workers
            .lock()
            .expect("monitor lock poisoned")
            .contains_key(id)
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop_all();
    }
}

/// One probe cycle. Returns `false` when the instance no longer exists and
/// polling should cease.
fn poll_once(shared: &MonitorShared, id: &str) -> bool {
    // Skip silently when the instance has no port yet or exposes no
    // control API at all.
    let Some(record) = shared.store.get(id) else {
        return false;
    };
    if !record.config.http_enabled {
        return true;
    }
    let Some(port) = record.runtime.port else {
        return true;
    };

    let client = shared.clients.client_for(id, port);
    match client.check_health() {
        Ok(health) => {
            shared
                .failure_counts
                .lock()
                .expect("monitor lock poisoned")
                .remove(id);

            let Some(mut record) = shared.store.get(id) else {
                return false;
            };
            if record.state == InstanceState::Error {
                info!(instance_id = %id, "instance recovered");
                record.state = InstanceState::Connected;
                record.error = None;
            }
            record.merge_health(&health);
            shared.store.upsert(record);
            true
        }
        Err(err) => {
            let failures = {
                let mut counts = shared
                    .failure_counts
                    .lock()
                    .expect("monitor lock poisoned");
                let entry = counts.entry(id.to_string()).or_insert(0);
                *entry += 1;
                *entry
            };
            debug!(instance_id = %id, failures, error = %err, "health probe failed");

            let Some(mut record) = shared.store.get(id) else {
                return false;
            };
            record.merge_health(&InstanceHealth {
                ok: false,
                ..InstanceHealth::default()
            });
            // The error transition only ever fires from `connected`.
            if failures >= FAILURE_THRESHOLD && record.state == InstanceState::Connected {
                warn!(instance_id = %id, failures, "failure threshold reached");
                record.state = InstanceState::Error;
                record.error = Some(FAILURE_MESSAGE.to_string());
            }
            shared.store.upsert(record);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ControlClient;
    use crate::error::{EngineError, Result};
    use crate::types::{InstanceConfig, InstanceRecord};

    /// Factory whose health answer can be flipped at runtime.
    struct ToggleFactory {
        healthy: Arc<AtomicBool>,
    }

    struct ToggleClient {
        healthy: Arc<AtomicBool>,
        port: u16,
    }

    impl ControlClient for ToggleClient {
        fn base_url(&self) -> String {
            format!("http://127.0.0.1:{}", self.port)
        }

        fn check_health(&self) -> Result<InstanceHealth> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(InstanceHealth {
                    ok: true,
                    version: Some("1.0.0".to_string()),
                    ..InstanceHealth::default()
                })
            } else {
                Err(EngineError::ProbeFailed {
                    port: self.port,
                    details: "connection refused".to_string(),
                })
            }
        }

        fn append_prompt(&self, _prompt: &str) -> Result<()> {
            Ok(())
        }
    }

    impl ClientFactory for ToggleFactory {
        fn client_for(&self, _instance_id: &str, port: u16) -> Arc<dyn ControlClient> {
            Arc::new(ToggleClient {
                healthy: Arc::clone(&self.healthy),
                port,
            })
        }
    }

    fn setup(state: InstanceState, port: Option<u16>) -> (Arc<InstanceStore>, HealthMonitor, Arc<AtomicBool>) {
        let store = Arc::new(InstanceStore::new());
        let mut record = InstanceRecord::new(InstanceConfig::new("i1", "claude"));
        record.state = state;
        record.runtime.port = port;
        store.upsert(record);

        let healthy = Arc::new(AtomicBool::new(true));
        let factory = Arc::new(ToggleFactory {
            healthy: Arc::clone(&healthy),
        });
        let monitor = HealthMonitor::with_interval(
            Arc::clone(&store),
            factory,
            Duration::from_millis(10),
        );
        (store, monitor, healthy)
    }

    #[test]
    fn test_three_failures_transition_connected_to_error() {
        let (store, monitor, healthy) = setup(InstanceState::Connected, Some(20000));
        healthy.store(false, Ordering::SeqCst);

        monitor.poll_once("i1");
        monitor.poll_once("i1");
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Connected);

        monitor.poll_once("i1");
        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Error);
        assert_eq!(
            record.error.as_deref(),
            Some("Health check failed 3 consecutive times")
        );
        assert!(!record.health.as_ref().unwrap().ok);
    }

    #[test]
    fn test_success_recovers_error_instance() {
        let (store, monitor, healthy) = setup(InstanceState::Connected, Some(20000));
        healthy.store(false, Ordering::SeqCst);
        for _ in 0..3 {
            monitor.poll_once("i1");
        }
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Error);

        healthy.store(true, Ordering::SeqCst);
        monitor.poll_once("i1");

        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Connected);
        assert!(record.error.is_none());
        assert!(record.health.as_ref().unwrap().ok);
        assert_eq!(monitor.failure_count("i1"), 0);
    }

    #[test]
    fn test_disconnected_instance_never_becomes_error() {
        let (store, monitor, healthy) = setup(InstanceState::Disconnected, Some(20000));
        healthy.store(false, Ordering::SeqCst);

        for _ in 0..10 {
            monitor.poll_once("i1");
        }
        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Disconnected);
        assert!(record.error.is_none());
        // Failures are still counted and health is still merged.
        assert_eq!(monitor.failure_count("i1"), 10);
        assert!(!record.health.as_ref().unwrap().ok);
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let (_store, monitor, healthy) = setup(InstanceState::Connected, Some(20000));
        healthy.store(false, Ordering::SeqCst);
        monitor.poll_once("i1");
        monitor.poll_once("i1");
        assert_eq!(monitor.failure_count("i1"), 2);

        healthy.store(true, Ordering::SeqCst);
        monitor.poll_once("i1");
        assert_eq!(monitor.failure_count("i1"), 0);

        // Two fresh failures stay below the threshold again.
        healthy.store(false, Ordering::SeqCst);
        monitor.poll_once("i1");
        monitor.poll_once("i1");
        assert_eq!(monitor.failure_count("i1"), 2);
    }

    #[test]
    fn test_poll_skips_removed_instance() {
        let (store, monitor, _healthy) = setup(InstanceState::Connected, Some(20000));
        store.remove("i1");
        monitor.poll_once("i1");
        assert_eq!(monitor.failure_count("i1"), 0);
    }

    #[test]
    fn test_poll_skips_http_disabled_instance() {
        let (store, monitor, healthy) = setup(InstanceState::Connected, Some(20000));
        let mut record = store.get("i1").unwrap();
        record.config.http_enabled = false;
        store.upsert(record);

        healthy.store(false, Ordering::SeqCst);
        for _ in 0..5 {
            monitor.poll_once("i1");
        }
        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Connected);
        assert!(record.health.is_none());
        assert_eq!(monitor.failure_count("i1"), 0);
    }

    #[test]
    fn test_worker_retires_when_instance_removed() {
        let (store, monitor, _healthy) = setup(InstanceState::Connected, Some(20000));
        monitor.start("i1");
        assert!(monitor.is_monitoring("i1"));

        store.remove("i1");

        // The worker observes the missing record on its next tick and
        // removes itself from the worker map.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while monitor.is_monitoring("i1") {
            assert!(
                std::time::Instant::now() < deadline,
                "worker did not retire after instance removal"
            );
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(monitor.failure_count("i1"), 0);
    }

    #[test]
    fn test_poll_skips_instance_without_port() {
        let (store, monitor, healthy) = setup(InstanceState::Connected, None);
        healthy.store(false, Ordering::SeqCst);
        monitor.poll_once("i1");
        assert_eq!(monitor.failure_count("i1"), 0);
        assert!(store.get("i1").unwrap().health.is_none());
    }

    #[test]
    fn test_health_success_merges_fields() {
        let (store, monitor, _healthy) = setup(InstanceState::Connected, Some(20000));

        // Seed unrelated health fields that a later probe must not erase.
        let mut record = store.get("i1").unwrap();
        record.merge_health(&InstanceHealth {
            ok: true,
            session_title: Some("refactor".to_string()),
            ..InstanceHealth::default()
        });
        store.upsert(record);

        monitor.poll_once("i1");

        let health = store.get("i1").unwrap().health.unwrap();
        assert!(health.ok);
        assert_eq!(health.session_title.as_deref(), Some("refactor"));
        assert_eq!(health.version.as_deref(), Some("1.0.0"));
    }

    #[test]
    fn test_start_is_idempotent() {
        let (_store, monitor, _healthy) = setup(InstanceState::Connected, Some(20000));
        monitor.start("i1");
        monitor.start("i1");
        assert!(monitor.is_monitoring("i1"));
        monitor.stop("i1");
        assert!(!monitor.is_monitoring("i1"));
    }

    #[test]
    fn test_start_refuses_transient_states() {
        let (_store, monitor, _healthy) = setup(InstanceState::Spawning, Some(20000));
        monitor.start("i1");
        assert!(!monitor.is_monitoring("i1"));
    }

    #[test]
    fn test_start_unknown_instance_is_noop() {
        let (_store, monitor, _healthy) = setup(InstanceState::Connected, Some(20000));
        monitor.start("ghost");
        assert!(!monitor.is_monitoring("ghost"));
    }

    #[test]
    fn test_stop_resets_failure_counter() {
        let (_store, monitor, healthy) = setup(InstanceState::Connected, Some(20000));
        healthy.store(false, Ordering::SeqCst);
        monitor.poll_once("i1");
        assert_eq!(monitor.failure_count("i1"), 1);
        monitor.stop("i1");
        assert_eq!(monitor.failure_count("i1"), 0);
    }

    #[test]
    fn test_background_worker_polls_and_stops() {
        let (store, monitor, _healthy) = setup(InstanceState::Connected, Some(20000));
        monitor.start("i1");

        // Wait for at least one tick to land.
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            if store.get("i1").unwrap().health.is_some() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no tick observed");
            std::thread::sleep(Duration::from_millis(5));
        }

        monitor.dispose();
        assert!(!monitor.is_monitoring("i1"));
    }
}
