//! Instance controller: drives spawn/connect/disconnect/kill and the
//! lifecycle state machine.
//!
//! The controller is the only component that talks to the process spawner.
//! Every collaborator failure is caught, recorded onto the instance record
//! (`state = error`, message in `error`), logged with the instance id and
//! operation name, and then rethrown so the caller can react.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::error::{EngineError, Result};
use crate::ports::PortAllocator;
use crate::resolver::ResolveCapability;
use crate::store::InstanceStore;
use crate::types::{InstanceConfig, InstanceRecord, InstanceState};

/// Terminal keys are derived from the instance id with this prefix.
const TERMINAL_KEY_PREFIX: &str = "flotilla-term-";
/// Environment variable carrying the assigned control-API port.
pub const PORT_ENV: &str = "FLOTILLA_PORT";
/// Environment variable identifying who launched the process.
pub const CALLER_ENV: &str = "FLOTILLA_CALLER";
const CALLER_VALUE: &str = "flotilla";

/// Everything the spawner collaborator needs to create a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnRequest {
    pub terminal_key: String,
    /// Fully assembled, shell-escaped launch command.
    pub command: String,
    pub port: u16,
    pub workspace_path: Option<String>,
    pub env: Vec<(String, String)>,
}

/// Result of a successful spawn.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpawnedProcess {
    pub pid: Option<u32>,
}

/// Process creation/termination, keyed by terminal key.
pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess>;
    fn kill(&self, terminal_key: &str, pid: Option<u32>) -> Result<()>;
}

/// Optional overrides for a spawn. Fields left `None` keep whatever the
/// instance config already holds.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub preferred_port: Option<u16>,
    pub workspace_path: Option<String>,
}

/// Capability interface the resolver consumes for tier-4 auto-spawn.
pub trait SpawnCapability: Send + Sync {
    fn spawn_for_resolution(&self, instance_id: &str, preferred_port: Option<u16>) -> Result<()>;
}

/// Drives the instance state machine against the store.
pub struct InstanceController {
    store: Arc<InstanceStore>,
    ports: Arc<PortAllocator>,
    spawner: Arc<dyn ProcessSpawner>,
    /// Base command used when creating a record on the fly.
    default_command: String,
    // Set after construction to break the controller↔resolver cycle.
    resolver: Mutex<Option<Arc<dyn ResolveCapability>>>,
}

impl InstanceController {
    pub fn new(
        store: Arc<InstanceStore>,
        ports: Arc<PortAllocator>,
        spawner: Arc<dyn ProcessSpawner>,
        default_command: impl Into<String>,
    ) -> Self {
        InstanceController {
            store,
            ports,
            spawner,
            default_command: default_command.into(),
            resolver: Mutex::new(None),
        }
    }

    /// Wire in the resolver that `resolve` delegates to.
    pub fn set_resolver(&self, resolver: Arc<dyn ResolveCapability>) {
        *self.resolver.lock().expect("controller lock poisoned") = Some(resolver);
    }

    /// Spawn the instance process, allocating a port under its terminal key.
    ///
    /// Returns the assigned port. On failure the record is put into the
    /// `error` state with the message recorded, and the error is rethrown.
    pub fn spawn(&self, id: &str, opts: Option<SpawnOptions>) -> Result<u16> {
        let opts = opts.unwrap_or_default();
        let mut record = self.fetch_or_create(id);

        // Merge explicit options only; absent options keep the config as-is.
        if let Some(command) = opts.command {
            record.config.command = command;
        }
        if let Some(args) = opts.args {
            record.config.args = args;
        }
        if let Some(port) = opts.preferred_port {
            record.config.preferred_port = Some(port);
        }
        if let Some(workspace) = opts.workspace_path {
            record.config.workspace_path = Some(workspace);
        }

        let terminal_key = record
            .runtime
            .terminal_key
            .clone()
            .unwrap_or_else(|| terminal_key_for(id));
        record.runtime.terminal_key = Some(terminal_key.clone());
        record.state = InstanceState::Spawning;
        let config = record.config.clone();
        self.store.upsert(record);

        let result = self.spawn_inner(id, &terminal_key, &config);
        match result {
            Ok((port, pid)) => {
                let mut record = self.fetch_or_create(id);
                record.state = InstanceState::Connected;
                record.runtime.port = Some(port);
                record.runtime.pid = pid;
                record.runtime.last_seen_at = Some(Utc::now());
                record.error = None;
                self.store.upsert(record);
                info!(instance_id = %id, port, pid = ?pid, "instance spawned");
                Ok(port)
            }
            Err(err) => Err(self.fail(id, "spawn", err)),
        }
    }

    fn spawn_inner(
        &self,
        id: &str,
        terminal_key: &str,
        config: &InstanceConfig,
    ) -> Result<(u16, Option<u32>)> {
        let port = self
            .ports
            .assign_port_to_terminal(terminal_key, config.preferred_port)?;

        let command = build_launch_command(&config.command, &config.args);
        let request = SpawnRequest {
            terminal_key: terminal_key.to_string(),
            command,
            port,
            workspace_path: config.workspace_path.clone(),
            env: vec![
                (PORT_ENV.to_string(), port.to_string()),
                (CALLER_ENV.to_string(), CALLER_VALUE.to_string()),
            ],
        };

        let spawned = self.spawner.spawn(&request).map_err(|e| match e {
            err @ EngineError::SpawnFailed { .. } => err,
            other => EngineError::SpawnFailed {
                id: id.to_string(),
                details: other.to_string(),
            },
        })?;
        Ok((port, spawned.pid))
    }

    /// Attach to an already-running instance on `port`.
    pub fn connect(&self, id: &str, port: u16) -> Result<u16> {
        let mut record = self.fetch_or_create(id);
        let terminal_key = record
            .runtime
            .terminal_key
            .clone()
            .unwrap_or_else(|| terminal_key_for(id));
        record.runtime.terminal_key = Some(terminal_key.clone());
        record.state = InstanceState::Connecting;
        self.store.upsert(record);

        // Idempotent per key: an existing assignment wins over the request.
        let assigned = match self.ports.assign_port_to_terminal(&terminal_key, Some(port)) {
            Ok(assigned) => assigned,
            Err(err) => return Err(self.fail(id, "connect", err)),
        };

        let mut record = self.fetch_or_create(id);
        record.state = InstanceState::Connected;
        record.runtime.port = Some(assigned);
        record.runtime.last_seen_at = Some(Utc::now());
        record.error = None;
        self.store.upsert(record);
        info!(instance_id = %id, port = assigned, "instance connected");
        Ok(assigned)
    }

    /// Soft transition to `disconnected`; the underlying process is left
    /// untouched.
    pub fn disconnect(&self, id: &str) -> Result<()> {
        let mut record = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        record.state = InstanceState::Disconnected;
        self.store.upsert(record);
        info!(instance_id = %id, "instance disconnected");
        Ok(())
    }

    /// Terminate the instance process and release its resources.
    pub fn kill(&self, id: &str) -> Result<()> {
        let mut record = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        record.state = InstanceState::Stopping;
        let terminal_key = record.runtime.terminal_key.clone();
        let pid = record.runtime.pid;
        let port = record.runtime.port;
        self.store.upsert(record);

        // A record adopted via discovery carries a pid but no terminal key;
        // it still owns a real process that must be signalled.
        if terminal_key.is_some() || pid.is_some() {
            let kill_key = terminal_key
                .clone()
                .unwrap_or_else(|| terminal_key_for(id));
            if let Err(err) = self.spawner.kill(&kill_key, pid) {
                return Err(self.fail(id, "kill", err));
            }
        }
        if let Some(key) = &terminal_key {
            self.ports.release_terminal_ports(key);
        }
        if let Some(port) = port {
            self.ports.release_port(port);
        }

        let mut record = self.fetch_or_create(id);
        record.state = InstanceState::Disconnected;
        record.runtime.pid = None;
        record.runtime.port = None;
        self.store.upsert(record);
        info!(instance_id = %id, "instance killed");
        Ok(())
    }

    /// Resolve a connection for the instance.
    ///
    /// Delegates to the resolver when one is wired in; otherwise reports the
    /// already-stored port without any multi-tier search.
    pub fn resolve(&self, id: &str) -> Result<Option<u16>> {
        let mut record = self
            .store
            .get(id)
            .ok_or_else(|| EngineError::InstanceNotFound(id.to_string()))?;
        record.state = InstanceState::Resolving;
        self.store.upsert(record);

        let resolver = {
            let guard = self.resolver.lock().expect("controller lock poisoned");
            guard.clone()
        };

        match resolver {
            Some(resolver) => match resolver.resolve_port(id) {
                Some(port) => {
                    // The resolver already persisted runtime + connected state.
                    info!(instance_id = %id, port, "resolution succeeded");
                    Ok(Some(port))
                }
                None => {
                    warn!(instance_id = %id, operation = "resolve", "resolution failed");
                    let mut record = self.fetch_or_create(id);
                    record.state = InstanceState::Error;
                    record.error = Some("Could not resolve a healthy endpoint".to_string());
                    self.store.upsert(record);
                    Ok(None)
                }
            },
            None => {
                let mut record = self.fetch_or_create(id);
                let port = record.runtime.port;
                record.state = if port.is_some() {
                    InstanceState::Connected
                } else {
                    InstanceState::Disconnected
                };
                self.store.upsert(record);
                Ok(port)
            }
        }
    }

    /// Shutdown: force-kill every tracked instance, release ports, and mark
    /// everything disconnected. Never fails.
    pub fn dispose(&self) {
        for record in self.store.get_all() {
            let id = record.id().to_string();
            if record.runtime.terminal_key.is_some() || record.runtime.pid.is_some() {
                let kill_key = record
                    .runtime
                    .terminal_key
                    .clone()
                    .unwrap_or_else(|| terminal_key_for(&id));
                if let Err(err) = self.spawner.kill(&kill_key, record.runtime.pid) {
                    warn!(instance_id = %id, error = %err, "kill during dispose failed");
                }
            }
            if let Some(key) = &record.runtime.terminal_key {
                self.ports.release_terminal_ports(key);
            }
            if let Some(port) = record.runtime.port {
                self.ports.release_port(port);
            }

            let mut record = record;
            record.state = InstanceState::Disconnected;
            record.runtime.pid = None;
            record.runtime.port = None;
            self.store.upsert(record);
        }
        info!("controller disposed");
    }

    fn fetch_or_create(&self, id: &str) -> InstanceRecord {
        self.store.get(id).unwrap_or_else(|| {
            InstanceRecord::new(InstanceConfig::new(id, self.default_command.clone()))
        })
    }

    /// Record the failure on the instance and return the error for rethrow.
    fn fail(&self, id: &str, operation: &str, err: EngineError) -> EngineError {
        error!(instance_id = %id, operation, error = %err, "controller operation failed");
        let mut record = self.fetch_or_create(id);
        record.state = InstanceState::Error;
        record.error = Some(err.to_string());
        self.store.upsert(record);
        err
    }
}

impl SpawnCapability for InstanceController {
    fn spawn_for_resolution(&self, instance_id: &str, preferred_port: Option<u16>) -> Result<()> {
        let opts = SpawnOptions {
            preferred_port,
            ..SpawnOptions::default()
        };
        self.spawn(instance_id, Some(opts)).map(|_| ())
    }
}

/// Derive the stable terminal key for an instance id.
pub fn terminal_key_for(id: &str) -> String {
    format!("{TERMINAL_KEY_PREFIX}{id}")
}

/// Append args to the base command, shell-escaping anything outside
/// `[A-Za-z0-9_./:@-]`.
pub fn build_launch_command(command: &str, args: &[String]) -> String {
    let mut parts = vec![command.to_string()];
    parts.extend(args.iter().map(|arg| shell_escape(arg)));
    parts.join(" ")
}

fn is_shell_safe_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | ':' | '@' | '-')
}

fn shell_escape(arg: &str) -> String {
    if !arg.is_empty() && arg.chars().all(is_shell_safe_char) {
        arg.to_string()
    } else {
        // Single-quote, escaping embedded single quotes.
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Spawner that records requests and answers with a fixed pid.
    #[derive(Default)]
    struct RecordingSpawner {
        requests: Mutex<Vec<SpawnRequest>>,
        kills: Mutex<Vec<(String, Option<u32>)>>,
        fail_spawn: bool,
        fail_kill: bool,
    }

    impl ProcessSpawner for RecordingSpawner {
        fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
            if self.fail_spawn {
                return Err(EngineError::SpawnFailed {
                    id: request.terminal_key.clone(),
                    details: "exec failed".to_string(),
                });
            }
            self.requests.lock().unwrap().push(request.clone());
            Ok(SpawnedProcess { pid: Some(4321) })
        }

        fn kill(&self, terminal_key: &str, pid: Option<u32>) -> Result<()> {
            if self.fail_kill {
                return Err(EngineError::KillFailed {
                    id: terminal_key.to_string(),
                    details: "no such process".to_string(),
                });
            }
            self.kills
                .lock()
                .unwrap()
                .push((terminal_key.to_string(), pid));
            Ok(())
        }
    }

    fn controller_with(
        spawner: Arc<RecordingSpawner>,
    ) -> (Arc<InstanceStore>, Arc<PortAllocator>, InstanceController) {
        let store = Arc::new(InstanceStore::new());
        let ports = Arc::new(PortAllocator::new());
        let controller = InstanceController::new(
            Arc::clone(&store),
            Arc::clone(&ports),
            spawner,
            "claude",
        );
        (store, ports, controller)
    }

    #[test]
    fn test_spawn_creates_record_and_assigns_port() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, ports, controller) = controller_with(Arc::clone(&spawner));

        let port = controller.spawn("i1", None).unwrap();

        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Connected);
        assert_eq!(record.runtime.port, Some(port));
        assert_eq!(record.runtime.pid, Some(4321));
        assert_eq!(
            record.runtime.terminal_key.as_deref(),
            Some("flotilla-term-i1")
        );
        assert!(record.error.is_none());
        assert!(!ports.is_port_available(port));
    }

    #[test]
    fn test_spawn_injects_port_and_caller_env() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (_store, _ports, controller) = controller_with(Arc::clone(&spawner));

        let port = controller.spawn("i1", None).unwrap();

        let requests = spawner.requests.lock().unwrap();
        let request = &requests[0];
        assert!(request
            .env
            .contains(&(PORT_ENV.to_string(), port.to_string())));
        assert!(request
            .env
            .contains(&(CALLER_ENV.to_string(), "flotilla".to_string())));
    }

    #[test]
    fn test_spawn_uses_preferred_port() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (_store, _ports, controller) = controller_with(spawner);

        let opts = SpawnOptions {
            preferred_port: Some(20000),
            ..SpawnOptions::default()
        };
        assert_eq!(controller.spawn("i1", Some(opts)).unwrap(), 20000);
    }

    #[test]
    fn test_spawn_merges_only_explicit_options() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(spawner);

        let mut config = InstanceConfig::new("i1", "claude");
        config.args = vec!["--resume".to_string()];
        store.upsert(InstanceRecord::new(config));

        controller
            .spawn(
                "i1",
                Some(SpawnOptions {
                    preferred_port: Some(20001),
                    ..SpawnOptions::default()
                }),
            )
            .unwrap();

        let record = store.get("i1").unwrap();
        // Args untouched, preferred port merged.
        assert_eq!(record.config.args, vec!["--resume".to_string()]);
        assert_eq!(record.config.preferred_port, Some(20001));
        assert_eq!(record.config.command, "claude");
    }

    #[test]
    fn test_spawn_failure_records_error_and_rethrows() {
        let spawner = Arc::new(RecordingSpawner {
            fail_spawn: true,
            ..RecordingSpawner::default()
        });
        let (store, _ports, controller) = controller_with(spawner);

        let result = controller.spawn("i1", None);
        assert!(result.is_err());

        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Error);
        assert!(record.error.as_deref().unwrap().contains("exec failed"));
    }

    #[test]
    fn test_connect_assigns_given_port() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, ports, controller) = controller_with(spawner);

        assert_eq!(controller.connect("i1", 20000).unwrap(), 20000);
        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Connected);
        assert_eq!(record.runtime.port, Some(20000));
        assert!(!ports.is_port_available(20000));
    }

    #[test]
    fn test_connect_conflicting_port_errors_and_records() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, ports, controller) = controller_with(spawner);
        ports.reserve_port(20000).unwrap();

        let result = controller.connect("i1", 20000);
        assert!(matches!(result, Err(EngineError::PortInUse(20000))));
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Error);
    }

    #[test]
    fn test_disconnect_is_soft() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(Arc::clone(&spawner));

        controller.spawn("i1", None).unwrap();
        controller.disconnect("i1").unwrap();

        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Disconnected);
        // Process untouched: no kill was issued.
        assert!(spawner.kills.lock().unwrap().is_empty());
        // Runtime facts survive a soft disconnect.
        assert!(record.runtime.port.is_some());
    }

    #[test]
    fn test_kill_releases_port_and_clears_runtime() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, ports, controller) = controller_with(Arc::clone(&spawner));

        let port = controller.spawn("i1", None).unwrap();
        controller.kill("i1").unwrap();

        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Disconnected);
        assert!(record.runtime.pid.is_none());
        assert!(record.runtime.port.is_none());
        assert!(ports.is_port_available(port));

        let kills = spawner.kills.lock().unwrap();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0], ("flotilla-term-i1".to_string(), Some(4321)));
    }

    #[test]
    fn test_kill_adopted_instance_signals_by_pid() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(Arc::clone(&spawner));

        // Discovery adoption persists pid + port but never a terminal key.
        let mut record = InstanceRecord::new(InstanceConfig::new("adopted", "claude"));
        record.state = InstanceState::Connected;
        record.runtime.pid = Some(7777);
        record.runtime.port = Some(30000);
        store.upsert(record);

        controller.kill("adopted").unwrap();

        let kills = spawner.kills.lock().unwrap();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0], ("flotilla-term-adopted".to_string(), Some(7777)));
        drop(kills);

        let record = store.get("adopted").unwrap();
        assert_eq!(record.state, InstanceState::Disconnected);
        assert!(record.runtime.pid.is_none());
        assert!(record.runtime.port.is_none());
    }

    #[test]
    fn test_dispose_kills_adopted_instance() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(Arc::clone(&spawner));

        let mut record = InstanceRecord::new(InstanceConfig::new("adopted", "claude"));
        record.state = InstanceState::Connected;
        record.runtime.pid = Some(7777);
        record.runtime.port = Some(30000);
        store.upsert(record);

        controller.dispose();

        let kills = spawner.kills.lock().unwrap();
        assert_eq!(kills.len(), 1);
        assert_eq!(kills[0].1, Some(7777));
    }

    #[test]
    fn test_kill_without_process_facts_skips_spawner() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(Arc::clone(&spawner));
        store.upsert(InstanceRecord::new(InstanceConfig::new("i1", "claude")));

        controller.kill("i1").unwrap();
        assert!(spawner.kills.lock().unwrap().is_empty());
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Disconnected);
    }

    #[test]
    fn test_kill_failure_records_error_and_rethrows() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(Arc::clone(&spawner));
        controller.spawn("i1", None).unwrap();

        let failing = Arc::new(RecordingSpawner {
            fail_kill: true,
            ..RecordingSpawner::default()
        });
        let controller = InstanceController::new(
            Arc::clone(&store),
            Arc::new(PortAllocator::new()),
            failing,
            "claude",
        );

        assert!(controller.kill("i1").is_err());
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Error);
    }

    #[test]
    fn test_resolve_without_resolver_reports_stored_port() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(spawner);

        let mut record = InstanceRecord::new(InstanceConfig::new("i1", "claude"));
        record.runtime.port = Some(20000);
        store.upsert(record);

        assert_eq!(controller.resolve("i1").unwrap(), Some(20000));
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Connected);
    }

    #[test]
    fn test_resolve_without_resolver_or_port_is_disconnected() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(spawner);
        store.upsert(InstanceRecord::new(InstanceConfig::new("i1", "claude")));

        assert_eq!(controller.resolve("i1").unwrap(), None);
        assert_eq!(store.get("i1").unwrap().state, InstanceState::Disconnected);
    }

    #[test]
    fn test_resolve_with_resolver_reflects_failure_as_error() {
        struct NoResolver;
        impl ResolveCapability for NoResolver {
            fn resolve_port(&self, _id: &str) -> Option<u16> {
                None
            }
        }

        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(spawner);
        store.upsert(InstanceRecord::new(InstanceConfig::new("i1", "claude")));
        controller.set_resolver(Arc::new(NoResolver));

        assert_eq!(controller.resolve("i1").unwrap(), None);
        let record = store.get("i1").unwrap();
        assert_eq!(record.state, InstanceState::Error);
        assert!(record.error.is_some());
    }

    #[test]
    fn test_resolve_unknown_instance_fails() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (_store, _ports, controller) = controller_with(spawner);
        assert!(matches!(
            controller.resolve("ghost"),
            Err(EngineError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn test_dispose_never_fails_and_disconnects_all() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, ports, controller) = controller_with(spawner);

        let port_a = controller.spawn("a", None).unwrap();
        let port_b = controller.spawn("b", None).unwrap();

        controller.dispose();

        for id in ["a", "b"] {
            let record = store.get(id).unwrap();
            assert_eq!(record.state, InstanceState::Disconnected);
            assert!(record.runtime.pid.is_none());
        }
        assert!(ports.is_port_available(port_a));
        assert!(ports.is_port_available(port_b));
    }

    #[test]
    fn test_dispose_survives_kill_failures() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (store, _ports, controller) = controller_with(Arc::clone(&spawner));
        controller.spawn("a", None).unwrap();

        let failing = Arc::new(RecordingSpawner {
            fail_kill: true,
            ..RecordingSpawner::default()
        });
        let controller = InstanceController::new(
            Arc::clone(&store),
            Arc::new(PortAllocator::new()),
            failing,
            "claude",
        );

        controller.dispose();
        assert_eq!(store.get("a").unwrap().state, InstanceState::Disconnected);
    }

    #[test]
    fn test_build_launch_command_escapes_unsafe_args() {
        let command = build_launch_command(
            "claude",
            &[
                "--resume".to_string(),
                "a b".to_string(),
                "it's".to_string(),
                "path/to:file@v1".to_string(),
            ],
        );
        assert_eq!(command, "claude --resume 'a b' 'it'\\''s' path/to:file@v1");
    }

    #[test]
    fn test_build_launch_command_escapes_empty_arg() {
        assert_eq!(build_launch_command("cmd", &[String::new()]), "cmd ''");
    }

    #[test]
    fn test_spawn_twice_reuses_terminal_port() {
        let spawner = Arc::new(RecordingSpawner::default());
        let (_store, _ports, controller) = controller_with(spawner);

        let first = controller.spawn("i1", None).unwrap();
        let second = controller.spawn("i1", None).unwrap();
        // The terminal key holds its assignment across spawns.
        assert_eq!(first, second);
    }
}
