//! Default process spawner backed by the system shell.
//!
//! Spawned processes are detached from the engine's control flow: stdio goes
//! to null and the child is correlated by terminal key. Children we spawned
//! ourselves are killed and reaped through their handle; processes adopted
//! from discovery are signalled through `sysinfo`, which behaves the same for
//! non-children.

use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;

use sysinfo::{Pid, ProcessRefreshKind, System};
use tracing::{info, warn};

use crate::controller::{ProcessSpawner, SpawnRequest, SpawnedProcess};
use crate::error::{EngineError, Result};

/// Spawns instance processes via `sh -c`, tracking children per terminal key.
#[derive(Default)]
pub struct ShellSpawner {
    children: Mutex<HashMap<String, Child>>,
}

impl ShellSpawner {
    pub fn new() -> Self {
        ShellSpawner::default()
    }
}

impl ProcessSpawner for ShellSpawner {
    fn spawn(&self, request: &SpawnRequest) -> Result<SpawnedProcess> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&request.command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(workspace) = &request.workspace_path {
            command.current_dir(workspace);
        }
        for (key, value) in &request.env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|e| EngineError::SpawnFailed {
            id: request.terminal_key.clone(),
            details: e.to_string(),
        })?;

        let pid = child.id();
        self.children
            .lock()
            .expect("spawner lock poisoned")
            .insert(request.terminal_key.clone(), child);
        info!(terminal_key = %request.terminal_key, pid, port = request.port, "process spawned");
        Ok(SpawnedProcess { pid: Some(pid) })
    }

    fn kill(&self, terminal_key: &str, pid: Option<u32>) -> Result<()> {
        let child = self
            .children
            .lock()
            .expect("spawner lock poisoned")
            .remove(terminal_key);

        if let Some(mut child) = child {
            let child_pid = child.id();
            // Kill and reap our own child; an already-exited child is fine.
            if let Err(e) = child.kill() {
                if e.kind() != std::io::ErrorKind::InvalidInput {
                    return Err(EngineError::KillFailed {
                        id: terminal_key.to_string(),
                        details: e.to_string(),
                    });
                }
            }
            let _ = child.wait();
            info!(terminal_key = %terminal_key, pid = child_pid, "process killed");
            return Ok(());
        }

        // Not our child (e.g. adopted from discovery): signal by pid.
        let Some(pid) = pid else {
            warn!(terminal_key = %terminal_key, "kill requested without a pid");
            return Ok(());
        };
        kill_by_pid(terminal_key, pid)
    }
}

fn kill_by_pid(terminal_key: &str, pid: u32) -> Result<()> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    match sys.process(sys_pid) {
        Some(process) => {
            if process.kill() {
                info!(terminal_key = %terminal_key, pid, "process killed");
                Ok(())
            } else {
                Err(EngineError::KillFailed {
                    id: terminal_key.to_string(),
                    details: format!("kill signal to pid {pid} failed"),
                })
            }
        }
        // Already exited.
        None => Ok(()),
    }
}

/// Whether a pid refers to a live process.
pub fn is_pid_alive(pid: u32) -> bool {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).is_some()
}
