//! File-backed persistence of instance configurations.
//!
//! Only `InstanceConfig` survives across sessions; runtime facts (ports,
//! pids) are re-derived by the resolver after a restart. The on-disk format
//! is a small versioned JSON document:
//!
//! ```json
//! {
//!   "version": 1,
//!   "saved_at": "2026-08-30T12:00:00Z",
//!   "instances": [ { ... InstanceConfig fields ... } ]
//! }
//! ```
//!
//! # Defensive Design
//!
//! Loading never fails hard: a missing file, empty file, corrupt JSON, or
//! unsupported version all yield an empty list with a logged warning. Saves
//! go through a temp file + rename so a crash never leaves a partial file.

use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::store::{InstanceStore, Subscription};
use crate::types::{InstanceConfig, InstanceRecord};

/// Schema version. Only files with a matching version are loaded.
const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct ConfigFile {
    version: u32,
    saved_at: DateTime<Utc>,
    instances: Vec<InstanceConfig>,
}

/// Loads and saves instance configurations at a fixed path.
pub struct ConfigPersistence {
    path: PathBuf,
}

impl ConfigPersistence {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        ConfigPersistence { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted configs. Defects in the file yield an empty list.
    pub fn load(&self) -> Vec<InstanceConfig> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read instance configs");
                return Vec::new();
            }
        };

        if content.trim().is_empty() {
            warn!(path = %self.path.display(), "empty instance config file");
            return Vec::new();
        }

        match serde_json::from_str::<ConfigFile>(&content) {
            Ok(file) if file.version == FORMAT_VERSION => file.instances,
            Ok(file) => {
                warn!(
                    path = %self.path.display(),
                    version = file.version,
                    "unsupported instance config version"
                );
                Vec::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "corrupt instance config file");
                Vec::new()
            }
        }
    }

    /// Atomically write the given configs.
    pub fn save(&self, instances: &[InstanceConfig]) -> Result<()> {
        let file = ConfigFile {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            instances: instances.to_vec(),
        };
        let content = serde_json::to_string_pretty(&file).map_err(|e| EngineError::Json {
            context: "serializing instance configs".to_string(),
            source: e,
        })?;

        let parent = self.path.parent().ok_or_else(|| EngineError::Io {
            context: "instance config path has no parent".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent directory"),
        })?;
        fs::create_dir_all(parent).map_err(|e| EngineError::Io {
            context: format!("creating {}", parent.display()),
            source: e.into(),
        })?;

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| EngineError::Io {
            context: "creating temp config file".to_string(),
            source: e,
        })?;
        temp.write_all(content.as_bytes())
            .and_then(|_| temp.flush())
            .map_err(|e| EngineError::Io {
                context: "writing temp config file".to_string(),
                source: e,
            })?;
        temp.persist(&self.path).map_err(|e| EngineError::Io {
            context: format!("committing {}", self.path.display()),
            source: e.error,
        })?;

        debug!(path = %self.path.display(), count = file.instances.len(), "instance configs saved");
        Ok(())
    }

    /// Upsert persisted configs into the store as `disconnected` records.
    ///
    /// Ids already present in the store are left untouched.
    pub fn hydrate(&self, store: &InstanceStore) -> usize {
        let mut hydrated = 0;
        for config in self.load() {
            if store.get(&config.id).is_some() {
                continue;
            }
            store.upsert(InstanceRecord::new(config));
            hydrated += 1;
        }
        debug!(count = hydrated, "store hydrated from persisted configs");
        hydrated
    }

    /// Subscribe to store changes, saving a config snapshot on every change.
    ///
    /// Returns the subscription so the caller controls its lifetime. Save
    /// failures are logged, never propagated into the mutating call.
    pub fn attach(self, store: &std::sync::Arc<InstanceStore>) -> Subscription {
        let store_ref = std::sync::Arc::clone(store);
        store.on_change(move |_| {
            let configs: Vec<InstanceConfig> = store_ref
                .get_all()
                .into_iter()
                .map(|record| record.config)
                .collect();
            if let Err(e) = self.save(&configs) {
                warn!(error = %e, "failed to persist instance configs on change");
            }
        })
    }
}
