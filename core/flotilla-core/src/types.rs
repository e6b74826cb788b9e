//! Data model for managed instances.
//!
//! An [`InstanceRecord`] aggregates launch configuration, live process facts,
//! the lifecycle state, and the last health probe result. Records are plain
//! values: the store hands out clones, so mutating a returned record never
//! affects stored state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a managed instance.
///
/// Transitions are driven by the controller, resolver, and health monitor:
///
/// ```text
/// disconnected → resolving → spawning | connecting → connected
/// connected → error → connected | disconnected
/// connected/any → stopping → disconnected
/// ```
///
/// Only `connected` instances may move to `error` through the health-failure
/// path; `error` instances return to `connected` only via a successful probe
/// or resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Disconnected,
    Resolving,
    Spawning,
    Connecting,
    Connected,
    Error,
    Stopping,
}

impl InstanceState {
    /// States during which the health monitor must not start polling.
    pub fn is_transient(self) -> bool {
        matches!(self, InstanceState::Spawning | InstanceState::Stopping)
    }
}

impl std::fmt::Display for InstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            InstanceState::Disconnected => "disconnected",
            InstanceState::Resolving => "resolving",
            InstanceState::Spawning => "spawning",
            InstanceState::Connecting => "connecting",
            InstanceState::Connected => "connected",
            InstanceState::Error => "error",
            InstanceState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Identity and launch parameters. Set at creation, updated only by the
/// controller and persistence hydration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    pub id: String,
    #[serde(default)]
    pub workspace_path: Option<String>,
    pub label: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub preferred_port: Option<u16>,
    /// When false the instance exposes no control API: resolution returns
    /// nothing and the health monitor skips it.
    #[serde(default = "default_true")]
    pub http_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl InstanceConfig {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        let id = id.into();
        InstanceConfig {
            label: id.clone(),
            id,
            workspace_path: None,
            command: command.into(),
            args: Vec::new(),
            preferred_port: None,
            http_enabled: true,
        }
    }
}

/// Live process facts. Mutated only by the controller and resolver.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRuntime {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub pid: Option<u32>,
    /// Stable correlation handle linking the spawned process, its port
    /// reservation, and this record.
    #[serde(default)]
    pub terminal_key: Option<String>,
    #[serde(default)]
    pub last_seen_at: Option<DateTime<Utc>>,
}

/// Last health probe result. Mutated only by the health monitor and resolver.
///
/// Fields other than `ok` are merged, never wholesale-overwritten: a probe
/// that reports only `ok` keeps whatever title/model/version was last known.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceHealth {
    pub ok: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub session_title: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub message_count: Option<u64>,
    #[serde(default)]
    pub version: Option<String>,
}

impl InstanceHealth {
    /// Merge `other` into `self`: `ok` is always taken, the remaining fields
    /// only when the incoming probe actually carried them.
    pub fn merge(&mut self, other: &InstanceHealth) {
        self.ok = other.ok;
        if other.base_url.is_some() {
            self.base_url = other.base_url.clone();
        }
        if other.session_title.is_some() {
            self.session_title = other.session_title.clone();
        }
        if other.model.is_some() {
            self.model = other.model.clone();
        }
        if other.message_count.is_some() {
            self.message_count = other.message_count;
        }
        if other.version.is_some() {
            self.version = other.version.clone();
        }
    }
}

/// Aggregate record for one managed instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub config: InstanceConfig,
    #[serde(default)]
    pub runtime: InstanceRuntime,
    pub state: InstanceState,
    #[serde(default)]
    pub health: Option<InstanceHealth>,
    /// Last failure message; retained for as long as the instance stays in
    /// the `error` state.
    #[serde(default)]
    pub error: Option<String>,
}

impl InstanceRecord {
    pub fn new(config: InstanceConfig) -> Self {
        InstanceRecord {
            config,
            runtime: InstanceRuntime::default(),
            state: InstanceState::Disconnected,
            health: None,
            error: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Merge a probe result into this record's health (see
    /// [`InstanceHealth::merge`]).
    pub fn merge_health(&mut self, incoming: &InstanceHealth) {
        match &mut self.health {
            Some(existing) => existing.merge(incoming),
            None => self.health = Some(incoming.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_states() {
        assert!(InstanceState::Spawning.is_transient());
        assert!(InstanceState::Stopping.is_transient());
        assert!(!InstanceState::Connected.is_transient());
        assert!(!InstanceState::Disconnected.is_transient());
    }

    #[test]
    fn health_merge_keeps_unreported_fields() {
        let mut health = InstanceHealth {
            ok: true,
            model: Some("sonnet".to_string()),
            version: Some("1.2.0".to_string()),
            ..InstanceHealth::default()
        };
        health.merge(&InstanceHealth {
            ok: false,
            message_count: Some(7),
            ..InstanceHealth::default()
        });

        assert!(!health.ok);
        assert_eq!(health.model.as_deref(), Some("sonnet"));
        assert_eq!(health.version.as_deref(), Some("1.2.0"));
        assert_eq!(health.message_count, Some(7));
    }

    #[test]
    fn merge_health_on_record_without_prior_health() {
        let mut record = InstanceRecord::new(InstanceConfig::new("i1", "claude"));
        assert!(record.health.is_none());

        record.merge_health(&InstanceHealth {
            ok: true,
            ..InstanceHealth::default()
        });
        assert!(record.health.as_ref().unwrap().ok);
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut config = InstanceConfig::new("i1", "claude");
        config.preferred_port = Some(4096);
        let record = InstanceRecord::new(config);

        let json = serde_json::to_string(&record).unwrap();
        let back: InstanceRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
        assert_eq!(back.state, InstanceState::Disconnected);
    }
}
