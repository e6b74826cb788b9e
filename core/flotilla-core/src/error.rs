//! Error types for engine operations.
//!
//! The taxonomy splits along how callers are expected to react:
//! validation/conflict/not-found errors indicate caller misuse and are thrown
//! synchronously; transient errors are retried (or counted) by the owning
//! component; terminal errors are surfaced to the caller and never
//! auto-retried.

/// All errors that can occur in flotilla-core operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ─────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────
    #[error("Port {0} is outside the ephemeral range")]
    PortOutOfRange(u16),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // ─────────────────────────────────────────────────────────────────────
    // Conflict
    // ─────────────────────────────────────────────────────────────────────
    #[error("Port {0} is already in use")]
    PortInUse(u16),

    #[error("No free port in the ephemeral range")]
    PortsExhausted,

    // ─────────────────────────────────────────────────────────────────────
    // Not found
    // ─────────────────────────────────────────────────────────────────────
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("No active instance (store is empty)")]
    NoActiveInstance,

    // ─────────────────────────────────────────────────────────────────────
    // Transient (network / readiness)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Health probe failed for port {port}: {details}")]
    ProbeFailed { port: u16, details: String },

    #[error("Control API request failed with status {status}")]
    ApiStatus { status: u16 },

    #[error("Retry budget exhausted after {attempts} attempts: {details}")]
    RetriesExhausted { attempts: u32, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Terminal (process / persistence)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Spawn failed for instance {id}: {details}")]
    SpawnFailed { id: String, details: String },

    #[error("Kill failed for instance {id}: {details}")]
    KillFailed { id: String, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl EngineError {
    /// True for failures the owning component may retry (network, readiness).
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::ProbeFailed { .. }
                | EngineError::ApiStatus { .. }
                | EngineError::RetriesExhausted { .. }
        )
    }
}

/// Convenience type alias for Results using EngineError.
pub type Result<T> = std::result::Result<T, EngineError>;

// Conversion for string error compatibility
impl From<EngineError> for String {
    fn from(err: EngineError) -> String {
        err.to_string()
    }
}
