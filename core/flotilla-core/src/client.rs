//! Bounded-timeout HTTP client for the managed-instance control API.
//!
//! Every managed instance exposes a small local HTTP API:
//!
//! - `GET /health` → `{"status": "ok" | "error", "version"?, "timestamp"?}`;
//!   healthy iff the response is successful and `status == "ok"`.
//! - `POST /tui/append-prompt` with `{"prompt": "..."}`; any 2xx is success.
//!
//! Probes use short per-attempt timeouts so callers never hang on a dead
//! port. Command calls additionally retry with exponential backoff up to a
//! fixed budget; exhausting the budget yields a typed failure.
//!
//! The concrete client is behind the [`ControlClient`] trait so the resolver,
//! controller, and health monitor can be driven by mocks in tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, Result};
use crate::types::InstanceHealth;

/// Per-attempt timeout for health probes and commands.
const REQUEST_TIMEOUT_MS: u64 = 1_500;
/// TCP connect timeout. Local endpoints either accept immediately or never.
const CONNECT_TIMEOUT_MS: u64 = 500;
/// Command retry budget (total attempts, including the first).
const RETRY_MAX_ATTEMPTS: u32 = 3;
/// Base delay before the first retry; doubles per attempt.
const RETRY_BASE_DELAY_MS: u64 = 200;

/// Wire format of `GET /health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
struct AppendPromptRequest<'a> {
    prompt: &'a str,
}

/// Probe/command abstraction over one instance endpoint.
pub trait ControlClient: Send + Sync {
    /// Base URL of the endpoint this client talks to.
    fn base_url(&self) -> String;

    /// Single bounded health probe. `Ok` means the endpoint answered 2xx
    /// with `status == "ok"`; anything else is a transient error.
    fn check_health(&self) -> Result<InstanceHealth>;

    /// Append a prompt to the instance's TUI input. Retried internally.
    fn append_prompt(&self, prompt: &str) -> Result<()>;
}

/// Produces (and pools) clients per instance endpoint.
pub trait ClientFactory: Send + Sync {
    fn client_for(&self, instance_id: &str, port: u16) -> Arc<dyn ControlClient>;
}

/// Blocking HTTP implementation of [`ControlClient`].
pub struct HttpControlClient {
    http: reqwest::blocking::Client,
    base_url: String,
}

impl HttpControlClient {
    fn new(http: reqwest::blocking::Client, port: u16) -> Self {
        HttpControlClient {
            http,
            base_url: format!("http://127.0.0.1:{port}"),
        }
    }
}

impl ControlClient for HttpControlClient {
    fn base_url(&self) -> String {
        self.base_url.clone()
    }

    fn check_health(&self) -> Result<InstanceHealth> {
        let url = format!("{}/health", self.base_url);
        let response = self.http.get(&url).send().map_err(|e| transient(&url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::ApiStatus {
                status: status.as_u16(),
            });
        }

        let body: HealthResponse = response.json().map_err(|e| transient(&url, e))?;
        if body.status != "ok" {
            return Err(EngineError::ProbeFailed {
                port: port_of(&self.base_url),
                details: format!("status = {}", body.status),
            });
        }

        Ok(InstanceHealth {
            ok: true,
            base_url: Some(self.base_url.clone()),
            version: body.version,
            ..InstanceHealth::default()
        })
    }

    fn append_prompt(&self, prompt: &str) -> Result<()> {
        let url = format!("{}/tui/append-prompt", self.base_url);
        with_retry("append-prompt", || {
            let response = self
                .http
                .post(&url)
                .json(&AppendPromptRequest { prompt })
                .send()
                .map_err(|e| transient(&url, e))?;
            let status = response.status();
            if status.is_success() {
                Ok(())
            } else {
                Err(EngineError::ApiStatus {
                    status: status.as_u16(),
                })
            }
        })
    }
}

/// Pools one [`HttpControlClient`] per instance endpoint, sharing a single
/// timeout-bounded reqwest client.
pub struct HttpClientFactory {
    http: reqwest::blocking::Client,
    pool: Mutex<HashMap<(String, u16), Arc<HttpControlClient>>>,
}

impl HttpClientFactory {
    pub fn new() -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .connect_timeout(Duration::from_millis(CONNECT_TIMEOUT_MS))
            .build()
            .unwrap_or_default();
        HttpClientFactory {
            http,
            pool: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for HttpClientFactory {
    fn default() -> Self {
        HttpClientFactory::new()
    }
}

impl ClientFactory for HttpClientFactory {
    fn client_for(&self, instance_id: &str, port: u16) -> Arc<dyn ControlClient> {
        let mut pool = self.pool.lock().expect("client pool lock poisoned");
        let client = pool
            .entry((instance_id.to_string(), port))
            .or_insert_with(|| Arc::new(HttpControlClient::new(self.http.clone(), port)));
        Arc::clone(client) as Arc<dyn ControlClient>
    }
}

/// Run `op` with exponential backoff, retrying transient failures only.
fn with_retry<T>(op_name: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay_ms = RETRY_BASE_DELAY_MS;
    let mut last_details = String::new();

    for attempt in 1..=RETRY_MAX_ATTEMPTS {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < RETRY_MAX_ATTEMPTS => {
                warn!(op = op_name, attempt, error = %err, "transient failure, retrying");
                last_details = err.to_string();
                std::thread::sleep(Duration::from_millis(delay_ms));
                delay_ms *= 2;
            }
            Err(err) if err.is_transient() => {
                debug!(op = op_name, attempt, "retry budget exhausted");
                return Err(EngineError::RetriesExhausted {
                    attempts: RETRY_MAX_ATTEMPTS,
                    details: err.to_string(),
                });
            }
            Err(err) => return Err(err),
        }
    }

    Err(EngineError::RetriesExhausted {
        attempts: RETRY_MAX_ATTEMPTS,
        details: last_details,
    })
}

fn transient(url: &str, err: reqwest::Error) -> EngineError {
    EngineError::ProbeFailed {
        port: port_of(url),
        details: err.to_string(),
    }
}

fn port_of(url: &str) -> u16 {
    url.rsplit(':')
        .next()
        .and_then(|tail| {
            tail.split('/')
                .next()
                .and_then(|digits| digits.parse().ok())
        })
        .unwrap_or(0)
}
