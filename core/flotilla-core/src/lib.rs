//! # flotilla-core
//!
//! Core library for Flotilla, managing the lifecycle of locally spawned
//! interactive CLI instances and resolving control connections to them over
//! each instance's ephemeral HTTP port.
//!
//! ## Design Principles
//!
//! - **Synchronous**: No async runtime dependency. Blocking HTTP with bounded
//!   timeouts; background work runs on plain threads with stop flags.
//! - **Thread-safe**: All shared components use interior locking and hand out
//!   defensive copies. Callers never hold references into internal state.
//! - **Graceful degradation**: Resolution and disposal never throw; persisted
//!   state that fails to load yields empty defaults, not errors.
//! - **Trait seams**: Process spawning, HTTP transport, and instance discovery
//!   sit behind traits so every component is testable without real processes
//!   or sockets.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use flotilla_core::{
//!     ConnectionResolver, HttpClientFactory, InstanceController, InstanceStore,
//!     PortAllocator, ShellSpawner,
//! };
//!
//! let store = Arc::new(InstanceStore::new());
//! let ports = Arc::new(PortAllocator::with_store(Arc::clone(&store)));
//! let clients = Arc::new(HttpClientFactory::new());
//! let resolver = Arc::new(ConnectionResolver::new(
//!     Arc::clone(&store),
//!     clients.clone(),
//!     None,
//!     None,
//! ));
//! let controller = Arc::new(InstanceController::new(
//!     Arc::clone(&store),
//!     Arc::clone(&ports),
//!     Arc::new(ShellSpawner::new()),
//!     "claude",
//! ));
//! controller.set_resolver(Arc::clone(&resolver) as _);
//! resolver.set_controller(Arc::clone(&controller) as _);
//!
//! let port = controller.resolve("my-instance")?;
//! ```

// Public modules
pub mod client;
pub mod controller;
pub mod error;
pub mod health;
pub mod paths;
pub mod persist;
pub mod ports;
pub mod process;
pub mod resolver;
pub mod store;
pub mod types;

// Re-export commonly used items at crate root
pub use client::{ClientFactory, ControlClient, HealthResponse, HttpClientFactory, HttpControlClient};
pub use controller::{
    InstanceController, ProcessSpawner, SpawnCapability, SpawnOptions, SpawnRequest, SpawnedProcess,
};
pub use error::{EngineError, Result};
pub use health::{HealthMonitor, FAILURE_MESSAGE, FAILURE_THRESHOLD};
pub use paths::{normalize_path, paths_match};
pub use persist::ConfigPersistence;
pub use ports::{PortAllocator, PORT_RANGE_END, PORT_RANGE_START};
pub use process::ShellSpawner;
pub use resolver::{
    ConnectionResolver, DiscoveredInstance, InstanceDiscovery, ResolveCapability, WorkspaceProvider,
};
pub use store::{InstanceStore, Subscription};
pub use types::{
    InstanceConfig, InstanceHealth, InstanceRecord, InstanceRuntime, InstanceState,
};
