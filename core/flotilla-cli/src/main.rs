//! flotilla: CLI front-end for the instance lifecycle engine.
//!
//! Manages locally spawned interactive CLI instances: registering them,
//! spawning and killing their processes, resolving healthy control endpoints,
//! and sending prompts over each instance's local HTTP API.
//!
//! ## Subcommands
//!
//! - `add`: Register an instance configuration
//! - `list`: Show all registered instances and their state
//! - `active`: Show or change the active instance
//! - `spawn` / `connect` / `disconnect` / `kill`: Drive the lifecycle
//! - `resolve`: Find (or establish) a healthy endpoint for an instance
//! - `send`: Append a prompt to an instance's TUI input
//! - `remove`: Forget an instance

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use flotilla_core::{
    ClientFactory, ConfigPersistence, ConnectionResolver, HttpClientFactory, InstanceConfig,
    InstanceController, InstanceRecord, InstanceStore, PortAllocator, ProcessSpawner,
    ShellSpawner,
};

const DEFAULT_COMMAND: &str = "claude";
const CONFIG_FILE: &str = "instances.json";

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Lifecycle manager for local interactive CLI instances")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an instance configuration
    Add {
        /// Instance identifier
        id: String,

        /// Launch command (defaults to the standard tool)
        #[arg(long, default_value = DEFAULT_COMMAND)]
        command: String,

        /// Extra arguments appended to the launch command
        #[arg(long = "arg", value_name = "ARG")]
        args: Vec<String>,

        /// Workspace directory the instance works in
        #[arg(long)]
        workspace: Option<String>,

        /// Preferred control-API port
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show all registered instances and their state
    List,

    /// Show the active instance, or make another instance active
    Active {
        /// Instance to make active (omit to print the current one)
        id: Option<String>,
    },

    /// Spawn an instance process
    Spawn {
        id: String,

        /// Preferred control-API port for this spawn
        #[arg(long)]
        port: Option<u16>,
    },

    /// Attach to an already-running instance on a known port
    Connect { id: String, port: u16 },

    /// Mark an instance disconnected without touching its process
    Disconnect { id: String },

    /// Resolve a healthy control endpoint (spawning if necessary)
    Resolve {
        /// Instance to resolve (defaults to the active instance)
        id: Option<String>,
    },

    /// Terminate an instance process and release its resources
    Kill { id: String },

    /// Append a prompt to an instance's TUI input
    Send {
        /// Instance to target (defaults to the active instance)
        #[arg(long)]
        id: Option<String>,

        /// Prompt text
        prompt: String,
    },

    /// Forget an instance (does not touch a running process)
    Remove { id: String },
}

struct Engine {
    store: Arc<InstanceStore>,
    clients: Arc<HttpClientFactory>,
    controller: Arc<InstanceController>,
    _persistence: flotilla_core::Subscription,
}

fn main() {
    init_logging();
    let cli = Cli::parse();

    let config_path = match config_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "failed to resolve config path");
            std::process::exit(1);
        }
    };

    let engine = build_engine(config_path);
    if let Err(err) = run(&engine, cli.command) {
        error!(error = %err, "command failed");
        std::process::exit(1);
    }
}

fn init_logging() {
    let debug_enabled = env::var("FLOTILLA_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn config_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".flotilla").join(CONFIG_FILE))
}

/// Wire the full component graph and hydrate persisted configs.
fn build_engine(config_path: PathBuf) -> Engine {
    let store = Arc::new(InstanceStore::new());
    let ports = Arc::new(PortAllocator::with_store(Arc::clone(&store)));
    let clients = Arc::new(HttpClientFactory::new());
    let spawner = Arc::new(ShellSpawner::new());

    let resolver = Arc::new(ConnectionResolver::new(
        Arc::clone(&store),
        Arc::clone(&clients) as Arc<dyn ClientFactory>,
        None,
        None,
    ));
    let controller = Arc::new(InstanceController::new(
        Arc::clone(&store),
        Arc::clone(&ports),
        Arc::clone(&spawner) as Arc<dyn ProcessSpawner>,
        DEFAULT_COMMAND,
    ));
    controller.set_resolver(Arc::clone(&resolver) as _);
    resolver.set_controller(Arc::clone(&controller) as _);

    let persistence = ConfigPersistence::new(config_path);
    persistence.hydrate(&store);
    let subscription = persistence.attach(&store);

    Engine {
        store,
        clients,
        controller,
        _persistence: subscription,
    }
}

fn run(engine: &Engine, command: Commands) -> Result<(), String> {
    match command {
        Commands::Add {
            id,
            command,
            args,
            workspace,
            port,
        } => {
            let mut config = InstanceConfig::new(&id, command);
            config.args = args;
            config.workspace_path = workspace;
            config.preferred_port = port;
            engine.store.upsert(InstanceRecord::new(config));
            println!("added {id}");
            Ok(())
        }

        Commands::List => {
            let records = engine.store.get_all();
            if records.is_empty() {
                println!("no instances registered");
                return Ok(());
            }
            let active = engine.store.active_id();
            for record in records {
                let marker = if active.as_deref() == Some(record.id()) {
                    "*"
                } else {
                    " "
                };
                let port = record
                    .runtime
                    .port
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                let pid = record
                    .runtime
                    .pid
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "-".to_string());
                print!(
                    "{marker} {:<20} {:<12} port={port:<6} pid={pid:<8}",
                    record.id(),
                    record.state.to_string(),
                );
                if let Some(message) = &record.error {
                    print!(" {message}");
                }
                println!();
            }
            Ok(())
        }

        Commands::Active { id } => match id {
            Some(id) => {
                engine.store.set_active(&id).map_err(String::from)?;
                println!("active: {id}");
                Ok(())
            }
            None => {
                let record = engine.store.get_active().map_err(String::from)?;
                println!("active: {}", record.id());
                Ok(())
            }
        },

        Commands::Spawn { id, port } => {
            let opts = port.map(|port| flotilla_core::SpawnOptions {
                preferred_port: Some(port),
                ..flotilla_core::SpawnOptions::default()
            });
            let assigned = engine.controller.spawn(&id, opts).map_err(String::from)?;
            println!("{id} spawned on port {assigned}");
            Ok(())
        }

        Commands::Connect { id, port } => {
            let assigned = engine.controller.connect(&id, port).map_err(String::from)?;
            println!("{id} connected on port {assigned}");
            Ok(())
        }

        Commands::Disconnect { id } => {
            engine.controller.disconnect(&id).map_err(String::from)?;
            println!("{id} disconnected");
            Ok(())
        }

        Commands::Resolve { id } => {
            let id = target_id(engine, id)?;
            match engine.controller.resolve(&id).map_err(String::from)? {
                Some(port) => {
                    println!("{id} resolved to port {port}");
                    Ok(())
                }
                None => Err(format!("could not resolve a healthy endpoint for {id}")),
            }
        }

        Commands::Kill { id } => {
            engine.controller.kill(&id).map_err(String::from)?;
            println!("{id} killed");
            Ok(())
        }

        Commands::Send { id, prompt } => {
            let id = target_id(engine, id)?;
            let port = engine
                .controller
                .resolve(&id)
                .map_err(String::from)?
                .ok_or_else(|| format!("could not resolve a healthy endpoint for {id}"))?;
            engine
                .clients
                .client_for(&id, port)
                .append_prompt(&prompt)
                .map_err(String::from)?;
            println!("prompt sent to {id}");
            Ok(())
        }

        Commands::Remove { id } => {
            if engine.store.remove(&id) {
                println!("removed {id}");
                Ok(())
            } else {
                Err(format!("no such instance: {id}"))
            }
        }
    }
}

/// Explicit id, or fall back to the active instance.
fn target_id(engine: &Engine, id: Option<String>) -> Result<String, String> {
    match id {
        Some(id) => Ok(id),
        None => engine
            .store
            .get_active()
            .map(|record| record.id().to_string())
            .map_err(String::from),
    }
}
