//! tdl - probe for the trace daemon link
//!
//! Connects to a running trace daemon and issues single requests, which is
//! handy when bringing up a daemon or checking that one is alive.
//!
//! # Usage
//!
//! ```bash
//! # Connect and print the daemon pid
//! tdl ping
//!
//! # Register a shared-memory object by its shm name
//! tdl register-shm /trace_buffer
//!
//! # Register a tracing client
//! tdl register-client --binding lola --app-id camera_app
//!
//! # Wait until the daemon goes away
//! tdl watch
//! ```
//!
//! Configuration is read from `<config dir>/tdl/config.toml` unless
//! `--config` is given; `TDL_SERVER_NAME`, `TDL_SOCKET_DIR` and
//! `TDL_SEND_TIMEOUT_MS` override it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tdl_client::{
    CommunicatorConfig, CommunicatorFactory, DaemonCommunication, DaemonCommunicatorFactory,
};
use tdl_core::{AppId, BindingType, ShmObjectHandle};

/// Trace daemon link probe
#[derive(Parser, Debug)]
#[command(name = "tdl", version, about)]
struct Args {
    /// Path to a TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and print the daemon pid
    Ping,
    /// Register a shared-memory object
    RegisterShm {
        /// Shared-memory object name, e.g. /trace_buffer
        path: String,
    },
    /// Register a tracing client
    RegisterClient {
        /// Middleware binding: lola, vector or vector-zero-copy
        #[arg(long)]
        binding: BindingType,

        /// Application instance identifier
        #[arg(long)]
        app_id: String,
    },
    /// Unregister a shared-memory object by its daemon index
    Unregister {
        index: i32,
    },
    /// Stay connected until the daemon terminates
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("tdl=info".parse()?)
                .add_directive("tdl_client=info".parse()?)
                .add_directive("tdl_protocol=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let config = CommunicatorConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    info!(
        server = %config.server_name,
        socket_dir = %config.socket_dir.display(),
        "Connecting to trace daemon"
    );

    let communicator = DaemonCommunicatorFactory::from_config(config).create(None);
    let result = run(communicator.as_ref(), args.command, args.json).await;
    communicator.shutdown().await;
    result
}

async fn run(communicator: &dyn DaemonCommunication, command: Command, as_json: bool) -> Result<()> {
    communicator
        .connect()
        .await
        .context("Failed to connect to trace daemon")?;

    match command {
        Command::Ping => {
            let pid = communicator.daemon_process_id();
            if as_json {
                println!("{}", json!({ "daemon_pid": pid }));
            } else if let Some(pid) = pid {
                println!("Daemon is running (PID {pid})");
            }
        }
        Command::RegisterShm { path } => {
            let index = communicator
                .register_shared_memory_object_path(&path)
                .await
                .with_context(|| format!("Failed to register {path}"))?;
            if as_json {
                println!("{}", json!({ "path": path, "index": index }));
            } else {
                println!("Registered {path} as index {index}");
            }
        }
        Command::RegisterClient { binding, app_id } => {
            let app_id = AppId::new(&app_id).context("Invalid application id")?;
            let client = communicator
                .register_client(binding, &app_id)
                .await
                .context("Failed to register client")?;
            if as_json {
                println!(
                    "{}",
                    json!({ "binding": binding, "app_id": app_id.to_string(), "client_id": client })
                );
            } else {
                println!("Registered {app_id} ({binding}) as client {client}");
            }
        }
        Command::Unregister { index } => {
            let index = ShmObjectHandle::new(index);
            communicator
                .unregister_shared_memory_object(index)
                .await
                .with_context(|| format!("Failed to unregister index {index}"))?;
            if as_json {
                println!("{}", json!({ "index": index, "unregistered": true }));
            } else {
                println!("Unregistered index {index}");
            }
        }
        Command::Watch => watch(communicator, as_json).await?,
    }

    Ok(())
}

async fn watch(communicator: &dyn DaemonCommunication, as_json: bool) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    communicator.subscribe_to_daemon_termination_notification(Box::new(move || {
        let _ = tx.send(());
    }));

    if !as_json {
        println!("Watching daemon, press Ctrl+C to stop");
    }

    tokio::select! {
        _ = rx.recv() => {
            warn!("Trace daemon terminated");
            if as_json {
                println!("{}", json!({ "event": "daemon_terminated" }));
            } else {
                println!("Daemon terminated");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to wait for Ctrl+C")?;
            info!("Interrupted");
        }
    }

    Ok(())
}
