//! Error types for the client side of the daemon link.
//!
//! `ErrorCode` from `tdl-core` is what every public operation returns. The
//! errors defined here stay internal to a layer: transport failures are logged
//! and translated into an `ErrorCode` at the communicator boundary, and
//! configuration errors only surface at startup.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::transport::{ChannelId, ConnectionId, EndpointId};

// ============================================================================
// Transport Errors
// ============================================================================

/// Failures reported by a [`Transport`](crate::transport::Transport) backend.
#[derive(Error, Debug)]
pub enum TransportError {
    /// Underlying OS call failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// No server endpoint is published under the requested name.
    #[error("No endpoint named '{name}' at {path}")]
    EndpointNameNotFound { name: String, path: PathBuf },

    #[error("Channel {0} is not open")]
    ChannelNotFound(ChannelId),

    #[error("Private endpoint {0} does not exist")]
    EndpointNotFound(EndpointId),

    #[error("Connection {0} is not attached")]
    ConnectionNotFound(ConnectionId),

    /// The peer went away while a request was in flight.
    #[error("Channel {0} closed by peer")]
    PeerClosed(ChannelId),

    /// The reply did not fit the caller's buffer.
    #[error("Reply of {actual} bytes does not fit a {capacity} byte buffer")]
    ReplyTooLarge { capacity: usize, actual: usize },

    /// A one-shot deadline could not be armed.
    #[error("Deadline unavailable: {0}")]
    DeadlineUnavailable(String),

    /// The worker serving the channel stopped before answering.
    #[error("Worker for channel {0} stopped")]
    WorkerStopped(ChannelId),
}

pub type TransportResult<T> = Result<T, TransportError>;

// ============================================================================
// Configuration Errors
// ============================================================================

/// Errors raised while loading [`CommunicatorConfig`](crate::config::CommunicatorConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// An environment override held a value of the wrong shape.
    #[error("Invalid value '{value}' for {variable}")]
    InvalidEnv { variable: &'static str, value: String },
}
