//! TDL Client - talks to the trace daemon on behalf of the tracing library
//!
//! This crate provides:
//! - The [`Transport`] capability and a Unix-domain-socket backend
//! - The [`DaemonCommunicator`] with its connection state machine and RPCs
//! - The crash detector that notices daemon termination
//! - Factories for functional and unsupported communicators
//! - Configuration loading
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.
//!
//! # Example
//!
//! ```rust,ignore
//! use tdl_client::{CommunicatorConfig, CommunicatorFactory, DaemonCommunicatorFactory};
//! use tdl_core::{AppId, BindingType};
//!
//! let config = CommunicatorConfig::load(None)?;
//! let communicator = DaemonCommunicatorFactory::from_config(config).create(None);
//! communicator.connect().await?;
//! let id = communicator
//!     .register_client(BindingType::LoLa, &AppId::new("camera")?)
//!     .await?;
//! communicator.shutdown().await;
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

pub mod communicator;
pub mod config;
pub mod crash_detector;
pub mod error;
pub mod factory;
pub mod session;
pub mod shm;
pub mod transport;
pub mod unix;

// Re-exports for convenience
pub use communicator::{DaemonCommunication, DaemonCommunicator};
pub use config::CommunicatorConfig;
pub use crash_detector::{CrashDetector, DetectorStatus};
pub use error::{ConfigError, TransportError, TransportResult};
pub use factory::{
    CommunicatorFactory, DaemonCommunicatorFactory, UnsupportedCommunicatorFactory,
    UnsupportedDaemonCommunicator,
};
pub use session::{DaemonTerminationCallback, Link};
pub use shm::{PosixSharedMemory, SharedMemoryOs};
pub use transport::{ChannelId, ConnectionId, Deadline, EndpointId, Notification, Transport};
pub use unix::UnixSocketTransport;

/// Locks `mutex`, recovering the data if a previous holder panicked.
pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
