//! Construction of daemon communicators.

use std::os::fd::RawFd;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use tdl_core::{AppId, BindingType, ErrorCode, ProcessId, ShmObjectHandle, TraceClientId, TraceResult};

use crate::communicator::{DaemonCommunication, DaemonCommunicator};
use crate::config::CommunicatorConfig;
use crate::session::DaemonTerminationCallback;
use crate::shm::{PosixSharedMemory, SharedMemoryOs};
use crate::transport::Transport;
use crate::unix::UnixSocketTransport;

/// Creates the communicator used by the tracing library.
pub trait CommunicatorFactory: Send + Sync {
    /// Returns `injected` unchanged when given, otherwise a new communicator.
    fn create(
        &self,
        injected: Option<Box<dyn DaemonCommunication>>,
    ) -> Box<dyn DaemonCommunication>;
}

// ============================================================================
// Functional Factory
// ============================================================================

/// Factory for [`DaemonCommunicator`]s sharing one transport.
pub struct DaemonCommunicatorFactory {
    transport: Arc<dyn Transport>,
    shm: Arc<dyn SharedMemoryOs>,
    config: CommunicatorConfig,
}

impl DaemonCommunicatorFactory {
    pub fn new(
        transport: Arc<dyn Transport>,
        shm: Arc<dyn SharedMemoryOs>,
        config: CommunicatorConfig,
    ) -> Self {
        Self {
            transport,
            shm,
            config,
        }
    }

    /// Unix socket transport and POSIX shared memory, as configured.
    pub fn from_config(config: CommunicatorConfig) -> Self {
        let transport = Arc::new(UnixSocketTransport::new(config.socket_dir.clone()));
        Self::new(transport, Arc::new(PosixSharedMemory), config)
    }
}

impl CommunicatorFactory for DaemonCommunicatorFactory {
    fn create(
        &self,
        injected: Option<Box<dyn DaemonCommunication>>,
    ) -> Box<dyn DaemonCommunication> {
        if let Some(communicator) = injected {
            debug!("Using injected daemon communicator");
            return communicator;
        }
        Box::new(DaemonCommunicator::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.shm),
            self.config.clone(),
        ))
    }
}

// ============================================================================
// Unsupported Stub
// ============================================================================

/// Factory for platforms without daemon support.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedCommunicatorFactory;

impl CommunicatorFactory for UnsupportedCommunicatorFactory {
    fn create(
        &self,
        injected: Option<Box<dyn DaemonCommunication>>,
    ) -> Box<dyn DaemonCommunication> {
        injected.unwrap_or_else(|| Box::new(UnsupportedDaemonCommunicator))
    }
}

/// Communicator whose every operation fails with
/// [`ErrorCode::DaemonCommunicatorNotSupportedFatal`].
#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedDaemonCommunicator;

#[async_trait]
impl DaemonCommunication for UnsupportedDaemonCommunicator {
    async fn connect(&self) -> TraceResult<()> {
        Err(ErrorCode::DaemonCommunicatorNotSupportedFatal)
    }

    async fn register_shared_memory_object(&self, _fd: RawFd) -> TraceResult<ShmObjectHandle> {
        Err(ErrorCode::DaemonCommunicatorNotSupportedFatal)
    }

    async fn register_shared_memory_object_path(
        &self,
        _path: &str,
    ) -> TraceResult<ShmObjectHandle> {
        Err(ErrorCode::DaemonCommunicatorNotSupportedFatal)
    }

    async fn register_client(
        &self,
        _binding_type: BindingType,
        _app_id: &AppId,
    ) -> TraceResult<TraceClientId> {
        Err(ErrorCode::DaemonCommunicatorNotSupportedFatal)
    }

    async fn unregister_shared_memory_object(&self, _handle: ShmObjectHandle) -> TraceResult<()> {
        Err(ErrorCode::DaemonCommunicatorNotSupportedFatal)
    }

    fn subscribe_to_daemon_termination_notification(&self, _callback: DaemonTerminationCallback) {}

    fn daemon_process_id(&self) -> Option<ProcessId> {
        None
    }

    async fn shutdown(&self) {}
}
