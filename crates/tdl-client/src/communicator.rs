//! Request/reply communication with the trace daemon.
//!
//! `DaemonCommunicator` drives the connection state machine and the four
//! daemon RPCs. Every RPC funnels through [`DaemonCommunicator::send_message`],
//! which encodes the request image, arms the per-call deadline and performs
//! one exchange on the main channel.
//!
//! # Connection Lifecycle
//!
//! 1. The constructor spawns the crash detector.
//! 2. `connect()` waits for the detector to attach, opens the daemon's named
//!    endpoint and fetches the daemon pid.
//! 3. RPCs run one at a time over the main channel.
//! 4. A daemon death (seen by the detector) or `shutdown()` takes the link
//!    back to `Disconnected`.
//!
//! # Error Translation
//!
//! Transport failures are logged here and surface as
//! [`ErrorCode::MessageSendFailedRecoverable`]. When the daemon answers with
//! an error-code reply, that code is returned verbatim.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::time::timeout_at;
use tracing::{debug, error, info, warn};

use tdl_core::{
    AppId, BindingType, ErrorCode, ProcessId, ShmObjectHandle, TraceClientId, TraceResult,
};
use tdl_protocol::{decode_response, encode_request, Request, Response, RESPONSE_WIRE_SIZE};

use crate::config::CommunicatorConfig;
use crate::crash_detector::{CrashDetector, DetectorStatus};
use crate::lock_unpoisoned;
use crate::session::{DaemonTerminationCallback, Link, Session};
use crate::shm::SharedMemoryOs;
use crate::transport::{ChannelId, Transport};

// ============================================================================
// Communication Trait
// ============================================================================

/// Operations the tracing library needs from the daemon.
#[async_trait]
pub trait DaemonCommunication: Send + Sync {
    /// Establishes the session. A no-op when already connected.
    async fn connect(&self) -> TraceResult<()>;

    /// Registers the shared-memory object behind `fd` with the daemon.
    async fn register_shared_memory_object(&self, fd: RawFd) -> TraceResult<ShmObjectHandle>;

    /// Opens the shared-memory object at `path` and registers it.
    async fn register_shared_memory_object_path(&self, path: &str)
        -> TraceResult<ShmObjectHandle>;

    /// Registers a tracing client for `binding_type`.
    async fn register_client(
        &self,
        binding_type: BindingType,
        app_id: &AppId,
    ) -> TraceResult<TraceClientId>;

    async fn unregister_shared_memory_object(&self, handle: ShmObjectHandle) -> TraceResult<()>;

    /// Stores the callback run when the daemon dies, replacing any previous one.
    fn subscribe_to_daemon_termination_notification(&self, callback: DaemonTerminationCallback);

    /// Pid of the connected daemon.
    fn daemon_process_id(&self) -> Option<ProcessId>;

    /// Closes the session and stops termination detection.
    async fn shutdown(&self);
}

// ============================================================================
// Daemon Communicator
// ============================================================================

/// Functional [`DaemonCommunication`] over a [`Transport`].
pub struct DaemonCommunicator {
    transport: Arc<dyn Transport>,
    shm: Arc<dyn SharedMemoryOs>,
    config: CommunicatorConfig,
    session: Arc<Session>,
    detector: CrashDetector,

    /// Serializes `connect()` calls.
    connect_lock: tokio::sync::Mutex<()>,

    /// Held across one exchange: one call in flight at a time.
    call_lock: tokio::sync::Mutex<()>,

    /// Descriptors opened by path, closed on unregistration.
    opened_objects: Mutex<HashMap<ShmObjectHandle, OwnedFd>>,
}

impl DaemonCommunicator {
    /// Creates a communicator and starts its crash detector.
    ///
    /// Must be called from within a tokio runtime for termination detection
    /// to work; otherwise `connect()` fails with
    /// [`ErrorCode::DaemonTerminationDetectionFailedFatal`].
    pub fn new(
        transport: Arc<dyn Transport>,
        shm: Arc<dyn SharedMemoryOs>,
        config: CommunicatorConfig,
    ) -> Self {
        let session = Arc::new(Session::new());
        let detector = CrashDetector::spawn(Arc::clone(&transport), Arc::clone(&session));

        Self {
            transport,
            shm,
            config,
            session,
            detector,
            connect_lock: tokio::sync::Mutex::new(()),
            call_lock: tokio::sync::Mutex::new(()),
            opened_objects: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CommunicatorConfig {
        &self.config
    }

    /// Snapshot of the main channel state.
    pub fn link(&self) -> Link {
        self.session.link()
    }

    pub fn detector_status(&self) -> DetectorStatus {
        self.detector.status()
    }

    /// Performs one request/reply exchange on the main channel.
    ///
    /// On success `response` is overwritten with the decoded reply. On any
    /// failure it keeps the value the caller put in it.
    ///
    /// # Errors
    ///
    /// - `DaemonNotConnectedFatal` if no main channel is open
    /// - `MessageSendFailedRecoverable` if the deadline cannot be armed, the
    ///   exchange fails, or the deadline expires
    /// - `GenericErrorRecoverable` if the reply does not decode
    pub async fn send_message(&self, request: &Request, response: &mut Response) -> TraceResult<()> {
        let _in_flight = self.call_lock.lock().await;

        let channel = self
            .session
            .link()
            .channel()
            .ok_or(ErrorCode::DaemonNotConnectedFatal)?;

        let image = encode_request(request);
        let mut reply = [0u8; RESPONSE_WIRE_SIZE];

        let deadline = self
            .transport
            .arm_deadline(self.config.send_timeout())
            .map_err(|e| {
                warn!(error = %e, "Failed to arm send deadline");
                ErrorCode::MessageSendFailedRecoverable
            })?;

        debug!(channel = %channel, message = %request.message_id(), "Sending request");
        let exchange = self.transport.send_receive(channel, &image, &mut reply);
        let received = match timeout_at(deadline.instant(), exchange).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                warn!(channel = %channel, message = %request.message_id(), error = %e, "Exchange failed");
                return Err(ErrorCode::MessageSendFailedRecoverable);
            }
            Err(_) => {
                warn!(
                    channel = %channel,
                    message = %request.message_id(),
                    timeout_ms = self.config.send_timeout_ms,
                    "Daemon did not reply in time"
                );
                return Err(ErrorCode::MessageSendFailedRecoverable);
            }
        };

        let decoded = decode_response(reply.get(..received).unwrap_or_default()).map_err(|e| {
            warn!(channel = %channel, error = %e, "Malformed reply");
            ErrorCode::GenericErrorRecoverable
        })?;

        *response = decoded;
        Ok(())
    }

    /// Sends `request` with `sentinel` as the initial response.
    async fn call(&self, request: Request, sentinel: Response) -> TraceResult<Response> {
        let mut response = sentinel;
        self.send_message(&request, &mut response).await?;
        Ok(response)
    }

    /// Drops a channel that never reached `Connected`.
    async fn abandon_channel(&self, channel: ChannelId) {
        if self.session.link().channel() == Some(channel) {
            self.session.set_link(Link::Disconnected);
        }
        if let Err(e) = self.transport.close_channel(channel).await {
            debug!(channel = %channel, error = %e, "Close of abandoned channel failed");
        }
    }

    fn require_connected(&self) -> TraceResult<ProcessId> {
        self.session
            .link()
            .daemon_pid()
            .ok_or(ErrorCode::DaemonNotConnectedFatal)
    }
}

/// Error for a reply whose variant does not match the request.
fn unexpected_reply(response: Response) -> ErrorCode {
    match response {
        Response::ErrorCode(code) => {
            debug!(code = %code, "Daemon reported an error");
            code
        }
        other => {
            warn!(variant = ?other.variant_type(), "Unexpected reply variant");
            ErrorCode::GenericErrorRecoverable
        }
    }
}

#[async_trait]
impl DaemonCommunication for DaemonCommunicator {
    async fn connect(&self) -> TraceResult<()> {
        let _connecting = self.connect_lock.lock().await;
        if self.session.link().is_connected() {
            debug!("Already connected to daemon");
            return Ok(());
        }

        match self.detector.ready().await {
            DetectorStatus::Attached { .. } => {}
            status => {
                error!(status = ?status, "Daemon termination detection is not running");
                return Err(ErrorCode::DaemonTerminationDetectionFailedFatal);
            }
        }

        let channel = self
            .transport
            .open_channel(&self.config.server_name)
            .await
            .map_err(|e| {
                error!(server = %self.config.server_name, error = %e, "Failed to open daemon endpoint");
                ErrorCode::ServerConnectionNameOpenFailedFatal
            })?;
        self.session.set_link(Link::Connecting { channel });

        let response = match self
            .call(Request::daemon_process_id(), Response::unknown_daemon_process_id())
            .await
        {
            Ok(response) => response,
            Err(code) => {
                self.abandon_channel(channel).await;
                return Err(code);
            }
        };

        let pid = match response {
            Response::DaemonProcessId(pid) if pid.is_valid() => pid,
            Response::ErrorCode(code) => {
                self.abandon_channel(channel).await;
                return Err(code);
            }
            other => {
                warn!(reply = ?other, "Daemon did not report a valid pid");
                self.abandon_channel(channel).await;
                return Err(ErrorCode::DaemonConnectionFailedFatal);
            }
        };

        if !self.session.complete_connect(channel, pid) {
            warn!(channel = %channel, "Daemon connection lost while connecting");
            self.abandon_channel(channel).await;
            return Err(ErrorCode::DaemonConnectionFailedFatal);
        }

        info!(channel = %channel, daemon_pid = %pid, "Connected to daemon");
        Ok(())
    }

    async fn register_shared_memory_object(&self, fd: RawFd) -> TraceResult<ShmObjectHandle> {
        let pid = self.require_connected()?;

        let handle = self.shm.create_handle(fd, pid).map_err(|e| {
            warn!(fd, daemon_pid = %pid, error = %e, "Failed to create shared memory handle");
            ErrorCode::SharedMemoryObjectRegistrationFailedFatal
        })?;

        let response = self
            .call(
                Request::register_shared_memory_object(handle),
                Response::invalid_shared_memory_object(),
            )
            .await?;

        match response {
            Response::RegisterSharedMemoryObject(index) if index.is_valid() => {
                debug!(fd, index = %index, "Registered shared memory object");
                Ok(index)
            }
            Response::RegisterSharedMemoryObject(_) => {
                warn!(fd, "Daemon returned an invalid shared memory index");
                Err(ErrorCode::SharedMemoryObjectHandleCreationFailedFatal)
            }
            other => Err(unexpected_reply(other)),
        }
    }

    async fn register_shared_memory_object_path(
        &self,
        path: &str,
    ) -> TraceResult<ShmObjectHandle> {
        if path.is_empty() {
            return Err(ErrorCode::InvalidArgumentFatal);
        }
        self.require_connected()?;

        let fd = self.shm.open(path).map_err(|e| {
            warn!(path, error = %e, "Failed to open shared memory object");
            ErrorCode::BadFileDescriptorFatal
        })?;

        // `fd` is closed on drop if the registration fails.
        let index = self.register_shared_memory_object(fd.as_raw_fd()).await?;
        lock_unpoisoned(&self.opened_objects).insert(index, fd);
        Ok(index)
    }

    async fn register_client(
        &self,
        binding_type: BindingType,
        app_id: &AppId,
    ) -> TraceResult<TraceClientId> {
        if !binding_type.is_defined() {
            return Err(ErrorCode::InvalidBindingTypeFatal);
        }

        let response = self
            .call(
                Request::register_client(binding_type, *app_id),
                Response::default_trace_client_id(),
            )
            .await?;

        match response {
            Response::RegisterClient(id) => {
                debug!(binding = %binding_type, app_id = %app_id, client_id = %id, "Registered client");
                Ok(id)
            }
            other => Err(unexpected_reply(other)),
        }
    }

    async fn unregister_shared_memory_object(&self, handle: ShmObjectHandle) -> TraceResult<()> {
        self.require_connected()?;

        let response = self
            .call(
                Request::unregister_shared_memory_object(handle),
                Response::unregister_not_confirmed(),
            )
            .await?;

        match response {
            Response::UnregisterSharedMemoryObject {
                is_unregister_successful: true,
            } => {
                lock_unpoisoned(&self.opened_objects).remove(&handle);
                debug!(index = %handle, "Unregistered shared memory object");
                Ok(())
            }
            Response::UnregisterSharedMemoryObject { .. } => {
                warn!(index = %handle, "Daemon refused to unregister shared memory object");
                Err(ErrorCode::SharedMemoryObjectUnregisterFailedFatal)
            }
            other => Err(unexpected_reply(other)),
        }
    }

    fn subscribe_to_daemon_termination_notification(&self, callback: DaemonTerminationCallback) {
        self.session.set_termination_callback(callback);
    }

    fn daemon_process_id(&self) -> Option<ProcessId> {
        self.session.link().daemon_pid()
    }

    async fn shutdown(&self) {
        self.detector.shutdown().await;

        if let Some(channel) = self.session.take_channel() {
            if let Err(e) = self.transport.close_channel(channel).await {
                debug!(channel = %channel, error = %e, "Channel close failed");
            }
        }
        lock_unpoisoned(&self.opened_objects).clear();
        info!("Daemon communicator shut down");
    }
}

impl Drop for DaemonCommunicator {
    fn drop(&mut self) {
        let Some(channel) = self.session.take_channel() else {
            return;
        };
        if let Ok(handle) = Handle::try_current() {
            let transport = Arc::clone(&self.transport);
            handle.spawn(async move {
                if let Err(e) = transport.close_channel(channel).await {
                    debug!(channel = %channel, error = %e, "Channel close on drop failed");
                }
            });
        }
    }
}
