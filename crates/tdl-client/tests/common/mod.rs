//! Shared test doubles for the communicator integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`; the panic-free policy covers
//! production code only.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use tdl_client::{
    ChannelId, CommunicatorConfig, ConnectionId, DaemonCommunicator, Deadline, EndpointId,
    Notification, SharedMemoryOs, Transport, TransportError, TransportResult,
};
use tdl_core::{ProcessId, ShmHandle};
use tdl_protocol::{decode_request, encode_response, Request, Response};

/// Pid the scripted daemon reports.
pub const DAEMON_PID: ProcessId = ProcessId::new(4242);

/// Short deadline so timeout tests stay quick.
pub const TEST_SEND_TIMEOUT_MS: u64 = 50;

// ============================================================================
// Scripted Transport
// ============================================================================

/// What the scripted daemon does with one request.
pub enum Reply {
    Respond(Response),
    /// Never answer.
    Hang,
    /// Fail the exchange at the transport level.
    Fail,
    /// Answer with raw bytes instead of an encoded response.
    Raw(Vec<u8>),
}

type Handler = Box<dyn FnMut(&Request) -> Reply + Send>;
type NotificationQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>>;

/// In-memory transport answering requests through a closure.
pub struct ScriptedTransport {
    handler: Mutex<Handler>,
    pub fail_open: AtomicBool,
    pub fail_endpoint_creation: AtomicBool,
    pub fail_attach: AtomicBool,
    pub fail_deadline: AtomicBool,
    sent: Mutex<Vec<Request>>,
    open_channels: Mutex<HashSet<ChannelId>>,
    endpoints: Mutex<HashMap<EndpointId, (mpsc::UnboundedSender<Notification>, NotificationQueue)>>,
    connections: Mutex<HashMap<ConnectionId, EndpointId>>,
    next_id: AtomicI32,
}

impl ScriptedTransport {
    pub fn new(handler: impl FnMut(&Request) -> Reply + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            handler: Mutex::new(Box::new(handler)),
            fail_open: AtomicBool::new(false),
            fail_endpoint_creation: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            fail_deadline: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            open_channels: Mutex::new(HashSet::new()),
            endpoints: Mutex::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicI32::new(100),
        })
    }

    /// A daemon that reports [`DAEMON_PID`] and hands every other request
    /// to `handler`.
    pub fn daemon(mut handler: impl FnMut(&Request) -> Reply + Send + 'static) -> Arc<Self> {
        Self::new(move |request| match request {
            Request::DaemonProcessId => Reply::Respond(Response::DaemonProcessId(DAEMON_PID)),
            other => handler(other),
        })
    }

    /// Every request received so far, pid requests included.
    pub fn sent_requests(&self) -> Vec<Request> {
        self.sent.lock().unwrap().clone()
    }

    /// Requests other than the pid round trip.
    pub fn rpc_requests(&self) -> Vec<Request> {
        self.sent_requests()
            .into_iter()
            .filter(|request| *request != Request::DaemonProcessId)
            .collect()
    }

    pub fn open_channels(&self) -> Vec<ChannelId> {
        self.open_channels.lock().unwrap().iter().copied().collect()
    }

    pub fn live_endpoints(&self) -> usize {
        self.endpoints.lock().unwrap().len()
    }

    pub fn live_connections(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Reports `channel` dead to every private endpoint.
    pub fn kill_channel(&self, channel: ChannelId) {
        self.open_channels.lock().unwrap().remove(&channel);
        for (sender, _) in self.endpoints.lock().unwrap().values() {
            let _ = sender.send(Notification::ConnectionDied { channel });
        }
    }

    fn allocate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn open_channel(&self, name: &str) -> TransportResult<ChannelId> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(TransportError::EndpointNameNotFound {
                name: name.to_string(),
                path: name.into(),
            });
        }
        let channel = ChannelId::new(self.allocate_id());
        self.open_channels.lock().unwrap().insert(channel);
        Ok(channel)
    }

    async fn close_channel(&self, channel: ChannelId) -> TransportResult<()> {
        if self.open_channels.lock().unwrap().remove(&channel) {
            Ok(())
        } else {
            Err(TransportError::ChannelNotFound(channel))
        }
    }

    async fn send_receive(
        &self,
        channel: ChannelId,
        request: &[u8],
        reply: &mut [u8],
    ) -> TransportResult<usize> {
        if !self.open_channels.lock().unwrap().contains(&channel) {
            return Err(TransportError::ChannelNotFound(channel));
        }

        let request = decode_request(request)
            .map_err(|e| TransportError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;
        self.sent.lock().unwrap().push(request);

        let outcome = {
            let mut handler = self.handler.lock().unwrap();
            (*handler)(&request)
        };

        let bytes = match outcome {
            Reply::Respond(response) => encode_response(&response).to_vec(),
            Reply::Raw(bytes) => bytes,
            Reply::Fail => return Err(TransportError::PeerClosed(channel)),
            Reply::Hang => std::future::pending().await,
        };

        let target = reply
            .get_mut(..bytes.len())
            .ok_or(TransportError::ReplyTooLarge {
                capacity: 0,
                actual: bytes.len(),
            })?;
        target.copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    async fn create_private_endpoint(&self) -> TransportResult<EndpointId> {
        if self.fail_endpoint_creation.load(Ordering::SeqCst) {
            return Err(TransportError::Io(io::Error::from(io::ErrorKind::PermissionDenied)));
        }
        let endpoint = EndpointId::new(self.allocate_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        self.endpoints.lock().unwrap().insert(
            endpoint,
            (sender, Arc::new(tokio::sync::Mutex::new(receiver))),
        );
        Ok(endpoint)
    }

    async fn destroy_private_endpoint(&self, endpoint: EndpointId) -> TransportResult<()> {
        self.endpoints
            .lock()
            .unwrap()
            .remove(&endpoint)
            .map(|_| ())
            .ok_or(TransportError::EndpointNotFound(endpoint))
    }

    async fn attach(&self, endpoint: EndpointId) -> TransportResult<ConnectionId> {
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(TransportError::EndpointNotFound(endpoint));
        }
        let connection = ConnectionId::new(self.allocate_id());
        self.connections.lock().unwrap().insert(connection, endpoint);
        Ok(connection)
    }

    async fn detach(&self, connection: ConnectionId) -> TransportResult<()> {
        self.connections
            .lock()
            .unwrap()
            .remove(&connection)
            .map(|_| ())
            .ok_or(TransportError::ConnectionNotFound(connection))
    }

    async fn send_notification(
        &self,
        connection: ConnectionId,
        notification: Notification,
    ) -> TransportResult<()> {
        let endpoint = *self
            .connections
            .lock()
            .unwrap()
            .get(&connection)
            .ok_or(TransportError::ConnectionNotFound(connection))?;
        let endpoints = self.endpoints.lock().unwrap();
        let (sender, _) = endpoints
            .get(&endpoint)
            .ok_or(TransportError::EndpointNotFound(endpoint))?;
        sender
            .send(notification)
            .map_err(|_| TransportError::EndpointNotFound(endpoint))
    }

    async fn receive_notification(&self, endpoint: EndpointId) -> TransportResult<Notification> {
        let queue = self
            .endpoints
            .lock()
            .unwrap()
            .get(&endpoint)
            .map(|(_, queue)| Arc::clone(queue))
            .ok_or(TransportError::EndpointNotFound(endpoint))?;
        let mut receiver = queue.lock().await;
        receiver
            .recv()
            .await
            .ok_or(TransportError::EndpointNotFound(endpoint))
    }

    fn arm_deadline(&self, timeout: Duration) -> TransportResult<Deadline> {
        if self.fail_deadline.load(Ordering::SeqCst) {
            return Err(TransportError::DeadlineUnavailable("timer exhausted".to_string()));
        }
        Ok(Deadline::after(timeout))
    }
}

// ============================================================================
// Fake Shared Memory
// ============================================================================

/// Shared-memory backend handing out real descriptors to temp files.
#[derive(Default)]
pub struct FakeSharedMemory {
    pub fail_open: AtomicBool,
    pub fail_handle: AtomicBool,
}

/// Offset added to a descriptor to form its fake handle.
pub const HANDLE_OFFSET: u64 = 0x1000;

impl SharedMemoryOs for FakeSharedMemory {
    fn open(&self, _path: &str) -> io::Result<OwnedFd> {
        if self.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        }
        Ok(tempfile::tempfile()?.into())
    }

    fn create_handle(&self, fd: RawFd, _daemon_pid: ProcessId) -> io::Result<ShmHandle> {
        if self.fail_handle.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::PermissionDenied));
        }
        Ok(ShmHandle::new(HANDLE_OFFSET + fd as u64))
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn test_config() -> CommunicatorConfig {
    CommunicatorConfig {
        send_timeout_ms: TEST_SEND_TIMEOUT_MS,
        ..CommunicatorConfig::default()
    }
}

pub fn communicator(transport: &Arc<ScriptedTransport>) -> DaemonCommunicator {
    communicator_with_shm(transport, Arc::new(FakeSharedMemory::default()))
}

pub fn communicator_with_shm(
    transport: &Arc<ScriptedTransport>,
    shm: Arc<FakeSharedMemory>,
) -> DaemonCommunicator {
    DaemonCommunicator::new(transport.clone(), shm, test_config())
}

/// Polls `condition` for up to one second.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
