//! Unix-domain-socket backend for [`Transport`].
//!
//! A named server endpoint is the socket file `<socket_dir>/<name>.sock`.
//! Every open channel is served by one worker task that owns the stream:
//!
//! ```text
//! ┌──────────────────┐  Exchange   ┌────────────────┐  264 B   ┌────────┐
//! │ send_receive()   │────────────▶│ channel worker │─────────▶│ daemon │
//! │                  │◀────────────│ (per channel)  │◀─────────│        │
//! └──────────────────┘  oneshot    └───────┬────────┘  16 B    └────────┘
//!                                          │ EOF while idle
//!                                          ▼
//!                                  ConnectionDied to every
//!                                  private endpoint
//! ```
//!
//! Between exchanges the worker keeps a read pending on the stream, so the
//! server closing its end is noticed even when the client is quiet.
//!
//! Requests and replies are fixed-size, so an exchange writes the request
//! image and then reads exactly as many bytes as the caller's reply buffer
//! holds. A caller that gives up after its request went out still leaves a
//! reply owed on the stream; the worker counts those bytes and drops them
//! before the next reply is read, so replies never shift onto later requests.
//!
//! A worker whose server hung up removes its own channel entry.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{TransportError, TransportResult};
use crate::lock_unpoisoned;
use crate::transport::{ChannelId, ConnectionId, EndpointId, Notification, Transport};

/// Pending exchanges queued per channel.
const EXCHANGE_QUEUE_DEPTH: usize = 8;

/// Scratch space for bytes arriving between exchanges.
const IDLE_READ_BUFFER: usize = 64;

// ============================================================================
// Shared Tables
// ============================================================================

/// One request/reply exchange handed to a channel worker.
struct Exchange {
    request: Vec<u8>,
    reply_len: usize,
    respond_to: oneshot::Sender<TransportResult<Vec<u8>>>,
}

struct ChannelWorker {
    commands: mpsc::Sender<Exchange>,
    cancel: CancellationToken,
}

type ChannelTable = Arc<Mutex<HashMap<ChannelId, ChannelWorker>>>;

type NotificationQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Notification>>>;

struct Endpoint {
    sender: mpsc::UnboundedSender<Notification>,
    receiver: NotificationQueue,
}

/// Private endpoints and the connections attached to them.
#[derive(Default)]
struct EndpointTable {
    endpoints: HashMap<EndpointId, Endpoint>,
    connections: HashMap<ConnectionId, EndpointId>,
}

impl EndpointTable {
    fn broadcast(&self, notification: Notification) {
        for (id, endpoint) in &self.endpoints {
            if endpoint.sender.send(notification).is_err() {
                debug!(endpoint = %id, "Endpoint receiver gone, notification dropped");
            }
        }
    }
}

// ============================================================================
// Unix Socket Transport
// ============================================================================

/// [`Transport`] over Unix-domain stream sockets.
pub struct UnixSocketTransport {
    socket_dir: PathBuf,
    next_id: AtomicI32,
    channels: ChannelTable,
    endpoints: Arc<Mutex<EndpointTable>>,
}

impl UnixSocketTransport {
    /// Creates a transport resolving endpoint names inside `socket_dir`.
    pub fn new(socket_dir: impl Into<PathBuf>) -> Self {
        Self {
            socket_dir: socket_dir.into(),
            next_id: AtomicI32::new(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
            endpoints: Arc::new(Mutex::new(EndpointTable::default())),
        }
    }

    pub fn socket_dir(&self) -> &Path {
        &self.socket_dir
    }

    /// Socket file a logical endpoint name maps to.
    pub fn socket_path(&self, name: &str) -> PathBuf {
        self.socket_dir.join(format!("{name}.sock"))
    }

    fn allocate_id(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn endpoint_queue(&self, endpoint: EndpointId) -> TransportResult<NotificationQueue> {
        lock_unpoisoned(&self.endpoints)
            .endpoints
            .get(&endpoint)
            .map(|slot| Arc::clone(&slot.receiver))
            .ok_or(TransportError::EndpointNotFound(endpoint))
    }
}

impl Drop for UnixSocketTransport {
    fn drop(&mut self) {
        for worker in lock_unpoisoned(&self.channels).values() {
            worker.cancel.cancel();
        }
    }
}

#[async_trait]
impl Transport for UnixSocketTransport {
    async fn open_channel(&self, name: &str) -> TransportResult<ChannelId> {
        let path = self.socket_path(name);
        if !path.exists() {
            return Err(TransportError::EndpointNameNotFound {
                name: name.to_string(),
                path,
            });
        }

        let stream = UnixStream::connect(&path).await?;
        let channel = ChannelId::new(self.allocate_id());
        let (commands, receiver) = mpsc::channel(EXCHANGE_QUEUE_DEPTH);
        let cancel = CancellationToken::new();

        // Registered before the worker runs so a fast hang-up can unregister it.
        lock_unpoisoned(&self.channels).insert(
            channel,
            ChannelWorker {
                commands,
                cancel: cancel.clone(),
            },
        );
        tokio::spawn(run_channel_worker(
            channel,
            stream,
            receiver,
            cancel,
            Arc::clone(&self.channels),
            Arc::clone(&self.endpoints),
        ));

        info!(channel = %channel, path = %path.display(), "Channel opened");
        Ok(channel)
    }

    async fn close_channel(&self, channel: ChannelId) -> TransportResult<()> {
        let worker = lock_unpoisoned(&self.channels)
            .remove(&channel)
            .ok_or(TransportError::ChannelNotFound(channel))?;
        worker.cancel.cancel();
        debug!(channel = %channel, "Channel closed");
        Ok(())
    }

    async fn send_receive(
        &self,
        channel: ChannelId,
        request: &[u8],
        reply: &mut [u8],
    ) -> TransportResult<usize> {
        let commands = lock_unpoisoned(&self.channels)
            .get(&channel)
            .map(|worker| worker.commands.clone())
            .ok_or(TransportError::ChannelNotFound(channel))?;

        let capacity = reply.len();
        let (respond_to, response) = oneshot::channel();
        commands
            .send(Exchange {
                request: request.to_vec(),
                reply_len: capacity,
                respond_to,
            })
            .await
            .map_err(|_| TransportError::WorkerStopped(channel))?;

        let bytes = response
            .await
            .map_err(|_| TransportError::WorkerStopped(channel))??;

        let target = reply
            .get_mut(..bytes.len())
            .ok_or(TransportError::ReplyTooLarge {
                capacity,
                actual: bytes.len(),
            })?;
        target.copy_from_slice(&bytes);
        Ok(bytes.len())
    }

    async fn create_private_endpoint(&self) -> TransportResult<EndpointId> {
        let endpoint = EndpointId::new(self.allocate_id());
        let (sender, receiver) = mpsc::unbounded_channel();
        lock_unpoisoned(&self.endpoints).endpoints.insert(
            endpoint,
            Endpoint {
                sender,
                receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            },
        );
        debug!(endpoint = %endpoint, "Private endpoint created");
        Ok(endpoint)
    }

    async fn destroy_private_endpoint(&self, endpoint: EndpointId) -> TransportResult<()> {
        let mut table = lock_unpoisoned(&self.endpoints);
        table
            .endpoints
            .remove(&endpoint)
            .ok_or(TransportError::EndpointNotFound(endpoint))?;
        table.connections.retain(|_, target| *target != endpoint);
        debug!(endpoint = %endpoint, "Private endpoint destroyed");
        Ok(())
    }

    async fn attach(&self, endpoint: EndpointId) -> TransportResult<ConnectionId> {
        let mut table = lock_unpoisoned(&self.endpoints);
        if !table.endpoints.contains_key(&endpoint) {
            return Err(TransportError::EndpointNotFound(endpoint));
        }
        let connection = ConnectionId::new(self.allocate_id());
        table.connections.insert(connection, endpoint);
        Ok(connection)
    }

    async fn detach(&self, connection: ConnectionId) -> TransportResult<()> {
        lock_unpoisoned(&self.endpoints)
            .connections
            .remove(&connection)
            .map(|_| ())
            .ok_or(TransportError::ConnectionNotFound(connection))
    }

    async fn send_notification(
        &self,
        connection: ConnectionId,
        notification: Notification,
    ) -> TransportResult<()> {
        let table = lock_unpoisoned(&self.endpoints);
        let endpoint = table
            .connections
            .get(&connection)
            .ok_or(TransportError::ConnectionNotFound(connection))?;
        let slot = table
            .endpoints
            .get(endpoint)
            .ok_or(TransportError::EndpointNotFound(*endpoint))?;
        slot.sender
            .send(notification)
            .map_err(|_| TransportError::EndpointNotFound(*endpoint))
    }

    async fn receive_notification(&self, endpoint: EndpointId) -> TransportResult<Notification> {
        let queue = self.endpoint_queue(endpoint)?;
        let mut receiver = queue.lock().await;
        receiver
            .recv()
            .await
            .ok_or(TransportError::EndpointNotFound(endpoint))
    }
}

// ============================================================================
// Channel Worker
// ============================================================================

async fn run_channel_worker(
    channel: ChannelId,
    mut stream: UnixStream,
    mut commands: mpsc::Receiver<Exchange>,
    cancel: CancellationToken,
    channels: ChannelTable,
    endpoints: Arc<Mutex<EndpointTable>>,
) {
    let mut idle = [0u8; IDLE_READ_BUFFER];
    // Reply bytes the server still owes for requests already written.
    let mut owed = 0usize;

    let died = loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break false,

            command = commands.recv() => {
                let Some(Exchange { request, reply_len, mut respond_to }) = command else {
                    break false;
                };

                // The write always completes so the server never sees half a request.
                let written = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break false,
                    written = stream.write_all(&request) => written,
                };

                let result = match written {
                    Ok(()) => {
                        owed += reply_len;
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break false,
                            _ = respond_to.closed() => {
                                debug!(channel = %channel, "Caller abandoned exchange, reply will be dropped");
                                continue;
                            }
                            reply = read_reply(&mut stream, reply_len, &mut owed) => reply,
                        }
                    }
                    Err(e) => Err(TransportError::Io(e)),
                };

                let peer_gone = matches!(
                    &result,
                    Err(TransportError::Io(e)) if is_disconnect(e)
                );
                let result = result.map_err(|e| match e {
                    TransportError::Io(ref io) if is_disconnect(io) => {
                        TransportError::PeerClosed(channel)
                    }
                    other => other,
                });
                let _ = respond_to.send(result);
                if peer_gone {
                    break true;
                }
            }

            read = stream.read(&mut idle) => match read {
                Ok(0) => break true,
                Ok(n) => {
                    let late = n.min(owed);
                    owed -= late;
                    if late > 0 {
                        debug!(channel = %channel, bytes = late, "Dropped late reply");
                    }
                    if n > late {
                        warn!(channel = %channel, bytes = n - late, "Discarding unsolicited bytes");
                    }
                }
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Channel read failed");
                    break true;
                }
            },
        }
    };

    if died && !cancel.is_cancelled() {
        info!(channel = %channel, "Server closed channel");
        lock_unpoisoned(&channels).remove(&channel);
        lock_unpoisoned(&endpoints).broadcast(Notification::ConnectionDied { channel });
    }
    debug!(channel = %channel, "Channel worker stopped");
}

/// Reads the reply to the latest request, first dropping replies still owed
/// to abandoned ones. `owed` is kept exact across cancellation.
async fn read_reply(
    stream: &mut UnixStream,
    reply_len: usize,
    owed: &mut usize,
) -> TransportResult<Vec<u8>> {
    let mut stale = [0u8; IDLE_READ_BUFFER];
    while *owed > reply_len {
        let want = (*owed - reply_len).min(stale.len());
        let n = stream.read(&mut stale[..want]).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        *owed -= n;
        debug!(bytes = n, "Dropped late reply");
    }

    let mut reply = vec![0u8; reply_len];
    let mut filled = 0;
    while filled < reply_len {
        let n = stream.read(&mut reply[filled..]).await?;
        if n == 0 {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        filled += n;
        *owed -= n;
    }
    Ok(reply)
}

fn is_disconnect(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    fn transport() -> (UnixSocketTransport, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (UnixSocketTransport::new(dir.path()), dir)
    }

    #[test]
    fn test_socket_path_mapping() {
        let transport = UnixSocketTransport::new("/run/user/1000");
        assert_eq!(
            transport.socket_path("trace_daemon"),
            PathBuf::from("/run/user/1000/trace_daemon.sock")
        );
    }

    #[tokio::test]
    async fn test_open_missing_endpoint_fails() {
        let (transport, _dir) = transport();
        let err = transport.open_channel("nobody").await.unwrap_err();
        assert!(matches!(err, TransportError::EndpointNameNotFound { .. }));
    }

    #[tokio::test]
    async fn test_stop_notification_reaches_endpoint() {
        let (transport, _dir) = transport();
        let endpoint = transport.create_private_endpoint().await.unwrap();
        let connection = transport.attach(endpoint).await.unwrap();

        transport
            .send_notification(connection, Notification::Stop)
            .await
            .unwrap();
        assert_eq!(
            transport.receive_notification(endpoint).await.unwrap(),
            Notification::Stop
        );

        transport.detach(connection).await.unwrap();
        transport.destroy_private_endpoint(endpoint).await.unwrap();
        assert!(transport
            .send_notification(connection, Notification::Stop)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_exchange_and_close_without_death_notice() {
        let (transport, dir) = transport();
        let listener = UnixListener::bind(dir.path().join("echo.sock")).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4];
            stream.read_exact(&mut request).await.unwrap();
            stream.write_all(&[request[0], 9]).await.unwrap();
            // Keep the server side open until the client hangs up.
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let endpoint = transport.create_private_endpoint().await.unwrap();
        let channel = transport.open_channel("echo").await.unwrap();

        let mut reply = [0u8; 2];
        let n = transport
            .send_receive(channel, &[5, 0, 0, 0], &mut reply)
            .await
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(reply, [5, 9]);

        transport.close_channel(channel).await.unwrap();
        let pending = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            transport.receive_notification(endpoint),
        )
        .await;
        assert!(pending.is_err(), "closing a channel must not report a death");
    }

    #[tokio::test]
    async fn test_server_exit_posts_connection_died() {
        let (transport, dir) = transport();
        let listener = UnixListener::bind(dir.path().join("short.sock")).unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let endpoint = transport.create_private_endpoint().await.unwrap();
        let channel = transport.open_channel("short").await.unwrap();

        let notification = transport.receive_notification(endpoint).await.unwrap();
        assert_eq!(notification, Notification::ConnectionDied { channel });
        assert!(lock_unpoisoned(&transport.channels).is_empty());
        assert!(matches!(
            transport.close_channel(channel).await,
            Err(TransportError::ChannelNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_late_reply_is_not_handed_to_next_exchange() {
        let (transport, dir) = transport();
        let listener = UnixListener::bind(dir.path().join("slow.sock")).unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 1];
            stream.read_exact(&mut request).await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            stream.write_all(&[request[0], request[0]]).await.unwrap();
            stream.read_exact(&mut request).await.unwrap();
            stream.write_all(&[request[0], request[0]]).await.unwrap();
            let mut rest = Vec::new();
            let _ = stream.read_to_end(&mut rest).await;
        });

        let channel = transport.open_channel("slow").await.unwrap();
        let mut reply = [0u8; 2];
        let first = tokio::time::timeout(
            std::time::Duration::from_millis(20),
            transport.send_receive(channel, &[1], &mut reply),
        )
        .await;
        assert!(first.is_err());

        let mut reply = [0u8; 2];
        transport
            .send_receive(channel, &[2], &mut reply)
            .await
            .unwrap();
        assert_eq!(reply, [2, 2]);
        transport.close_channel(channel).await.unwrap();
    }
}
