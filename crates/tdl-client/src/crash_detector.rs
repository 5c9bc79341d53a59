//! Background detection of daemon termination.
//!
//! One detector task runs per communicator. It owns a private endpoint that
//! the transport posts `ConnectionDied` notices to, plus one connection
//! attached to that endpoint so the communicator can deliver a private stop
//! signal.
//!
//! ```text
//! Starting ──attach ok──▶ Attached{endpoint, connection} ──stop──▶ Stopped
//!     │
//!     └──attach failed──▶ Unavailable
//! ```
//!
//! The endpoint/connection pair is published through a single `watch` value,
//! so `connect()` never observes one without the other.
//!
//! # Shutdown
//!
//! Shutdown is cooperative: the cancellation token is cancelled AND a `Stop`
//! notification is posted, then the task is joined. The task itself detaches
//! the connection and destroys the endpoint before publishing `Stopped`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lock_unpoisoned;
use crate::session::Session;
use crate::transport::{ConnectionId, EndpointId, Notification, Transport};

/// Pause after a failed receive before trying again.
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Published state of the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorStatus {
    /// Private endpoint not created yet.
    Starting,

    /// Watching for connection deaths.
    Attached {
        endpoint: EndpointId,
        connection: ConnectionId,
    },

    /// Setup failed; nothing is being watched.
    Unavailable,

    /// Stopped and torn down.
    Stopped,
}

/// Handle to the crash detector task.
pub struct CrashDetector {
    transport: Arc<dyn Transport>,
    status: watch::Receiver<DetectorStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CrashDetector {
    /// Spawns the detector on the current tokio runtime.
    ///
    /// Without a runtime the detector reports `Unavailable` and nothing is
    /// spawned.
    pub fn spawn(transport: Arc<dyn Transport>, session: Arc<Session>) -> Self {
        let (status_tx, status) = watch::channel(DetectorStatus::Starting);
        let cancel = CancellationToken::new();

        let task = match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(run_detector(
                Arc::clone(&transport),
                session,
                cancel.clone(),
                status_tx,
            ))),
            Err(e) => {
                warn!(error = %e, "No async runtime, daemon termination detection disabled");
                status_tx.send_replace(DetectorStatus::Unavailable);
                None
            }
        };

        Self {
            transport,
            status,
            cancel,
            task: Mutex::new(task),
        }
    }

    /// Current status without waiting.
    pub fn status(&self) -> DetectorStatus {
        *self.status.borrow()
    }

    /// Waits until the detector has finished its setup.
    pub async fn ready(&self) -> DetectorStatus {
        let mut status = self.status.clone();
        let ready = match status
            .wait_for(|state| *state != DetectorStatus::Starting)
            .await
        {
            Ok(state) => *state,
            Err(_) => DetectorStatus::Unavailable,
        };
        ready
    }

    /// Stops the task and waits for it to finish its teardown.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        if let DetectorStatus::Attached { connection, .. } = self.status() {
            if let Err(e) = self
                .transport
                .send_notification(connection, Notification::Stop)
                .await
            {
                debug!(error = %e, "Stop notification not delivered");
            }
        }

        let task = lock_unpoisoned(&self.task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Crash detector task failed");
            }
        }
    }
}

impl Drop for CrashDetector {
    fn drop(&mut self) {
        // The task tears itself down once it observes the cancellation.
        self.cancel.cancel();
    }
}

async fn attach(transport: &dyn Transport) -> Option<(EndpointId, ConnectionId)> {
    let endpoint = match transport.create_private_endpoint().await {
        Ok(endpoint) => endpoint,
        Err(e) => {
            warn!(error = %e, "Failed to create crash detection endpoint");
            return None;
        }
    };

    match transport.attach(endpoint).await {
        Ok(connection) => Some((endpoint, connection)),
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "Failed to attach crash detection connection");
            if let Err(e) = transport.destroy_private_endpoint(endpoint).await {
                debug!(endpoint = %endpoint, error = %e, "Endpoint cleanup failed");
            }
            None
        }
    }
}

async fn run_detector(
    transport: Arc<dyn Transport>,
    session: Arc<Session>,
    cancel: CancellationToken,
    status: watch::Sender<DetectorStatus>,
) {
    let Some((endpoint, connection)) = attach(transport.as_ref()).await else {
        status.send_replace(DetectorStatus::Unavailable);
        return;
    };
    status.send_replace(DetectorStatus::Attached {
        endpoint,
        connection,
    });
    info!(endpoint = %endpoint, connection = %connection, "Crash detector started");

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Crash detector cancelled");
                break;
            }

            received = transport.receive_notification(endpoint) => match received {
                Ok(Notification::ConnectionDied { channel }) => {
                    session.invalidate(channel);
                }
                Ok(Notification::Stop) => {
                    debug!("Crash detector received stop");
                    break;
                }
                Ok(Notification::Other { code, value }) => {
                    debug!(code, value, "Ignoring notification");
                }
                Err(e) => {
                    warn!(endpoint = %endpoint, error = %e, "Notification receive failed");
                    sleep(RECEIVE_RETRY_DELAY).await;
                }
            },
        }
    }

    if let Err(e) = transport.detach(connection).await {
        warn!(connection = %connection, error = %e, "Failed to detach crash detection connection");
    }
    if let Err(e) = transport.destroy_private_endpoint(endpoint).await {
        warn!(endpoint = %endpoint, error = %e, "Failed to destroy crash detection endpoint");
    }
    status.send_replace(DetectorStatus::Stopped);
    info!("Crash detector stopped");
}
