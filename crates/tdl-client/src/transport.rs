//! Message-passing capability the communicator is written against.
//!
//! The trait exposes exactly what the protocol needs from the OS:
//!
//! - named channels to a server, each carrying blocking request/reply
//!   exchanges;
//! - private endpoints that receive short notifications, including a
//!   `ConnectionDied` notice whenever a channel opened through the same
//!   transport loses its server;
//! - connections attached to a private endpoint, used to post notifications
//!   to it (the crash detector's stop signal travels this way);
//! - one-shot deadlines bounding a single exchange.
//!
//! Backends own every resource behind the integer ids they hand out. Ids are
//! plain values with no ownership, so a stale id simply fails lookup.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::TransportResult;

// ============================================================================
// Resource Ids
// ============================================================================

macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(i32);

        impl $name {
            pub const fn new(raw: i32) -> Self {
                Self(raw)
            }

            pub const fn as_raw(self) -> i32 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

resource_id!(
    /// A client channel to a named server endpoint.
    ChannelId
);
resource_id!(
    /// A private endpoint that receives notifications.
    EndpointId
);
resource_id!(
    /// A connection attached to a private endpoint.
    ConnectionId
);

// ============================================================================
// Notifications
// ============================================================================

/// Short out-of-band message delivered to a private endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// The server behind `channel` went away.
    ConnectionDied { channel: ChannelId },

    /// Private stop signal for the endpoint's owner.
    Stop,

    /// Anything else a backend may deliver; carries its raw code and value.
    Other { code: i8, value: i32 },
}

// ============================================================================
// Deadlines
// ============================================================================

/// A one-shot deadline bounding one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline(Instant);

impl Deadline {
    /// Deadline expiring `timeout` from now.
    pub fn after(timeout: Duration) -> Self {
        Self(Instant::now() + timeout)
    }

    pub fn instant(self) -> Instant {
        self.0
    }

    pub fn is_expired(self) -> bool {
        Instant::now() >= self.0
    }
}

// ============================================================================
// Transport Trait
// ============================================================================

/// OS message-passing primitives.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Opens a channel to the server published under `name`.
    async fn open_channel(&self, name: &str) -> TransportResult<ChannelId>;

    /// Closes a channel. Closing never produces a `ConnectionDied` notice.
    async fn close_channel(&self, channel: ChannelId) -> TransportResult<()>;

    /// Sends `request` and waits for the reply, which is written into `reply`.
    ///
    /// Returns the number of reply bytes written.
    async fn send_receive(
        &self,
        channel: ChannelId,
        request: &[u8],
        reply: &mut [u8],
    ) -> TransportResult<usize>;

    /// Creates a private endpoint flagged for connection-death notices.
    async fn create_private_endpoint(&self) -> TransportResult<EndpointId>;

    async fn destroy_private_endpoint(&self, endpoint: EndpointId) -> TransportResult<()>;

    /// Attaches a connection onto `endpoint`.
    async fn attach(&self, endpoint: EndpointId) -> TransportResult<ConnectionId>;

    async fn detach(&self, connection: ConnectionId) -> TransportResult<()>;

    /// Posts a notification to the endpoint `connection` is attached to.
    async fn send_notification(
        &self,
        connection: ConnectionId,
        notification: Notification,
    ) -> TransportResult<()>;

    /// Waits for the next notification on `endpoint`.
    async fn receive_notification(&self, endpoint: EndpointId) -> TransportResult<Notification>;

    /// Arms a one-shot deadline for the next exchange.
    ///
    /// Backends with a timer resource to allocate override this; the default
    /// is a plain monotonic instant.
    fn arm_deadline(&self, timeout: Duration) -> TransportResult<Deadline> {
        Ok(Deadline::after(timeout))
    }
}
