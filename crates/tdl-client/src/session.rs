//! Connection state shared by the communicator and its crash detector.
//!
//! The main channel and the daemon pid live in one [`Link`] value behind one
//! lock, so a reader sees either the whole connected pair or nothing.

use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use tdl_core::ProcessId;

use crate::lock_unpoisoned;
use crate::transport::ChannelId;

/// Callback invoked once when the connected daemon is observed to die.
pub type DaemonTerminationCallback = Box<dyn Fn() + Send + Sync>;

type SharedCallback = Arc<dyn Fn() + Send + Sync>;

/// State of the main channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Link {
    #[default]
    Disconnected,

    /// Main channel open, daemon pid not yet known.
    Connecting { channel: ChannelId },

    Connected { channel: ChannelId, pid: ProcessId },
}

impl Link {
    /// The open main channel, in either connecting or connected state.
    pub fn channel(&self) -> Option<ChannelId> {
        match self {
            Link::Disconnected => None,
            Link::Connecting { channel } | Link::Connected { channel, .. } => Some(*channel),
        }
    }

    pub fn daemon_pid(&self) -> Option<ProcessId> {
        match self {
            Link::Connected { pid, .. } => Some(*pid),
            _ => None,
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, Link::Connected { .. })
    }
}

/// Link state plus the termination subscriber.
#[derive(Default)]
pub struct Session {
    link: Mutex<Link>,
    on_termination: Mutex<Option<SharedCallback>>,
}

impl Session {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn link(&self) -> Link {
        *lock_unpoisoned(&self.link)
    }

    pub fn set_link(&self, link: Link) {
        *lock_unpoisoned(&self.link) = link;
    }

    /// Moves from `Connecting` on `channel` to `Connected`.
    ///
    /// Returns false if the link changed in the meantime (for instance the
    /// channel died during the pid round trip).
    pub fn complete_connect(&self, channel: ChannelId, pid: ProcessId) -> bool {
        let mut link = lock_unpoisoned(&self.link);
        match *link {
            Link::Connecting { channel: current } if current == channel => {
                *link = Link::Connected { channel, pid };
                true
            }
            _ => false,
        }
    }

    /// Takes the link down and returns the channel that was open, if any.
    pub fn take_channel(&self) -> Option<ChannelId> {
        let mut link = lock_unpoisoned(&self.link);
        let channel = link.channel();
        *link = Link::Disconnected;
        channel
    }

    /// Stores the termination callback, replacing any previous one.
    pub fn set_termination_callback(&self, callback: DaemonTerminationCallback) {
        *lock_unpoisoned(&self.on_termination) = Some(Arc::from(callback));
    }

    /// Handles the death of `channel`.
    ///
    /// If `channel` is the current main channel the link is reset and the
    /// subscriber, if any, is called outside the lock. Returns whether the
    /// notice matched.
    pub fn invalidate(&self, channel: ChannelId) -> bool {
        {
            let mut link = lock_unpoisoned(&self.link);
            if link.channel() != Some(channel) {
                debug!(channel = %channel, "Ignoring death of unrelated channel");
                return false;
            }
            *link = Link::Disconnected;
        }

        info!(channel = %channel, "Daemon connection lost");
        let callback = lock_unpoisoned(&self.on_termination).clone();
        if let Some(callback) = callback {
            callback();
        }
        true
    }
}
