//! Node events and sync pass reporting
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  NodeEvent: notifications for the control plane          │
//! │  ├── FeedUpdated: a local post was saved and signed      │
//! │  └── PeerConnected: a peer connection was established    │
//! │                                                          │
//! │  SyncReport: outcome of one sync pass                    │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::fmt;

use crate::identity::PeerId;

/// Capacity of the node's event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Notification emitted by a running node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A locally authored post was saved and signed
    FeedUpdated {
        /// ID of the new post
        post_id: String,
    },
    /// A peer connection was newly established
    PeerConnected {
        /// The connected peer
        peer_id: PeerId,
    },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::FeedUpdated { post_id } => write!(f, "feed:updated {}", post_id),
            NodeEvent::PeerConnected { peer_id } => write!(f, "peer:connected {}", peer_id),
        }
    }
}

/// Counters for one sync pass
///
/// `synced + failed + skipped_offline` is at most `known`; it is lower only
/// when the pass was stopped early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Known peers at the start of the pass
    pub known: usize,
    /// Peers skipped because they were not connected
    pub skipped_offline: usize,
    /// Peers whose feed was fetched successfully
    pub synced: usize,
    /// Peers whose feed fetch failed
    pub failed: usize,
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} known, {} synced, {} failed, {} offline",
            self.known, self.synced, self.failed, self.skipped_offline
        )
    }
}
