//! In-process transport for tests and simulations
//!
//! A [`MemoryNetwork`] holds the store of every node that joined it plus an
//! explicit set of links. Opening a stream over a link creates a duplex
//! pipe and runs the remote node's responder on the other end, exactly as
//! the iroh handlers would.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::{PeerStream, Transport};
use crate::error::{SyncError, SyncResult};
use crate::identity::PeerId;
use crate::protocol::{serve_feed, serve_profile, FEED_ALPN, PROFILE_ALPN};
use crate::storage::Storage;

/// Buffer size of each in-memory pipe direction
const PIPE_CAPACITY: usize = 64 * 1024;

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, Storage>,
    /// Unordered pairs, stored with the smaller id first
    links: HashSet<(PeerId, PeerId)>,
    /// Streams opened towards each peer
    streams_opened: HashMap<PeerId, usize>,
}

fn link_key(a: PeerId, b: PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared registry of in-memory nodes and the links between them
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<RwLock<NetworkState>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("MemoryNetwork")
            .field("nodes", &state.nodes.len())
            .field("links", &state.links.len())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `storage` as a node and return its transport
    pub fn join(&self, storage: Storage) -> MemoryTransport {
        let local_peer = storage.local_peer();
        self.state.write().nodes.insert(local_peer, storage);
        MemoryTransport {
            network: self.clone(),
            local_peer,
        }
    }

    /// Connect two nodes
    pub fn link(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.write().links.insert(link_key(*a, *b))
    }

    /// Disconnect two nodes
    pub fn unlink(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.write().links.remove(&link_key(*a, *b))
    }

    pub fn is_linked(&self, a: &PeerId, b: &PeerId) -> bool {
        self.state.read().links.contains(&link_key(*a, *b))
    }

    /// Number of streams any node has opened towards `peer`
    pub fn streams_opened_to(&self, peer: &PeerId) -> usize {
        self.state
            .read()
            .streams_opened
            .get(peer)
            .copied()
            .unwrap_or(0)
    }
}

/// One node's view of a [`MemoryNetwork`]
#[derive(Clone, Debug)]
pub struct MemoryTransport {
    network: MemoryNetwork,
    local_peer: PeerId,
}

impl Transport for MemoryTransport {
    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    async fn open_stream(&self, peer: &PeerId, alpn: &'static [u8]) -> SyncResult<PeerStream> {
        if alpn != FEED_ALPN && alpn != PROFILE_ALPN {
            return Err(SyncError::Network(format!(
                "Peer {} does not speak {}",
                peer,
                String::from_utf8_lossy(alpn)
            )));
        }

        let storage = {
            let mut state = self.network.state.write();
            if !state.links.contains(&link_key(self.local_peer, *peer)) {
                return Err(SyncError::Network(format!("Not connected to {}", peer)));
            }
            let storage = state
                .nodes
                .get(peer)
                .cloned()
                .ok_or_else(|| SyncError::Network(format!("Unknown peer {}", peer)))?;
            *state.streams_opened.entry(*peer).or_insert(0) += 1;
            storage
        };

        let (local, remote) = tokio::io::duplex(PIPE_CAPACITY);
        let (remote_recv, remote_send) = tokio::io::split(remote);
        let requester = self.local_peer;
        let responder = *peer;

        tokio::spawn(async move {
            let result = if alpn == FEED_ALPN {
                serve_feed(&storage, remote_recv, remote_send).await.map(|_| ())
            } else {
                serve_profile(&storage, remote_send).await.map(|_| ())
            };
            if let Err(e) = result {
                debug!(peer = %responder, requester = %requester, error = ?e, "In-memory responder failed");
            }
        });

        let (recv, send) = tokio::io::split(local);
        Ok(PeerStream {
            peer: *peer,
            send: Box::new(send),
            recv: Box::new(recv),
        })
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.network.is_linked(&self.local_peer, peer)
    }

    async fn dial(&self, peer: &PeerId, _addresses: &[String]) -> SyncResult<bool> {
        if *peer == self.local_peer {
            return Err(SyncError::InvalidInput("Cannot dial ourselves".to_string()));
        }
        if !self.network.state.read().nodes.contains_key(peer) {
            return Err(SyncError::Network(format!("Peer {} is unreachable", peer)));
        }
        Ok(self.network.link(&self.local_peer, peer))
    }

    fn local_addresses(&self) -> Vec<String> {
        vec![format!("memory:{}", self.local_peer)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::create_test_storage;

    #[tokio::test]
    async fn test_streams_require_a_link() {
        let network = MemoryNetwork::new();
        let (a_store, _ka, _ta) = create_test_storage();
        let (b_store, _kb, _tb) = create_test_storage();
        let a = network.join(a_store);
        let b = network.join(b_store);
        let b_id = b.local_peer();

        assert!(!a.is_connected(&b_id));
        assert!(a.open_stream(&b_id, FEED_ALPN).await.is_err());
        assert_eq!(network.streams_opened_to(&b_id), 0);

        network.link(&a.local_peer(), &b_id);
        assert!(a.is_connected(&b_id));
        assert!(b.is_connected(&a.local_peer()));
        assert!(a.open_stream(&b_id, PROFILE_ALPN).await.is_ok());
        assert_eq!(network.streams_opened_to(&b_id), 1);

        network.unlink(&b_id, &a.local_peer());
        assert!(!a.is_connected(&b_id));
    }

    #[tokio::test]
    async fn test_dial_links_once() {
        let network = MemoryNetwork::new();
        let (a_store, _ka, _ta) = create_test_storage();
        let (b_store, _kb, _tb) = create_test_storage();
        let a = network.join(a_store);
        let b_id = network.join(b_store).local_peer();

        assert!(a.dial(&b_id, &[]).await.unwrap());
        assert!(!a.dial(&b_id, &[]).await.unwrap());
        assert!(a.dial(&a.local_peer(), &[]).await.is_err());
    }

    #[tokio::test]
    async fn test_dial_unknown_peer_fails() {
        let network = MemoryNetwork::new();
        let (a_store, _ka, _ta) = create_test_storage();
        let (_stranger_store, stranger, _ts) = create_test_storage();
        let a = network.join(a_store);

        let result = a.dial(&stranger.peer_id(), &[]).await;
        assert!(matches!(result, Err(SyncError::Network(_))));
    }

    #[tokio::test]
    async fn test_unknown_alpn_is_rejected() {
        let network = MemoryNetwork::new();
        let (a_store, _ka, _ta) = create_test_storage();
        let (b_store, _kb, _tb) = create_test_storage();
        let a = network.join(a_store);
        let b_id = network.join(b_store).local_peer();
        network.link(&a.local_peer(), &b_id);

        assert!(a.open_stream(&b_id, b"/other/1").await.is_err());
        assert_eq!(network.streams_opened_to(&b_id), 0);
    }
}
