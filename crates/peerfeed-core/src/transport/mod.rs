//! Peer transport seam
//!
//! The sync layer only needs three things from the network: open a
//! bidirectional stream to a peer for a protocol, ask whether a peer is
//! currently connected, and dial a peer at known addresses. Inbound
//! handlers are registered when a transport is built for a [`Storage`].
//!
//! - [`IrohTransport`]: QUIC via iroh, used by real nodes
//! - [`MemoryTransport`]: in-process duplex pipes, used by tests
//!
//! [`Storage`]: crate::storage::Storage

use std::future::Future;

use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::SyncError;
use crate::identity::PeerId;

pub mod quic;
pub mod memory;

pub use quic::IrohTransport;
pub use memory::{MemoryNetwork, MemoryTransport};

/// One request/response stream to a remote peer
///
/// Dropping both halves releases the stream.
pub struct PeerStream {
    /// The identity the transport authenticated for the remote end
    pub peer: PeerId,
    /// Our writing half
    pub send: Box<dyn AsyncWrite + Send + Unpin>,
    /// Our reading half
    pub recv: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for PeerStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerStream")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

/// Network primitives consumed by the syncer
pub trait Transport: Send + Sync + 'static {
    /// Identity of this end
    fn local_peer(&self) -> PeerId;

    /// Open a fresh stream to `peer` speaking `alpn`
    fn open_stream(
        &self,
        peer: &PeerId,
        alpn: &'static [u8],
    ) -> impl Future<Output = Result<PeerStream, SyncError>> + Send;

    /// Whether a live connection to `peer` exists right now
    fn is_connected(&self, peer: &PeerId) -> bool;

    /// Connect to `peer` using the given addresses.
    ///
    /// Returns `true` when the peer was not connected before.
    fn dial(
        &self,
        peer: &PeerId,
        addresses: &[String],
    ) -> impl Future<Output = Result<bool, SyncError>> + Send;

    /// Addresses other peers can use to reach this node
    fn local_addresses(&self) -> Vec<String>;
}
