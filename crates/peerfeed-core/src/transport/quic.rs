//! QUIC transport using iroh
//!
//! The node's Ed25519 signing key doubles as the iroh endpoint key, so the
//! identity iroh authenticates for a connection is exactly the [`PeerId`]
//! posts are verified against.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use iroh::discovery::static_provider::StaticProvider;
use iroh::endpoint::Connection;
use iroh::protocol::Router;
use iroh::{Endpoint, EndpointAddr, PublicKey, SecretKey};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{PeerStream, Transport};
use crate::error::{SyncError, SyncResult};
use crate::identity::{NodeKeypair, PeerId};
use crate::protocol::{FeedProtocolHandler, ProfileProtocolHandler, FEED_ALPN};
use crate::storage::Storage;
use crate::sync::NodeEvent;

fn to_public_key(peer: &PeerId) -> SyncResult<PublicKey> {
    PublicKey::from_bytes(peer.as_bytes())
        .map_err(|e| SyncError::Identity(format!("Peer id is not an endpoint key: {}", e)))
}

fn to_peer_id(key: &PublicKey) -> SyncResult<PeerId> {
    PeerId::from_bytes(key.as_bytes())
}

fn is_live(conn: &Connection) -> bool {
    conn.close_reason().is_none()
}

/// Live connections per peer, inbound and outbound
///
/// Shared between the transport and the protocol handlers. Closed
/// connections are pruned lazily on access.
#[derive(Clone)]
pub(crate) struct ConnectionTracker {
    live: Arc<Mutex<HashMap<PeerId, Vec<Connection>>>>,
    events: broadcast::Sender<NodeEvent>,
}

impl ConnectionTracker {
    pub(crate) fn new(events: broadcast::Sender<NodeEvent>) -> Self {
        Self {
            live: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    /// Remember `conn`; returns true if `peer` had no live connection before
    pub(crate) fn record(&self, peer: PeerId, conn: &Connection) -> bool {
        let mut live = self.live.lock();
        let conns = live.entry(peer).or_default();
        conns.retain(is_live);
        let newly = conns.is_empty();
        conns.push(conn.clone());
        newly
    }

    /// Remember a connection a remote opened to us, announcing new peers
    pub(crate) fn record_inbound(&self, conn: &Connection) -> SyncResult<PeerId> {
        let peer = to_peer_id(&conn.remote_id())?;
        if self.record(peer, conn) {
            info!(peer = %peer, "Peer connected");
            // No subscribers is fine
            let _ = self.events.send(NodeEvent::PeerConnected { peer_id: peer });
        }
        Ok(peer)
    }

    pub(crate) fn is_connected(&self, peer: &PeerId) -> bool {
        let mut live = self.live.lock();
        match live.get_mut(peer) {
            Some(conns) => {
                conns.retain(is_live);
                !conns.is_empty()
            }
            None => false,
        }
    }
}

/// iroh-backed [`Transport`]
///
/// Owns the endpoint and the router serving both protocols for one store.
pub struct IrohTransport {
    endpoint: Endpoint,
    router: Router,
    static_provider: StaticProvider,
    tracker: ConnectionTracker,
    /// Outbound connections reused per (peer, ALPN)
    outbound: Mutex<HashMap<(PeerId, &'static [u8]), Connection>>,
    local_peer: PeerId,
}

impl std::fmt::Debug for IrohTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IrohTransport")
            .field("local_peer", &self.local_peer.to_string())
            .finish_non_exhaustive()
    }
}

impl IrohTransport {
    /// Bind an endpoint for `keypair` and start serving `storage`.
    ///
    /// `bind_port` 0 picks an ephemeral port. Inbound peers that newly
    /// connect are announced on `events`.
    pub async fn bind(
        keypair: &NodeKeypair,
        storage: Storage,
        bind_port: u16,
        events: broadcast::Sender<NodeEvent>,
    ) -> SyncResult<Self> {
        let secret_key = SecretKey::from_bytes(&keypair.secret_bytes());
        let static_provider = StaticProvider::new();

        let mut builder = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![
                FeedProtocolHandler::alpn().to_vec(),
                ProfileProtocolHandler::alpn().to_vec(),
            ])
            .discovery(static_provider.clone());
        if bind_port != 0 {
            builder = builder.bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, bind_port));
        }
        let endpoint = builder
            .bind()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to bind endpoint: {}", e)))?;

        let endpoint_id = endpoint.id();
        info!(%endpoint_id, "Endpoint bound");

        let tracker = ConnectionTracker::new(events);
        let router = Router::builder(endpoint.clone())
            .accept(
                FeedProtocolHandler::alpn(),
                FeedProtocolHandler::new(storage.clone(), tracker.clone()),
            )
            .accept(
                ProfileProtocolHandler::alpn(),
                ProfileProtocolHandler::new(storage, tracker.clone()),
            )
            .spawn();
        info!("Feed and profile handlers registered");

        Ok(Self {
            endpoint,
            router,
            static_provider,
            tracker,
            outbound: Mutex::new(HashMap::new()),
            local_peer: keypair.peer_id(),
        })
    }

    /// Connection to `peer` for `alpn`, reusing a live one when possible
    async fn connection(&self, peer: &PeerId, alpn: &'static [u8]) -> SyncResult<Connection> {
        let cached = self
            .outbound
            .lock()
            .get(&(*peer, alpn))
            .filter(|conn| is_live(conn))
            .cloned();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let public_key = to_public_key(peer)?;
        let conn = self
            .endpoint
            .connect(public_key, alpn)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to connect to {}: {}", peer, e)))?;

        self.tracker.record(*peer, &conn);
        self.outbound.lock().insert((*peer, alpn), conn.clone());
        debug!(peer = %peer, alpn = %String::from_utf8_lossy(alpn), "Opened connection");
        Ok(conn)
    }

    /// Stop serving and close the endpoint
    pub async fn shutdown(&self) {
        info!("Shutting down transport");
        if let Err(e) = self.router.shutdown().await {
            warn!(error = ?e, "Failed to shutdown router cleanly");
        }
        self.endpoint.close().await;
    }
}

impl Transport for IrohTransport {
    fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    async fn open_stream(&self, peer: &PeerId, alpn: &'static [u8]) -> SyncResult<PeerStream> {
        let conn = self.connection(peer, alpn).await?;
        let (send, recv) = conn
            .open_bi()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to open bi stream: {}", e)))?;

        Ok(PeerStream {
            peer: *peer,
            send: Box::new(send),
            recv: Box::new(recv),
        })
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.tracker.is_connected(peer)
    }

    async fn dial(&self, peer: &PeerId, addresses: &[String]) -> SyncResult<bool> {
        if *peer == self.local_peer {
            return Err(SyncError::InvalidInput("Cannot dial ourselves".to_string()));
        }
        let was_connected = self.tracker.is_connected(peer);

        let mut endpoint_addr = EndpointAddr::new(to_public_key(peer)?);
        for address in addresses {
            match address.parse::<SocketAddr>() {
                Ok(socket_addr) => endpoint_addr = endpoint_addr.with_ip_addr(socket_addr),
                Err(_) => debug!(peer = %peer, %address, "Skipping unparseable address"),
            }
        }
        self.static_provider.add_endpoint_info(endpoint_addr);

        self.connection(peer, FEED_ALPN).await?;
        Ok(!was_connected)
    }

    fn local_addresses(&self) -> Vec<String> {
        let advertised: Vec<String> = self
            .endpoint
            .addr()
            .ip_addrs()
            .map(|addr| addr.to_string())
            .collect();
        if !advertised.is_empty() {
            return advertised;
        }

        // Before address discovery completes only the bound sockets are
        // known; wildcard binds are reachable on loopback.
        self.endpoint
            .bound_sockets()
            .into_iter()
            .map(|mut addr| {
                if addr.ip().is_unspecified() {
                    let loopback: IpAddr = match addr {
                        SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
                        SocketAddr::V6(_) => std::net::Ipv6Addr::LOCALHOST.into(),
                    };
                    addr.set_ip(loopback);
                }
                addr.to_string()
            })
            .collect()
    }
}
