//! FeedNode - the surface a control plane drives
//!
//! Ties together identity, the store, a transport, the syncer and the
//! scheduler, and fans out [`NodeEvent`]s to subscribers.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::identity::{NodeKeypair, PeerId};
use crate::protocol::beginning_of_time;
use crate::storage::Storage;
use crate::sync::{
    NodeEvent, SyncReport, SyncScheduler, Syncer, DEFAULT_READ_TIMEOUT, DEFAULT_SYNC_INTERVAL,
    EVENT_CHANNEL_CAPACITY,
};
use crate::transport::{IrohTransport, MemoryNetwork, MemoryTransport, Transport};
use crate::types::{Post, Profile};

/// File holding the node's secret key inside the data directory
pub const KEY_FILE: &str = "identity.key";

/// Database file inside the data directory
pub const DB_FILE: &str = "peerfeed.redb";

/// Runtime configuration for a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    /// Holds the key file and the database
    pub data_dir: PathBuf,
    /// Time between background sync passes
    pub sync_interval: Duration,
    /// Bound on each read from a remote stream
    pub read_timeout: Duration,
    /// UDP port to bind; 0 picks an ephemeral one
    pub bind_port: u16,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            read_timeout: DEFAULT_READ_TIMEOUT,
            bind_port: 0,
        }
    }

    pub fn with_sync_interval(mut self, sync_interval: Duration) -> Self {
        self.sync_interval = sync_interval;
        self
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn with_bind_port(mut self, bind_port: u16) -> Self {
        self.bind_port = bind_port;
        self
    }

    pub fn key_path(&self) -> PathBuf {
        self.data_dir.join(KEY_FILE)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(DB_FILE)
    }
}

/// A known peer together with its live connectivity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KnownPeer {
    pub profile: Profile,
    pub connected: bool,
}

/// Load (or create) the key and open the store under `config.data_dir`
fn open_local_state(config: &NodeConfig) -> SyncResult<(NodeKeypair, Storage)> {
    std::fs::create_dir_all(&config.data_dir)?;
    let keypair = NodeKeypair::load_or_generate(config.key_path())?;
    let storage = Storage::new(config.db_path(), keypair.peer_id())?;
    Ok((keypair, storage))
}

/// A peer-to-peer feed node
pub struct FeedNode<T: Transport> {
    keypair: NodeKeypair,
    storage: Storage,
    transport: Arc<T>,
    syncer: Syncer<T>,
    scheduler: SyncScheduler<T>,
    events: broadcast::Sender<NodeEvent>,
}

impl<T: Transport> std::fmt::Debug for FeedNode<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedNode")
            .field("peer", &self.keypair.peer_id().to_string())
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

impl FeedNode<IrohTransport> {
    /// Open the node stored in `config.data_dir` and bind it to the network
    pub async fn open(config: &NodeConfig) -> SyncResult<Self> {
        info!(data_dir = ?config.data_dir, "Opening node");
        let (keypair, storage) = open_local_state(config)?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let transport =
            IrohTransport::bind(&keypair, storage.clone(), config.bind_port, events.clone())
                .await?;

        Ok(Self::assemble(keypair, storage, transport, events, config))
    }

    /// Stop the scheduler and close the endpoint
    pub async fn shutdown(&self) {
        self.stop().await;
        self.transport.shutdown().await;
        info!("Node shutdown complete");
    }
}

impl FeedNode<MemoryTransport> {
    /// Open the node's local state without any network
    ///
    /// No peer is ever connected, so sync passes skip every known peer.
    pub fn open_offline(config: &NodeConfig) -> SyncResult<Self> {
        let (keypair, storage) = open_local_state(config)?;
        let transport = MemoryNetwork::new().join(storage.clone());
        Self::new(keypair, storage, transport, config)
    }
}

impl<T: Transport> FeedNode<T> {
    /// Build a node from parts; `storage` must belong to `keypair`
    pub fn new(
        keypair: NodeKeypair,
        storage: Storage,
        transport: T,
        config: &NodeConfig,
    ) -> SyncResult<Self> {
        if storage.local_peer() != keypair.peer_id() || transport.local_peer() != keypair.peer_id()
        {
            return Err(SyncError::InvalidInput(
                "Storage and transport must belong to the node's identity".to_string(),
            ));
        }
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Ok(Self::assemble(keypair, storage, transport, events, config))
    }

    fn assemble(
        keypair: NodeKeypair,
        storage: Storage,
        transport: T,
        events: broadcast::Sender<NodeEvent>,
        config: &NodeConfig,
    ) -> Self {
        let transport = Arc::new(transport);
        let syncer = Syncer::new(storage.clone(), transport.clone())
            .with_read_timeout(config.read_timeout);
        let scheduler = SyncScheduler::new(syncer.clone(), config.sync_interval);

        Self {
            keypair,
            storage,
            transport,
            syncer,
            scheduler,
            events,
        }
    }

    pub fn local_peer(&self) -> PeerId {
        self.keypair.peer_id()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn syncer(&self) -> &Syncer<T> {
        &self.syncer
    }

    pub fn scheduler(&self) -> &SyncScheduler<T> {
        &self.scheduler
    }

    /// Subscribe to node events
    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: NodeEvent) {
        debug!(%event, "Emitting node event");
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Advertise our addresses and start the background scheduler
    pub fn start(&self, shutdown: CancellationToken) -> SyncResult<()> {
        self.publish_addresses()?;
        self.scheduler.start(shutdown);
        info!(peer = %self.local_peer(), "Node started");
        Ok(())
    }

    /// Stop the scheduler, letting the fetch in flight finish
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Record the transport's reachable addresses in the local profile
    pub fn publish_addresses(&self) -> SyncResult<Profile> {
        let addresses = self.transport.local_addresses();
        let mut profile = self.storage.get_local_profile()?;
        if addresses.is_empty() || profile.addresses == addresses {
            return Ok(profile);
        }

        profile.addresses = addresses;
        let profile = self.storage.save_local_profile(profile)?;
        info!(addresses = ?profile.addresses, "Published local addresses");
        Ok(profile)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Posts
    // ═══════════════════════════════════════════════════════════════════════

    /// Store a new post, sign it, and persist the signature
    pub fn create_and_sign_local_post(&self, content: &str) -> SyncResult<Post> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidInput("Post content is empty".to_string()));
        }

        let saved = self.storage.save_post(Post::new(content))?;
        let payload = saved
            .signing_payload()
            .ok_or_else(|| SyncError::Storage("Saved post has no timestamp".to_string()))?;
        let signature = self.keypair.sign(&payload);
        let signed = self.storage.update_post_signature(&saved.id, &signature)?;

        info!(post_id = %signed.id, "Created local post");
        self.emit(NodeEvent::FeedUpdated {
            post_id: signed.id.clone(),
        });
        Ok(signed)
    }

    /// Every accepted post, newest first
    pub fn list_all_posts(&self) -> SyncResult<Vec<Post>> {
        let mut posts = self.storage.get_all_posts()?;
        posts.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(posts)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Profiles
    // ═══════════════════════════════════════════════════════════════════════

    pub fn get_local_profile(&self) -> SyncResult<Profile> {
        self.storage.get_local_profile()
    }

    /// Update name and bio, keeping addresses and avatar
    pub fn set_local_profile(&self, display_name: &str, bio: &str) -> SyncResult<Profile> {
        let mut profile = self.storage.get_local_profile()?;
        profile.display_name = display_name.to_string();
        profile.bio = bio.to_string();
        self.storage.save_local_profile(profile)
    }

    pub fn get_remote_profile(&self, peer_id: &str) -> SyncResult<Profile> {
        self.storage.get_remote_profile(peer_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Peers and synchronization
    // ═══════════════════════════════════════════════════════════════════════

    /// Known peers, sorted by id, with whether each is connected right now
    pub fn list_known_peers_with_connectivity(&self) -> SyncResult<Vec<KnownPeer>> {
        let mut peers: Vec<KnownPeer> = self
            .storage
            .get_known_peers_with_profiles()?
            .into_iter()
            .map(|profile| {
                let connected = PeerId::parse(&profile.peer_id)
                    .map(|peer| self.transport.is_connected(&peer))
                    .unwrap_or(false);
                KnownPeer { profile, connected }
            })
            .collect();
        peers.sort_by(|a, b| a.profile.peer_id.cmp(&b.profile.peer_id));
        Ok(peers)
    }

    /// Run one sync pass now; returns how many peers synced successfully
    pub async fn trigger_sync_now(&self) -> SyncResult<usize> {
        Ok(self.sync_report_now().await?.synced)
    }

    /// Run one sync pass now and return its full report
    pub async fn sync_report_now(&self) -> SyncResult<SyncReport> {
        self.syncer.sync_pass(&CancellationToken::new()).await
    }

    /// Fetch one peer's full feed now
    pub async fn sync_peer(&self, peer_id: &str) -> SyncResult<Vec<Post>> {
        let peer = PeerId::parse(peer_id)?;
        self.syncer
            .fetch_feed(&peer, beginning_of_time())
            .await
    }

    /// Connect to a peer the user told us about.
    ///
    /// Dials `addresses`, records the peer with exactly those addresses,
    /// announces the connection if it is new and starts a detached first
    /// feed fetch.
    pub async fn connect_peer(&self, peer_id: &str, addresses: Vec<String>) -> SyncResult<PeerId> {
        let peer = PeerId::parse(peer_id)?;
        if peer == self.local_peer() {
            return Err(SyncError::InvalidInput(
                "Cannot connect to ourselves".to_string(),
            ));
        }

        let newly = self.transport.dial(&peer, &addresses).await?;
        self.storage
            .save_remote_profile(&Profile::for_peer(peer.to_string()).with_addresses(addresses))?;

        info!(peer = %peer, newly, "Connected to peer");
        if newly {
            self.emit(NodeEvent::PeerConnected { peer_id: peer });
        }

        let syncer = self.syncer.clone();
        tokio::spawn(async move {
            if let Err(e) = syncer.fetch_feed(&peer, beginning_of_time()).await {
                warn!(peer = %peer, error = ?e, "Initial feed fetch failed");
            }
        });

        Ok(peer)
    }

    /// Dial every known peer that has addresses and is not connected, then
    /// fetch its feed. Returns how many peers were reached.
    pub async fn reconnect_known_peers(&self) -> SyncResult<usize> {
        let profiles = self.storage.get_known_peers_with_profiles()?;
        let mut reached = 0;

        for profile in profiles {
            if profile.addresses.is_empty() {
                continue;
            }
            let peer = match PeerId::parse(&profile.peer_id) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(peer = %profile.peer_id, error = ?e, "Skipping malformed known peer");
                    continue;
                }
            };
            if self.transport.is_connected(&peer) {
                continue;
            }

            debug!(peer = %peer, addresses = ?profile.addresses, "Reconnecting to known peer");
            match self.transport.dial(&peer, &profile.addresses).await {
                Ok(newly) => {
                    info!(peer = %peer, "Reconnected to known peer");
                    if newly {
                        self.emit(NodeEvent::PeerConnected { peer_id: peer });
                    }
                    reached += 1;
                    if let Err(e) = self
                        .syncer
                        .fetch_feed(&peer, beginning_of_time())
                        .await
                    {
                        warn!(peer = %peer, error = ?e, "Feed fetch after reconnect failed");
                    }
                }
                Err(e) => warn!(peer = %peer, error = ?e, "Failed to reconnect"),
            }
        }

        Ok(reached)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::verify;
    use tempfile::TempDir;

    fn memory_node(network: &MemoryNetwork) -> (FeedNode<MemoryTransport>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let keypair = NodeKeypair::generate().unwrap();
        let storage = Storage::new(temp_dir.path().join("node.redb"), keypair.peer_id()).unwrap();
        let transport = network.join(storage.clone());
        let node = FeedNode::new(keypair, storage, transport, &NodeConfig::new(temp_dir.path()))
            .unwrap();
        (node, temp_dir)
    }

    #[test]
    fn test_config_defaults() {
        let config = NodeConfig::new("/tmp/peerfeed");
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.bind_port, 0);
        assert_eq!(config.key_path(), PathBuf::from("/tmp/peerfeed/identity.key"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/peerfeed/peerfeed.redb"));
    }

    #[tokio::test]
    async fn test_created_post_is_signed_and_announced() {
        let network = MemoryNetwork::new();
        let (node, _temp) = memory_node(&network);
        let mut events = node.subscribe_events();

        let post = node.create_and_sign_local_post("hello").unwrap();
        let stored = node.storage().get_post(&post.id).unwrap().unwrap();
        assert_eq!(stored.content, "hello");
        assert!(stored.is_signed());
        assert!(verify(
            &stored.author_id,
            &stored.signing_payload().unwrap(),
            stored.signature.as_deref().unwrap()
        )
        .unwrap());

        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::FeedUpdated { post_id: post.id }
        );
    }

    #[tokio::test]
    async fn test_empty_post_is_rejected() {
        let network = MemoryNetwork::new();
        let (node, _temp) = memory_node(&network);

        let result = node.create_and_sign_local_post("   ");
        assert!(matches!(result, Err(SyncError::InvalidInput(_))));
        assert!(node.list_all_posts().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_posts_newest_first() {
        let network = MemoryNetwork::new();
        let (node, _temp) = memory_node(&network);

        let first = node.create_and_sign_local_post("first").unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = node.create_and_sign_local_post("second").unwrap();

        let ids: Vec<_> = node.list_all_posts().unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn test_set_local_profile_keeps_addresses() {
        let network = MemoryNetwork::new();
        let (node, _temp) = memory_node(&network);

        let published = node.publish_addresses().unwrap();
        assert_eq!(published.addresses.len(), 1);

        let profile = node.set_local_profile("Joy", "Plants seeds").unwrap();
        assert_eq!(profile.display_name, "Joy");
        assert_eq!(profile.addresses, published.addresses);
        assert_eq!(profile.peer_id, node.local_peer().to_string());
    }

    #[tokio::test]
    async fn test_connect_peer_records_and_announces() {
        let network = MemoryNetwork::new();
        let (alice, _ta) = memory_node(&network);
        let (bob, _tb) = memory_node(&network);
        let mut events = alice.subscribe_events();

        let bob_id = bob.local_peer();
        alice
            .connect_peer(&bob_id.to_string(), vec!["10.0.0.2:4433".to_string()])
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::PeerConnected { peer_id: bob_id }
        );
        let peers = alice.list_known_peers_with_connectivity().unwrap();
        assert_eq!(peers.len(), 1);
        assert!(peers[0].connected);
        assert_eq!(peers[0].profile.addresses, vec!["10.0.0.2:4433"]);
    }

    #[tokio::test]
    async fn test_reconnecting_a_linked_peer_announces_once() {
        let network = MemoryNetwork::new();
        let (alice, _ta) = memory_node(&network);
        let (bob, _tb) = memory_node(&network);
        let mut events = alice.subscribe_events();

        let bob_id = bob.local_peer();
        for addr in ["10.0.0.2:4433", "10.0.0.3:4433"] {
            alice
                .connect_peer(&bob_id.to_string(), vec![addr.to_string()])
                .await
                .unwrap();
        }

        assert_eq!(
            events.try_recv().unwrap(),
            NodeEvent::PeerConnected { peer_id: bob_id }
        );
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        // The second call still records the addresses it was given
        assert_eq!(
            alice.get_remote_profile(&bob_id.to_string()).unwrap().addresses,
            vec!["10.0.0.3:4433"]
        );
    }

    #[tokio::test]
    async fn test_sync_pass_fetches_posts_dated_before_1970() {
        use chrono::TimeZone;

        let network = MemoryNetwork::new();
        let (alice, _ta) = memory_node(&network);
        let (bob, _tb) = memory_node(&network);

        let saved = alice
            .storage()
            .save_post(Post {
                created_at: chrono::Utc.with_ymd_and_hms(1965, 3, 18, 8, 30, 0).single(),
                ..Post::new("from the archive")
            })
            .unwrap();
        let signature = alice.keypair.sign(&saved.signing_payload().unwrap());
        alice
            .storage()
            .update_post_signature(&saved.id, &signature)
            .unwrap();

        alice.transport().dial(&bob.local_peer(), &[]).await.unwrap();
        bob.storage()
            .save_remote_profile(&Profile::for_peer(alice.local_peer().to_string()))
            .unwrap();

        assert_eq!(bob.trigger_sync_now().await.unwrap(), 1);
        assert!(bob.storage().get_post(&saved.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_connect_to_self_or_garbage_fails() {
        let network = MemoryNetwork::new();
        let (node, _temp) = memory_node(&network);

        let own = node.local_peer().to_string();
        assert!(node.connect_peer(&own, Vec::new()).await.is_err());
        assert!(matches!(
            node.connect_peer("not base58 !", Vec::new()).await,
            Err(SyncError::Identity(_))
        ));
        assert!(node.storage().get_known_peers().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_trigger_sync_counts_only_synced_peers() {
        let network = MemoryNetwork::new();
        let (alice, _ta) = memory_node(&network);
        let (bob, _tb) = memory_node(&network);
        let (carol, _tc) = memory_node(&network);

        bob.create_and_sign_local_post("from bob").unwrap();
        alice
            .connect_peer(&bob.local_peer().to_string(), Vec::new())
            .await
            .unwrap();
        // Known but never linked
        alice
            .storage()
            .save_remote_profile(&Profile::for_peer(carol.local_peer().to_string()))
            .unwrap();

        assert_eq!(alice.trigger_sync_now().await.unwrap(), 1);
        let contents: Vec<_> = alice
            .list_all_posts()
            .unwrap()
            .into_iter()
            .map(|p| p.content)
            .collect();
        assert_eq!(contents, vec!["from bob"]);
    }

    #[tokio::test]
    async fn test_reconnect_dials_only_peers_with_addresses() {
        let network = MemoryNetwork::new();
        let (alice, _ta) = memory_node(&network);
        let (bob, _tb) = memory_node(&network);
        let (carol, _tc) = memory_node(&network);

        bob.create_and_sign_local_post("bob was here").unwrap();
        alice
            .storage()
            .save_remote_profile(
                &Profile::for_peer(bob.local_peer().to_string()).with_addresses(["memory"]),
            )
            .unwrap();
        alice
            .storage()
            .save_remote_profile(&Profile::for_peer(carol.local_peer().to_string()))
            .unwrap();

        let mut events = alice.subscribe_events();
        assert_eq!(alice.reconnect_known_peers().await.unwrap(), 1);
        assert!(alice.transport().is_connected(&bob.local_peer()));
        assert!(!alice.transport().is_connected(&carol.local_peer()));
        assert_eq!(
            events.recv().await.unwrap(),
            NodeEvent::PeerConnected {
                peer_id: bob.local_peer()
            }
        );
        assert_eq!(alice.list_all_posts().unwrap().len(), 1);

        // Already connected peers are left alone
        assert_eq!(alice.reconnect_known_peers().await.unwrap(), 0);
    }

    #[test]
    fn test_offline_node_reuses_identity() {
        let temp_dir = TempDir::new().unwrap();
        let config = NodeConfig::new(temp_dir.path().join("data"));

        let first = {
            let node = FeedNode::open_offline(&config).unwrap();
            node.local_peer()
        };
        let node = FeedNode::open_offline(&config).unwrap();
        assert_eq!(node.local_peer(), first);
        assert!(config.key_path().exists());
    }
}
