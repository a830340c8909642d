//! PeerFeed Core Library
//!
//! Replication and trust layer for a serverless social feed: signed posts
//! and profiles copied between mutually aware peers over iroh.
//!
//! ## Overview
//!
//! Every node keeps an eventually consistent local copy of the feeds of the
//! peers it follows. Nothing inbound is trusted: each post fetched from a
//! peer must carry a signature that verifies against that peer's key, and
//! profile merges never forget known reconnection addresses.
//!
//! ## Core Principles
//!
//! - **Self-certifying identity**: a peer id *is* its Ed25519 public key
//! - **Local-first**: every read is served from the local redb store
//! - **Full resync**: each pass re-requests a peer's whole history
//!
//! ## Quick Start
//!
//! ```ignore
//! use peerfeed_core::{FeedNode, NodeConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = FeedNode::open(&NodeConfig::new("~/.peerfeed")).await?;
//!     node.start(CancellationToken::new())?;
//!
//!     node.create_and_sign_local_post("Planted the tomatoes today")?;
//!     node.connect_peer("8fT4...", vec!["192.168.1.7:4433".into()]).await?;
//!
//!     for post in node.list_all_posts()? {
//!         println!("{}: {}", post.author_id, post.content);
//!     }
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod identity;
pub mod node;
pub mod protocol;
pub mod storage;
pub mod sync;
pub mod transport;
pub mod types;

// Re-exports
pub use error::{SyncError, SyncResult};
pub use identity::{NodeKeypair, PeerId};
pub use node::{FeedNode, KnownPeer, NodeConfig};
pub use protocol::beginning_of_time;
pub use storage::Storage;
pub use sync::{NodeEvent, SyncReport, SyncScheduler, Syncer};
pub use transport::{IrohTransport, MemoryNetwork, MemoryTransport, PeerStream, Transport};
pub use types::*;
