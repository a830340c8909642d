//! Persistent record store using redb.
//!
//! Four tables hold the four logical partitions:
//!
//! | table            | key        | value                  |
//! |------------------|------------|------------------------|
//! | `post:local`     | post id    | posts this node wrote  |
//! | `post:all`       | post id    | every accepted post    |
//! | `profile:local`  | `"self"`   | this node's profile    |
//! | `profile:remote` | peer id    | one profile per peer   |
//!
//! Every mutation runs in a single write transaction, so writes spanning
//! several tables commit all-or-nothing and readers never see half of one.
//! redb admits one writer at a time, which makes read-modify-write
//! sequences (signature update, profile merge) atomic as well.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::Database;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SyncError;
use crate::identity::PeerId;

mod posts;
mod profiles;

use posts::{ALL_POSTS_TABLE, LOCAL_POSTS_TABLE};
use profiles::{LOCAL_PROFILE_TABLE, REMOTE_PROFILES_TABLE};

/// Storage layer using redb for ACID-compliant persistence
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
    local_peer: PeerId,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("db", &"<Database>")
            .field("local_peer", &self.local_peer.to_string())
            .finish()
    }
}

impl Storage {
    /// Open (or create) the store at `path` for the node `local_peer`.
    ///
    /// This will:
    /// - Create the database directory if it doesn't exist
    /// - Initialize the database file
    /// - Create all four partitions
    pub fn new(path: impl AsRef<Path>, local_peer: PeerId) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(LOCAL_POSTS_TABLE)?;
            let _ = write_txn.open_table(ALL_POSTS_TABLE)?;
            let _ = write_txn.open_table(LOCAL_PROFILE_TABLE)?;
            let _ = write_txn.open_table(REMOTE_PROFILES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
            local_peer,
        })
    }

    /// The identity this store stamps onto locally authored records
    pub fn local_peer(&self) -> PeerId {
        self.local_peer
    }

    fn db_handle(&self) -> Arc<RwLock<Database>> {
        self.db.clone()
    }
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, SyncError> {
    serde_json::to_vec(value).map_err(|e| SyncError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
    serde_json::from_slice(bytes).map_err(|e| SyncError::Serialization(e.to_string()))
}
