//! Post Storage - the authored-locally and all-known views
//!
//! Local posts are written to both views in one transaction. Remote posts
//! only ever land in the all-known view.

use chrono::{DateTime, Utc};
use redb::{ReadableTable, TableDefinition};
use tracing::debug;
use ulid::Ulid;

use super::{decode, encode, Storage};
use crate::error::SyncError;
use crate::types::Post;

/// Posts authored by this node (key: post id, value: JSON Post)
pub(crate) const LOCAL_POSTS_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("post:local");

/// Every post this node has accepted, local or remote
pub(crate) const ALL_POSTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("post:all");

impl Storage {
    /// Persist a locally authored post into both views.
    ///
    /// Assigns `id` and `created_at` when absent and always stamps
    /// `author_id` with the local identity. Returns the stored record.
    pub fn save_post(&self, mut post: Post) -> Result<Post, SyncError> {
        if post.id.is_empty() {
            post.id = Ulid::new().to_string();
        }
        if post.created_at.is_none() {
            post.created_at = Some(Utc::now());
        }
        post.author_id = self.local_peer.to_string();

        let data = encode(&post)?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut local = write_txn.open_table(LOCAL_POSTS_TABLE)?;
            let mut all = write_txn.open_table(ALL_POSTS_TABLE)?;
            local.insert(post.id.as_str(), data.as_slice())?;
            all.insert(post.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        debug!(post_id = %post.id, "Saved local post");
        Ok(post)
    }

    /// Load a post from the all-known view
    ///
    /// Returns `None` if no post with the given ID has been accepted.
    pub fn get_post(&self, id: &str) -> Result<Option<Post>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(ALL_POSTS_TABLE)?;

        match table.get(id)? {
            Some(v) => Ok(Some(decode(v.value())?)),
            None => Ok(None),
        }
    }

    /// Locally authored posts with `created_at` strictly after `since`
    ///
    /// Unordered. Posts equal to `since` are excluded.
    pub fn get_local_posts(&self, since: DateTime<Utc>) -> Result<Vec<Post>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(LOCAL_POSTS_TABLE)?;

        let mut posts = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let post: Post = decode(value.value())?;
            if post.created_at.is_some_and(|t| t > since) {
                posts.push(post);
            }
        }
        Ok(posts)
    }

    /// The full all-known view, unordered
    pub fn get_all_posts(&self) -> Result<Vec<Post>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(ALL_POSTS_TABLE)?;

        let mut posts = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            posts.push(decode(value.value())?);
        }
        Ok(posts)
    }

    /// Persist an already-verified remote post into the all-known view only
    pub fn save_remote_post(&self, post: &Post) -> Result<(), SyncError> {
        if post.id.is_empty() {
            return Err(SyncError::InvalidInput("Remote post has no id".to_string()));
        }

        let data = encode(post)?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut all = write_txn.open_table(ALL_POSTS_TABLE)?;
            all.insert(post.id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        debug!(post_id = %post.id, author = %post.author_id, "Saved remote post");
        Ok(())
    }

    /// Rewrite the signature of an existing post.
    ///
    /// The all-known entry is the source of truth. The authored-locally
    /// entry is rewritten in the same transaction when the post lives there,
    /// so a remote post never leaks into the local view.
    pub fn update_post_signature(&self, id: &str, signature: &str) -> Result<Post, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let post = {
            let mut all = write_txn.open_table(ALL_POSTS_TABLE)?;
            let mut local = write_txn.open_table(LOCAL_POSTS_TABLE)?;

            let existing = all.get(id)?.map(|v| v.value().to_vec());
            let Some(existing) = existing else {
                return Err(SyncError::PostNotFound(id.to_string()));
            };

            let mut post: Post = decode(&existing)?;
            post.signature = Some(signature.to_string());
            let data = encode(&post)?;

            let in_local = local.get(id)?.is_some();
            all.insert(id, data.as_slice())?;
            if in_local {
                local.insert(id, data.as_slice())?;
            }
            post
        };
        write_txn.commit()?;

        debug!(post_id = %id, "Updated post signature");
        Ok(post)
    }
}
