//! Fetch, verify and persist content from one peer at a time

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SyncReport;
use crate::error::{SyncError, SyncResult};
use crate::identity::{verify, PeerId};
use crate::protocol::{
    beginning_of_time, decode_frame, encode_frame, frame_codec, FeedRequest, FEED_ALPN,
    PROFILE_ALPN,
};
use crate::storage::Storage;
use crate::transport::Transport;
use crate::types::{Post, Profile};

/// Default bound on each read from a remote stream
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Performs fetch-verify-persist cycles against single peers
///
/// Holds no state beyond handles; every read goes to the store.
pub struct Syncer<T: Transport> {
    storage: Storage,
    transport: Arc<T>,
    read_timeout: Duration,
}

impl<T: Transport> Clone for Syncer<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            transport: self.transport.clone(),
            read_timeout: self.read_timeout,
        }
    }
}

impl<T: Transport> std::fmt::Debug for Syncer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Syncer")
            .field("storage", &self.storage)
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl<T: Transport> Syncer<T> {
    pub fn new(storage: Storage, transport: Arc<T>) -> Self {
        Self {
            storage,
            transport,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Bound every remote read by `read_timeout` (builder style)
    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Fetch `peer`'s posts created after `since` and persist the valid ones.
    ///
    /// Every decoded post is attributed to `peer` (whatever author it
    /// claims) and must carry a signature that verifies against `peer`'s key;
    /// others are dropped with a warning. Returns the accepted posts in
    /// receipt order.
    ///
    /// Stream open, request send, and a failure before the first record are
    /// errors. A failure after that stops reading but keeps what was already
    /// accepted. On return a detached profile fetch for `peer` is spawned.
    pub async fn fetch_feed(&self, peer: &PeerId, since: DateTime<Utc>) -> SyncResult<Vec<Post>> {
        let accepted = self.exchange_feed(peer, since).await?;
        self.spawn_profile_fetch(*peer);
        Ok(accepted)
    }

    async fn exchange_feed(&self, peer: &PeerId, since: DateTime<Utc>) -> SyncResult<Vec<Post>> {
        let stream = self.transport.open_stream(peer, FEED_ALPN).await?;
        let author = stream.peer;
        debug!(peer = %author, %since, "Requesting feed");

        let mut requests = FramedWrite::new(stream.send, frame_codec());
        requests
            .send(encode_frame(&FeedRequest { since })?)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to send feed request: {}", e)))?;
        SinkExt::<bytes::Bytes>::close(&mut requests)
            .await
            .map_err(|e| SyncError::Network(format!("Failed to finish feed request: {}", e)))?;

        let mut frames = FramedRead::new(stream.recv, frame_codec());
        let mut received = 0usize;
        let mut accepted = Vec::new();

        loop {
            let post = match self.next_record::<Post, _>(&mut frames).await {
                Ok(Some(post)) => post,
                Ok(None) => break,
                Err(e) if received == 0 => return Err(e),
                Err(e) => {
                    warn!(
                        peer = %author,
                        received,
                        accepted = accepted.len(),
                        error = ?e,
                        "Feed stream failed mid-way, keeping accepted posts"
                    );
                    break;
                }
            };
            received += 1;

            if let Some(post) = self.accept_post(&author, post) {
                accepted.push(post);
            }
        }

        info!(peer = %author, received, accepted = accepted.len(), "Fetched feed");
        Ok(accepted)
    }

    /// Verify and persist one received post; `None` if it was dropped
    fn accept_post(&self, author: &PeerId, mut post: Post) -> Option<Post> {
        post.author_id = author.to_string();

        match check_signature(&post) {
            Ok(true) => {}
            Ok(false) => {
                warn!(peer = %author, post_id = %post.id, "Dropping post with invalid signature");
                return None;
            }
            Err(e) => {
                warn!(peer = %author, post_id = %post.id, error = ?e, "Dropping unverifiable post");
                return None;
            }
        }

        // Only whole seconds are covered by the signature
        post.created_at = post
            .created_at_secs()
            .and_then(|secs| DateTime::from_timestamp(secs, 0));

        match self.storage.save_remote_post(&post) {
            Ok(()) => {
                debug!(peer = %author, post_id = %post.id, "Accepted remote post");
                Some(post)
            }
            Err(e) => {
                warn!(peer = %author, post_id = %post.id, error = ?e, "Failed to save remote post");
                None
            }
        }
    }

    /// Fetch `peer`'s profile and merge it into the store
    ///
    /// The stored record is attributed to `peer` regardless of the id the
    /// payload claims. Returns the record as stored.
    pub async fn fetch_profile(&self, peer: &PeerId) -> SyncResult<Profile> {
        let mut stream = self.transport.open_stream(peer, PROFILE_ALPN).await?;
        let subject = stream.peer;

        // Opening the stream is the request
        stream
            .send
            .shutdown()
            .await
            .map_err(|e| SyncError::Network(format!("Failed to finish profile request: {}", e)))?;

        let mut frames = FramedRead::new(stream.recv, frame_codec());
        let mut profile: Profile = self.next_record(&mut frames).await?.ok_or_else(|| {
            SyncError::Network(format!("Peer {} closed the stream without a profile", subject))
        })?;

        profile.peer_id = subject.to_string();
        let stored = self.storage.save_remote_profile_merge(profile)?;
        debug!(peer = %subject, "Fetched profile");
        Ok(stored)
    }

    fn spawn_profile_fetch(&self, peer: PeerId) {
        let syncer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = syncer.fetch_profile(&peer).await {
                warn!(peer = %peer, error = ?e, "Profile fetch failed");
            }
        });
    }

    /// Read and decode the next frame; `Ok(None)` once the remote closed
    async fn next_record<V, R>(
        &self,
        frames: &mut FramedRead<R, LengthDelimitedCodec>,
    ) -> SyncResult<Option<V>>
    where
        V: serde::de::DeserializeOwned,
        R: AsyncRead + Unpin,
    {
        match tokio::time::timeout(self.read_timeout, frames.next()).await {
            Err(_) => Err(SyncError::Network(format!(
                "Timed out after {:?} waiting for peer",
                self.read_timeout
            ))),
            Ok(None) => Ok(None),
            Ok(Some(Err(e))) => Err(SyncError::Network(format!("Failed to read frame: {}", e))),
            Ok(Some(Ok(frame))) => decode_frame(&frame).map(Some),
        }
    }

    /// Run one pass over every known peer.
    ///
    /// Peers that are not connected right now are skipped without any
    /// network call. Each connected peer gets a full-history fetch, one peer
    /// at a time. Cancelling `stop` ends the pass before the next peer;
    /// the fetch in flight is allowed to finish.
    pub async fn sync_pass(&self, stop: &CancellationToken) -> SyncResult<SyncReport> {
        let peers = self.storage.get_known_peers()?;
        let mut report = SyncReport {
            known: peers.len(),
            ..Default::default()
        };

        for peer_id in &peers {
            if stop.is_cancelled() {
                debug!("Sync pass stopped early");
                break;
            }

            let peer = match PeerId::parse(peer_id) {
                Ok(peer) => peer,
                Err(e) => {
                    warn!(peer = %peer_id, error = ?e, "Skipping malformed known peer");
                    report.failed += 1;
                    continue;
                }
            };

            if !self.transport.is_connected(&peer) {
                debug!(peer = %peer, "Skipping offline peer");
                report.skipped_offline += 1;
                continue;
            }

            match self.fetch_feed(&peer, beginning_of_time()).await {
                Ok(posts) => {
                    debug!(peer = %peer, accepted = posts.len(), "Synced peer");
                    report.synced += 1;
                }
                Err(e) => {
                    warn!(peer = %peer, error = ?e, "Failed to sync peer");
                    report.failed += 1;
                }
            }
        }

        info!(
            known = report.known,
            synced = report.synced,
            failed = report.failed,
            offline = report.skipped_offline,
            "Sync pass complete"
        );
        Ok(report)
    }
}

/// Unsigned posts are simply invalid; a missing timestamp or a malformed
/// identity or signature encoding is an error.
fn check_signature(post: &Post) -> SyncResult<bool> {
    let signature = match post.signature.as_deref() {
        Some(sig) if !sig.is_empty() => sig,
        _ => return Ok(false),
    };
    let payload = post
        .signing_payload()
        .ok_or_else(|| SyncError::InvalidInput("Post has no timestamp".to_string()))?;

    verify(&post.author_id, &payload, signature)
}
