//! Feed exchange: responder side
//!
//! The responder reads one [`FeedRequest`] and streams every locally
//! authored post created after `since`, one frame per post.

use futures::{SinkExt, StreamExt};
use iroh::endpoint::Connection;
use iroh::protocol::ProtocolHandler;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use super::{decode_frame, encode_frame, frame_codec, FeedRequest, FEED_ALPN};
use crate::error::SyncError;
use crate::storage::Storage;
use crate::transport::quic::ConnectionTracker;

/// Answer one feed request on an already opened stream.
///
/// Posts are written oldest first, each flushed as soon as it is encoded;
/// the send half is shut down afterwards. Returns the number of posts sent.
pub async fn serve_feed<R, W>(storage: &Storage, recv: R, send: W) -> Result<usize, SyncError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(recv, frame_codec());
    let request: FeedRequest = match requests.next().await {
        Some(frame) => decode_frame(&frame?)?,
        None => {
            return Err(SyncError::Network(
                "Feed stream closed before a request arrived".to_string(),
            ))
        }
    };

    let mut posts = storage.get_local_posts(request.since)?;
    posts.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
    debug!(since = %request.since, posts = posts.len(), "Serving feed request");

    let mut sink = FramedWrite::new(send, frame_codec());
    for post in &posts {
        sink.send(encode_frame(post)?).await?;
    }
    SinkExt::<bytes::Bytes>::close(&mut sink).await?;

    Ok(posts.len())
}

/// Protocol handler for inbound FEED_ALPN connections
///
/// Registered with the Router; serves every stream the remote opens until
/// the connection closes.
#[derive(Clone)]
pub struct FeedProtocolHandler {
    storage: Storage,
    tracker: ConnectionTracker,
}

impl std::fmt::Debug for FeedProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeedProtocolHandler")
            .field("storage", &"<Storage>")
            .finish()
    }
}

impl FeedProtocolHandler {
    pub(crate) fn new(storage: Storage, tracker: ConnectionTracker) -> Self {
        Self { storage, tracker }
    }

    /// Get the ALPN identifier for this protocol
    pub const fn alpn() -> &'static [u8] {
        FEED_ALPN
    }

    async fn handle_connection(
        connection: Connection,
        storage: Storage,
        tracker: ConnectionTracker,
    ) -> Result<(), SyncError> {
        let peer = tracker.record_inbound(&connection)?;
        debug!(peer = %peer, "Handling feed connection");

        loop {
            let (send, recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(peer = %peer, reason = %e, "Feed connection closed");
                    return Ok(());
                }
            };

            match serve_feed(&storage, recv, send).await {
                Ok(sent) => info!(peer = %peer, posts = sent, "Served feed"),
                Err(e) => warn!(peer = %peer, error = ?e, "Failed to serve feed request"),
            }
        }
    }
}

impl ProtocolHandler for FeedProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let storage = self.storage.clone();
        let tracker = self.tracker.clone();

        async move {
            if let Err(e) = Self::handle_connection(conn, storage, tracker).await {
                warn!(error = ?e, "Failed to handle feed connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame;
    use crate::storage::test_support::create_test_storage;
    use crate::types::Post;
    use chrono::{Duration, Utc};

    async fn request_feed(storage: &Storage, request: FeedRequest) -> Vec<Post> {
        let (client, server) = tokio::io::duplex(4096);
        let (server_recv, server_send) = tokio::io::split(server);
        let (client_recv, client_send) = tokio::io::split(client);

        let mut requests = FramedWrite::new(client_send, frame_codec());
        requests.send(encode_frame(&request).unwrap()).await.unwrap();
        SinkExt::<bytes::Bytes>::close(&mut requests).await.unwrap();

        let sent = serve_feed(storage, server_recv, server_send).await.unwrap();

        let mut frames = FramedRead::new(client_recv, frame_codec());
        let mut posts = Vec::new();
        while let Some(frame) = frames.next().await {
            posts.push(decode_frame::<Post>(&frame.unwrap()).unwrap());
        }
        assert_eq!(sent, posts.len());
        posts
    }

    #[tokio::test]
    async fn test_serves_local_posts_oldest_first() {
        let (storage, _keypair, _temp) = create_test_storage();
        let t0 = Utc::now() - Duration::hours(1);
        for (id, offset) in [("b", 2), ("a", 1), ("c", 3)] {
            let mut post = Post::new(id);
            post.id = id.to_string();
            post.created_at = Some(t0 + Duration::minutes(offset));
            storage.save_post(post).unwrap();
        }

        let posts = request_feed(&storage, FeedRequest::everything()).await;
        let ids: Vec<_> = posts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_respects_since_and_skips_remote_posts() {
        let (storage, _keypair, _temp) = create_test_storage();
        let old = storage
            .save_post(Post {
                created_at: Some(Utc::now() - Duration::days(2)),
                ..Post::new("old")
            })
            .unwrap();
        storage.save_post(Post::new("new")).unwrap();

        let mut remote = Post::new("not mine");
        remote.id = "remote".to_string();
        remote.created_at = Some(Utc::now());
        storage.save_remote_post(&remote).unwrap();

        let request = FeedRequest {
            since: old.created_at.unwrap(),
        };
        let posts = request_feed(&storage, request).await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content, "new");
    }

    #[tokio::test]
    async fn test_full_history_includes_pre_epoch_posts() {
        use chrono::TimeZone;

        let (storage, _keypair, _temp) = create_test_storage();
        storage
            .save_post(Post {
                created_at: Utc.with_ymd_and_hms(1969, 7, 20, 20, 17, 0).single(),
                ..Post::new("one small step")
            })
            .unwrap();

        let posts = request_feed(&storage, FeedRequest::everything()).await;
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].content, "one small step");
    }

    #[tokio::test]
    async fn test_empty_feed_closes_cleanly() {
        let (storage, _keypair, _temp) = create_test_storage();
        assert!(request_feed(&storage, FeedRequest::everything()).await.is_empty());
    }

    #[tokio::test]
    async fn test_missing_request_is_an_error() {
        let (storage, _keypair, _temp) = create_test_storage();
        let (client, server) = tokio::io::duplex(64);
        let (server_recv, server_send) = tokio::io::split(server);
        drop(client);

        let result = serve_feed(&storage, server_recv, server_send).await;
        assert!(matches!(result, Err(SyncError::Network(_))));
    }
}
