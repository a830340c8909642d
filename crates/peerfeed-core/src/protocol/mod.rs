//! Wire protocol for feed and profile exchange
//!
//! Both protocols run over one bidirectional stream per request and carry
//! records as length-delimited frames, each holding one postcard-encoded
//! value. A writer signals end of data by shutting down its send half.
//!
//! ## Message Flow
//!
//! ```text
//! Requester                         Responder
//!   |                                   |
//!   |--- FeedRequest { since } -------->|   (FEED_ALPN)
//!   |--- <close send> ----------------->|
//!   |<-- Post --------------------------|
//!   |<-- Post --------------------------|
//!   |<-- <close> -----------------------|
//!   |                                   |
//!   |--- <close send> ----------------->|   (PROFILE_ALPN)
//!   |<-- Profile -----------------------|
//!   |<-- <close> -----------------------|
//! ```
//!
//! Responders do not authenticate or filter by requester (open read).

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::codec::LengthDelimitedCodec;

use crate::error::SyncError;

mod feed;
mod profile;

pub use feed::{serve_feed, FeedProtocolHandler};
pub use profile::{serve_profile, ProfileProtocolHandler};

/// ALPN for the feed exchange
pub const FEED_ALPN: &[u8] = b"/peerfeed/feed/1";

/// ALPN for the profile exchange
pub const PROFILE_ALPN: &[u8] = b"/peerfeed/profile/1";

/// Largest accepted frame (1 MiB)
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Seconds from the Unix epoch back to 0001-01-01T00:00:00Z
const YEAR_ONE_SECS: i64 = -62_135_596_800;

/// Floor of every full-history request: 0001-01-01T00:00:00Z
///
/// Posts dated before year 1 are never served.
pub fn beginning_of_time() -> DateTime<Utc> {
    DateTime::from_timestamp(YEAR_ONE_SECS, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The single request a feed requester sends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRequest {
    /// Only posts created strictly after this instant are returned
    pub since: DateTime<Utc>,
}

impl FeedRequest {
    /// Request the whole history
    pub fn everything() -> Self {
        Self {
            since: beginning_of_time(),
        }
    }
}

/// Codec shared by every stream of both protocols
pub fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Encode one value into a frame payload
pub fn encode_frame<T: Serialize>(value: &T) -> Result<Bytes, SyncError> {
    postcard::to_allocvec(value)
        .map(Bytes::from)
        .map_err(|e| SyncError::Serialization(format!("Failed to encode frame: {}", e)))
}

/// Decode one frame payload
pub fn decode_frame<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SyncError> {
    postcard::from_bytes(bytes)
        .map_err(|e| SyncError::Serialization(format!("Failed to decode frame: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Post, Profile};
    use chrono::TimeZone;
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_alpns_are_distinct() {
        assert_ne!(FEED_ALPN, PROFILE_ALPN);
    }

    #[test]
    fn test_handlers_advertise_their_alpns() {
        assert_eq!(FeedProtocolHandler::alpn(), FEED_ALPN);
        assert_eq!(ProfileProtocolHandler::alpn(), PROFILE_ALPN);
    }

    #[test]
    fn test_everything_starts_at_year_one() {
        let since = FeedRequest::everything().since;
        assert_eq!(since, Utc.with_ymd_and_hms(1, 1, 1, 0, 0, 0).unwrap());
        assert!(since < DateTime::<Utc>::default());
    }

    #[test]
    fn test_year_one_request_survives_a_frame() {
        let request = FeedRequest::everything();
        let decoded: FeedRequest = decode_frame(&encode_frame(&request).unwrap()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_post_frame_keeps_every_field() {
        let post = Post {
            id: "01HZX".to_string(),
            author_id: "author".to_string(),
            content: "hello | with pipes".to_string(),
            created_at: Utc.timestamp_opt(1_700_000_000, 5).single(),
            attachments: vec!["blob1".to_string()],
            signature: Some("beef".to_string()),
        };

        let decoded: Post = decode_frame(&encode_frame(&post).unwrap()).unwrap();
        assert_eq!(decoded, post);
    }

    #[test]
    fn test_garbage_frame_is_serialization_error() {
        let result = decode_frame::<Profile>(&[0xff, 0xff, 0xff, 0xff, 0xff]);
        assert!(matches!(result, Err(SyncError::Serialization(_))));
    }

    #[tokio::test]
    async fn test_frames_survive_a_byte_stream() {
        let (a, b) = tokio::io::duplex(64);

        let writer = tokio::spawn(async move {
            let mut sink = FramedWrite::new(a, frame_codec());
            for name in ["one", "two", "three"] {
                let profile = Profile {
                    display_name: name.to_string(),
                    ..Profile::for_peer("p")
                };
                sink.send(encode_frame(&profile).unwrap()).await.unwrap();
            }
            SinkExt::<bytes::Bytes>::close(&mut sink).await.unwrap();
        });

        let mut stream = FramedRead::new(b, frame_codec());
        let mut names = Vec::new();
        while let Some(frame) = stream.next().await {
            let profile: Profile = decode_frame(&frame.unwrap()).unwrap();
            names.push(profile.display_name);
        }
        writer.await.unwrap();

        assert_eq!(names, vec!["one", "two", "three"]);
    }
}
