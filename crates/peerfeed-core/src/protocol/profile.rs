//! Profile exchange: responder side
//!
//! Opening the stream is the request. The responder writes its local
//! profile as a single frame and closes.

use futures::SinkExt;
use iroh::endpoint::Connection;
use iroh::protocol::ProtocolHandler;
use tokio::io::AsyncWrite;
use tokio_util::codec::FramedWrite;
use tracing::{debug, info, warn};

use super::{encode_frame, frame_codec, PROFILE_ALPN};
use crate::error::SyncError;
use crate::storage::Storage;
use crate::transport::quic::ConnectionTracker;
use crate::types::Profile;

/// Write the local profile to `send` and shut it down
pub async fn serve_profile<W>(storage: &Storage, send: W) -> Result<Profile, SyncError>
where
    W: AsyncWrite + Unpin,
{
    let profile = storage.get_local_profile()?;

    let mut sink = FramedWrite::new(send, frame_codec());
    sink.send(encode_frame(&profile)?).await?;
    SinkExt::<bytes::Bytes>::close(&mut sink).await?;

    Ok(profile)
}

/// Protocol handler for inbound PROFILE_ALPN connections
#[derive(Clone)]
pub struct ProfileProtocolHandler {
    storage: Storage,
    tracker: ConnectionTracker,
}

impl std::fmt::Debug for ProfileProtocolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProfileProtocolHandler")
            .field("storage", &"<Storage>")
            .finish()
    }
}

impl ProfileProtocolHandler {
    pub(crate) fn new(storage: Storage, tracker: ConnectionTracker) -> Self {
        Self { storage, tracker }
    }

    /// Get the ALPN identifier for this protocol
    pub const fn alpn() -> &'static [u8] {
        PROFILE_ALPN
    }

    async fn handle_connection(
        connection: Connection,
        storage: Storage,
        tracker: ConnectionTracker,
    ) -> Result<(), SyncError> {
        let peer = tracker.record_inbound(&connection)?;
        debug!(peer = %peer, "Handling profile connection");

        loop {
            // The request stream carries no payload, so the receive half is
            // dropped unread.
            let (send, _recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(e) => {
                    debug!(peer = %peer, reason = %e, "Profile connection closed");
                    return Ok(());
                }
            };

            match serve_profile(&storage, send).await {
                Ok(profile) => info!(
                    peer = %peer,
                    addresses = profile.addresses.len(),
                    "Served local profile"
                ),
                Err(e) => warn!(peer = %peer, error = ?e, "Failed to serve profile"),
            }
        }
    }
}

impl ProtocolHandler for ProfileProtocolHandler {
    fn accept(
        &self,
        conn: Connection,
    ) -> impl std::future::Future<Output = Result<(), iroh::protocol::AcceptError>> + Send {
        let storage = self.storage.clone();
        let tracker = self.tracker.clone();

        async move {
            if let Err(e) = Self::handle_connection(conn, storage, tracker).await {
                warn!(error = ?e, "Failed to handle profile connection");
                return Err(iroh::protocol::AcceptError::from_err(e));
            }
            Ok(())
        }
    }
}
