//! Identity module for PeerFeed
//!
//! Each node owns one Ed25519 keypair. Its [`PeerId`] is the public key
//! itself (base58-encoded), so verifying a post needs nothing but the
//! author's identifier string.
//!
//! ## Example
//!
//! ```rust
//! use peerfeed_core::identity::{canonical_post_payload, verify, NodeKeypair};
//!
//! let keypair = NodeKeypair::generate().unwrap();
//! let payload = canonical_post_payload("p1", "hello", 1_700_000_000);
//! let signature = keypair.sign(&payload);
//!
//! let peer_id = keypair.peer_id().to_string();
//! assert!(verify(&peer_id, &payload, &signature).unwrap());
//! ```

mod keypair;
mod peer_id;

pub use keypair::NodeKeypair;
pub use peer_id::PeerId;

use ed25519_dalek::{Signature, Verifier};

use crate::SyncError;

/// Build the byte string a post signature covers: `id|content|created_at`
///
/// `created_at_secs` must already be truncated to whole seconds; sub-second
/// precision is never part of the signed payload.
pub fn canonical_post_payload(id: &str, content: &str, created_at_secs: i64) -> Vec<u8> {
    format!("{}|{}|{}", id, content, created_at_secs).into_bytes()
}

/// Verify a hex signature over `data` against the key inside `peer_id`
///
/// Returns `Err` when the identifier or the signature encoding is malformed,
/// and `Ok(false)` when both are well-formed but the signature does not match.
pub fn verify(peer_id: &str, data: &[u8], signature_hex: &str) -> Result<bool, SyncError> {
    let peer = PeerId::parse(peer_id)?;

    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| SyncError::Identity(format!("Signature is not valid hex: {}", e)))?;
    let sig_bytes: [u8; 64] = sig_bytes.as_slice().try_into().map_err(|_| {
        SyncError::Identity(format!(
            "Signature must be 64 bytes, got {}",
            sig_bytes.len()
        ))
    })?;
    let signature = Signature::from_bytes(&sig_bytes);

    Ok(peer.verifying_key().verify(data, &signature).is_ok())
}
