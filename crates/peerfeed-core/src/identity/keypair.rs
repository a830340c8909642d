//! Node keypair: the long-lived Ed25519 key behind a node's peer ID
//!
//! The same 32-byte secret seeds the iroh endpoint, so the identity the
//! transport authenticates is the identity that signs posts.

use std::fs;
use std::io::Write;
use std::path::Path;

use ed25519_dalek::{Signer, SigningKey};
use tracing::info;

use crate::identity::PeerId;
use crate::SyncError;

/// Ed25519 signing key for the local node
pub struct NodeKeypair {
    signing: SigningKey,
}

impl NodeKeypair {
    /// Generate a new random keypair
    pub fn generate() -> Result<Self, SyncError> {
        let mut seed = [0u8; 32];
        getrandom::getrandom(&mut seed)
            .map_err(|e| SyncError::Identity(format!("Failed to get random bytes: {}", e)))?;
        Ok(Self::from_secret_bytes(&seed))
    }

    /// Rebuild a keypair from its 32 secret bytes
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Self {
        Self {
            signing: SigningKey::from_bytes(secret),
        }
    }

    /// The 32 secret bytes (for persistence and endpoint setup)
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    /// This node's self-certifying identifier
    pub fn peer_id(&self) -> PeerId {
        PeerId::from_verifying_key(self.signing.verifying_key())
    }

    /// Sign `data` and return the signature as lowercase hex
    pub fn sign(&self, data: &[u8]) -> String {
        hex::encode(self.signing.sign(data).to_bytes())
    }

    /// Load the keypair stored at `path`, or generate and store a new one
    ///
    /// The file holds the hex-encoded secret. A file that exists but cannot be
    /// decoded is an error; it is never silently replaced.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, SyncError> {
        let path = path.as_ref();

        if path.exists() {
            let text = fs::read_to_string(path)?;
            let bytes = hex::decode(text.trim())
                .map_err(|e| SyncError::Identity(format!("Corrupt key file: {}", e)))?;
            let secret: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
                SyncError::Identity(format!("Key file must hold 32 bytes, got {}", bytes.len()))
            })?;
            return Ok(Self::from_secret_bytes(&secret));
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let keypair = Self::generate()?;
        write_private(path, hex::encode(keypair.secret_bytes()).as_bytes())?;
        info!(peer = %keypair.peer_id(), ?path, "Generated new node identity");

        Ok(keypair)
    }
}

impl std::fmt::Debug for NodeKeypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeKeypair")
            .field("peer_id", &self.peer_id().to_string())
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[cfg(unix)]
fn write_private(path: &Path, data: &[u8]) -> Result<(), SyncError> {
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private(path: &Path, data: &[u8]) -> Result<(), SyncError> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(data)?;
    Ok(())
}
