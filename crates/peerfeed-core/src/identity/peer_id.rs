//! Self-certifying peer identifier
//!
//! Format: base58 of the raw 32-byte Ed25519 public key.
//!
//! Unlike a hashed identifier, the public key is the identifier, so any party
//! can verify a peer's signatures from the identifier string alone.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::SyncError;

/// Identifier of a peer, carrying its Ed25519 public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PeerId(VerifyingKey);

impl PeerId {
    /// Wrap an already-validated verifying key
    pub fn from_verifying_key(key: VerifyingKey) -> Self {
        Self(key)
    }

    /// Build a peer ID from raw public key bytes
    ///
    /// Fails if the bytes are not a valid Ed25519 curve point.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, SyncError> {
        VerifyingKey::from_bytes(bytes)
            .map(Self)
            .map_err(|e| SyncError::Identity(format!("Invalid public key: {}", e)))
    }

    /// Parse a peer ID from its base58 string form
    pub fn parse(s: &str) -> Result<Self, SyncError> {
        if s.is_empty() {
            return Err(SyncError::Identity("Peer ID cannot be empty".to_string()));
        }

        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|_| SyncError::Identity("Invalid base58 encoding in peer ID".to_string()))?;

        let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            SyncError::Identity(format!(
                "Peer ID must decode to 32 bytes, got {}",
                decoded.len()
            ))
        })?;

        Self::from_bytes(&bytes)
    }

    /// The public key this identifier certifies
    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.0
    }

    /// Raw public key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }

    /// First 8 characters, for log lines and compact display
    pub fn fmt_short(&self) -> String {
        self.to_string().chars().take(8).collect()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", bs58::encode(self.0.as_bytes()).into_string())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self)
    }
}

impl FromStr for PeerId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Hash for PeerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.as_bytes().hash(state);
    }
}

impl PartialOrd for PeerId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PeerId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.as_bytes().cmp(other.0.as_bytes())
    }
}

impl Serialize for PeerId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PeerId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeKeypair;

    #[test]
    fn test_peer_id_string_roundtrip() {
        let keypair = NodeKeypair::generate().unwrap();
        let peer_id = keypair.peer_id();

        let parsed: PeerId = peer_id.to_string().parse().unwrap();
        assert_eq!(parsed, peer_id);
        assert_eq!(parsed.as_bytes(), peer_id.as_bytes());
    }

    #[test]
    fn test_peer_id_rejects_empty() {
        assert!(matches!(PeerId::parse(""), Err(SyncError::Identity(_))));
    }

    #[test]
    fn test_peer_id_rejects_invalid_base58() {
        // '0', 'O', 'I' and 'l' are not in the base58 alphabet
        assert!(matches!(PeerId::parse("0OIl"), Err(SyncError::Identity(_))));
    }

    #[test]
    fn test_peer_id_rejects_wrong_length() {
        let short = bs58::encode([7u8; 16]).into_string();
        let err = PeerId::parse(&short).unwrap_err();
        assert!(err.to_string().contains("32 bytes"));
    }

    #[test]
    fn test_peer_id_serde_as_string() {
        let keypair = NodeKeypair::generate().unwrap();
        let peer_id = keypair.peer_id();

        let json = serde_json::to_string(&peer_id).unwrap();
        assert_eq!(json, format!("\"{}\"", peer_id));

        let back: PeerId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, peer_id);
    }

    #[test]
    fn test_fmt_short() {
        let keypair = NodeKeypair::generate().unwrap();
        let short = keypair.peer_id().fmt_short();
        assert_eq!(short.len(), 8);
        assert!(keypair.peer_id().to_string().starts_with(&short));
    }
}
