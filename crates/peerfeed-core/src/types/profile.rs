//! Profile - display information and reconnection addresses for a peer

use serde::{Deserialize, Serialize};

/// Identity profile for a peer (local or remote)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    /// Peer ID this profile describes
    #[serde(default)]
    pub peer_id: String,

    /// Display name shown in UI
    #[serde(default)]
    pub display_name: String,

    /// Free-text biography
    #[serde(default)]
    pub bio: String,

    /// Content reference for an avatar image
    #[serde(default)]
    pub avatar_hash: Option<String>,

    /// Reconnection endpoints, in preference order
    #[serde(default)]
    pub addresses: Vec<String>,
}

impl Profile {
    /// An otherwise-empty profile carrying only the peer ID
    pub fn for_peer(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            ..Default::default()
        }
    }

    /// Set reconnection addresses (builder style)
    pub fn with_addresses(mut self, addrs: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.addresses = addrs.into_iter().map(Into::into).collect();
        self
    }

    /// Merge-on-write: take `incoming` but keep our addresses when it has none
    pub fn merged_with(self, incoming: Profile) -> Profile {
        if incoming.addresses.is_empty() {
            Profile {
                addresses: self.addresses,
                ..incoming
            }
        } else {
            incoming
        }
    }
}
