//! Profile Storage - the local profile and per-peer remote profiles
//!
//! A peer is "known" exactly when a remote profile exists for it; there is
//! no separate peer registry.

use redb::{ReadableTable, TableDefinition};
use tracing::{debug, warn};

use super::{decode, encode, Storage};
use crate::error::SyncError;
use crate::types::Profile;

/// The single local profile (key: [`LOCAL_PROFILE_KEY`])
pub(crate) const LOCAL_PROFILE_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("profile:local");

/// Remote profiles (key: peer id string, value: JSON Profile)
pub(crate) const REMOTE_PROFILES_TABLE: TableDefinition<&str, &[u8]> =
    TableDefinition::new("profile:remote");

/// Fixed key, independent of the node's identity
const LOCAL_PROFILE_KEY: &str = "self";

impl Storage {
    /// The local profile, or an empty one carrying our peer ID
    pub fn get_local_profile(&self) -> Result<Profile, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(LOCAL_PROFILE_TABLE)?;

        match table.get(LOCAL_PROFILE_KEY)? {
            Some(v) => decode(v.value()),
            None => Ok(Profile::for_peer(self.local_peer.to_string())),
        }
    }

    /// Overwrite the local profile
    ///
    /// `peer_id` is always forced to this node's identity.
    pub fn save_local_profile(&self, mut profile: Profile) -> Result<Profile, SyncError> {
        profile.peer_id = self.local_peer.to_string();
        let data = encode(&profile)?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(LOCAL_PROFILE_TABLE)?;
            table.insert(LOCAL_PROFILE_KEY, data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(profile)
    }

    /// Unconditionally overwrite the remote profile for `profile.peer_id`
    ///
    /// Used for profiles the node was told about directly (e.g. an explicit
    /// connect), not for profiles fetched by synchronization.
    pub fn save_remote_profile(&self, profile: &Profile) -> Result<(), SyncError> {
        if profile.peer_id.is_empty() {
            return Err(SyncError::InvalidInput(
                "Remote profile has no peer id".to_string(),
            ));
        }

        let data = encode(profile)?;

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        {
            let mut table = write_txn.open_table(REMOTE_PROFILES_TABLE)?;
            table.insert(profile.peer_id.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;

        debug!(peer = %profile.peer_id, "Saved remote profile");
        Ok(())
    }

    /// Save a synchronized remote profile without losing known addresses.
    ///
    /// Stored `addresses` survive when the incoming profile carries none; a
    /// non-empty incoming list replaces them. Read and write share one
    /// transaction. Returns the record as stored.
    pub fn save_remote_profile_merge(&self, profile: Profile) -> Result<Profile, SyncError> {
        if profile.peer_id.is_empty() {
            return Err(SyncError::InvalidInput(
                "Remote profile has no peer id".to_string(),
            ));
        }

        let db = self.db_handle();
        let db_guard = db.read();
        let write_txn = db_guard.begin_write()?;
        let merged = {
            let mut table = write_txn.open_table(REMOTE_PROFILES_TABLE)?;

            let existing = table
                .get(profile.peer_id.as_str())?
                .map(|v| v.value().to_vec());
            let merged = match existing {
                Some(bytes) => decode::<Profile>(&bytes)?.merged_with(profile),
                None => profile,
            };

            let data = encode(&merged)?;
            table.insert(merged.peer_id.as_str(), data.as_slice())?;
            merged
        };
        write_txn.commit()?;

        debug!(
            peer = %merged.peer_id,
            addresses = merged.addresses.len(),
            "Merged remote profile"
        );
        Ok(merged)
    }

    /// The stored profile for `peer_id`, or an empty one carrying that ID
    pub fn get_remote_profile(&self, peer_id: &str) -> Result<Profile, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(REMOTE_PROFILES_TABLE)?;

        match table.get(peer_id)? {
            Some(v) => decode(v.value()),
            None => Ok(Profile::for_peer(peer_id)),
        }
    }

    /// IDs of every peer with a stored remote profile
    pub fn get_known_peers(&self) -> Result<Vec<String>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(REMOTE_PROFILES_TABLE)?;

        // Keys are unique, so no further de-duplication is needed
        let mut peers = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            peers.push(key.value().to_string());
        }
        Ok(peers)
    }

    /// Every stored remote profile, for bootstrap reconnection
    ///
    /// Records that fail to decode are skipped with a warning.
    pub fn get_known_peers_with_profiles(&self) -> Result<Vec<Profile>, SyncError> {
        let db = self.db_handle();
        let db_guard = db.read();
        let read_txn = db_guard.begin_read()?;
        let table = read_txn.open_table(REMOTE_PROFILES_TABLE)?;

        let mut profiles = Vec::new();
        for entry in table.iter()? {
            let (key, value) = entry?;
            match decode::<Profile>(value.value()) {
                Ok(profile) => profiles.push(profile),
                Err(e) => warn!(peer = %key.value(), error = ?e, "Skipping undecodable profile"),
            }
        }
        Ok(profiles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::test_support::create_test_storage;

    #[test]
    fn test_default_local_profile_has_identity() {
        let (storage, keypair, _temp) = create_test_storage();

        let profile = storage.get_local_profile().unwrap();
        assert_eq!(profile.peer_id, keypair.peer_id().to_string());
        assert!(profile.display_name.is_empty());
        assert!(profile.addresses.is_empty());
    }

    #[test]
    fn test_save_local_profile_forces_identity() {
        let (storage, keypair, _temp) = create_test_storage();

        let profile = Profile {
            display_name: "Love".to_string(),
            bio: "Gardener".to_string(),
            ..Profile::for_peer("impostor")
        };
        let saved = storage.save_local_profile(profile).unwrap();
        assert_eq!(saved.peer_id, keypair.peer_id().to_string());

        let loaded = storage.get_local_profile().unwrap();
        assert_eq!(loaded.peer_id, keypair.peer_id().to_string());
        assert_eq!(loaded.display_name, "Love");
        assert_eq!(loaded.bio, "Gardener");
    }

    #[test]
    fn test_local_profile_is_not_a_known_peer() {
        let (storage, _keypair, _temp) = create_test_storage();

        storage
            .save_local_profile(Profile {
                display_name: "Me".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(storage.get_known_peers().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_remote_profile_defaults() {
        let (storage, _keypair, _temp) = create_test_storage();

        let profile = storage.get_remote_profile("stranger").unwrap();
        assert_eq!(profile, Profile::for_peer("stranger"));
    }

    #[test]
    fn test_save_remote_profile_overwrites_addresses() {
        let (storage, _keypair, _temp) = create_test_storage();

        let first = Profile::for_peer("peer1").with_addresses(["10.0.0.1:1"]);
        storage.save_remote_profile(&first).unwrap();

        let second = Profile::for_peer("peer1");
        storage.save_remote_profile(&second).unwrap();

        assert!(storage.get_remote_profile("peer1").unwrap().addresses.is_empty());
    }

    #[test]
    fn test_remote_profile_requires_peer_id() {
        let (storage, _keypair, _temp) = create_test_storage();

        assert!(storage.save_remote_profile(&Profile::default()).is_err());
        assert!(storage.save_remote_profile_merge(Profile::default()).is_err());
    }

    #[test]
    fn test_merge_preserves_addresses_when_incoming_empty() {
        let (storage, _keypair, _temp) = create_test_storage();

        storage
            .save_remote_profile(
                &Profile::for_peer("peerA").with_addresses(["/ip4/1.2.3.4/tcp/4001"]),
            )
            .unwrap();

        let incoming = Profile {
            display_name: "Alice".to_string(),
            ..Profile::for_peer("peerA")
        };
        let merged = storage.save_remote_profile_merge(incoming).unwrap();
        assert_eq!(merged.addresses, vec!["/ip4/1.2.3.4/tcp/4001"]);

        let stored = storage.get_remote_profile("peerA").unwrap();
        assert_eq!(stored.display_name, "Alice");
        assert_eq!(stored.addresses, vec!["/ip4/1.2.3.4/tcp/4001"]);
    }

    #[test]
    fn test_merge_replaces_addresses_when_incoming_non_empty() {
        let (storage, _keypair, _temp) = create_test_storage();

        storage
            .save_remote_profile(&Profile::for_peer("peerA").with_addresses(["old:1"]))
            .unwrap();
        storage
            .save_remote_profile_merge(Profile::for_peer("peerA").with_addresses(["new:2", "new:3"]))
            .unwrap();

        let stored = storage.get_remote_profile("peerA").unwrap();
        assert_eq!(stored.addresses, vec!["new:2", "new:3"]);
    }

    #[test]
    fn test_merge_into_unknown_peer_creates_it() {
        let (storage, _keypair, _temp) = create_test_storage();

        storage
            .save_remote_profile_merge(Profile::for_peer("fresh"))
            .unwrap();
        assert_eq!(storage.get_known_peers().unwrap(), vec!["fresh"]);
    }

    #[test]
    fn test_known_peers_and_profiles() {
        let (storage, _keypair, _temp) = create_test_storage();

        for peer in ["p1", "p2", "p3"] {
            storage.save_remote_profile(&Profile::for_peer(peer)).unwrap();
        }
        // Re-saving does not duplicate
        storage.save_remote_profile(&Profile::for_peer("p2")).unwrap();

        let mut peers = storage.get_known_peers().unwrap();
        peers.sort();
        assert_eq!(peers, vec!["p1", "p2", "p3"]);

        let profiles = storage.get_known_peers_with_profiles().unwrap();
        assert_eq!(profiles.len(), 3);
    }
}
