//! Value and peer storage contract.
//!
//! The engine only depends on this trait; [`MemoryStorage`] backs nodes
//! without a storage path and [`SledStorage`] persists to disk. Callers
//! validate signatures before writing; the store enforces the id-level
//! invariants: mutable/immutable substitution is rejected, sequence numbers
//! only move forward, and an optional compare-and-swap pins the expected
//! stored sequence.

mod memory;
mod persistent;

pub use memory::MemoryStorage;
pub use persistent::SledStorage;

use crate::error::{Error, Result};
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::now;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default lifetime of a non-persistent value.
pub const VALUE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Default lifetime of a non-persistent peer announcement.
pub const PEER_TTL: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredValue {
    pub value: Value,
    pub persistent: bool,
    pub created_at: u64,
    pub announced_at: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPeer {
    pub peer: PeerInfo,
    pub persistent: bool,
    pub created_at: u64,
    pub announced_at: u64,
}

impl StoredValue {
    pub fn new(value: Value, persistent: bool) -> Self {
        let at = now();
        Self {
            value,
            persistent,
            created_at: at,
            announced_at: at,
        }
    }

    /// Non-persistent records expire; persistent ones are re-announced and
    /// never reaped locally.
    pub fn is_expired(&self, ttl: Duration) -> bool {
        !self.persistent && now() >= self.created_at.saturating_add(ttl.as_secs())
    }
}

impl StoredPeer {
    pub fn new(peer: PeerInfo, persistent: bool) -> Self {
        let at = now();
        Self {
            peer,
            persistent,
            created_at: at,
            announced_at: at,
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        !self.persistent && now() >= self.created_at.saturating_add(ttl.as_secs())
    }
}

/// Write-invariant check shared by all implementations.
pub(crate) fn check_value_write(
    existing: Option<&Value>,
    new: &Value,
    expected_seq: Option<i32>,
) -> Result<()> {
    match existing {
        None => {
            if expected_seq.is_some() {
                return Err(Error::CasFail);
            }
            Ok(())
        }
        Some(old) => {
            if old.is_mutable() != new.is_mutable() {
                return Err(Error::ImmutableSubstitution);
            }
            if !new.is_mutable() {
                // same content hash, refresh only
                return Ok(());
            }
            if let Some(expected) = expected_seq {
                if old.sequence_number != expected {
                    return Err(Error::CasFail);
                }
            }
            if new.sequence_number <= old.sequence_number {
                return Err(Error::SequenceNotMonotonic);
            }
            Ok(())
        }
    }
}

pub trait Storage: Send + Sync {
    /// Set the TTLs; called once before the node starts serving.
    fn initialize(&self, value_ttl: Duration, peer_ttl: Duration) -> Result<()>;

    fn put_value(&self, value: &Value, persistent: bool, expected_seq: Option<i32>)
        -> Result<()>;
    fn get_value(&self, id: &Id) -> Result<Option<Value>>;
    fn remove_value(&self, id: &Id) -> Result<bool>;
    fn update_value_announced(&self, id: &Id) -> Result<()>;
    /// Persistent values whose last announcement is older than the cutoff.
    fn values_to_announce(&self, older_than: u64) -> Result<Vec<Value>>;

    fn put_peer(&self, peer: &PeerInfo, persistent: bool) -> Result<()>;
    fn get_peer(&self, id: &Id) -> Result<Option<PeerInfo>>;
    fn get_peers(&self, id: &Id, max: usize) -> Result<Vec<PeerInfo>>;
    /// Remove all announcements under a peer id.
    fn remove_peer(&self, id: &Id) -> Result<bool>;
    fn update_peer_announced(&self, peer_id: &Id, node_id: &Id) -> Result<()>;
    fn peers_to_announce(&self, older_than: u64) -> Result<Vec<PeerInfo>>;

    /// Reap expired entries.
    fn purge(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Identity;

    // Exercise both implementations against the same contract.
    fn stores() -> Vec<(&'static str, Box<dyn Storage>)> {
        let dir = tempfile::tempdir().unwrap();
        let sled = SledStorage::open(dir.path().join("storage.db")).unwrap();
        // keep the tempdir alive for the duration of the test process
        std::mem::forget(dir);
        vec![
            ("memory", Box::new(MemoryStorage::new()) as Box<dyn Storage>),
            ("sled", Box::new(sled)),
        ]
    }

    #[test]
    fn value_round_trip_and_removal() {
        for (name, store) in stores() {
            let value = Value::immutable(b"stored".to_vec()).unwrap();
            store.put_value(&value, false, None).unwrap();
            assert_eq!(store.get_value(&value.id()).unwrap(), Some(value.clone()), "{}", name);
            assert!(store.remove_value(&value.id()).unwrap());
            assert!(store.get_value(&value.id()).unwrap().is_none());
            assert!(!store.remove_value(&value.id()).unwrap());
        }
    }

    #[test]
    fn sequence_must_move_forward() {
        for (name, store) in stores() {
            let identity = Identity::generate();
            let v0 = Value::signed(&identity, None, 0, b"v0".to_vec()).unwrap();
            let v1 = v0.update(&identity, b"v1".to_vec()).unwrap();

            store.put_value(&v1, false, None).unwrap();
            let err = store.put_value(&v0, false, None).unwrap_err();
            assert!(matches!(err, Error::SequenceNotMonotonic), "{}", name);
            // storage unchanged
            assert_eq!(store.get_value(&v0.id()).unwrap(), Some(v1.clone()));

            let err = store.put_value(&v1, false, None).unwrap_err();
            assert!(matches!(err, Error::SequenceNotMonotonic), "{}", name);
        }
    }

    #[test]
    fn cas_pins_stored_sequence() {
        for (name, store) in stores() {
            let identity = Identity::generate();
            let v0 = Value::signed(&identity, None, 0, b"v0".to_vec()).unwrap();
            let v1 = v0.update(&identity, b"v1".to_vec()).unwrap();
            let v2 = v1.update(&identity, b"v2".to_vec()).unwrap();

            store.put_value(&v0, false, None).unwrap();
            assert!(matches!(
                store.put_value(&v2, false, Some(1)),
                Err(Error::CasFail)
            ), "{}", name);
            store.put_value(&v1, false, Some(0)).unwrap();
            assert_eq!(
                store.get_value(&v1.id()).unwrap().unwrap().sequence_number,
                1
            );
        }
    }

    #[test]
    fn immutable_substitution_rejected() {
        let identity = Identity::generate();
        let mutable = Value::signed(&identity, None, 2, b"m".to_vec()).unwrap();
        let immutable = Value::immutable(b"f".to_vec()).unwrap();

        assert!(matches!(
            check_value_write(Some(&mutable), &immutable, None),
            Err(Error::ImmutableSubstitution)
        ));
        assert!(matches!(
            check_value_write(Some(&immutable), &mutable, None),
            Err(Error::ImmutableSubstitution)
        ));
        // immutable refresh under the same id is a no-op success
        assert!(check_value_write(Some(&immutable), &immutable, None).is_ok());
    }

    #[test]
    fn peers_key_on_peer_and_node() {
        for (name, store) in stores() {
            let owner = Identity::generate();
            let a = PeerInfo::new(&owner, Id::random(), None, 80, None).unwrap();
            let b = PeerInfo::new(&owner, Id::random(), None, 81, None).unwrap();

            store.put_peer(&a, false).unwrap();
            store.put_peer(&b, false).unwrap();

            let got = store.get_peers(owner.id(), 0).unwrap();
            assert_eq!(got.len(), 2, "{}", name);
            assert!(got.contains(&a) && got.contains(&b));

            let one = store.get_peers(owner.id(), 1).unwrap();
            assert_eq!(one.len(), 1);

            assert!(store.get_peer(owner.id()).unwrap().is_some());
            assert!(store.remove_peer(owner.id()).unwrap());
            assert!(store.get_peers(owner.id(), 0).unwrap().is_empty());
        }
    }

    #[test]
    fn announce_scan_finds_stale_persistent_entries() {
        for (name, store) in stores() {
            let identity = Identity::generate();
            let persistent = Value::signed(&identity, None, 0, b"p".to_vec()).unwrap();
            let transient = Value::immutable(b"t".to_vec()).unwrap();

            store.put_value(&persistent, true, None).unwrap();
            store.put_value(&transient, false, None).unwrap();

            // cutoff in the future: everything persistent is due
            let due = store.values_to_announce(now() + 10).unwrap();
            assert_eq!(due.len(), 1, "{}", name);
            assert_eq!(due[0].id(), persistent.id());

            store.update_value_announced(&persistent.id()).unwrap();
            let due = store.values_to_announce(now().saturating_sub(10)).unwrap();
            assert!(due.is_empty(), "{}", name);
        }
    }

    #[test]
    fn expired_values_vanish() {
        for (name, store) in stores() {
            store
                .initialize(Duration::from_secs(0), Duration::from_secs(0))
                .unwrap();
            let value = Value::immutable(b"gone".to_vec()).unwrap();
            store.put_value(&value, false, None).unwrap();
            assert!(store.get_value(&value.id()).unwrap().is_none(), "{}", name);
            store.purge().unwrap();

            let owner = Identity::generate();
            let peer = PeerInfo::new(&owner, Id::random(), None, 80, None).unwrap();
            store.put_peer(&peer, false).unwrap();
            assert!(store.get_peers(owner.id(), 0).unwrap().is_empty(), "{}", name);
        }
    }
}
