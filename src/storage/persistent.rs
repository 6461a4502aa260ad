//! Disk-backed storage on sled.
//!
//! Two trees: `values` keyed by the 32-byte value id, `peers` keyed by
//! `peer_id || node_id`. Records are CBOR-encoded [`StoredValue`] /
//! [`StoredPeer`]. sled batches writes and flushes on its own cadence, so
//! calls here do not block on disk I/O.

use super::{check_value_write, Storage, StoredPeer, StoredValue, PEER_TTL, VALUE_TTL};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::now;
use crate::value::Value;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub struct SledStorage {
    _db: sled::Db,
    values: sled::Tree,
    peers: sled::Tree,
    ttls: Mutex<(Duration, Duration)>,
}

fn storage_err<E: std::fmt::Display>(e: E) -> Error {
    Error::Storage(e.to_string())
}

fn encode<T: serde::Serialize>(record: &T) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(record, &mut buf).map_err(storage_err)?;
    Ok(buf)
}

fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    ciborium::from_reader(bytes).map_err(storage_err)
}

fn peer_key(peer_id: &Id, node_id: &Id) -> [u8; 64] {
    let mut key = [0u8; 64];
    key[..32].copy_from_slice(peer_id.as_bytes());
    key[32..].copy_from_slice(node_id.as_bytes());
    key
}

impl SledStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(storage_err)?;
        let values = db.open_tree("values").map_err(storage_err)?;
        let peers = db.open_tree("peers").map_err(storage_err)?;
        Ok(Self {
            _db: db,
            values,
            peers,
            ttls: Mutex::new((VALUE_TTL, PEER_TTL)),
        })
    }

    fn ttls(&self) -> (Duration, Duration) {
        self.ttls
            .lock()
            .map(|g| *g)
            .unwrap_or((VALUE_TTL, PEER_TTL))
    }

    fn load_value(&self, id: &Id) -> Result<Option<StoredValue>> {
        let (value_ttl, _) = self.ttls();
        match self.values.get(id.as_bytes()).map_err(storage_err)? {
            Some(bytes) => {
                let stored: StoredValue = decode(&bytes)?;
                Ok((!stored.is_expired(value_ttl)).then_some(stored))
            }
            None => Ok(None),
        }
    }
}

impl Storage for SledStorage {
    fn initialize(&self, value_ttl: Duration, peer_ttl: Duration) -> Result<()> {
        let mut ttls = self
            .ttls
            .lock()
            .map_err(|_| Error::Storage("ttl lock poisoned".into()))?;
        *ttls = (value_ttl, peer_ttl);
        Ok(())
    }

    fn put_value(
        &self,
        value: &Value,
        persistent: bool,
        expected_seq: Option<i32>,
    ) -> Result<()> {
        let id = value.id();
        let existing = self.load_value(&id)?.map(|s| s.value);
        check_value_write(existing.as_ref(), value, expected_seq)?;
        let record = encode(&StoredValue::new(value.clone(), persistent))?;
        self.values
            .insert(id.as_bytes(), record)
            .map_err(storage_err)?;
        Ok(())
    }

    fn get_value(&self, id: &Id) -> Result<Option<Value>> {
        Ok(self.load_value(id)?.map(|s| s.value))
    }

    fn remove_value(&self, id: &Id) -> Result<bool> {
        Ok(self
            .values
            .remove(id.as_bytes())
            .map_err(storage_err)?
            .is_some())
    }

    fn update_value_announced(&self, id: &Id) -> Result<()> {
        if let Some(bytes) = self.values.get(id.as_bytes()).map_err(storage_err)? {
            let mut stored: StoredValue = decode(&bytes)?;
            stored.announced_at = now();
            self.values
                .insert(id.as_bytes(), encode(&stored)?)
                .map_err(storage_err)?;
        }
        Ok(())
    }

    fn values_to_announce(&self, older_than: u64) -> Result<Vec<Value>> {
        let mut due = Vec::new();
        for item in self.values.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let stored: StoredValue = decode(&bytes)?;
            if stored.persistent && stored.announced_at < older_than {
                due.push(stored.value);
            }
        }
        Ok(due)
    }

    fn put_peer(&self, peer: &PeerInfo, persistent: bool) -> Result<()> {
        let key = peer_key(&peer.peer_id, &peer.node_id);
        let record = encode(&StoredPeer::new(peer.clone(), persistent))?;
        self.peers.insert(key, record).map_err(storage_err)?;
        Ok(())
    }

    fn get_peer(&self, id: &Id) -> Result<Option<PeerInfo>> {
        Ok(self.get_peers(id, 1)?.into_iter().next())
    }

    fn get_peers(&self, id: &Id, max: usize) -> Result<Vec<PeerInfo>> {
        let (_, peer_ttl) = self.ttls();
        let mut peers = Vec::new();
        for item in self.peers.scan_prefix(id.as_bytes()) {
            let (_, bytes) = item.map_err(storage_err)?;
            let stored: StoredPeer = decode(&bytes)?;
            if stored.is_expired(peer_ttl) {
                continue;
            }
            peers.push(stored.peer);
            if max > 0 && peers.len() >= max {
                break;
            }
        }
        Ok(peers)
    }

    fn remove_peer(&self, id: &Id) -> Result<bool> {
        let mut removed = false;
        let keys: Vec<_> = self
            .peers
            .scan_prefix(id.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()
            .map_err(storage_err)?;
        for key in keys {
            removed |= self.peers.remove(key).map_err(storage_err)?.is_some();
        }
        Ok(removed)
    }

    fn update_peer_announced(&self, peer_id: &Id, node_id: &Id) -> Result<()> {
        let key = peer_key(peer_id, node_id);
        if let Some(bytes) = self.peers.get(key).map_err(storage_err)? {
            let mut stored: StoredPeer = decode(&bytes)?;
            stored.announced_at = now();
            self.peers
                .insert(key, encode(&stored)?)
                .map_err(storage_err)?;
        }
        Ok(())
    }

    fn peers_to_announce(&self, older_than: u64) -> Result<Vec<PeerInfo>> {
        let mut due = Vec::new();
        for item in self.peers.iter() {
            let (_, bytes) = item.map_err(storage_err)?;
            let stored: StoredPeer = decode(&bytes)?;
            if stored.persistent && stored.announced_at < older_than {
                due.push(stored.peer);
            }
        }
        Ok(due)
    }

    fn purge(&self) -> Result<()> {
        let (value_ttl, peer_ttl) = self.ttls();

        let mut dead = Vec::new();
        for item in self.values.iter() {
            let (key, bytes) = item.map_err(storage_err)?;
            if decode::<StoredValue>(&bytes)?.is_expired(value_ttl) {
                dead.push(key);
            }
        }
        for key in dead {
            self.values.remove(key).map_err(storage_err)?;
        }

        let mut dead = Vec::new();
        for item in self.peers.iter() {
            let (key, bytes) = item.map_err(storage_err)?;
            if decode::<StoredPeer>(&bytes)?.is_expired(peer_ttl) {
                dead.push(key);
            }
        }
        for key in dead {
            self.peers.remove(key).map_err(storage_err)?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("storage.db");
        let value = Value::immutable(b"durable".to_vec()).unwrap();

        {
            let store = SledStorage::open(&path).unwrap();
            store.put_value(&value, true, None).unwrap();
        }

        let store = SledStorage::open(&path).unwrap();
        assert_eq!(store.get_value(&value.id()).unwrap(), Some(value));
    }
}
