//! In-process storage for nodes without a storage path.

use super::{check_value_write, Storage, StoredPeer, StoredValue, PEER_TTL, VALUE_TTL};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::peer::PeerInfo;
use crate::types::now;
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

struct Inner {
    values: HashMap<Id, StoredValue>,
    peers: HashMap<(Id, Id), StoredPeer>,
    value_ttl: Duration,
    peer_ttl: Duration,
}

pub struct MemoryStorage {
    inner: Mutex<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                values: HashMap::new(),
                peers: HashMap::new(),
                value_ttl: VALUE_TTL,
                peer_ttl: PEER_TTL,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| Error::Storage("storage lock poisoned".into()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemoryStorage {
    fn initialize(&self, value_ttl: Duration, peer_ttl: Duration) -> Result<()> {
        let mut inner = self.lock()?;
        inner.value_ttl = value_ttl;
        inner.peer_ttl = peer_ttl;
        Ok(())
    }

    fn put_value(
        &self,
        value: &Value,
        persistent: bool,
        expected_seq: Option<i32>,
    ) -> Result<()> {
        let mut inner = self.lock()?;
        let ttl = inner.value_ttl;
        let id = value.id();
        let existing = inner
            .values
            .get(&id)
            .filter(|s| !s.is_expired(ttl))
            .map(|s| s.value.clone());
        check_value_write(existing.as_ref(), value, expected_seq)?;
        inner
            .values
            .insert(id, StoredValue::new(value.clone(), persistent));
        Ok(())
    }

    fn get_value(&self, id: &Id) -> Result<Option<Value>> {
        let inner = self.lock()?;
        Ok(inner
            .values
            .get(id)
            .filter(|s| !s.is_expired(inner.value_ttl))
            .map(|s| s.value.clone()))
    }

    fn remove_value(&self, id: &Id) -> Result<bool> {
        Ok(self.lock()?.values.remove(id).is_some())
    }

    fn update_value_announced(&self, id: &Id) -> Result<()> {
        if let Some(stored) = self.lock()?.values.get_mut(id) {
            stored.announced_at = now();
        }
        Ok(())
    }

    fn values_to_announce(&self, older_than: u64) -> Result<Vec<Value>> {
        let inner = self.lock()?;
        Ok(inner
            .values
            .values()
            .filter(|s| s.persistent && s.announced_at < older_than)
            .map(|s| s.value.clone())
            .collect())
    }

    fn put_peer(&self, peer: &PeerInfo, persistent: bool) -> Result<()> {
        self.lock()?
            .peers
            .insert(peer.storage_key(), StoredPeer::new(peer.clone(), persistent));
        Ok(())
    }

    fn get_peer(&self, id: &Id) -> Result<Option<PeerInfo>> {
        Ok(self.get_peers(id, 1)?.into_iter().next())
    }

    fn get_peers(&self, id: &Id, max: usize) -> Result<Vec<PeerInfo>> {
        let inner = self.lock()?;
        let mut peers: Vec<PeerInfo> = inner
            .peers
            .values()
            .filter(|s| s.peer.peer_id == *id && !s.is_expired(inner.peer_ttl))
            .map(|s| s.peer.clone())
            .collect();
        if max > 0 {
            peers.truncate(max);
        }
        Ok(peers)
    }

    fn remove_peer(&self, id: &Id) -> Result<bool> {
        let mut inner = self.lock()?;
        let before = inner.peers.len();
        inner.peers.retain(|(peer_id, _), _| peer_id != id);
        Ok(inner.peers.len() != before)
    }

    fn update_peer_announced(&self, peer_id: &Id, node_id: &Id) -> Result<()> {
        if let Some(stored) = self.lock()?.peers.get_mut(&(*peer_id, *node_id)) {
            stored.announced_at = now();
        }
        Ok(())
    }

    fn peers_to_announce(&self, older_than: u64) -> Result<Vec<PeerInfo>> {
        let inner = self.lock()?;
        Ok(inner
            .peers
            .values()
            .filter(|s| s.persistent && s.announced_at < older_than)
            .map(|s| s.peer.clone())
            .collect())
    }

    fn purge(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let value_ttl = inner.value_ttl;
        let peer_ttl = inner.peer_ttl;
        inner.values.retain(|_, s| !s.is_expired(value_ttl));
        inner.peers.retain(|_, s| !s.is_expired(peer_ttl));
        Ok(())
    }
}
