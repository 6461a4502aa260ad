//! Split-on-demand routing table over the full keyspace.

use super::bucket::KBucket;
use super::entry::KBucketEntry;
use super::prefix::Prefix;
use super::{BUCKET_REFRESH_INTERVAL, K};
use crate::error::{Error, Result};
use crate::id::Id;
use crate::types::{now, NodeInfo};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Ignore persisted caches older than this.
const CACHE_MAX_AGE_SECS: u64 = 24 * 60 * 60;
/// Candidate cap when loading a persisted cache.
const CACHE_MAX_ENTRIES: usize = 256;

/// Which liveness bar entries must clear when collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    /// Strict: handed to other nodes in `nodes4`/`nodes6`.
    NodesList,
    /// Relaxed: seeds our own lookups.
    LocalLookup,
}

/// Work produced by a maintenance pass.
#[derive(Debug, Default)]
pub struct Maintenance {
    /// Random targets inside buckets due for a refresh lookup.
    pub refresh_targets: Vec<Id>,
    /// Entries due for liveness pings or reachability probes.
    pub ping_candidates: Vec<NodeInfo>,
}

/// A sorted sequence of non-overlapping buckets covering the keyspace.
/// Writes are serialized by the owning reactor; see the concurrency notes
/// on [`super::rpc`].
#[derive(Debug)]
pub struct RoutingTable {
    local_id: Id,
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(local_id: Id) -> Self {
        Self {
            local_id,
            buckets: vec![KBucket::new(Prefix::whole())],
        }
    }

    pub fn local_id(&self) -> &Id {
        &self.local_id
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn entry_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    pub fn cache_count(&self) -> usize {
        self.buckets.iter().map(|b| b.cache().len()).sum()
    }

    fn bucket_index(&self, id: &Id) -> usize {
        let pp = self
            .buckets
            .partition_point(|b| b.prefix().first_id() <= *id);
        pp.saturating_sub(1)
    }

    pub fn bucket_of(&self, id: &Id) -> &KBucket {
        &self.buckets[self.bucket_index(id)]
    }

    /// Insert or refresh a verified entry, splitting the home bucket on
    /// demand. Entries for our own id are ignored.
    pub fn put(&mut self, entry: KBucketEntry) {
        if *entry.id() == self.local_id {
            return;
        }
        loop {
            let idx = self.bucket_index(entry.id());
            let full = self.buckets[idx].is_full();
            let known = self.buckets[idx].has_entry(entry.id());
            let splittable = self.buckets[idx].prefix().is_splittable()
                && self.buckets[idx].prefix().is_prefix_of(&self.local_id);

            if full && !known && splittable {
                let bucket = self.buckets.remove(idx);
                let (low, high) = bucket.split();
                self.buckets.insert(idx, high);
                self.buckets.insert(idx, low);
                continue;
            }

            self.buckets[idx].put(entry);
            return;
        }
    }

    /// Record a candidate observed on inbound traffic.
    pub fn put_candidate(&mut self, info: NodeInfo) {
        if info.id == self.local_id {
            return;
        }
        let idx = self.bucket_index(&info.id);
        self.buckets[idx].put_candidate(info);
    }

    pub fn get(&self, id: &Id) -> Option<NodeInfo> {
        self.bucket_of(id).find(id).map(|e| e.info.clone())
    }

    pub fn find_by_addr(&self, addr: &SocketAddr) -> Option<NodeInfo> {
        self.buckets
            .iter()
            .find_map(|b| b.find_by_addr(addr))
            .map(|e| e.info.clone())
    }

    pub fn on_timeout(&mut self, id: &Id) {
        let idx = self.bucket_index(id);
        self.buckets[idx].on_timeout(id);
    }

    pub fn on_send(&mut self, id: &Id) {
        let idx = self.bucket_index(id);
        self.buckets[idx].on_send(id);
    }

    pub fn remove(&mut self, id: &Id) {
        let idx = self.bucket_index(id);
        self.buckets[idx].remove(id);
    }

    /// A known address turned up with a new id. The stale entry is
    /// force-removed; its bucket neighbors are returned for verification
    /// pings.
    pub fn on_id_change(&mut self, addr: &SocketAddr, new_id: &Id) -> Vec<NodeInfo> {
        let Some(old) = self.find_by_addr(addr) else {
            return Vec::new();
        };
        if old.id == *new_id {
            return Vec::new();
        }
        let idx = self.bucket_index(&old.id);
        self.buckets[idx].remove(&old.id);
        self.buckets[idx]
            .entries()
            .iter()
            .map(|e| e.info.clone())
            .collect()
    }

    /// The `k` closest eligible entries to `target`: XOR distance
    /// ascending, then freshest-seen first.
    pub fn get_closest(&self, target: &Id, k: usize, eligibility: Eligibility) -> Vec<NodeInfo> {
        let center = self.bucket_index(target);
        let mut picked: Vec<&KBucketEntry> = Vec::new();

        let eligible = |e: &KBucketEntry| match eligibility {
            Eligibility::NodesList => e.is_eligible_for_nodes_list(),
            Eligibility::LocalLookup => e.is_eligible_for_local_lookup(),
        };

        let mut lo = center as isize;
        let mut hi = center as isize + 1;
        while (lo >= 0 || (hi as usize) < self.buckets.len()) && picked.len() < k {
            if lo >= 0 {
                picked.extend(self.buckets[lo as usize].entries().iter().filter(|e| eligible(e)));
                lo -= 1;
            }
            if (hi as usize) < self.buckets.len() && picked.len() < k {
                picked.extend(self.buckets[hi as usize].entries().iter().filter(|e| eligible(e)));
                hi += 1;
            }
        }

        picked.sort_by(|a, b| {
            target
                .three_way_compare(a.id(), b.id())
                .then_with(|| b.last_seen().cmp(&a.last_seen()))
        });
        picked.truncate(k);
        picked.into_iter().map(|e| e.info.clone()).collect()
    }

    /// Merge underfull sibling buckets, collect refresh targets and ping
    /// candidates. Run on the maintenance tick.
    pub fn maintenance(&mut self) -> Maintenance {
        // merge adjacent siblings whose combined live size fits one bucket
        let mut i = 0;
        while i + 1 < self.buckets.len() {
            let siblings = self.buckets[i]
                .prefix()
                .is_sibling_of(self.buckets[i + 1].prefix());
            let fits = self.buckets[i].live_count() + self.buckets[i + 1].live_count() <= K;
            if siblings && fits && self.buckets.len() > 1 {
                let right = self.buckets.remove(i + 1);
                self.buckets[i].absorb(right);
                i = i.saturating_sub(1);
            } else {
                i += 1;
            }
        }

        let mut out = Maintenance::default();
        let refresh_ms = BUCKET_REFRESH_INTERVAL.as_millis() as u64;
        for bucket in &mut self.buckets {
            if bucket.needs_refresh(refresh_ms) && !bucket.is_empty() {
                out.refresh_targets.push(bucket.prefix().random_id());
                bucket.mark_refreshed();
            }
            out.ping_candidates.extend(bucket.ping_candidates());
        }
        out
    }

    /// Flag the bucket containing `target` as freshly refreshed.
    pub fn mark_refreshed(&mut self, target: &Id) {
        let idx = self.bucket_index(target);
        self.buckets[idx].mark_refreshed();
    }

    // -------------------------------------------------------------------------
    // Persistence: `{ timestamp, entries[], cache[] }`, CBOR.
    // -------------------------------------------------------------------------

    pub fn save(&self, path: &Path) -> Result<()> {
        let file = CacheFile {
            timestamp: now(),
            entries: self
                .buckets
                .iter()
                .flat_map(|b| b.entries().iter().map(|e| e.info.clone()))
                .collect(),
            cache: self
                .buckets
                .iter()
                .flat_map(|b| b.cache().iter().map(|e| e.info.clone()))
                .collect(),
        };
        let mut buf = Vec::new();
        ciborium::into_writer(&file, &mut buf)
            .map_err(|e| Error::Storage(format!("cache encode: {}", e)))?;
        std::fs::write(path, buf)?;
        Ok(())
    }

    /// Load persisted entries as probe candidates. Stale or missing caches
    /// yield an empty list.
    pub fn load_candidates(path: &Path) -> Result<Vec<NodeInfo>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let file: CacheFile = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| Error::Storage(format!("cache decode: {}", e)))?;
        if now().saturating_sub(file.timestamp) > CACHE_MAX_AGE_SECS {
            return Ok(Vec::new());
        }
        let mut candidates = file.entries;
        candidates.extend(file.cache);
        candidates.truncate(CACHE_MAX_ENTRIES);
        Ok(candidates)
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        assert!(!self.buckets.is_empty());
        assert_eq!(self.buckets[0].prefix().first_id(), Id::MIN);
        for w in self.buckets.windows(2) {
            assert!(w[0].prefix().first_id() < w[1].prefix().first_id());
        }
        for bucket in &self.buckets {
            bucket.check_invariants();
            for e in bucket.entries().iter().chain(bucket.cache().iter()) {
                assert!(bucket.prefix().is_prefix_of(e.id()));
                assert_eq!(self.bucket_of(e.id()).prefix(), bucket.prefix());
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
struct CacheFile {
    timestamp: u64,
    entries: Vec<NodeInfo>,
    cache: Vec<NodeInfo>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verified(id: Id, port: u16) -> KBucketEntry {
        KBucketEntry::verified(
            NodeInfo::new(id, format!("44.3.2.1:{}", port).parse().unwrap()),
            20,
        )
    }

    fn id_near(local: &Id, shared_bits: usize) -> Id {
        // an id agreeing with `local` on the first `shared_bits` bits and
        // differing at the next
        let mut id = Id::random();
        for i in 0..shared_bits {
            id = id.with_bit(i, local.bit(i));
        }
        if shared_bits < 256 {
            id = id.with_bit(shared_bits, !local.bit(shared_bits));
        }
        id
    }

    #[test]
    fn home_bucket_splits_when_full() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);

        // ids near the local id keep landing in the home bucket and force
        // splits instead of cache demotion
        let mut port = 1000;
        for shared in 0..4 {
            for _ in 0..K {
                table.put(verified(id_near(&local, shared), port));
                port += 1;
            }
        }
        assert!(table.bucket_count() > 1);
        table.check_invariants();
    }

    #[test]
    fn far_bucket_overflows_to_cache() {
        let local = Id::MIN.with_bit(0, false); // all-zero id
        let mut table = RoutingTable::new(local);

        // ids in the high half; after the first split that bucket is not
        // the home bucket and must not split again
        let high = Prefix::whole().split_branch(true);
        for i in 0..K as u16 + 4 {
            table.put(verified(high.random_id(), 2000 + i));
        }
        let bucket = table.bucket_of(&high.first_id());
        assert!(bucket.len() <= K);
        table.check_invariants();
    }

    #[test]
    fn own_id_never_admitted() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        table.put(verified(local, 3000));
        table.put_candidate(NodeInfo::new(local, "44.3.2.1:3001".parse().unwrap()));
        assert_eq!(table.entry_count(), 0);
        assert_eq!(table.cache_count(), 0);
    }

    #[test]
    fn closest_returns_sorted_by_distance() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        for i in 0..32u16 {
            table.put(verified(Id::random(), 4000 + i));
        }

        let target = Id::random();
        let closest = table.get_closest(&target, K, Eligibility::NodesList);
        assert_eq!(closest.len(), K);
        for w in closest.windows(2) {
            assert_ne!(
                target.three_way_compare(&w[0].id, &w[1].id),
                std::cmp::Ordering::Greater
            );
        }
        table.check_invariants();
    }

    #[test]
    fn candidates_are_not_handed_out() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        for i in 0..8u16 {
            table.put_candidate(NodeInfo::new(
                Id::random(),
                format!("44.3.2.1:{}", 5000 + i).parse().unwrap(),
            ));
        }
        assert!(table
            .get_closest(&Id::random(), K, Eligibility::NodesList)
            .is_empty());
    }

    #[test]
    fn id_change_evicts_old_entry() {
        let local = Id::random();
        let mut table = RoutingTable::new(local);
        let addr: SocketAddr = "44.3.2.1:6000".parse().unwrap();
        let old_id = Id::random();
        table.put(KBucketEntry::verified(NodeInfo::new(old_id, addr), 10));
        for i in 0..4u16 {
            table.put(verified(Id::random(), 6100 + i));
        }

        let new_id = Id::random();
        let to_verify = table.on_id_change(&addr, &new_id);
        assert!(table.get(&old_id).is_none());
        // neighbors of the evicted entry come back for verification
        assert!(to_verify.iter().all(|n| n.id != old_id));
        table.check_invariants();
    }

    #[test]
    fn maintenance_merges_underfull_siblings() {
        let local = Id::MIN;
        let mut table = RoutingTable::new(local);

        // force a split with traffic near the local id, then empty buckets
        // merge back
        let mut port = 7000;
        for shared in 0..3 {
            for _ in 0..K {
                table.put(verified(id_near(&local, shared), port));
                port += 1;
            }
        }
        let before = table.bucket_count();
        assert!(before > 1);

        // drop everything in the high half
        let victims: Vec<Id> = table
            .buckets()
            .iter()
            .filter(|b| b.prefix().depth() > 0 && b.prefix().first_id().bit(0))
            .flat_map(|b| b.entries().iter().map(|e| *e.id()).collect::<Vec<_>>())
            .collect();
        for id in victims {
            table.remove(&id);
        }
        table.maintenance();
        assert!(table.bucket_count() <= before);
        table.check_invariants();
    }

    #[test]
    fn cache_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dht4.cache");

        let local = Id::random();
        let mut table = RoutingTable::new(local);
        for i in 0..6u16 {
            table.put(verified(Id::random(), 8000 + i));
        }
        table.put_candidate(NodeInfo::new(Id::random(), "44.3.2.1:8100".parse().unwrap()));
        table.save(&path).unwrap();

        let candidates = RoutingTable::load_candidates(&path).unwrap();
        assert_eq!(candidates.len(), 7);

        assert!(RoutingTable::load_candidates(&dir.path().join("missing"))
            .unwrap()
            .is_empty());
    }
}
