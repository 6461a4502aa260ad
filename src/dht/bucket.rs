//! A single k-bucket: up to K live entries plus a replacement cache.

use super::entry::KBucketEntry;
use super::prefix::Prefix;
use super::K;
use crate::id::Id;
use crate::types::{now_millis, NodeInfo};

/// Holds the live peers for one keyspace prefix, ordered stalest-first by
/// last-seen time, with a same-capacity replacement cache of candidates.
///
/// Invariants: every resident id matches `prefix`; no id appears in both
/// the live list and the cache.
#[derive(Debug)]
pub struct KBucket {
    prefix: Prefix,
    entries: Vec<KBucketEntry>,
    cache: Vec<KBucketEntry>,
    last_refresh: u64,
}

impl KBucket {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            entries: Vec::with_capacity(K),
            cache: Vec::with_capacity(K),
            last_refresh: now_millis(),
        }
    }

    pub fn prefix(&self) -> &Prefix {
        &self.prefix
    }

    pub fn entries(&self) -> &[KBucketEntry] {
        &self.entries
    }

    pub fn cache(&self) -> &[KBucketEntry] {
        &self.cache
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= K
    }

    /// Live entries that still respond; drives merge decisions.
    pub fn live_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.old_and_stale()).count()
    }

    pub fn has_entry(&self, id: &Id) -> bool {
        self.entries.iter().any(|e| e.id() == id)
    }

    pub fn find(&self, id: &Id) -> Option<&KBucketEntry> {
        self.entries
            .iter()
            .chain(self.cache.iter())
            .find(|e| e.id() == id)
    }

    pub fn find_by_addr(&self, addr: &std::net::SocketAddr) -> Option<&KBucketEntry> {
        self.entries
            .iter()
            .chain(self.cache.iter())
            .find(|e| e.info.addr == *addr)
    }

    /// Insert or refresh a verified entry. The split decision is the
    /// table's; by the time this runs, overflow goes to the cache.
    pub fn put(&mut self, entry: KBucketEntry) {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.id() == entry.id()) {
            existing.merge(&entry);
            self.sort_entries();
            return;
        }

        if let Some(pos) = self.cache.iter().position(|e| e.id() == entry.id()) {
            let mut cached = self.cache.remove(pos);
            cached.merge(&entry);
            if cached.is_reachable() && !self.is_full() {
                self.entries.push(cached);
                self.sort_entries();
            } else {
                self.insert_cache(cached);
            }
            return;
        }

        if !self.is_full() {
            self.entries.push(entry);
            self.sort_entries();
        } else {
            self.insert_cache(entry);
        }
    }

    /// Record a candidate seen on inbound traffic. Known entries get a
    /// freshness bump; unknown ones land in the cache.
    pub fn put_candidate(&mut self, info: NodeInfo) {
        if let Some(existing) = self.entries.iter_mut().find(|e| *e.id() == info.id) {
            existing.signal_seen();
            self.sort_entries();
            return;
        }
        self.insert_cache(KBucketEntry::new(info));
    }

    /// Cache insertion with the eviction preference: drop the stalest
    /// unreachable resident first; a reachable newcomer may displace the
    /// stalest entry outright.
    fn insert_cache(&mut self, entry: KBucketEntry) {
        if let Some(existing) = self.cache.iter_mut().find(|e| e.id() == entry.id()) {
            existing.merge(&entry);
            return;
        }
        if self.cache.len() < K {
            self.cache.push(entry);
            return;
        }

        let victim = self
            .cache
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_reachable())
            .min_by_key(|(_, e)| e.last_seen())
            .map(|(i, _)| i)
            .or_else(|| {
                entry.is_reachable().then(|| {
                    self.cache
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.last_seen())
                        .map(|(i, _)| i)
                        .unwrap_or(0)
                })
            });

        if let Some(i) = victim {
            self.cache[i] = entry;
        }
    }

    /// A call to this node went unanswered.
    pub fn on_timeout(&mut self, id: &Id) {
        if let Some(pos) = self.entries.iter().position(|e| e.id() == id) {
            self.entries[pos].signal_timeout();
            if self.entries[pos].removable_without_replacement() {
                self.entries.remove(pos);
                self.promote_from_cache();
            }
            return;
        }
        if let Some(pos) = self.cache.iter().position(|e| e.id() == id) {
            self.cache[pos].signal_timeout();
            if self.cache[pos].failed_requests() >= 2 {
                self.cache.remove(pos);
            }
        }
    }

    pub fn on_send(&mut self, id: &Id) {
        if let Some(e) = self
            .entries
            .iter_mut()
            .chain(self.cache.iter_mut())
            .find(|e| e.id() == id)
        {
            e.signal_request_sent();
        }
    }

    pub fn remove(&mut self, id: &Id) -> Option<KBucketEntry> {
        if let Some(pos) = self.entries.iter().position(|e| e.id() == id) {
            let removed = self.entries.remove(pos);
            self.promote_from_cache();
            return Some(removed);
        }
        self.cache
            .iter()
            .position(|e| e.id() == id)
            .map(|pos| self.cache.remove(pos))
    }

    /// Pull the best verified candidate up into the live list.
    fn promote_from_cache(&mut self) {
        if self.is_full() {
            return;
        }
        if let Some(pos) = self
            .cache
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_reachable())
            .max_by_key(|(_, e)| e.last_seen())
            .map(|(i, _)| i)
        {
            let promoted = self.cache.remove(pos);
            self.entries.push(promoted);
            self.sort_entries();
        }
    }

    /// Split into the two child buckets, redistributing residents.
    pub fn split(self) -> (KBucket, KBucket) {
        debug_assert!(self.prefix.is_splittable());
        let depth = self.prefix.depth();
        let mut low = KBucket::new(self.prefix.split_branch(false));
        let mut high = KBucket::new(self.prefix.split_branch(true));
        low.last_refresh = self.last_refresh;
        high.last_refresh = self.last_refresh;

        for entry in self.entries {
            let side = if entry.id().bit(depth) { &mut high } else { &mut low };
            side.entries.push(entry);
        }
        for entry in self.cache {
            let side = if entry.id().bit(depth) { &mut high } else { &mut low };
            side.insert_cache(entry);
        }
        low.sort_entries();
        high.sort_entries();
        (low, high)
    }

    /// Fold a sibling into this bucket under the shared parent prefix.
    pub fn absorb(&mut self, other: KBucket) {
        debug_assert!(self.prefix.is_sibling_of(other.prefix()));
        self.prefix = self.prefix.parent();
        self.last_refresh = self.last_refresh.min(other.last_refresh);

        let mut merged: Vec<KBucketEntry> = Vec::with_capacity(K);
        let mut spill: Vec<KBucketEntry> = Vec::new();
        let mut pool: Vec<KBucketEntry> = self
            .entries
            .drain(..)
            .chain(other.entries.into_iter())
            .collect();
        // keep reachable and fresh residents first
        pool.sort_by_key(|e| (!e.is_reachable(), std::cmp::Reverse(e.last_seen())));
        for entry in pool {
            if merged.len() < K {
                merged.push(entry);
            } else {
                spill.push(entry);
            }
        }
        self.entries = merged;
        self.sort_entries();

        for entry in spill.into_iter().chain(other.cache.into_iter()) {
            self.insert_cache(entry);
        }
    }

    pub fn needs_refresh(&self, interval_ms: u64) -> bool {
        now_millis().saturating_sub(self.last_refresh) >= interval_ms
    }

    pub fn mark_refreshed(&mut self) {
        self.last_refresh = now_millis();
    }

    /// Residents due for liveness pings or reachability probes.
    pub fn ping_candidates(&self) -> Vec<NodeInfo> {
        let mut out: Vec<NodeInfo> = self
            .entries
            .iter()
            .filter(|e| e.needs_ping())
            .map(|e| e.info.clone())
            .collect();
        out.extend(
            self.cache
                .iter()
                .filter(|e| e.needs_probe())
                .take(2)
                .map(|e| e.info.clone()),
        );
        out
    }

    fn sort_entries(&mut self) {
        self.entries.sort_by_key(|e| e.last_seen());
    }

    #[cfg(test)]
    pub(crate) fn check_invariants(&self) {
        for e in self.entries.iter().chain(self.cache.iter()) {
            assert!(self.prefix.is_prefix_of(e.id()), "resident outside prefix");
        }
        let mut ids: Vec<&Id> = self
            .entries
            .iter()
            .chain(self.cache.iter())
            .map(|e| e.id())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(
            ids.len(),
            self.entries.len() + self.cache.len(),
            "duplicate id in bucket"
        );
    }
}
