//! Per-peer liveness records for the routing table.

use super::MAX_FAILED_REQUESTS;
use crate::id::Id;
use crate::types::{now_millis, NodeInfo};
use std::fmt;

/// An entry is eligible for lookups while seen within this window.
pub const FRESH_WINDOW_MS: u64 = 15 * 60 * 1000;

/// Ping an entry that has been quiet for this long.
pub const NEEDS_PING_MS: u64 = 2 * 60 * 1000;

/// Don't re-ping an entry we contacted this recently.
const PING_BACKOFF_MS: u64 = 30 * 1000;

/// A routing-table resident: a known node plus its liveness history.
#[derive(Debug, Clone)]
pub struct KBucketEntry {
    pub info: NodeInfo,
    created_at: u64,
    last_seen: u64,
    last_send: u64,
    failed_requests: u32,
    reachable: bool,
    rtt_ewma: Option<f64>,
}

impl KBucketEntry {
    /// A candidate observed on inbound traffic; not yet proven reachable.
    pub fn new(info: NodeInfo) -> Self {
        let at = now_millis();
        Self {
            info,
            created_at: at,
            last_seen: at,
            last_send: 0,
            failed_requests: 0,
            reachable: false,
            rtt_ewma: None,
        }
    }

    /// An entry built from a response to one of our own calls.
    pub fn verified(info: NodeInfo, rtt_ms: u64) -> Self {
        let mut entry = Self::new(info);
        entry.reachable = true;
        entry.rtt_ewma = Some(rtt_ms as f64);
        entry
    }

    pub fn id(&self) -> &Id {
        &self.info.id
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn failed_requests(&self) -> u32 {
        self.failed_requests
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    /// Smoothed round-trip estimate in milliseconds.
    pub fn rtt_ewma(&self) -> Option<f64> {
        self.rtt_ewma
    }

    /// Fold a newer sighting of the same node into this record.
    pub fn merge(&mut self, other: &KBucketEntry) {
        debug_assert!(self.info.matches(&other.info));
        if other.last_seen > self.last_seen {
            self.last_seen = other.last_seen;
            self.info.version = other.info.version.or(self.info.version);
        }
        if other.reachable {
            self.reachable = true;
            self.failed_requests = 0;
        }
        if let Some(rtt) = other.rtt_ewma {
            self.update_rtt(rtt);
        }
    }

    /// One of our requests to this node got a response.
    pub fn signal_response(&mut self, rtt_ms: u64) {
        self.last_seen = now_millis();
        self.failed_requests = 0;
        self.reachable = true;
        self.update_rtt(rtt_ms as f64);
    }

    /// Inbound traffic from this node; freshness only, not reachability.
    pub fn signal_seen(&mut self) {
        self.last_seen = now_millis();
    }

    pub fn signal_request_sent(&mut self) {
        self.last_send = now_millis();
    }

    pub fn signal_timeout(&mut self) {
        self.failed_requests = self.failed_requests.saturating_add(1);
    }

    fn update_rtt(&mut self, sample: f64) {
        self.rtt_ewma = Some(match self.rtt_ewma {
            None => sample,
            Some(ewma) => (3.0 * ewma + sample) / 4.0,
        });
    }

    fn age_of(&self, ts: u64) -> u64 {
        now_millis().saturating_sub(ts)
    }

    /// Seen recently, or never timed out on us.
    pub fn is_eligible_for_local_lookup(&self) -> bool {
        self.age_of(self.last_seen) < FRESH_WINDOW_MS || self.failed_requests == 0
    }

    /// Strict bar for entries handed to other nodes: proven reachable and
    /// recently seen.
    pub fn is_eligible_for_nodes_list(&self) -> bool {
        self.reachable && self.age_of(self.last_seen) < FRESH_WINDOW_MS
    }

    pub fn needs_ping(&self) -> bool {
        self.age_of(self.last_seen) > NEEDS_PING_MS && self.age_of(self.last_send) > PING_BACKOFF_MS
    }

    /// Unverified cache resident due for a reachability probe.
    pub fn needs_probe(&self) -> bool {
        !self.reachable && self.age_of(self.last_send) > PING_BACKOFF_MS
    }

    pub fn old_and_stale(&self) -> bool {
        self.failed_requests >= 2 && self.age_of(self.last_seen) >= FRESH_WINDOW_MS
    }

    /// Dead enough to drop even without a cache replacement.
    pub fn removable_without_replacement(&self) -> bool {
        self.failed_requests >= MAX_FAILED_REQUESTS
    }
}

impl fmt::Display for KBucketEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} fail={} reach={} rtt={:.0?}",
            self.info, self.failed_requests, self.reachable, self.rtt_ewma
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry() -> KBucketEntry {
        KBucketEntry::new(NodeInfo::new(Id::random(), "1.2.3.4:1000".parse().unwrap()))
    }

    #[test]
    fn fresh_candidate_is_lookup_eligible_but_not_listable() {
        let e = entry();
        assert!(e.is_eligible_for_local_lookup());
        assert!(!e.is_eligible_for_nodes_list());
        assert!(!e.removable_without_replacement());
    }

    #[test]
    fn response_proves_reachability() {
        let mut e = entry();
        e.signal_timeout();
        e.signal_response(40);
        assert!(e.is_reachable());
        assert_eq!(e.failed_requests(), 0);
        assert!(e.is_eligible_for_nodes_list());
    }

    #[test]
    fn rtt_smooths_toward_samples() {
        let mut e = entry();
        e.signal_response(100);
        assert_eq!(e.rtt_ewma(), Some(100.0));
        e.signal_response(200);
        let rtt = e.rtt_ewma().unwrap();
        assert!(rtt > 100.0 && rtt < 200.0);
    }

    #[test]
    fn repeated_timeouts_make_removable() {
        let mut e = entry();
        for _ in 0..MAX_FAILED_REQUESTS {
            e.signal_timeout();
        }
        assert!(e.removable_without_replacement());
        // a single sighting does not reset the counter
        e.signal_seen();
        assert!(e.removable_without_replacement());
        // a response does
        e.signal_response(10);
        assert!(!e.removable_without_replacement());
    }

    #[test]
    fn merge_takes_reachability_and_freshness() {
        let info = NodeInfo::new(Id::random(), "9.9.9.9:42".parse().unwrap());
        let mut stale = KBucketEntry::new(info.clone());
        stale.signal_timeout();

        let fresh = KBucketEntry::verified(info, 25);
        stale.merge(&fresh);
        assert!(stale.is_reachable());
        assert_eq!(stale.failed_requests(), 0);
        assert_eq!(stale.rtt_ewma(), Some(25.0));
    }
}
