//! Suspicious-node detection and ingress bans.
//!
//! Malformed datagrams and id/address inconsistencies are counted per ip
//! over a sliding window. Crossing the threshold promotes the host to a
//! timed ban list; banned hosts are dropped before decoding.

use crate::types::now_millis;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use tracing::{debug, info};

/// Sliding observation window.
const OBSERVATION_WINDOW_MS: u64 = 15 * 60 * 1000;
/// Ban duration once the threshold is crossed.
const BAN_DURATION_MS: u64 = 30 * 60 * 1000;
/// Bound on tracked hosts.
const MAX_TRACKED_IPS: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Undecodable or out-of-contract datagram.
    Malformed,
    /// Known address presenting a different id, or vice versa.
    Inconsistent,
}

pub struct Sentinel {
    enabled: bool,
    threshold: u32,
    observations: HashMap<IpAddr, VecDeque<u64>>,
    bans: HashMap<IpAddr, u64>,
}

impl Sentinel {
    pub fn new(enabled: bool, threshold: u32) -> Self {
        Self {
            enabled,
            threshold,
            observations: HashMap::new(),
            bans: HashMap::new(),
        }
    }

    /// Record a misbehavior observation; may promote the host to the ban
    /// list.
    pub fn observe(&mut self, ip: IpAddr, kind: Observation) {
        if !self.enabled {
            return;
        }
        let at = now_millis();
        let window = self.observations.entry(ip).or_default();
        window.push_back(at);
        while let Some(front) = window.front() {
            if at.saturating_sub(*front) > OBSERVATION_WINDOW_MS {
                window.pop_front();
            } else {
                break;
            }
        }
        debug!("suspicious {:?} from {} ({} in window)", kind, ip, window.len());

        if window.len() as u32 >= self.threshold {
            self.observations.remove(&ip);
            self.bans.insert(ip, at + BAN_DURATION_MS);
            info!("banning {} for {}s", ip, BAN_DURATION_MS / 1000);
        }
    }

    /// Ingress check; lazily expires stale bans.
    pub fn is_banned(&mut self, ip: IpAddr) -> bool {
        if !self.enabled {
            return false;
        }
        match self.bans.get(&ip) {
            Some(until) if now_millis() < *until => true,
            Some(_) => {
                self.bans.remove(&ip);
                false
            }
            None => false,
        }
    }

    pub fn banned_count(&self) -> usize {
        self.bans.len()
    }

    /// Periodic cleanup of expired bans and empty windows.
    pub fn purge(&mut self) {
        let at = now_millis();
        self.bans.retain(|_, until| at < *until);
        self.observations.retain(|_, window| {
            window
                .back()
                .is_some_and(|last| at.saturating_sub(*last) <= OBSERVATION_WINDOW_MS)
        });
        if self.observations.len() > MAX_TRACKED_IPS {
            let mut sizes: Vec<(IpAddr, usize)> = self
                .observations
                .iter()
                .map(|(ip, w)| (*ip, w.len()))
                .collect();
            sizes.sort_by_key(|(_, n)| *n);
            for (ip, _) in sizes.into_iter().take(MAX_TRACKED_IPS / 2) {
                self.observations.remove(&ip);
            }
        }
    }
}
