//! Per-ip token-bucket throttling.
//!
//! Inbound requests from an ip that exhausted its bucket are dropped;
//! outbound calls to such an ip are delayed in proportion to the deficit
//! rather than dropped.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Stop tracking ips beyond this; full buckets are pruned first.
const MAX_TRACKED_IPS: usize = 4096;

#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, rate_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            rate_per_sec,
            last_update: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_update = now;
    }

    pub fn try_consume(&mut self, tokens: f64) -> bool {
        self.refill();
        if self.tokens >= tokens {
            self.tokens -= tokens;
            true
        } else {
            false
        }
    }

    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    /// Time until `tokens` become available at the refill rate.
    pub fn time_until(&mut self, tokens: f64) -> Duration {
        self.refill();
        if self.tokens >= tokens {
            return Duration::ZERO;
        }
        Duration::from_secs_f64((tokens - self.tokens) / self.rate_per_sec)
    }

    pub fn is_full(&mut self) -> bool {
        self.refill();
        self.tokens >= self.capacity
    }
}

pub struct Throttle {
    enabled: bool,
    rate: f64,
    burst: f64,
    buckets: HashMap<IpAddr, TokenBucket>,
}

impl Throttle {
    pub fn new(enabled: bool, rate: u32, burst: u32) -> Self {
        Self {
            enabled,
            rate: rate as f64,
            burst: burst as f64,
            buckets: HashMap::new(),
        }
    }

    fn bucket(&mut self, ip: IpAddr) -> &mut TokenBucket {
        let (rate, burst) = (self.rate, self.burst);
        self.buckets
            .entry(ip)
            .or_insert_with(|| TokenBucket::new(burst, rate))
    }

    /// Admit or drop an inbound request from `ip`.
    pub fn inbound_allowed(&mut self, ip: IpAddr) -> bool {
        if !self.enabled {
            return true;
        }
        self.bucket(ip).try_consume(1.0)
    }

    /// Delay to apply before sending a call to `ip`. Zero when the bucket
    /// has capacity; otherwise proportional to the deficit.
    pub fn outbound_delay(&mut self, ip: IpAddr) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        let delay = self.bucket(ip).time_until(1.0);
        if delay > Duration::ZERO {
            self.bucket(ip).try_consume(1.0);
        }
        delay
    }

    /// Drop replenished buckets; bound the map under churn.
    pub fn purge(&mut self) {
        self.buckets.retain(|_, b| !b.is_full());
        if self.buckets.len() > MAX_TRACKED_IPS {
            // under extreme churn, forget the fullest buckets first
            let mut loads: Vec<(IpAddr, f64)> = self
                .buckets
                .iter_mut()
                .map(|(ip, b)| (*ip, b.available()))
                .collect();
            loads.sort_by(|a, b| b.1.total_cmp(&a.1));
            for (ip, _) in loads.into_iter().skip(MAX_TRACKED_IPS / 2) {
                self.buckets.remove(&ip);
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_drop() {
        let mut throttle = Throttle::new(true, 32, 8);
        let ip: IpAddr = "6.6.6.6".parse().unwrap();

        for _ in 0..8 {
            assert!(throttle.inbound_allowed(ip));
        }
        assert!(!throttle.inbound_allowed(ip));
    }

    #[test]
    fn disabled_throttle_admits_everything() {
        let mut throttle = Throttle::new(false, 1, 1);
        let ip: IpAddr = "6.6.6.6".parse().unwrap();
        for _ in 0..1000 {
            assert!(throttle.inbound_allowed(ip));
        }
        assert_eq!(throttle.tracked(), 0);
    }

    #[test]
    fn independent_buckets_per_ip() {
        let mut throttle = Throttle::new(true, 32, 2);
        let a: IpAddr = "6.6.6.6".parse().unwrap();
        let b: IpAddr = "7.7.7.7".parse().unwrap();

        assert!(throttle.inbound_allowed(a));
        assert!(throttle.inbound_allowed(a));
        assert!(!throttle.inbound_allowed(a));
        assert!(throttle.inbound_allowed(b));
    }

    #[test]
    fn outbound_delay_grows_with_deficit() {
        let mut throttle = Throttle::new(true, 10, 2);
        let ip: IpAddr = "6.6.6.6".parse().unwrap();

        assert_eq!(throttle.outbound_delay(ip), Duration::ZERO);
        assert_eq!(throttle.outbound_delay(ip), Duration::ZERO);
        let d1 = throttle.outbound_delay(ip);
        let d2 = throttle.outbound_delay(ip);
        assert!(d1 > Duration::ZERO);
        assert!(d2 > d1);
    }

    #[test]
    fn purge_forgets_idle_ips() {
        let mut throttle = Throttle::new(true, 1000, 4);
        let ip: IpAddr = "6.6.6.6".parse().unwrap();
        assert!(throttle.inbound_allowed(ip));
        assert_eq!(throttle.tracked(), 1);

        std::thread::sleep(Duration::from_millis(20));
        throttle.purge();
        assert_eq!(throttle.tracked(), 0);
    }
}
