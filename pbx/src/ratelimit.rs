//! Per-peer token bucket rate limiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token buckets keyed by peer, refilled on access.
///
/// Stale buckets are pruned whenever the map grows past a bound so abusive
/// peers cannot exhaust memory.
pub struct RateLimiter<K> {
    rate_per_sec: f64,
    burst: f64,
    buckets: Mutex<HashMap<K, Bucket>>,
}

const MAX_TRACKED_PEERS: usize = 8192;

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    pub fn new(rate_per_sec: u32, burst: u32) -> Self {
        Self {
            rate_per_sec: f64::from(rate_per_sec),
            burst: f64::from(burst),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `peer`; false means the peer is over its rate
    pub fn check(&self, peer: &K) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();

        if buckets.len() >= MAX_TRACKED_PEERS {
            let idle_cutoff = Duration::from_secs(60);
            buckets.retain(|_, bucket| now.duration_since(bucket.last_refill) < idle_cutoff);
        }

        let bucket = buckets.entry(peer.clone()).or_insert(Bucket {
            tokens: self.burst,
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.rate_per_sec).min(self.burst);
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::IpAddr;

    #[tokio::test(start_paused = true)]
    async fn burst_then_throttle() {
        let limiter: RateLimiter<IpAddr> = RateLimiter::new(10, 20);
        let peer: IpAddr = "192.0.2.1".parse().unwrap();

        for _ in 0..20 {
            assert!(limiter.check(&peer));
        }

        assert!(!limiter.check(&peer));

        // a second of refill buys ten more
        tokio::time::advance(Duration::from_secs(1)).await;

        for _ in 0..10 {
            assert!(limiter.check(&peer));
        }

        assert!(!limiter.check(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn peers_are_independent() {
        let limiter: RateLimiter<IpAddr> = RateLimiter::new(1, 1);

        let a: IpAddr = "192.0.2.1".parse().unwrap();
        let b: IpAddr = "192.0.2.2".parse().unwrap();

        assert!(limiter.check(&a));
        assert!(!limiter.check(&a));
        assert!(limiter.check(&b));
    }
}
