//! Shared counter state for the rate-limit and throttle policies
//!
//! Both limiters are mutated from many concurrent requests. Every update
//! happens under one short, non-async critical section so no increment is
//! lost and no decision reads a half-applied update.

use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::Duration;
use tokio::time::Instant;

/// Admission result for one request against a window counter
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowHit {
    /// Requests counted in the current window, this one included
    pub count: u64,
    pub limit: u64,
    pub reset_at: Instant,
}

impl WindowHit {
    pub fn exceeded(&self) -> bool {
        self.count > self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.count)
    }
}

#[derive(Clone, Copy, Debug)]
struct WindowEntry {
    count: u64,
    started: Instant,
}

enum WindowStore {
    Unbounded(HashMap<String, WindowEntry>),
    Bounded(LruCache<String, WindowEntry>),
}

impl WindowStore {
    fn entry(&mut self, key: &str, now: Instant) -> &mut WindowEntry {
        let fresh = WindowEntry {
            count: 0,
            started: now,
        };
        match self {
            WindowStore::Unbounded(map) => map.entry(key.to_string()).or_insert(fresh),
            WindowStore::Bounded(cache) => cache.get_or_insert_mut(key.to_string(), || fresh),
        }
    }

    fn len(&self) -> usize {
        match self {
            WindowStore::Unbounded(map) => map.len(),
            WindowStore::Bounded(cache) => cache.len(),
        }
    }
}

/// Keyed fixed-window request counter
///
/// Keys are kept forever unless `max_keys` is set, in which case the least
/// recently used key is evicted once the bound is reached.
pub struct WindowLimiter {
    window: Duration,
    max: u64,
    store: Mutex<WindowStore>,
}

impl WindowLimiter {
    pub fn new(window: Duration, max: u64, max_keys: Option<NonZeroUsize>) -> Self {
        let store = match max_keys {
            Some(bound) => WindowStore::Bounded(LruCache::new(bound)),
            None => WindowStore::Unbounded(HashMap::new()),
        };
        Self {
            window,
            max,
            store: Mutex::new(store),
        }
    }

    /// Count one request for `key`, resetting the window when it expired
    pub fn hit(&self, key: &str) -> WindowHit {
        let now = Instant::now();
        let mut store = self.store.lock();
        let entry = store.entry(key, now);
        if now.duration_since(entry.started) >= self.window {
            entry.count = 0;
            entry.started = now;
        }
        entry.count = entry.count.saturating_add(1);

        WindowHit {
            count: entry.count,
            limit: self.max,
            reset_at: entry.started + self.window,
        }
    }

    pub fn key_count(&self) -> usize {
        self.store.lock().len()
    }
}

/// Continuous-refill token bucket
#[derive(Clone, Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    fn new(rate: u64, period: Duration, now: Instant) -> Self {
        let capacity = rate as f64;
        Self {
            capacity,
            refill_per_sec: capacity / period.as_secs_f64(),
            tokens: capacity,
            last: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last = now;
    }
}

/// One token bucket per named throttle group
pub struct GroupThrottle {
    buckets: Mutex<HashMap<String, TokenBucket>>,
}

impl GroupThrottle {
    /// `groups` maps group name to `(rate, period)`; `period` must be non-zero
    pub fn new<'a>(groups: impl IntoIterator<Item = (&'a str, u64, Duration)>) -> Self {
        let now = Instant::now();
        let buckets = groups
            .into_iter()
            .map(|(name, rate, period)| (name.to_string(), TokenBucket::new(rate, period, now)))
            .collect();
        Self {
            buckets: Mutex::new(buckets),
        }
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.buckets.lock().contains_key(name)
    }

    /// Take one token from every configured group the request belongs to
    ///
    /// Either every bucket gives a token or none does. On rejection the
    /// first exhausted group is returned. Groups not configured on this
    /// throttle are ignored.
    pub fn try_acquire<'a>(&self, groups: impl IntoIterator<Item = &'a str>) -> Result<(), String> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let mut selected: Vec<&str> = Vec::new();

        for group in groups {
            let Some(bucket) = buckets.get_mut(group) else {
                continue;
            };
            bucket.refill(now);
            if bucket.tokens < 1.0 {
                return Err(group.to_string());
            }
            selected.push(group);
        }

        for group in selected {
            if let Some(bucket) = buckets.get_mut(group) {
                bucket.tokens -= 1.0;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_rejects_after_max_and_resets() {
        let limiter = WindowLimiter::new(Duration::from_millis(1000), 5, None);
        for i in 1..=5 {
            let hit = limiter.hit("k");
            assert!(!hit.exceeded(), "request {} should pass", i);
        }
        let sixth = limiter.hit("k");
        assert!(sixth.exceeded());
        assert_eq!(sixth.remaining(), 0);

        tokio::time::advance(Duration::from_millis(1000)).await;
        let after = limiter.hit("k");
        assert!(!after.exceeded());
        assert_eq!(after.count, 1);
        assert_eq!(after.remaining(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_keys_are_independent() {
        let limiter = WindowLimiter::new(Duration::from_secs(60), 1, None);
        assert!(!limiter.hit("a").exceeded());
        assert!(!limiter.hit("b").exceeded());
        assert!(limiter.hit("a").exceeded());
        assert_eq!(limiter.key_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_lru_bound() {
        let limiter = WindowLimiter::new(Duration::from_secs(60), 1, NonZeroUsize::new(2));
        limiter.hit("a");
        limiter.hit("b");
        limiter.hit("c");
        assert_eq!(limiter.key_count(), 2);
        // "a" was evicted, so it starts a fresh window
        assert!(!limiter.hit("a").exceeded());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_all_or_nothing() {
        let throttle = GroupThrottle::new([
            ("A", 1, Duration::from_millis(1000)),
            ("B", 100, Duration::from_millis(1000)),
        ]);
        assert!(throttle.try_acquire(["A", "B"]).is_ok());
        assert_eq!(throttle.try_acquire(["A", "B"]), Err("A".to_string()));

        // B was not charged by the rejected request
        let tokens = throttle.buckets.lock().get("B").map(|b| b.tokens).unwrap();
        assert!((tokens - 99.0).abs() < 1e-6);

        assert!(throttle.try_acquire(["B"]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_refills_continuously() {
        let throttle = GroupThrottle::new([("A", 2, Duration::from_millis(1000))]);
        assert!(throttle.try_acquire(["A"]).is_ok());
        assert!(throttle.try_acquire(["A"]).is_ok());
        assert!(throttle.try_acquire(["A"]).is_err());

        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(throttle.try_acquire(["A"]).is_err());
        tokio::time::advance(Duration::from_millis(250)).await;
        assert!(throttle.try_acquire(["A"]).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_ignores_unknown_groups() {
        let throttle = GroupThrottle::new([("A", 1, Duration::from_secs(1))]);
        assert!(throttle.try_acquire(["other"]).is_ok());
        assert!(throttle.has_group("A"));
        assert!(!throttle.has_group("other"));
    }
}
