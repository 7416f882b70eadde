use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

#[derive(Debug, Clone, Copy)]
struct RateBucket {
    count: u32,
    window_start: DateTime<Utc>,
}

/// Fixed-window request cap per logical key, independent of credits.
///
/// Each key's bucket is updated under its map shard lock, so the
/// reset-check-increment sequence is atomic per key.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    buckets: DashMap<String, RateBucket>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_seconds: u64) -> Self {
        Self {
            limit,
            window: Duration::seconds(window_seconds.max(1) as i64),
            buckets: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn allow(&self, key: &str) -> bool {
        self.allow_at(key, Utc::now())
    }

    /// Denials leave the bucket untouched.
    pub fn allow_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut bucket = self.buckets.entry(key.to_string()).or_insert(RateBucket {
            count: 0,
            window_start: now,
        });
        if now - bucket.window_start > self.window {
            bucket.count = 0;
            bucket.window_start = now;
        }
        if bucket.count < self.limit {
            bucket.count += 1;
            true
        } else {
            tracing::info!(key, limit = self.limit, "rate limit exceeded");
            false
        }
    }

    /// Calls left in the current window for `key`.
    pub fn remaining(&self, key: &str, now: DateTime<Utc>) -> u32 {
        match self.buckets.get(key) {
            Some(bucket) if now - bucket.window_start <= self.window => {
                self.limit.saturating_sub(bucket.count)
            }
            _ => self.limit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_call_in_window_is_denied_then_window_resets() {
        let limiter = RateLimiter::new(3, 60);
        let t0 = Utc::now();
        assert!(limiter.allow_at("tenant-a", t0));
        assert!(limiter.allow_at("tenant-a", t0 + Duration::seconds(1)));
        assert!(limiter.allow_at("tenant-a", t0 + Duration::seconds(2)));
        assert!(!limiter.allow_at("tenant-a", t0 + Duration::seconds(3)));
        assert_eq!(limiter.remaining("tenant-a", t0 + Duration::seconds(3)), 0);

        assert!(limiter.allow_at("tenant-a", t0 + Duration::seconds(61)));
        assert_eq!(limiter.remaining("tenant-a", t0 + Duration::seconds(61)), 2);
    }

    #[test]
    fn keys_have_independent_windows() {
        let limiter = RateLimiter::new(1, 60);
        let now = Utc::now();
        assert!(limiter.allow_at("a", now));
        assert!(!limiter.allow_at("a", now));
        assert!(limiter.allow_at("b", now));
    }

    #[test]
    fn boundary_of_window_still_counts_as_same_window() {
        let limiter = RateLimiter::new(1, 60);
        let t0 = Utc::now();
        assert!(limiter.allow_at("k", t0));
        assert!(!limiter.allow_at("k", t0 + Duration::seconds(60)));
        assert!(limiter.allow_at("k", t0 + Duration::seconds(60) + Duration::milliseconds(1)));
    }
}
