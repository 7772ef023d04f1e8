//! Front-door request limit per visitor address
//!
//! Fixed windows: the first hit in a window starts it, every hit counts.
//! Counters live in Redis when configured so several proxy instances share
//! them; otherwise (or while Redis errors) an in-process map is used.

use fred::prelude::*;
use std::sync::Arc;
use std::time::Duration;

const VISITOR_PREFIX: &str = "rl:visit";

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests admitted per window
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn new(max_requests: u32, window_secs: u64) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(window_secs),
        }
    }
}

/// Counter state after one hit
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    /// Hits so far in this window, this one included
    pub current: u32,
    pub limit: u32,
    /// Seconds until the window closes
    pub reset_in_secs: u64,
    pub remaining: u32,
}

impl RateLimitResult {
    fn from_count(current: u32, config: &RateLimitConfig, reset_in_secs: u64) -> Self {
        Self {
            allowed: current <= config.max_requests,
            current,
            limit: config.max_requests,
            reset_in_secs,
            remaining: config.max_requests.saturating_sub(current),
        }
    }

    /// `X-RateLimit-*` headers for a rejection
    pub fn headers(&self) -> Vec<(String, String)> {
        [
            ("X-RateLimit-Limit", self.limit.to_string()),
            ("X-RateLimit-Remaining", self.remaining.to_string()),
            ("X-RateLimit-Reset", self.reset_in_secs.to_string()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    redis: Option<Arc<Client>>,
    local: Arc<local::LocalRateLimiter>,
}

impl RateLimiter {
    pub fn new(redis: Option<Arc<Client>>) -> Self {
        Self {
            redis,
            local: Arc::new(local::LocalRateLimiter::default()),
        }
    }

    /// Count one hit against `prefix:identifier`
    pub async fn check(&self, prefix: &str, identifier: &str, config: &RateLimitConfig) -> RateLimitResult {
        let key = format!("{}:{}", prefix, identifier);

        if let Some(redis) = &self.redis {
            match Self::hit_redis(redis, &key, config).await {
                Ok(result) => return result,
                Err(e) => tracing::warn!("Redis rate limit check failed, using local counters: {}", e),
            }
        }

        self.local.hit(&key, config)
    }

    async fn hit_redis(redis: &Client, key: &str, config: &RateLimitConfig) -> anyhow::Result<RateLimitResult> {
        let window_secs = config.window.as_secs();

        let count: u32 = redis.incr(key).await?;
        if count == 1 {
            let _: () = redis.expire(key, window_secs as i64, None).await?;
        }

        let ttl: i64 = redis.ttl(key).await?;
        let reset_in_secs = u64::try_from(ttl).ok().filter(|t| *t > 0).unwrap_or(window_secs);

        Ok(RateLimitResult::from_count(count, config, reset_in_secs))
    }

    /// Count one request from a visitor address
    pub async fn check_visitor(&self, address: &str, config: &RateLimitConfig) -> RateLimitResult {
        self.check(VISITOR_PREFIX, address, config).await
    }

    /// Forget local windows older than `max_age`
    pub fn cleanup_local(&self, max_age: Duration) {
        self.local.prune(max_age);
    }
}

/// Per-process counters
pub mod local {
    use super::{RateLimitConfig, RateLimitResult};
    use dashmap::DashMap;
    use std::time::{Duration, Instant};

    struct Window {
        hits: u32,
        opened_at: Instant,
    }

    #[derive(Default)]
    pub struct LocalRateLimiter {
        windows: DashMap<String, Window>,
    }

    impl LocalRateLimiter {
        pub fn hit(&self, key: &str, config: &RateLimitConfig) -> RateLimitResult {
            let now = Instant::now();
            let mut window = self.windows.entry(key.to_string()).or_insert(Window {
                hits: 0,
                opened_at: now,
            });

            if now.duration_since(window.opened_at) >= config.window {
                window.hits = 0;
                window.opened_at = now;
            }
            window.hits = window.hits.saturating_add(1);

            let open_for = now.duration_since(window.opened_at).as_secs();
            RateLimitResult::from_count(window.hits, config, config.window.as_secs().saturating_sub(open_for))
        }

        pub fn prune(&self, max_age: Duration) {
            let now = Instant::now();
            self.windows.retain(|_, w| now.duration_since(w.opened_at) < max_age);
        }

        pub fn len(&self) -> usize {
            self.windows.len()
        }

        pub fn is_empty(&self) -> bool {
            self.windows.is_empty()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_admits_up_to_limit() {
        let counters = local::LocalRateLimiter::default();
        let config = RateLimitConfig::new(3, 60);

        for hit in 1..=3u32 {
            let result = counters.hit("rl:visit:198.51.100.4", &config);
            assert!(result.allowed, "hit {} rejected", hit);
            assert_eq!(result.current, hit);
            assert_eq!(result.remaining, 3 - hit);
        }

        let rejected = counters.hit("rl:visit:198.51.100.4", &config);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
        assert!(rejected.reset_in_secs <= 60);

        // Separate addresses have separate windows
        assert!(counters.hit("rl:visit:198.51.100.5", &config).allowed);
    }

    #[test]
    fn test_expired_window_restarts() {
        let counters = local::LocalRateLimiter::default();
        let config = RateLimitConfig {
            max_requests: 1,
            window: Duration::ZERO,
        };

        assert!(counters.hit("k", &config).allowed);
        assert!(counters.hit("k", &config).allowed);
    }

    #[test]
    fn test_prune() {
        let counters = local::LocalRateLimiter::default();
        let config = RateLimitConfig::new(3, 60);
        counters.hit("a", &config);
        counters.hit("b", &config);
        assert_eq!(counters.len(), 2);

        counters.prune(Duration::from_secs(3600));
        assert_eq!(counters.len(), 2);

        counters.prune(Duration::ZERO);
        assert!(counters.is_empty());
    }

    #[tokio::test]
    async fn test_without_redis_counts_locally() {
        let limiter = RateLimiter::new(None);
        let config = RateLimitConfig::new(2, 900);

        assert!(limiter.check_visitor("198.51.100.4", &config).await.allowed);
        assert!(limiter.check_visitor("198.51.100.4", &config).await.allowed);

        let rejected = limiter.check_visitor("198.51.100.4", &config).await;
        assert!(!rejected.allowed);
        assert_eq!(rejected.headers()[0], ("X-RateLimit-Limit".to_string(), "2".to_string()));
    }
}
