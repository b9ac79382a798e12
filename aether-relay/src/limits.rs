//! Publisher rate limiting.
//!
//! Keyed by the 32-byte publisher pubkey, using governor's keyed limiter
//! backed by DashMap. Disabled when the configured quota is zero.

use crate::config::ValidationConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;

type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap5::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Rate limiters for the relay.
#[derive(Clone, Default)]
pub struct RateLimits {
    publish_limiter: Option<Arc<KeyedLimiter<[u8; 32]>>>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("publish_limiter", &self.publish_limiter.is_some())
            .finish()
    }
}

impl RateLimits {
    /// Build limiters from the validation config. A zero quota disables
    /// the limiter entirely.
    pub fn new(config: &ValidationConfig) -> Self {
        let publish_limiter = NonZeroU32::new(config.publishes_per_minute)
            .map(|quota| Arc::new(RateLimiter::keyed(Quota::per_minute(quota))));
        Self { publish_limiter }
    }

    /// Whether a publish from `pubkey` is within quota.
    pub fn check_publish(&self, pubkey: &[u8; 32]) -> bool {
        match &self.publish_limiter {
            Some(limiter) => limiter.check_key(pubkey).is_ok(),
            None => true,
        }
    }

    /// Number of tracked publisher keys, for metrics.
    pub fn tracked_publishers(&self) -> usize {
        self.publish_limiter
            .as_ref()
            .map(|limiter| limiter.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(per_minute: u32) -> ValidationConfig {
        ValidationConfig {
            publishes_per_minute: per_minute,
            ..ValidationConfig::default()
        }
    }

    #[test]
    fn zero_quota_disables_limiting() {
        let limits = RateLimits::new(&config(0));
        let key = [1u8; 32];
        for _ in 0..1000 {
            assert!(limits.check_publish(&key));
        }
    }

    #[test]
    fn quota_is_enforced_per_key() {
        let limits = RateLimits::new(&config(5));
        let a = [1u8; 32];
        let b = [2u8; 32];
        for _ in 0..5 {
            assert!(limits.check_publish(&a));
        }
        assert!(!limits.check_publish(&a));
        // an independent publisher still has quota
        assert!(limits.check_publish(&b));
    }
}
