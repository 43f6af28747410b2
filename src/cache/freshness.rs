//! Freshness policy: the one place where entry age becomes a cache status.

use super::CacheStatus;
use crate::error::{PostcacheError, Result};
use std::time::Duration;

/// Classify an entry of the given age.
///
/// - `age < fresh_for` → [`CacheStatus::Hit`]
/// - `fresh_for <= age < expire_after` → [`CacheStatus::Stale`]
/// - otherwise → [`CacheStatus::Miss`]
pub fn classify(age: Duration, fresh_for: Duration, expire_after: Duration) -> CacheStatus {
    if age < fresh_for {
        CacheStatus::Hit
    } else if age < expire_after {
        CacheStatus::Stale
    } else {
        CacheStatus::Miss
    }
}

/// Validated pair of freshness thresholds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FreshnessPolicy {
    fresh_for: Duration,
    expire_after: Duration,
}

impl FreshnessPolicy {
    /// Fails unless `fresh_for < expire_after`.
    pub fn new(fresh_for: Duration, expire_after: Duration) -> Result<Self> {
        if fresh_for >= expire_after {
            return Err(PostcacheError::Config(format!(
                "freshness window ({}ms) must be shorter than expire window ({}ms)",
                fresh_for.as_millis(),
                expire_after.as_millis()
            )));
        }
        Ok(Self {
            fresh_for,
            expire_after,
        })
    }

    pub fn fresh_for(&self) -> Duration {
        self.fresh_for
    }

    pub fn expire_after(&self) -> Duration {
        self.expire_after
    }

    pub fn classify(&self, age: Duration) -> CacheStatus {
        classify(age, self.fresh_for, self.expire_after)
    }

    /// Classify from the time left before the store expires the key.
    ///
    /// Stores with native TTLs do not keep absolute age, but every write sets
    /// the TTL to `expire_after`, so `age = expire_after - remaining`.
    pub fn classify_remaining(&self, remaining: Duration) -> CacheStatus {
        self.classify(self.expire_after.saturating_sub(remaining))
    }
}
