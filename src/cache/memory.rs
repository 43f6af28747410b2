//! In-process entry store.
//!
//! Entries live in one `DashMap`; its shard locks guard every read, write and
//! the reaper's iteration. A background reaper removes entries once they reach
//! the expire window, so memory is reclaimed even for keys nobody asks for
//! again.

use super::{CacheSettings, EntryStore, FreshnessPolicy, Lookup, MemoryLeases};
use crate::error::{PostcacheError, Result};
use crate::fingerprint::Fingerprint;
use crate::metrics::CacheMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A cached origin response.
#[derive(Clone, Debug)]
struct Entry {
    payload: Bytes,
    created_at: Instant,
}

/// Thread-safe entry store with age-based classification and a reaper.
pub struct MemoryStore {
    entries: Arc<DashMap<Fingerprint, Entry>>,
    leases: Arc<MemoryLeases>,
    policy: FreshnessPolicy,
    shutdown: CancellationToken,
}

impl MemoryStore {
    /// Allocate the store and start its reaper on the current tokio runtime.
    ///
    /// The reaper runs until the store is dropped.
    pub fn initialize(settings: &CacheSettings, metrics: CacheMetrics) -> Result<Self> {
        if settings.reap_interval.is_zero() {
            return Err(PostcacheError::Config(
                "reap interval must be greater than zero".into(),
            ));
        }

        let store = Self {
            entries: Arc::new(DashMap::new()),
            leases: Arc::new(MemoryLeases::new(settings.lease_ttl)),
            policy: settings.policy,
            shutdown: CancellationToken::new(),
        };

        spawn_reaper(
            store.entries.clone(),
            store.leases.clone(),
            store.policy.expire_after(),
            settings.reap_interval,
            metrics,
            store.shutdown.clone(),
        );
        info!(
            "In-process cache initialized (reaping every {}ms)",
            settings.reap_interval.as_millis()
        );

        Ok(store)
    }

    /// Lease manager sharing this store's lifetime
    pub fn leases(&self) -> Arc<MemoryLeases> {
        self.leases.clone()
    }

    /// Number of entries currently held, expired-but-unreaped included
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Drop for MemoryStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl EntryStore for MemoryStore {
    async fn get(&self, fp: &Fingerprint) -> Result<Lookup> {
        let Some(entry) = self.entries.get(fp) else {
            return Ok(Lookup::Miss);
        };
        let status = self.policy.classify(entry.created_at.elapsed());
        Ok(Lookup::classified(status, entry.payload.clone()))
    }

    async fn set(&self, fp: &Fingerprint, payload: Bytes) -> Result<()> {
        self.entries.insert(
            *fp,
            Entry {
                payload,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }
}

/// Remove every entry at or past `expire_after`. Returns how many went.
fn reap(entries: &DashMap<Fingerprint, Entry>, expire_after: Duration) -> usize {
    let now = Instant::now();
    let mut reaped = 0;
    entries.retain(|fp, entry| {
        let live = now.duration_since(entry.created_at) < expire_after;
        if !live {
            debug!("{} CULL", fp);
            reaped += 1;
        }
        live
    });
    reaped
}

fn spawn_reaper(
    entries: Arc<DashMap<Fingerprint, Entry>>,
    leases: Arc<MemoryLeases>,
    expire_after: Duration,
    interval: Duration,
    metrics: CacheMetrics,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        debug!("In-process cache reaper started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = reap(&entries, expire_after);
                    leases.sweep_expired();
                    metrics.record_sweep(reaped, entries.len());
                    if reaped > 0 {
                        debug!("Reaped {} expired entries, {} remain", reaped, entries.len());
                    }
                }
            }
        }
        debug!("In-process cache reaper stopped");
    });
}
