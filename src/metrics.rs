//! Prometheus metrics for cache outcomes, store size and origin latency.
//!
//! Handles are registered once into [`CacheMetrics`] and passed to each
//! component at construction. Registering before a recorder is installed
//! yields no-op handles, which is what unit tests get.

use crate::cache::CacheStatus;
use metrics::{Counter, Gauge, Histogram, counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::time::Instant;

/// Install the global Prometheus recorder and return its render handle.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {}", e))
}

#[derive(Clone)]
pub struct CacheMetrics {
    hit: Counter,
    stale: Counter,
    miss: Counter,
    cant_cache: Counter,
    entries: Gauge,
    reaped: Counter,
    lookup_duration: Histogram,
    fetch_duration: Histogram,
    refresh_failures: Counter,
    store_write_failures: Counter,
    coalesced: Counter,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self {
            hit: counter!("postcache_requests_total", "cache" => "hit"),
            stale: counter!("postcache_requests_total", "cache" => "stale"),
            miss: counter!("postcache_requests_total", "cache" => "miss"),
            cant_cache: counter!("postcache_requests_total", "cache" => "cant-cache"),
            entries: gauge!("postcache_entries"),
            reaped: counter!("postcache_reaped_total"),
            lookup_duration: histogram!("postcache_lookup_duration_seconds"),
            fetch_duration: histogram!("postcache_origin_fetch_duration_seconds"),
            refresh_failures: counter!("postcache_refresh_failures_total"),
            store_write_failures: counter!("postcache_store_write_failures_total"),
            coalesced: counter!("postcache_coalesced_total"),
        }
    }

    pub fn record_outcome(&self, status: CacheStatus) {
        match status {
            CacheStatus::Hit => self.hit.increment(1),
            CacheStatus::Stale => self.stale.increment(1),
            CacheStatus::Miss => self.miss.increment(1),
        }
    }

    pub fn record_cant_cache(&self) {
        self.cant_cache.increment(1);
    }

    /// Called by the in-process reaper after every sweep
    pub fn record_sweep(&self, reaped: usize, remaining: usize) {
        self.reaped.increment(reaped as u64);
        self.entries.set(remaining as f64);
    }

    pub fn record_lookup(&self, start: Instant) {
        self.lookup_duration.record(start.elapsed().as_secs_f64());
    }

    pub fn record_fetch(&self, start: Instant) {
        self.fetch_duration.record(start.elapsed().as_secs_f64());
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.increment(1);
    }

    pub fn record_store_write_failure(&self) {
        self.store_write_failures.increment(1);
    }

    pub fn record_coalesced(&self) {
        self.coalesced.increment(1);
    }
}

impl Default for CacheMetrics {
    fn default() -> Self {
        Self::new()
    }
}
