//! In-process refresh leases.

use super::{LeaseManager, LeaseToken};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A held refresh lease.
#[derive(Clone, Copy, Debug)]
struct Lease {
    acquired_at: Instant,
    token: LeaseToken,
}

/// Leases held in a concurrent map.
///
/// Acquisition goes through `DashMap::entry`, so the "is it free?" check and
/// the insert happen under the same shard lock.
#[derive(Debug)]
pub struct MemoryLeases {
    held: DashMap<Fingerprint, Lease>,
    ttl: Duration,
}

impl MemoryLeases {
    pub fn new(ttl: Duration) -> Self {
        Self {
            held: DashMap::new(),
            ttl,
        }
    }

    pub fn acquire(&self, fp: &Fingerprint) -> Option<LeaseToken> {
        let lease = Lease {
            acquired_at: Instant::now(),
            token: LeaseToken::new(),
        };
        match self.held.entry(*fp) {
            Entry::Vacant(slot) => {
                slot.insert(lease);
                Some(lease.token)
            }
            Entry::Occupied(mut slot) => {
                // Holder never released; take over once the lease has lapsed
                if lease.acquired_at.duration_since(slot.get().acquired_at) >= self.ttl {
                    debug!("Lease for {} expired, taking over", fp);
                    slot.insert(lease);
                    Some(lease.token)
                } else {
                    None
                }
            }
        }
    }

    /// Returns whether the lease was dropped
    pub fn release_lease(&self, fp: &Fingerprint, token: &LeaseToken) -> bool {
        let released = self
            .held
            .remove_if(fp, |_, lease| lease.token == *token)
            .is_some();
        if !released {
            debug!("Lease for {} no longer held by this token", fp);
        }
        released
    }

    /// Drop leases whose holders never released them. Returns how many went.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut swept = 0;
        self.held.retain(|_, lease| {
            let live = now.duration_since(lease.acquired_at) < self.ttl;
            if !live {
                swept += 1;
            }
            live
        });
        swept
    }

    pub fn held_count(&self) -> usize {
        self.held.len()
    }
}

#[async_trait]
impl LeaseManager for MemoryLeases {
    async fn try_acquire(&self, fp: &Fingerprint) -> Result<Option<LeaseToken>> {
        Ok(self.acquire(fp))
    }

    async fn release(&self, fp: &Fingerprint, token: &LeaseToken) -> Result<()> {
        self.release_lease(fp, token);
        Ok(())
    }
}
