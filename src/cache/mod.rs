//! Cache core: entry stores, freshness policy and refresh leases.
//!
//! Two interchangeable backends implement [`EntryStore`] and [`LeaseManager`]:
//! the in-process [`MemoryStore`] and, with the `valkey` feature, the shared
//! [`ValkeyStore`]. The coordinator only sees the traits.

pub mod freshness;
pub mod lease;
pub mod memory;
#[cfg(feature = "valkey")]
pub mod valkey;

pub use freshness::{FreshnessPolicy, classify};
pub use lease::MemoryLeases;
pub use memory::MemoryStore;
#[cfg(feature = "valkey")]
pub use valkey::ValkeyStore;

use crate::config::{CacheStoreType, Config};
use crate::error::{PostcacheError, Result};
use crate::fingerprint::Fingerprint;
use crate::metrics::CacheMetrics;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

/// Default lease self-expiry.
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(600);

/// Default in-process reaper period.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(1);

/// Which path served a cacheable request. Sent to clients in `X-Cache`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CacheStatus {
    Hit,
    Stale,
    Miss,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Stale => "STALE",
            CacheStatus::Miss => "MISS",
        }
    }
}

impl fmt::Display for CacheStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of an entry store read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Lookup {
    Hit(Bytes),
    Stale(Bytes),
    Miss,
}

impl Lookup {
    /// Pair a payload with the status the classifier gave it
    pub fn classified(status: CacheStatus, payload: Bytes) -> Self {
        match status {
            CacheStatus::Hit => Lookup::Hit(payload),
            CacheStatus::Stale => Lookup::Stale(payload),
            CacheStatus::Miss => Lookup::Miss,
        }
    }

    pub fn status(&self) -> CacheStatus {
        match self {
            Lookup::Hit(_) => CacheStatus::Hit,
            Lookup::Stale(_) => CacheStatus::Stale,
            Lookup::Miss => CacheStatus::Miss,
        }
    }

    pub fn payload(&self) -> Option<&Bytes> {
        match self {
            Lookup::Hit(payload) | Lookup::Stale(payload) => Some(payload),
            Lookup::Miss => None,
        }
    }
}

/// Tunables shared by both backends.
#[derive(Clone, Copy, Debug)]
pub struct CacheSettings {
    pub policy: FreshnessPolicy,
    pub lease_ttl: Duration,
    /// Only used by the in-process reaper
    pub reap_interval: Duration,
}

impl CacheSettings {
    pub fn new(policy: FreshnessPolicy) -> Self {
        Self {
            policy,
            lease_ttl: DEFAULT_LEASE_TTL,
            reap_interval: DEFAULT_REAP_INTERVAL,
        }
    }
}

/// Storage for cached payloads keyed by fingerprint.
///
/// Stores are initialized by their constructors; there is no way to reach a
/// half-initialized store through this trait.
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Read and classify the entry for `fp`.
    ///
    /// Storage outages are errors, never a [`Lookup::Miss`].
    async fn get(&self, fp: &Fingerprint) -> Result<Lookup>;

    /// Replace the entry for `fp` and restart its age at zero.
    async fn set(&self, fp: &Fingerprint, payload: Bytes) -> Result<()>;
}

/// Identifies one acquisition of a refresh lease.
///
/// Release only drops the lease if it still carries this token, so a holder
/// whose lease lapsed and was taken over cannot free the new holder's lease.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct LeaseToken(Uuid);

impl LeaseToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Per-fingerprint mutual exclusion for refreshes.
#[async_trait]
pub trait LeaseManager: Send + Sync {
    /// Atomically take the lease for `fp` if nobody holds it.
    ///
    /// Returns the token needed to release it, or `None` when it is held.
    /// A lease older than its TTL counts as free.
    async fn try_acquire(&self, fp: &Fingerprint) -> Result<Option<LeaseToken>>;

    /// Drop the lease for `fp` if `token` still holds it.
    ///
    /// Releasing a free lease, or one now held under another token, is a no-op.
    async fn release(&self, fp: &Fingerprint, token: &LeaseToken) -> Result<()>;
}

/// The store and lease manager selected at startup.
#[derive(Clone)]
pub struct CacheBackend {
    pub store: Arc<dyn EntryStore>,
    pub leases: Arc<dyn LeaseManager>,
    /// Short name for health output and logs
    pub kind: &'static str,
}

impl CacheBackend {
    /// In-process store with its reaper, plus in-process leases
    pub fn memory(settings: &CacheSettings, metrics: CacheMetrics) -> Result<Self> {
        let store = Arc::new(MemoryStore::initialize(settings, metrics)?);
        let leases = store.leases();
        Ok(Self {
            store,
            leases,
            kind: "memory",
        })
    }

    /// Shared store with distributed leases on the same connection
    #[cfg(feature = "valkey")]
    pub async fn valkey(url: &str, settings: &CacheSettings) -> Result<Self> {
        let store = Arc::new(ValkeyStore::initialize(url, settings).await?);
        Ok(Self {
            store: store.clone(),
            leases: store,
            kind: "valkey",
        })
    }

    /// Build the backend named by the configuration
    pub async fn from_config(config: &Config, metrics: CacheMetrics) -> Result<Self> {
        let settings = config.cache_settings()?;
        let backend = match config.cache_store {
            CacheStoreType::Memory => Self::memory(&settings, metrics)?,
            CacheStoreType::Valkey => {
                let url = config.valkey_url.as_deref().ok_or_else(|| {
                    PostcacheError::Config("VALKEY_URL is required for the valkey store".into())
                })?;
                Self::valkey_or_unsupported(url, &settings).await?
            }
        };
        info!(
            "Cache backend '{}' ready (fresh {}s, expire {}s)",
            backend.kind,
            settings.policy.fresh_for().as_secs(),
            settings.policy.expire_after().as_secs()
        );
        Ok(backend)
    }

    #[cfg(feature = "valkey")]
    async fn valkey_or_unsupported(url: &str, settings: &CacheSettings) -> Result<Self> {
        Self::valkey(url, settings).await
    }

    #[cfg(not(feature = "valkey"))]
    async fn valkey_or_unsupported(_url: &str, _settings: &CacheSettings) -> Result<Self> {
        Err(PostcacheError::Config(
            "postcache was built without the `valkey` feature".into(),
        ))
    }
}
