//! Shared entry store and distributed leases on Valkey/Redis.
//!
//! Key layout:
//! - `<fingerprint-hex>`: raw payload, TTL = expire window
//! - `lock-<fingerprint-hex>`: the holder's lease token, TTL = lease TTL
//!
//! The store never keeps absolute timestamps. Every write resets the key's TTL
//! to the expire window, so an entry's age is recovered from its remaining TTL.

use super::{CacheSettings, EntryStore, FreshnessPolicy, LeaseManager, LeaseToken, Lookup};
use crate::error::{PostcacheError, Result};
use crate::fingerprint::Fingerprint;
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use std::time::Duration;
use tracing::{debug, info};

/// Delete the lock key only while it still holds the caller's token.
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// Entry store backed by a Valkey connection manager.
///
/// The manager reconnects on its own; commands issued while the server is
/// unreachable fail with [`PostcacheError::StoreUnavailable`].
#[derive(Clone)]
pub struct ValkeyStore {
    conn: ConnectionManager,
    policy: FreshnessPolicy,
    lease_ttl: Duration,
}

impl ValkeyStore {
    /// Connect to the Valkey server at `url`.
    pub async fn initialize(url: &str, settings: &CacheSettings) -> Result<Self> {
        if settings.lease_ttl.as_secs() == 0 {
            return Err(PostcacheError::Config(
                "lease TTL must be at least one second for the valkey store".into(),
            ));
        }
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Connected to Valkey at {}", url);
        Ok(Self {
            conn,
            policy: settings.policy,
            lease_ttl: settings.lease_ttl,
        })
    }
}

pub fn entry_key(fp: &Fingerprint) -> String {
    fp.to_hex()
}

pub fn lock_key(fp: &Fingerprint) -> String {
    format!("lock-{}", fp.to_hex())
}

/// Interpret a `PTTL` reply for a key whose value was just read.
///
/// `-2` (gone) and `-1` (no expiry) both mean the key is not in the state
/// every write leaves it in.
fn remaining_ttl(fp: &Fingerprint, pttl: i64) -> Result<Duration> {
    match pttl {
        -2 => Err(PostcacheError::StoreInconsistent(format!(
            "{} expired between GET and PTTL",
            fp
        ))),
        ms if ms < 0 => Err(PostcacheError::StoreInconsistent(format!(
            "{} has no TTL",
            fp
        ))),
        ms => Ok(Duration::from_millis(ms as u64)),
    }
}

#[async_trait]
impl EntryStore for ValkeyStore {
    async fn get(&self, fp: &Fingerprint) -> Result<Lookup> {
        let key = entry_key(fp);
        let mut conn = self.conn.clone();

        let payload: Option<Vec<u8>> = redis::cmd("GET")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        let Some(payload) = payload else {
            return Ok(Lookup::Miss);
        };

        let pttl: i64 = redis::cmd("PTTL")
            .arg(&key)
            .query_async(&mut conn)
            .await?;
        let remaining = remaining_ttl(fp, pttl)?;

        let status = self.policy.classify_remaining(remaining);
        Ok(Lookup::classified(status, Bytes::from(payload)))
    }

    async fn set(&self, fp: &Fingerprint, payload: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        // Value and TTL in one command, so no reader sees a key without expiry
        redis::cmd("SET")
            .arg(entry_key(fp))
            .arg(payload.as_ref())
            .arg("PX")
            .arg(self.policy.expire_after().as_millis() as u64)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaseManager for ValkeyStore {
    async fn try_acquire(&self, fp: &Fingerprint) -> Result<Option<LeaseToken>> {
        let mut conn = self.conn.clone();
        let token = LeaseToken::new();
        // SET NX EX: acquisition and lease expiry are a single atomic step
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key(fp))
            .arg(token.to_string())
            .arg("NX")
            .arg("EX")
            .arg(self.lease_ttl.as_secs())
            .query_async(&mut conn)
            .await?;
        if reply.is_none() {
            debug!("Lease for {} already held", fp);
            return Ok(None);
        }
        Ok(Some(token))
    }

    async fn release(&self, fp: &Fingerprint, token: &LeaseToken) -> Result<()> {
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::cmd("EVAL")
            .arg(RELEASE_SCRIPT)
            .arg(1)
            .arg(lock_key(fp))
            .arg(token.to_string())
            .query_async(&mut conn)
            .await?;
        if deleted == 0 {
            debug!("Lease for {} no longer held by this token", fp);
        }
        Ok(())
    }
}
