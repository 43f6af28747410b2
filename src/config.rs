use crate::cache::{CacheSettings, FreshnessPolicy};
use crate::error::Result;
use crate::origin::{DEFAULT_BACKOFF_MS, RetryConfig};
use std::env;
use std::time::Duration;
use url::Url;

/// Cache store selection
#[derive(Clone, Debug, PartialEq)]
pub enum CacheStoreType {
    /// In-process map with a background reaper
    Memory,
    /// Shared Valkey/Redis store, usable by several proxy instances
    Valkey,
}

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    /// Base URL of the origin query service
    pub backend_url: Url,
    pub is_dev: bool,
    /// Cache store backend
    pub cache_store: CacheStoreType,
    /// Valkey/Redis URL (used when cache_store = Valkey)
    pub valkey_url: Option<String>,
    /// Age below which entries are served without refresh (default: 60)
    pub freshness_secs: u64,
    /// Age at which entries are no longer served (default: 300)
    pub expire_secs: u64,
    /// Self-expiry of refresh leases (default: 600)
    pub lease_ttl_secs: u64,
    /// In-process reaper period (default: 1000)
    pub reap_interval_ms: u64,
    /// Per-attempt origin timeout (default: 600)
    pub origin_timeout_secs: u64,
    /// Origin attempts per fetch (default: 1, no retry)
    pub origin_max_attempts: u32,
    /// Share one in-flight origin fetch between concurrent misses (default: true)
    pub coalesce_misses: bool,
}

impl Config {
    /// Load configuration from environment variables
    /// In DEV mode, provides sensible defaults. In PROD mode, PORT and BACKEND_URL are required.
    pub fn from_env() -> std::result::Result<Self, Box<dyn std::error::Error>> {
        let is_dev = env::var("DEV_MODE")
            .unwrap_or_else(|_| "false".to_string())
            .parse()
            .unwrap_or(false);

        // Port: required in prod, defaults to 8081 in dev
        let port = if is_dev {
            env::var("PORT")
                .unwrap_or_else(|_| "8081".to_string())
                .parse()?
        } else {
            env::var("PORT")
                .map_err(|_| "PORT is required in production")?
                .parse()?
        };

        // Backend URL: required in prod, defaults to a local origin in dev
        let backend_url = if is_dev {
            env::var("BACKEND_URL").unwrap_or_else(|_| "http://127.0.0.1:80".to_string())
        } else {
            env::var("BACKEND_URL").map_err(|_| "BACKEND_URL is required in production")?
        };
        let backend_url = Url::parse(&backend_url)
            .map_err(|e| format!("BACKEND_URL is not a valid URL: {}", e))?;

        let cache_store = match env::var("CACHE_STORE")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "memory" => CacheStoreType::Memory,
            "valkey" | "redis" => CacheStoreType::Valkey,
            other => {
                return Err(format!(
                    "CACHE_STORE must be 'memory' or 'valkey', got '{}'",
                    other
                )
                .into());
            }
        };
        let valkey_url = env::var("VALKEY_URL").ok();
        if cache_store == CacheStoreType::Valkey && valkey_url.is_none() {
            return Err("VALKEY_URL is required when CACHE_STORE=valkey".into());
        }

        let freshness_secs = parse_or("FRESHNESS_SECS", 60)?;
        let expire_secs = parse_or("EXPIRE_SECS", 300)?;
        if freshness_secs >= expire_secs {
            return Err(format!(
                "FRESHNESS_SECS ({}) must be less than EXPIRE_SECS ({})",
                freshness_secs, expire_secs
            )
            .into());
        }

        let lease_ttl_secs = parse_or("LEASE_TTL_SECS", 600)?;
        let reap_interval_ms = parse_or("REAP_INTERVAL_MS", 1000)?;
        let origin_timeout_secs = parse_or("ORIGIN_TIMEOUT_SECS", 600)?;
        let origin_max_attempts = parse_or("ORIGIN_MAX_ATTEMPTS", 1)?;
        let coalesce_misses = parse_or("COALESCE_MISSES", true)?;

        Ok(Config {
            port,
            backend_url,
            is_dev,
            cache_store,
            valkey_url,
            freshness_secs,
            expire_secs,
            lease_ttl_secs,
            reap_interval_ms,
            origin_timeout_secs,
            origin_max_attempts,
            coalesce_misses,
        })
    }

    /// Cache tunables derived from this configuration
    pub fn cache_settings(&self) -> Result<CacheSettings> {
        let policy = FreshnessPolicy::new(
            Duration::from_secs(self.freshness_secs),
            Duration::from_secs(self.expire_secs),
        )?;
        Ok(CacheSettings {
            policy,
            lease_ttl: Duration::from_secs(self.lease_ttl_secs),
            reap_interval: Duration::from_millis(self.reap_interval_ms),
        })
    }

    /// Origin retry policy derived from this configuration
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.origin_max_attempts,
            backoff: Duration::from_millis(DEFAULT_BACKOFF_MS),
            timeout: Some(Duration::from_secs(self.origin_timeout_secs)),
        }
    }
}

/// Parse an optional variable, falling back to `default` when unset.
/// A set-but-unparseable value is an error rather than a silent default.
fn parse_or<T>(name: &str, default: T) -> std::result::Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| format!("{} has an invalid value '{}': {}", name, raw, e)),
        Err(_) => Ok(default),
    }
}
