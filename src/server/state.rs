use crate::{
    cache::CacheBackend,
    config::Config,
    coordinator::Coordinator,
    error::{PostcacheError, Result},
    metrics::CacheMetrics,
    origin::HttpOrigin,
};
use metrics_exporter_prometheus::PrometheusHandle;
use reqwest::Client;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Origin adapter, also used to resolve passthrough URLs
    pub origin: Arc<HttpOrigin>,
    /// Stampede-control front of the cache
    pub coordinator: Coordinator,
    pub metrics: CacheMetrics,
    /// Present when the Prometheus recorder has been installed
    pub prometheus: Option<PrometheusHandle>,
    /// Name of the selected cache backend
    pub cache_kind: &'static str,
    pub started_at: Instant,
}

impl AppState {
    /// Build the cache backend, origin client and coordinator for `config`
    pub async fn new(config: Config, prometheus: Option<PrometheusHandle>) -> Result<Self> {
        let http_client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| PostcacheError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        // Handles must be registered after the recorder is installed
        let metrics = CacheMetrics::new();
        let backend = CacheBackend::from_config(&config, metrics.clone()).await?;
        let cache_kind = backend.kind;

        let origin = Arc::new(HttpOrigin::new(
            http_client,
            config.backend_url.clone(),
            config.retry_config(),
        ));
        let coordinator = Coordinator::new(
            backend,
            origin.clone(),
            metrics.clone(),
            config.coalesce_misses,
        );

        Ok(Self {
            config: Arc::new(config),
            origin,
            coordinator,
            metrics,
            prometheus,
            cache_kind,
            started_at: Instant::now(),
        })
    }
}
