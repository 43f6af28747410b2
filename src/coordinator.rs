//! Stampede-control coordinator.
//!
//! Turns a store lookup into one of three outcomes:
//!
//! - **HIT**: serve the cached payload.
//! - **STALE**: serve the cached payload and, if this request wins the refresh
//!   lease, refresh it on a detached task. Refresh failures never reach the
//!   client.
//! - **MISS**: fetch from the origin inline and cache the result. Concurrent
//!   misses for one fingerprint share a single fetch when coalescing is on.
//!   A shared fetch runs on its own task, so it finishes and leaves the
//!   in-flight map even if every waiting request goes away.

use crate::cache::{CacheBackend, CacheStatus, EntryStore, LeaseManager, Lookup};
use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::metrics::CacheMetrics;
use crate::origin::{FetchError, OriginFetcher};
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type SharedFetch = Shared<BoxFuture<'static, std::result::Result<Bytes, FetchError>>>;

/// Payload served for a cacheable request and the path that produced it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheResponse {
    pub status: CacheStatus,
    pub payload: Bytes,
}

#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn EntryStore>,
    leases: Arc<dyn LeaseManager>,
    origin: Arc<dyn OriginFetcher>,
    metrics: CacheMetrics,
    coalesce_misses: bool,
    /// Origin fetches currently serving one or more MISS requests
    inflight: DashMap<Fingerprint, SharedFetch>,
    refreshes: TaskTracker,
}

impl Coordinator {
    pub fn new(
        backend: CacheBackend,
        origin: Arc<dyn OriginFetcher>,
        metrics: CacheMetrics,
        coalesce_misses: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: backend.store,
                leases: backend.leases,
                origin,
                metrics,
                coalesce_misses,
                inflight: DashMap::new(),
                refreshes: TaskTracker::new(),
            }),
        }
    }

    /// Serve a cacheable request.
    ///
    /// Store read failures and MISS-path fetch failures are returned as errors;
    /// nothing is guessed or written in either case.
    pub async fn serve(&self, path_and_query: &str, body: Bytes) -> Result<CacheResponse> {
        let fp = Fingerprint::compute(path_and_query, &body);

        let start = Instant::now();
        let lookup = self.inner.store.get(&fp).await?;
        self.inner.metrics.record_lookup(start);

        let response = match lookup {
            Lookup::Hit(payload) => CacheResponse {
                status: CacheStatus::Hit,
                payload,
            },
            Lookup::Stale(payload) => {
                self.refresh_in_background(fp, path_and_query, body).await;
                CacheResponse {
                    status: CacheStatus::Stale,
                    payload,
                }
            }
            Lookup::Miss => CacheResponse {
                status: CacheStatus::Miss,
                payload: self.fetch_for_miss(fp, path_and_query, body).await?,
            },
        };

        self.inner.metrics.record_outcome(response.status);
        debug!("{} {} cache: {}", path_and_query, fp, response.status);
        Ok(response)
    }

    /// Background refreshes that have not finished yet
    pub fn refreshes_in_flight(&self) -> usize {
        self.inner.refreshes.len()
    }

    /// Stop accepting new refresh tasks and wait for running ones to finish.
    pub async fn shutdown(&self) {
        self.inner.refreshes.close();
        if !self.inner.refreshes.is_empty() {
            info!(
                "Waiting for {} background refreshes",
                self.inner.refreshes.len()
            );
        }
        self.inner.refreshes.wait().await;
    }

    async fn refresh_in_background(&self, fp: Fingerprint, path_and_query: &str, body: Bytes) {
        let token = match self.inner.leases.try_acquire(&fp).await {
            Ok(Some(token)) => token,
            Ok(None) => {
                debug!("Refresh for {} already in flight", fp);
                return;
            }
            Err(e) => {
                warn!("Could not take refresh lease for {}: {}", fp, e);
                self.inner.metrics.record_refresh_failure();
                return;
            }
        };

        let inner = self.inner.clone();
        let path_and_query = path_and_query.to_owned();
        self.inner.refreshes.spawn(async move {
            let outcome = AssertUnwindSafe(inner.fetch_and_store(&fp, &path_and_query, body))
                .catch_unwind()
                .await;

            // Runs however the fetch ended; a lease left behind would block
            // refreshes for this key until it lapses
            if let Err(e) = inner.leases.release(&fp, &token).await {
                warn!("Failed to release refresh lease for {}: {}", fp, e);
            }

            match outcome {
                Ok(Ok(_)) => debug!("Background refresh for {} complete", fp),
                Ok(Err(e)) => {
                    warn!("Background refresh for {} failed: {}", fp, e);
                    inner.metrics.record_refresh_failure();
                }
                Err(_) => {
                    error!("Background refresh for {} panicked", fp);
                    inner.metrics.record_refresh_failure();
                }
            }
        });
    }

    async fn fetch_for_miss(
        &self,
        fp: Fingerprint,
        path_and_query: &str,
        body: Bytes,
    ) -> std::result::Result<Bytes, FetchError> {
        if !self.inner.coalesce_misses {
            return self.inner.fetch_and_store(&fp, path_and_query, body).await;
        }

        let fetch = match self.inner.inflight.entry(fp) {
            Entry::Occupied(slot) => {
                debug!("Joining in-flight fetch for {}", fp);
                self.inner.metrics.record_coalesced();
                slot.get().clone()
            }
            Entry::Vacant(slot) => {
                let inner = self.inner.clone();
                let path_and_query = path_and_query.to_owned();
                let task = tokio::spawn(async move {
                    let result =
                        AssertUnwindSafe(inner.fetch_and_store(&fp, &path_and_query, body))
                            .catch_unwind()
                            .await
                            .unwrap_or_else(|_| {
                                error!("Origin fetch for {} panicked", fp);
                                Err(FetchError::Interrupted("fetch panicked".into()))
                            });
                    // The entry is written before this, so late arrivals hit the store
                    inner.inflight.remove(&fp);
                    result
                });
                let fetch = async move {
                    task.await
                        .unwrap_or_else(|e| Err(FetchError::Interrupted(e.to_string())))
                }
                .boxed()
                .shared();
                slot.insert(fetch.clone());
                fetch
            }
        };

        fetch.await
    }
}

impl Inner {
    /// Fetch from the origin and cache a non-empty result.
    ///
    /// A failed write is logged and counted but does not fail the fetch: the
    /// caller still has a good payload to serve.
    async fn fetch_and_store(
        &self,
        fp: &Fingerprint,
        path_and_query: &str,
        body: Bytes,
    ) -> std::result::Result<Bytes, FetchError> {
        let start = Instant::now();
        let fetched = self.origin.fetch(path_and_query, body).await;
        self.metrics.record_fetch(start);
        let payload = fetched?;

        if payload.is_empty() {
            info!("Origin returned an empty body for {}, not caching", fp);
            return Ok(payload);
        }

        if let Err(e) = self.store.set(fp, payload.clone()).await {
            warn!("Failed to cache response for {}: {}", fp, e);
            self.metrics.record_store_write_failure();
        }
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheSettings, FreshnessPolicy, LeaseToken, MemoryLeases};
    use crate::error::PostcacheError;
    use async_trait::async_trait;
    use axum::http::StatusCode;
    use futures_util::future::join_all;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const FRESH: Duration = Duration::from_secs(60);
    const EXPIRE: Duration = Duration::from_secs(300);
    const PATH: &str = "/x";
    const QUERY: &[u8] = br#"{"q":1}"#;

    /// Origin double that counts calls and replays a configurable reply.
    struct FakeOrigin {
        calls: AtomicUsize,
        reply: Mutex<std::result::Result<Bytes, FetchError>>,
        delay: Duration,
        panics: bool,
    }

    impl FakeOrigin {
        fn new(body: &'static [u8]) -> Arc<Self> {
            Self::with_delay(body, Duration::ZERO)
        }

        fn with_delay(body: &'static [u8], delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Mutex::new(Ok(Bytes::from_static(body))),
                delay,
                panics: false,
            })
        }

        fn panicking() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                reply: Mutex::new(Ok(Bytes::new())),
                delay: Duration::ZERO,
                panics: true,
            })
        }

        fn reply_with(&self, reply: std::result::Result<Bytes, FetchError>) {
            *self.reply.lock().unwrap() = reply;
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OriginFetcher for FakeOrigin {
        async fn fetch(
            &self,
            _path_and_query: &str,
            _body: Bytes,
        ) -> std::result::Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.panics {
                panic!("origin exploded");
            }
            self.reply.lock().unwrap().clone()
        }
    }

    /// Store whose every operation fails as if the server were down.
    struct UnreachableStore;

    #[async_trait]
    impl EntryStore for UnreachableStore {
        async fn get(&self, _fp: &Fingerprint) -> Result<Lookup> {
            Err(PostcacheError::StoreUnavailable("connection refused".into()))
        }

        async fn set(&self, _fp: &Fingerprint, _payload: Bytes) -> Result<()> {
            Err(PostcacheError::StoreUnavailable("connection refused".into()))
        }
    }

    /// Serves a fixed stale entry, ignores writes.
    struct AlwaysStale;

    #[async_trait]
    impl EntryStore for AlwaysStale {
        async fn get(&self, _fp: &Fingerprint) -> Result<Lookup> {
            Ok(Lookup::Stale(Bytes::from_static(b"old")))
        }

        async fn set(&self, _fp: &Fingerprint, _payload: Bytes) -> Result<()> {
            Ok(())
        }
    }

    struct UnreachableLeases;

    #[async_trait]
    impl LeaseManager for UnreachableLeases {
        async fn try_acquire(&self, _fp: &Fingerprint) -> Result<Option<LeaseToken>> {
            Err(PostcacheError::StoreUnavailable("connection refused".into()))
        }

        async fn release(&self, _fp: &Fingerprint, _token: &LeaseToken) -> Result<()> {
            Err(PostcacheError::StoreUnavailable("connection refused".into()))
        }
    }

    fn memory_backend() -> CacheBackend {
        let settings = CacheSettings::new(FreshnessPolicy::new(FRESH, EXPIRE).unwrap());
        CacheBackend::memory(&settings, CacheMetrics::new()).unwrap()
    }

    fn coordinator(origin: Arc<FakeOrigin>) -> Coordinator {
        Coordinator::new(memory_backend(), origin, CacheMetrics::new(), true)
    }

    /// Let detached refreshes run to completion.
    async fn settle(coordinator: &Coordinator) {
        while coordinator.refreshes_in_flight() > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn serve(coordinator: &Coordinator) -> CacheResponse {
        coordinator
            .serve(PATH, Bytes::from_static(QUERY))
            .await
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_misses_then_hits() {
        let origin = FakeOrigin::new(br#"{"r":1}"#);
        let coordinator = coordinator(origin.clone());

        let first = serve(&coordinator).await;
        assert_eq!(first.status, CacheStatus::Miss);
        assert_eq!(first.payload, Bytes::from_static(br#"{"r":1}"#));

        let second = serve(&coordinator).await;
        assert_eq!(second.status, CacheStatus::Hit);
        assert_eq!(second.payload, first.payload);
        assert_eq!(origin.calls(), 1, "a HIT must not reach the origin");
    }

    #[tokio::test(start_paused = true)]
    async fn stale_serves_old_payload_and_refreshes_once() {
        let origin = FakeOrigin::new(br#"{"r":1}"#);
        let coordinator = coordinator(origin.clone());
        serve(&coordinator).await;

        tokio::time::advance(FRESH + Duration::from_secs(1)).await;
        origin.reply_with(Ok(Bytes::from_static(br#"{"r":2}"#)));

        let stale = serve(&coordinator).await;
        assert_eq!(stale.status, CacheStatus::Stale);
        assert_eq!(stale.payload, Bytes::from_static(br#"{"r":1}"#));

        settle(&coordinator).await;
        assert_eq!(origin.calls(), 2);

        let refreshed = serve(&coordinator).await;
        assert_eq!(refreshed.status, CacheStatus::Hit);
        assert_eq!(refreshed.payload, Bytes::from_static(br#"{"r":2}"#));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_stale_requests_trigger_one_refresh() {
        let origin = FakeOrigin::with_delay(br#"{"r":1}"#, Duration::from_secs(5));
        let coordinator = coordinator(origin.clone());
        serve(&coordinator).await;
        tokio::time::advance(FRESH).await;

        let responses = join_all((0..50).map(|_| serve(&coordinator))).await;
        assert!(responses.iter().all(|r| r.status == CacheStatus::Stale));

        settle(&coordinator).await;
        assert_eq!(origin.calls(), 2, "one MISS fetch plus exactly one refresh");
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_misses_again() {
        let origin = FakeOrigin::new(br#"{"r":1}"#);
        let coordinator = coordinator(origin.clone());
        serve(&coordinator).await;

        tokio::time::advance(EXPIRE).await;
        let again = serve(&coordinator).await;
        assert_eq!(again.status, CacheStatus::Miss);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn miss_fetch_error_propagates_and_caches_nothing() {
        let origin = FakeOrigin::new(b"");
        origin.reply_with(Err(FetchError::Status(StatusCode::INTERNAL_SERVER_ERROR)));
        let coordinator = coordinator(origin.clone());

        let err = coordinator
            .serve(PATH, Bytes::from_static(QUERY))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PostcacheError::Fetch(FetchError::Status(s)) if s == StatusCode::INTERNAL_SERVER_ERROR
        ));

        origin.reply_with(Ok(Bytes::from_static(b"ok")));
        assert_eq!(serve(&coordinator).await.status, CacheStatus::Miss);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_stale_entry_and_frees_lease() {
        let origin = FakeOrigin::new(br#"{"r":1}"#);
        let backend = memory_backend();
        let leases = backend.leases.clone();
        let coordinator = Coordinator::new(backend, origin.clone(), CacheMetrics::new(), true);
        serve(&coordinator).await;

        tokio::time::advance(FRESH).await;
        origin.reply_with(Err(FetchError::Timeout));

        let stale = serve(&coordinator).await;
        assert_eq!(stale.status, CacheStatus::Stale);
        settle(&coordinator).await;

        let fp = Fingerprint::compute(PATH, QUERY);
        let token = leases.try_acquire(&fp).await.unwrap();
        assert!(token.is_some(), "lease must be released");
        leases.release(&fp, &token.unwrap()).await.unwrap();

        let still_stale = serve(&coordinator).await;
        assert_eq!(still_stale.status, CacheStatus::Stale);
        assert_eq!(still_stale.payload, Bytes::from_static(br#"{"r":1}"#));
        settle(&coordinator).await;
        assert_eq!(origin.calls(), 3, "each STALE request may retry the refresh");
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_refresh_still_releases_lease() {
        let origin = FakeOrigin::panicking();
        let leases = Arc::new(MemoryLeases::new(Duration::from_secs(600)));
        let backend = CacheBackend {
            store: Arc::new(AlwaysStale),
            leases: leases.clone(),
            kind: "test",
        };
        let coordinator = Coordinator::new(backend, origin.clone(), CacheMetrics::new(), true);

        assert_eq!(serve(&coordinator).await.status, CacheStatus::Stale);
        settle(&coordinator).await;

        assert_eq!(origin.calls(), 1);
        assert_eq!(leases.held_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_origin_body_is_served_but_not_cached() {
        let origin = FakeOrigin::new(b"");
        let coordinator = coordinator(origin.clone());

        let first = serve(&coordinator).await;
        assert_eq!(first.status, CacheStatus::Miss);
        assert!(first.payload.is_empty());

        assert_eq!(serve(&coordinator).await.status, CacheStatus::Miss);
        assert_eq!(origin.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_misses_share_one_fetch() {
        let origin = FakeOrigin::with_delay(br#"{"r":1}"#, Duration::from_secs(1));
        let coordinator = coordinator(origin.clone());

        let responses = join_all((0..20).map(|_| serve(&coordinator))).await;
        assert!(responses.iter().all(|r| r.status == CacheStatus::Miss));
        assert!(
            responses
                .iter()
                .all(|r| r.payload == Bytes::from_static(br#"{"r":1}"#))
        );
        assert_eq!(origin.calls(), 1);

        assert_eq!(serve(&coordinator).await.status, CacheStatus::Hit);
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_miss_fetch_still_completes_and_caches() {
        let origin = FakeOrigin::with_delay(br#"{"r":1}"#, Duration::from_millis(500));
        let coordinator = coordinator(origin.clone());

        let waiter = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { serve(&coordinator).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());

        // Nobody is waiting any more, but the fetch runs to completion
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(coordinator.inner.inflight.is_empty());

        let next = serve(&coordinator).await;
        assert_eq!(next.status, CacheStatus::Hit);
        assert_eq!(next.payload, Bytes::from_static(br#"{"r":1}"#));
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_miss_fetch_fails_waiters_and_clears_inflight() {
        let origin = FakeOrigin::panicking();
        let coordinator = coordinator(origin.clone());

        let err = coordinator
            .serve(PATH, Bytes::from_static(QUERY))
            .await
            .unwrap_err();
        assert!(matches!(err, PostcacheError::Fetch(FetchError::Interrupted(_))));
        assert!(coordinator.inner.inflight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn uncoalesced_misses_each_fetch() {
        let origin = FakeOrigin::with_delay(br#"{"r":1}"#, Duration::from_secs(1));
        let coordinator =
            Coordinator::new(memory_backend(), origin.clone(), CacheMetrics::new(), false);

        join_all((0..5).map(|_| serve(&coordinator))).await;
        assert_eq!(origin.calls(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesced_waiters_share_fetch_error() {
        let origin = FakeOrigin::with_delay(b"", Duration::from_secs(1));
        origin.reply_with(Err(FetchError::Status(StatusCode::BAD_REQUEST)));
        let coordinator = coordinator(origin.clone());

        let results =
            join_all((0..3).map(|_| coordinator.serve(PATH, Bytes::from_static(QUERY)))).await;
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(origin.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn store_outage_fails_closed_without_origin_fetch() {
        let origin = FakeOrigin::new(br#"{"r":1}"#);
        let backend = CacheBackend {
            store: Arc::new(UnreachableStore),
            leases: Arc::new(MemoryLeases::new(Duration::from_secs(600))),
            kind: "test",
        };
        let coordinator = Coordinator::new(backend, origin.clone(), CacheMetrics::new(), true);

        let err = coordinator
            .serve(PATH, Bytes::from_static(QUERY))
            .await
            .unwrap_err();
        assert!(matches!(err, PostcacheError::StoreUnavailable(_)));
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn lease_outage_still_serves_stale() {
        let origin = FakeOrigin::new(br#"{"r":1}"#);
        let backend = CacheBackend {
            store: Arc::new(AlwaysStale),
            leases: Arc::new(UnreachableLeases),
            kind: "test",
        };
        let coordinator = Coordinator::new(backend, origin.clone(), CacheMetrics::new(), true);

        let response = serve(&coordinator).await;
        assert_eq!(response.status, CacheStatus::Stale);
        assert_eq!(response.payload, Bytes::from_static(b"old"));
        assert_eq!(coordinator.refreshes_in_flight(), 0);
        assert_eq!(origin.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_waits_for_refreshes() {
        let origin = FakeOrigin::with_delay(br#"{"r":2}"#, Duration::from_secs(30));
        let backend = CacheBackend {
            store: Arc::new(AlwaysStale),
            leases: Arc::new(MemoryLeases::new(Duration::from_secs(600))),
            kind: "test",
        };
        let coordinator = Coordinator::new(backend, origin.clone(), CacheMetrics::new(), true);

        serve(&coordinator).await;
        assert_eq!(coordinator.refreshes_in_flight(), 1);

        coordinator.shutdown().await;
        assert_eq!(coordinator.refreshes_in_flight(), 0);
        assert_eq!(origin.calls(), 1);
    }
}
