use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;

use crate::caching::serializer::clone_entry;
use crate::caching::{
    self, CacheEntry, CacheKey, Coordinator, ExpirationLedger, FetchError, FsStore, MemoryTier,
    NormalizedRequest, PersistentStore, PurgeStats, RequestOptions, Storage, TwoTierCache,
};
use crate::config::Config;
use crate::transport::{ReqwestTransport, Transport, TransportRequest, parse_response};
use crate::types::{Payload, Response, ResponseType};

struct Inner {
    transport: Arc<dyn Transport>,
    cache: TwoTierCache,
    coordinator: Coordinator<CacheEntry>,
    purge_delay: Duration,
    purge_guard: Duration,
    purge_scheduled: AtomicBool,
}

impl fmt::Debug for Inner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchCache")
            .field("transport", &self.transport)
            .field("cache", &self.cache)
            .field("in-flight requests", &self.coordinator.pending_count())
            .finish()
    }
}

impl Inner {
    async fn execute(&self, request: TransportRequest, response_type: ResponseType) -> CacheEntry {
        metric!(counter("caches.transport") += 1, "mode" => "async");
        tracing::trace!(url = %request.url, method = %request.method, "Sending request");
        let start = Instant::now();
        let result = self.transport.send(request).await;
        metric!(timer("caches.transport.duration") = start.elapsed(), "mode" => "async");
        match result {
            Ok(response) => parse_response(response, response_type),
            Err(e) => {
                tracing::debug!(error = &e as &dyn std::error::Error, "Request failed");
                CacheEntry::failure(e.into())
            }
        }
    }

    fn execute_blocking(&self, request: TransportRequest, response_type: ResponseType) -> CacheEntry {
        metric!(counter("caches.transport") += 1, "mode" => "blocking");
        tracing::trace!(url = %request.url, method = %request.method, "Sending blocking request");
        let start = Instant::now();
        let result = self.transport.send_blocking(request);
        metric!(timer("caches.transport.duration") = start.elapsed(), "mode" => "blocking");
        match result {
            Ok(response) => parse_response(response, response_type),
            Err(e) => {
                tracing::debug!(error = &e as &dyn std::error::Error, "Request failed");
                CacheEntry::failure(e.into())
            }
        }
    }

    fn purge(&self, remove_all: bool) -> PurgeStats {
        caching::purge(
            self.cache.storage(),
            self.cache.ledger(),
            self.cache.prefix(),
            remove_all,
        )
    }
}

/// Issues requests through a [`Transport`], serving them from cache where allowed and
/// coalescing identical concurrent requests.
///
/// A process is expected to construct one instance and share it. Clones are cheap and share
/// all state.
#[derive(Clone, Debug)]
pub struct FetchCache {
    inner: Arc<Inner>,
}

impl FetchCache {
    /// Creates a cache over the given transport and optional persistent store.
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        store: Option<Arc<dyn PersistentStore>>,
    ) -> Self {
        let storage = Storage::new(store);
        let ledger = ExpirationLedger::new(storage.clone(), &config.build, &config.key_prefix);
        let memory = MemoryTier::new(config.caches.in_memory_capacity);
        let cache = TwoTierCache::new(memory, storage, ledger, &config.key_prefix);

        Self {
            inner: Arc::new(Inner {
                transport,
                cache,
                coordinator: Coordinator::new(),
                purge_delay: config.caches.purge_delay,
                purge_guard: config.caches.purge_guard,
                purge_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a cache using HTTP and, if `cache_dir` is configured, the file system.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let transport =
            ReqwestTransport::new(config.transport).context("failed to create HTTP client")?;
        let store = match &config.cache_dir {
            Some(cache_dir) => {
                let store = FsStore::new(cache_dir).with_context(|| {
                    format!("failed to create cache directory {}", cache_dir.display())
                })?;
                Some(Arc::new(store) as Arc<dyn PersistentStore>)
            }
            None => None,
        };
        Ok(Self::new(config, Arc::new(transport), store))
    }

    /// Fetches `url`, serving it from cache if `options` allow it.
    ///
    /// Requests without a body, and requests with a `post_cache_key`, are coalesced with
    /// identical in-flight requests regardless of the cache options, and their results are
    /// written to the cache. Other requests go straight to the transport.
    pub async fn fetch_cached(
        &self,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, FetchError> {
        let NormalizedRequest {
            transport,
            cache,
            cache_key,
        } = caching::normalize(url, body.is_some(), options);
        let response_type = transport.response_type;
        let request = TransportRequest {
            url: url.to_owned(),
            method: transport.method,
            headers: transport.headers,
            body,
        };

        let Some(key) = cache_key else {
            return self.inner.execute(request, response_type).await.into_response();
        };

        if let Some(entry) = self.inner.cache.get(&key, &cache) {
            return entry.into_response();
        }

        let inner = Arc::clone(&self.inner);
        let ttl = cache.local_storage_expiration;
        let computation = {
            let key = key.clone();
            move || async move {
                let entry = inner.execute(request, response_type).await;
                inner.cache.set(&key, clone_entry(&entry), ttl);
                entry
            }
        };

        self.inner
            .coordinator
            .request(key, computation)
            .await
            .unwrap_or_else(|_| CacheEntry::failure(FetchError::Interrupted))
            .into_response()
    }

    /// Fetches `url` as JSON and deserializes it into `T`.
    pub async fn fetch_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<T, FetchError> {
        let options = RequestOptions {
            response_type: ResponseType::Json,
            ..options
        };
        let response = self.fetch_cached(url, body, options).await?;
        match response.payload {
            Payload::Json(value) => {
                serde_json::from_value(value).map_err(|e| FetchError::Malformed(e.to_string()))
            }
            other => Err(FetchError::Malformed(format!(
                "expected a JSON payload, got {other:?}"
            ))),
        }
    }

    /// Fetches `url` like [`fetch_cached`](Self::fetch_cached), blocking the current thread.
    ///
    /// This reads and writes the same cache tiers, but does not take part in request
    /// coalescing: it neither attaches to in-flight requests nor lets others attach to it.
    /// It must not be called from within an async context.
    pub fn fetch_cached_blocking(
        &self,
        url: &str,
        body: Option<Bytes>,
        options: RequestOptions,
    ) -> Result<Response, FetchError> {
        let NormalizedRequest {
            transport,
            cache,
            cache_key,
        } = caching::normalize(url, body.is_some(), options);
        let response_type = transport.response_type;
        let request = TransportRequest {
            url: url.to_owned(),
            method: transport.method,
            headers: transport.headers,
            body,
        };

        if let Some(entry) = cache_key
            .as_ref()
            .and_then(|key| self.inner.cache.get(key, &cache))
        {
            return entry.into_response();
        }

        let entry = self.inner.execute_blocking(request, response_type);
        if let Some(key) = &cache_key {
            self.inner
                .cache
                .set(key, clone_entry(&entry), cache.local_storage_expiration);
        }
        entry.into_response()
    }

    /// Drops every in-memory entry, e.g. after the remote state changed wholesale.
    ///
    /// Persisted entries are kept.
    pub fn clear_memory_cache(&self) {
        tracing::debug!("Clearing in-memory cache");
        self.inner.cache.clear_all();
    }

    /// Removes expired entries from the persistent tier, or all of them with `remove_all`.
    pub fn purge(&self, remove_all: bool) -> PurgeStats {
        self.inner.purge(remove_all)
    }

    /// Schedules the startup purge.
    ///
    /// The purge runs once per instance, `caches.purge_delay` after the first call. It is
    /// skipped if the persisted purge flag shows that another purge ran within
    /// `caches.purge_guard`, e.g. from a process that was restarted right before. Returns
    /// `None` if the purge was already scheduled.
    pub fn spawn_purge(&self) -> Option<JoinHandle<Option<PurgeStats>>> {
        if self.inner.purge_scheduled.swap(true, Ordering::SeqCst) {
            return None;
        }

        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            tokio::time::sleep(inner.purge_delay).await;

            let storage = inner.cache.storage();
            if caching::purged_recently(storage, inner.purge_guard) {
                tracing::debug!("Skipping purge, another one ran recently");
                return None;
            }
            caching::mark_purged(storage);

            let stats = inner.purge(false);
            tracing::info!(removed = stats.removed(), "Purged persistent cache");
            Some(stats)
        }))
    }

    /// Whether a request for `key` is currently in flight.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner.coordinator.is_pending(key)
    }
}
