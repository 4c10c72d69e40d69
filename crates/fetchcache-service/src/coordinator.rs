//! Request orchestration: memory, then persistent store, then network.

use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use anyhow::Context;
use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::caching::{
    Admission, CacheContents, CacheError, EntryRegistry, FsStore, MemoryPressure,
    MemoryPressureListener, PersistentCacheAdapter, PersistentStore, ResourceKey,
};
use crate::config::{CachePolicy, Config};
use crate::delivery::{
    Delivery, FnSink, IdentityToken, ObserverId, PayloadCheck, PendingRequest, ResultDelivery,
    ResultSink,
};
use crate::transport::{FetchRequest, HttpTransport, Transport, TransportOptions};

/// How a call to [`FetchCoordinator::request`] was served.
#[derive(Debug)]
pub enum RequestStatus {
    /// The key was unusable. The failure has already been delivered.
    Rejected,
    /// Nothing is cached and the policy forbids loading. The failure has already been delivered.
    NotCached,
    /// Served from memory. The result has already been delivered.
    Memory,
    /// Served from the persistent store. The result has already been delivered.
    Persistent,
    /// Joined an outstanding download. The result is delivered when it completes.
    Joined,
    /// Started a new download, running on the returned task.
    Started(JoinHandle<()>),
}

impl RequestStatus {
    /// Waits for the download this request started, if any.
    pub async fn finished(self) {
        if let Self::Started(handle) = self {
            if let Err(err) = handle.await {
                tracing::error!(error = &err as &dyn std::error::Error, "Download task failed");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    fade_duration: Duration,
    request_timeout: Duration,
    cache_policy: CachePolicy,
}

struct CoordinatorInner {
    registry: Arc<EntryRegistry>,
    persistent: PersistentCacheAdapter,
    transport: Arc<dyn Transport>,
    payload_check: Option<Arc<dyn PayloadCheck>>,
    delivery: ResultDelivery,
    settings: RwLock<Settings>,
    runtime: Handle,
}

/// Resolves resources for any number of concurrent callers.
///
/// At most one download per resource is in flight at any time. Everyone asking for a resource
/// while it downloads is notified when that download completes, in the order they asked.
///
/// The coordinator is cheap to clone, clones share all state.
#[derive(Clone)]
pub struct FetchCoordinator {
    inner: Arc<CoordinatorInner>,
}

impl std::fmt::Debug for FetchCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchCoordinator")
            .field("registry", &self.inner.registry)
            .field("persistent", &self.inner.persistent)
            .field("transport", &self.inner.transport)
            .field("settings", &self.settings())
            .finish_non_exhaustive()
    }
}

impl FetchCoordinator {
    /// Creates a coordinator from its parts.
    ///
    /// Downloads run on `runtime`, so requests may come from any thread, inside a runtime or not.
    /// Downloaded and persisted payloads have to pass `payload_check`, if given.
    pub fn new(
        config: &Config,
        registry: Arc<EntryRegistry>,
        store: Option<Arc<dyn PersistentStore>>,
        transport: Arc<dyn Transport>,
        payload_check: Option<Arc<dyn PayloadCheck>>,
        runtime: Handle,
    ) -> Self {
        let caches = &config.caches;
        Self {
            inner: Arc::new(CoordinatorInner {
                registry,
                persistent: PersistentCacheAdapter::new(store, caches),
                transport,
                payload_check,
                delivery: ResultDelivery,
                settings: RwLock::new(Settings {
                    fade_duration: caches.fade_duration,
                    request_timeout: caches.request_timeout,
                    cache_policy: caches.cache_policy,
                }),
                runtime,
            }),
        }
    }

    /// Creates a coordinator with a filesystem store under `cache_dir` and an HTTP transport.
    ///
    /// Must be called from within a tokio runtime, which then runs all downloads.
    pub fn from_config(
        config: &Config,
        payload_check: Option<Arc<dyn PayloadCheck>>,
    ) -> anyhow::Result<Self> {
        let runtime = Handle::try_current().context("no tokio runtime to run downloads on")?;
        let store = FsStore::from_config(config).context("failed to open persistent store")?;
        if let Some(store) = &store {
            store
                .clear_tmp()
                .context("failed to clear temporary directory")?;
        }
        let transport = HttpTransport::new(config).context("failed to create HTTP client")?;
        let registry = Arc::new(EntryRegistry::new(config.caches.retain_observers_on_evict));

        Ok(Self::new(
            config,
            registry,
            store.map(|store| Arc::new(store) as Arc<dyn PersistentStore>),
            Arc::new(transport),
            payload_check,
            runtime,
        ))
    }

    pub fn registry(&self) -> &Arc<EntryRegistry> {
        &self.inner.registry
    }

    pub fn persistent(&self) -> &PersistentCacheAdapter {
        &self.inner.persistent
    }

    /// Evicts the memory cache whenever `pressure` is signaled, for as long as the returned
    /// listener lives.
    pub fn listen_for_memory_pressure(&self, pressure: &MemoryPressure) -> MemoryPressureListener {
        let registry = self.inner.registry.clone();
        MemoryPressureListener::spawn_on(registry, pressure, &self.inner.runtime)
    }

    fn settings(&self) -> Settings {
        *self
            .inner
            .settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn update_settings(&self, f: impl FnOnce(&mut Settings)) -> Settings {
        let mut settings = self
            .inner
            .settings
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        f(&mut settings);
        *settings
    }

    fn reconfigure_transport(&self, settings: Settings) {
        self.inner.transport.configure(&TransportOptions {
            timeout: settings.request_timeout,
            cache_policy: settings.cache_policy,
        });
    }

    /// The cross-fade duration for the display layer.
    pub fn fade_duration(&self) -> Duration {
        self.settings().fade_duration
    }

    pub fn set_fade_duration(&self, fade_duration: Duration) {
        self.update_settings(|s| s.fade_duration = fade_duration);
    }

    pub fn request_timeout(&self) -> Duration {
        self.settings().request_timeout
    }

    /// Changes the timeout of future downloads and rebuilds the transport.
    pub fn set_request_timeout(&self, request_timeout: Duration) {
        let settings = self.update_settings(|s| s.request_timeout = request_timeout);
        self.reconfigure_transport(settings);
    }

    pub fn cache_policy(&self) -> CachePolicy {
        self.settings().cache_policy
    }

    /// Changes the default cache policy and rebuilds the transport.
    pub fn set_cache_policy(&self, cache_policy: CachePolicy) {
        let settings = self.update_settings(|s| s.cache_policy = cache_policy);
        self.inner.persistent.set_cache_policy(cache_policy);
        self.reconfigure_transport(settings);
    }

    pub fn disk_cache_max_age(&self) -> Duration {
        self.inner.persistent.max_age()
    }

    /// Changes the maximum age of persisted responses.
    ///
    /// Zero empties the persistent store before returning.
    pub fn set_disk_cache_max_age(&self, max_age: Duration) {
        self.inner.persistent.set_max_age(max_age);
    }

    /// Requests the resource at `url` with the default cache policy.
    ///
    /// See [`request_with_policy`](Self::request_with_policy).
    pub fn request(
        &self,
        url: &str,
        observer: ObserverId,
        token: IdentityToken,
        sink: Arc<dyn ResultSink>,
    ) -> RequestStatus {
        self.request_with_policy(url, self.cache_policy(), observer, token, sink)
    }

    /// Requests the resource at `url`.
    ///
    /// Never blocks on the network. Hits in memory or in the persistent store are delivered to
    /// `sink` before this returns. Otherwise the request joins the outstanding download of the
    /// resource or starts a new one on the coordinator's runtime, and is delivered when that
    /// completes.
    ///
    /// With [`CachePolicy::AlwaysLoad`] the persistent store is skipped, the memory cache and
    /// download coalescing still apply. With [`CachePolicy::ReturnCacheOnly`] a miss in both
    /// caches fails right away and never joins or starts a download.
    pub fn request_with_policy(
        &self,
        url: &str,
        cache_policy: CachePolicy,
        observer: ObserverId,
        token: IdentityToken,
        sink: Arc<dyn ResultSink>,
    ) -> RequestStatus {
        metric!(counter("caches.access") += 1);
        let pending = PendingRequest::new(observer, token, sink);
        let inner = &self.inner;

        let key = match ResourceKey::parse(url) {
            Ok(key) => key,
            Err(err) => {
                tracing::debug!(url, error = %err, "Rejecting request");
                inner.delivery.deliver(&pending, &Err(err));
                return RequestStatus::Rejected;
            }
        };

        if let Some(payload) = inner.registry.lookup_payload(&key) {
            tracing::trace!(%key, "Memory cache hit");
            metric!(counter("caches.memory.hit") += 1);
            inner.delivery.deliver(&pending, &Ok(payload));
            return RequestStatus::Memory;
        }

        if cache_policy != CachePolicy::AlwaysLoad {
            if let Some(payload) = inner.lookup_persistent(&key) {
                inner.registry.store_payload(&key, payload.clone());
                inner.delivery.deliver(&pending, &Ok(payload));
                return RequestStatus::Persistent;
            }
        }

        if cache_policy == CachePolicy::ReturnCacheOnly {
            tracing::debug!(%key, "Not loading, only cached data allowed");
            metric!(counter("caches.download.forbidden") += 1);
            let err = CacheError::DownloadError(
                "resource is not cached and the policy forbids loading it".into(),
            );
            inner.delivery.deliver(&pending, &Err(err));
            return RequestStatus::NotCached;
        }

        match inner.registry.admit(&key, pending.clone()) {
            // someone finished a download while we were looking at the store
            Admission::Cached(payload) => {
                metric!(counter("caches.memory.hit") += 1);
                inner.delivery.deliver(&pending, &Ok(payload));
                RequestStatus::Memory
            }
            Admission::Joined => {
                tracing::debug!(%key, observer = %pending.observer, "Joined outstanding download");
                metric!(counter("caches.download.joined") += 1);
                RequestStatus::Joined
            }
            Admission::Started => {
                tracing::debug!(%key, observer = %pending.observer, "Starting download");
                let request = FetchRequest {
                    key,
                    cache_policy,
                    timeout: self.request_timeout(),
                };
                let guard = DownloadGuard {
                    inner: Arc::clone(inner),
                    key: request.key.clone(),
                    originator: Some(pending),
                };
                let download = Arc::clone(inner).download(request, guard);
                RequestStatus::Started(inner.runtime.spawn(download))
            }
        }
    }

    /// Resolves the resource at `url` and waits for the outcome.
    pub async fn fetch(&self, url: &str) -> CacheContents<Bytes> {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let sink = FnSink::new(move |delivery| {
            if let Some(sender) = sender.lock().unwrap_or_else(PoisonError::into_inner).take() {
                let _ = sender.send(delivery);
            }
        });

        let status = self.request(url, ObserverId::next(), IdentityToken::default(), sink);
        status.finished().await;

        match receiver.await {
            Ok(Delivery::Loaded(payload)) => Ok(payload),
            Ok(Delivery::Failed(err)) => Err(err),
            // no identity is tracked, and the sink is dropped undelivered only on eviction
            Ok(Delivery::Superseded) | Err(_) => Err(CacheError::InternalError),
        }
    }
}

impl CoordinatorInner {
    /// Returns the fresh persisted payload for `key`, dropping the record if it is stale.
    fn lookup_persistent(&self, key: &ResourceKey) -> Option<Bytes> {
        let Some(record) = self.persistent.lookup(key) else {
            metric!(counter("caches.file.miss") += 1);
            return None;
        };

        if !self.persistent.is_fresh(&record) {
            tracing::trace!(%key, "Persisted response is stale");
            metric!(counter("caches.file.stale") += 1);
            self.persistent.invalidate(key);
            return None;
        }

        if let Err(reason) = self.check_payload(&record.response_bytes) {
            tracing::debug!(%key, %reason, "Persisted response is malformed");
            self.persistent.invalidate(key);
            return None;
        }

        tracing::trace!(%key, "Persistent cache hit");
        metric!(counter("caches.file.hit") += 1);
        Some(record.response_bytes)
    }

    fn check_payload(&self, payload: &Bytes) -> Result<(), String> {
        match &self.payload_check {
            Some(check) => check.check(payload),
            None => Ok(()),
        }
    }

    /// Runs the download owned by `guard` and hands the outcome to everyone waiting for it.
    async fn download(self: Arc<Self>, request: FetchRequest, mut guard: DownloadGuard) {
        metric!(counter("caches.download") += 1);
        let start = Instant::now();
        let key = request.key.clone();
        let cache_policy = request.cache_policy;
        let timeout = request.timeout;

        let response = match tokio::time::timeout(timeout, self.transport.fetch(request)).await {
            Ok(response) => response,
            Err(_) => Err(CacheError::Timeout(timeout)),
        };
        metric!(timer("caches.download.duration") = start.elapsed());

        let response = response.and_then(|response| match self.check_payload(&response.payload) {
            Ok(()) => Ok(response),
            Err(reason) => Err(CacheError::Malformed(reason)),
        });
        let outcome = response
            .as_ref()
            .map(|response| response.payload.clone())
            .map_err(|err| err.clone());

        let originator = guard.disarm();
        let waiters = self.registry.complete_download(&key, &outcome);
        match &response {
            Ok(response) => {
                tracing::debug!(%key, waiters = waiters.len(), "Download finished");
                self.persistent.store_response(&key, response, cache_policy);
            }
            Err(err) => {
                tracing::debug!(%key, error = %err, waiters = waiters.len(), "Download failed");
            }
        }

        self.delivery.deliver_all(originator.iter().chain(&waiters), &outcome);
    }
}

/// Owns a started download until it completes.
///
/// If the download is dropped unfinished (the transport panicked, the task was aborted or the
/// runtime shut down), the guard fails it so the key does not stay marked as downloading.
struct DownloadGuard {
    inner: Arc<CoordinatorInner>,
    key: ResourceKey,
    originator: Option<PendingRequest>,
}

impl DownloadGuard {
    /// Hands back the originator. The download is completed by the caller from here on.
    fn disarm(&mut self) -> Option<PendingRequest> {
        self.originator.take()
    }
}

impl Drop for DownloadGuard {
    fn drop(&mut self) {
        let Some(originator) = self.originator.take() else {
            return;
        };
        tracing::error!(key = %self.key, "Download was abandoned before completing");
        metric!(counter("caches.download.abandoned") += 1);

        let outcome = Err(CacheError::InternalError);
        let waiters = self.inner.registry.complete_download(&self.key, &outcome);
        self.inner
            .delivery
            .deliver_all(std::iter::once(&originator).chain(&waiters), &outcome);
    }
}
