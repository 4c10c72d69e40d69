use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, SystemTime};

use crate::config::{CacheConfig, CachePolicy};
use crate::transport::FetchResponse;

use super::{PersistentCacheRecord, PersistentStore, ResourceKey};

/// The header rewritten on every stored response.
const CACHE_CONTROL: &str = "cache-control";

#[derive(Debug, Clone, Copy)]
struct PersistenceSettings {
    max_age: Duration,
    cache_policy: CachePolicy,
    max_entry_size_fraction: f64,
}

/// Layers the freshness and eligibility rules on top of a [`PersistentStore`].
///
/// Without a store, every lookup misses and nothing is persisted. Store failures are logged and
/// otherwise treated as misses.
#[derive(Debug)]
pub struct PersistentCacheAdapter {
    store: Option<Arc<dyn PersistentStore>>,
    settings: RwLock<PersistenceSettings>,
}

impl PersistentCacheAdapter {
    pub fn new(store: Option<Arc<dyn PersistentStore>>, config: &CacheConfig) -> Self {
        Self {
            store,
            settings: RwLock::new(PersistenceSettings {
                max_age: config.disk_cache_max_age,
                cache_policy: config.cache_policy,
                max_entry_size_fraction: config.max_entry_size_fraction,
            }),
        }
    }

    fn settings(&self) -> PersistenceSettings {
        *self.settings.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn store(&self) -> Option<&Arc<dyn PersistentStore>> {
        self.store.as_ref()
    }

    pub fn max_age(&self) -> Duration {
        self.settings().max_age
    }

    /// The maximum size of a single persisted response.
    pub fn max_entry_size(&self) -> u64 {
        self.entry_size_limit(&self.settings())
    }

    fn entry_size_limit(&self, settings: &PersistenceSettings) -> u64 {
        let capacity = self.store.as_ref().map_or(0, |store| store.capacity());
        (capacity as f64 * settings.max_entry_size_fraction) as u64
    }

    /// Changes the maximum age of persisted responses.
    ///
    /// A maximum age of zero removes every persisted response. Nothing is persisted while it
    /// stays at zero, including responses that were being stored concurrently.
    pub fn set_max_age(&self, max_age: Duration) {
        // held across the clear, writers check eligibility and put under the read lock
        let mut settings = self.settings.write().unwrap_or_else(PoisonError::into_inner);
        settings.max_age = max_age;
        if max_age.is_zero() {
            self.clear();
        }
    }

    pub fn set_cache_policy(&self, cache_policy: CachePolicy) {
        self.settings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .cache_policy = cache_policy;
    }

    /// Looks up the persisted response for `key`, regardless of its age.
    pub fn lookup(&self, key: &ResourceKey) -> Option<PersistentCacheRecord> {
        let store = self.store.as_ref()?;
        match store.get(key) {
            Ok(record) => record,
            Err(err) => {
                tracing::warn!(%key, error = %err, "Failed to read persisted response");
                None
            }
        }
    }

    /// Whether `record` is younger than the current maximum age.
    pub fn is_fresh(&self, record: &PersistentCacheRecord) -> bool {
        self.is_fresh_at(record, SystemTime::now())
    }

    /// Whether `record` is younger than the current maximum age at time `now`.
    ///
    /// Records stamped in the future count as brand new.
    pub fn is_fresh_at(&self, record: &PersistentCacheRecord, now: SystemTime) -> bool {
        let age = now
            .duration_since(record.creation_timestamp)
            .unwrap_or_default();
        age < self.max_age()
    }

    /// Removes the persisted response for `key`.
    pub fn invalidate(&self, key: &ResourceKey) {
        if let Some(store) = &self.store {
            if let Err(err) = store.remove(key) {
                tracing::warn!(%key, error = %err, "Failed to remove persisted response");
            }
        }
    }

    /// Removes every persisted response.
    pub fn clear(&self) {
        if let Some(store) = &self.store {
            if let Err(err) = store.clear() {
                tracing::warn!(error = %err, "Failed to clear persistent store");
            }
        }
    }

    /// Whether a response of `size` bytes requested with `request_policy` may be persisted.
    pub fn is_eligible(&self, size: u64, request_policy: CachePolicy) -> bool {
        self.is_eligible_with(&self.settings(), size, request_policy)
    }

    fn is_eligible_with(
        &self,
        settings: &PersistenceSettings,
        size: u64,
        request_policy: CachePolicy,
    ) -> bool {
        self.store.is_some()
            && !settings.max_age.is_zero()
            && size <= self.entry_size_limit(settings)
            && settings.cache_policy.returns_cache_data()
            && request_policy.returns_cache_data()
    }

    /// Persists `response` under `key` if it is eligible, and returns whether it was stored.
    ///
    /// The stored copy carries a creation timestamp of now and a `Cache-Control` header
    /// announcing the configured maximum age, whatever the server sent.
    pub fn store_response(
        &self,
        key: &ResourceKey,
        response: &FetchResponse,
        request_policy: CachePolicy,
    ) -> bool {
        let Some(store) = &self.store else {
            return false;
        };
        let size = response.payload.len() as u64;
        let settings = self.settings.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_eligible_with(&settings, size, request_policy) {
            tracing::trace!(%key, size, "Response is not eligible for persistence");
            return false;
        }

        let mut headers = response.headers.clone();
        headers.insert(
            CACHE_CONTROL.to_owned(),
            format!("max-age={}", settings.max_age.as_secs()),
        );
        let record = PersistentCacheRecord {
            request_key: key.clone(),
            response_bytes: response.payload.clone(),
            status: response.status,
            headers,
            creation_timestamp: SystemTime::now(),
        };

        match store.put(&record) {
            Ok(()) => {
                metric!(counter("caches.file.write") += 1);
                metric!(time_raw("caches.file.size") = size);
                true
            }
            Err(err) => {
                tracing::warn!(%key, error = %err, "Failed to persist response");
                false
            }
        }
    }
}
