use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;

use crate::delivery::{ObserverId, PendingRequest};

use super::{CacheContents, ResourceKey};

/// The per-resource state kept by the [`EntryRegistry`].
#[derive(Debug, Clone, Default)]
pub struct CacheEntry {
    /// The payload, once a download for this resource succeeded.
    payload: Option<Bytes>,
    /// Whether a download for this resource is outstanding.
    downloading: bool,
    /// Callers waiting for the outstanding download, in registration order.
    observers: Vec<PendingRequest>,
}

impl CacheEntry {
    pub fn payload(&self) -> Option<&Bytes> {
        self.payload.as_ref()
    }

    pub fn is_downloading(&self) -> bool {
        self.downloading
    }

    pub fn observers(&self) -> &[PendingRequest] {
        &self.observers
    }

    /// Appends a waiter, or replaces the request of an already registered observer in place.
    fn add_observer(&mut self, pending: PendingRequest) {
        match self
            .observers
            .iter_mut()
            .find(|existing| existing.observer == pending.observer)
        {
            Some(existing) => *existing = pending,
            None => self.observers.push(pending),
        }
    }
}

/// How a request was admitted by [`EntryRegistry::admit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// The payload is already in memory.
    Cached(Bytes),
    /// No download was outstanding. The caller now owns the download and must complete it.
    Started,
    /// A download is outstanding and the caller was registered as one of its observers.
    Joined,
}

/// The in-memory cache and the coordination point for concurrent downloads.
///
/// All state lives behind a single mutex, and every method is one critical section. The lock is
/// never held while downloading or while delivering results.
pub struct EntryRegistry {
    entries: Mutex<HashMap<ResourceKey, CacheEntry>>,
    /// Whether [`evict_all`](Self::evict_all) keeps entries with an outstanding download.
    retain_observers_on_evict: bool,
}

impl fmt::Debug for EntryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.try_lock().map(|e| e.len()).unwrap_or_default();
        f.debug_struct("EntryRegistry")
            .field("entries", &entries)
            .field("retain_observers_on_evict", &self.retain_observers_on_evict)
            .finish()
    }
}

impl Default for EntryRegistry {
    fn default() -> Self {
        Self::new(false)
    }
}

impl EntryRegistry {
    pub fn new(retain_observers_on_evict: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            retain_observers_on_evict,
        }
    }

    /// Locks the registry.
    ///
    /// No user code runs under this lock, so a poisoned lock still guards consistent entries.
    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the payload of `key`, if it is in memory.
    pub fn lookup_payload(&self, key: &ResourceKey) -> Option<Bytes> {
        self.lock().get(key).and_then(|entry| entry.payload.clone())
    }

    /// Returns a snapshot of the entry for `key`, creating an empty one if needed.
    pub fn entry_for(&self, key: &ResourceKey) -> CacheEntry {
        self.lock().entry(key.clone()).or_default().clone()
    }

    /// Claims the download for `key`.
    ///
    /// Returns `true` if no download was outstanding; the caller must then fetch the resource and
    /// call [`complete_download`](Self::complete_download). Returns `false` if another caller
    /// already owns the download. Of any number of concurrent calls, exactly one gets `true`.
    pub fn begin_download_if_needed(&self, key: &ResourceKey) -> bool {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        if entry.downloading {
            return false;
        }
        entry.downloading = true;
        true
    }

    /// Registers `pending` to be notified when the outstanding download of `key` completes.
    ///
    /// Does nothing and returns `false` if there is no outstanding download, as the request
    /// would never be notified.
    pub fn register_observer(&self, key: &ResourceKey, pending: PendingRequest) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) if entry.downloading => {
                entry.add_observer(pending);
                true
            }
            _ => {
                tracing::debug!(
                    key = %key,
                    observer = %pending.observer,
                    "Refusing to register observer without an outstanding download"
                );
                false
            }
        }
    }

    /// Removes a registered observer before the download completes.
    ///
    /// Returns whether the observer was registered.
    pub fn unregister_observer(&self, key: &ResourceKey, observer: ObserverId) -> bool {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return false;
        };
        let before = entry.observers.len();
        entry.observers.retain(|pending| pending.observer != observer);
        entry.observers.len() != before
    }

    /// Admits a request in one critical section.
    ///
    /// Serves the in-memory payload if there is one, otherwise either claims the download like
    /// [`begin_download_if_needed`](Self::begin_download_if_needed) or registers `pending` like
    /// [`register_observer`](Self::register_observer). Combining the steps closes the window in
    /// which a download could complete between claiming and registering.
    pub fn admit(&self, key: &ResourceKey, pending: PendingRequest) -> Admission {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        if let Some(payload) = &entry.payload {
            return Admission::Cached(payload.clone());
        }
        if entry.downloading {
            entry.add_observer(pending);
            Admission::Joined
        } else {
            entry.downloading = true;
            Admission::Started
        }
    }

    /// Finishes the outstanding download of `key`.
    ///
    /// Clears the download flag, stores the payload on success and returns the registered
    /// observers in registration order, leaving none behind. Observers registered after this call
    /// belong to the next download cycle.
    ///
    /// If the entry was evicted in the meantime it is recreated, and its former observers are
    /// lost.
    pub fn complete_download(
        &self,
        key: &ResourceKey,
        outcome: &CacheContents<Bytes>,
    ) -> Vec<PendingRequest> {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.downloading = false;
        if let Ok(payload) = outcome {
            entry.payload = Some(payload.clone());
        }
        std::mem::take(&mut entry.observers)
    }

    /// Places a payload in memory without touching download state or observers.
    ///
    /// Used for responses served from the persistent cache.
    pub fn store_payload(&self, key: &ResourceKey, payload: Bytes) {
        self.lock().entry(key.clone()).or_default().payload = Some(payload);
    }

    /// Drops all entries, returning how many were dropped.
    ///
    /// Downloads that are in flight still complete and recreate their entry. Unless the registry
    /// was created to retain them, the observers of those downloads are dropped with their entry
    /// and never notified.
    pub fn evict_all(&self) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        if self.retain_observers_on_evict {
            entries.retain(|_, entry| entry.downloading);
            for entry in entries.values_mut() {
                entry.payload = None;
            }
        } else {
            entries.clear();
            entries.shrink_to_fit();
        }
        before - entries.len()
    }

    /// The number of entries, including empty ones.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
