//! # Fetchcache Caching infrastructure
//!
//! Fetchcache sits between a display layer that wants bytes for URLs and the network. Many
//! displays tend to ask for the same resource at the same time (think of a scrolling list of
//! avatars), and the same resources are asked for again on every launch. This module holds the
//! layers that keep those requests from turning into network traffic, and our central
//! [`CacheError`] type.
//!
//! ## Cache Layers
//!
//! - An in-memory layer, the [`EntryRegistry`]. It holds the payloads of finished downloads and
//!   doubles as the request coalescing point: at most one download per resource is outstanding,
//!   and everyone else who asks in the meantime is queued up as an observer of that download.
//! - A persistent layer, the [`PersistentCacheAdapter`] on top of a [`PersistentStore`]. It
//!   keeps raw responses across restarts, together with the time they were stored.
//!
//! A request goes through the following steps:
//! - First, it goes through the in-memory layer.
//! - On miss, it tries the persistent layer. A fresh record is promoted into memory. A stale
//!   record is removed.
//! - On miss, it either joins the outstanding download or starts a new one.
//! - The downloaded payload is stored in memory, handed to every waiter, and persisted if it is
//!   eligible.
//!
//! Memory can be shed at any time through [`MemoryPressure`]. Persisted responses are not
//! affected by that.
//!
//! ### Metrics
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by the in-memory layer.
//! - `caches.file.hit`: Accesses served by the persistent layer.
//! - `caches.file.stale`: Persisted records that were too old to be used.
//! - `caches.download`: Actual downloads being run.
//! - `caches.download.joined`: Accesses that joined an outstanding download.
//!
//! Various other metrics are being collected as well, including:
//! - `caches.file.size`: A histogram for the size (in bytes) of persisted responses.
//! - `caches.file.write`: The number of responses being persisted.
//! - `caches.evict`: The number of times the memory layer was evicted.
//!
//! ### Configuration
//!
//! The in-memory layer is always active. The persistent layer is gated by the
//! [`Config::cache_dir`](crate::config::Config::cache_dir) option, and tuned by
//! [`Config::caches`](crate::config::Config::caches).
//!
//! ## Freshness
//!
//! A persisted record is fresh while it is younger than `disk_cache_max_age`. The age is computed
//! from the time fetchcache stored the record, whatever caching headers the server sent. On
//! store, the `Cache-Control` header of the record is rewritten to announce that maximum age.
//!
//! Setting the maximum age to zero removes every persisted record and disables persistence.
//!
//! ## Eligibility
//!
//! A response is only persisted when all of these hold:
//! - the maximum age is not zero,
//! - it takes up at most 5% (by default) of the store capacity,
//! - both the configured and the per-request [`CachePolicy`](crate::config::CachePolicy) are one
//!   of the "return cache data" policies.

mod cache_error;
mod fs;
mod key;
mod persistent;
mod pressure;
mod registry;


pub use cache_error::{CacheContents, CacheError, ErrorKind};
pub use fs::{CleanupStats, FsStore, PersistentCacheRecord, PersistentStore};
pub use key::ResourceKey;
pub use persistent::PersistentCacheAdapter;
pub use pressure::{MemoryPressure, MemoryPressureListener};
pub use registry::{Admission, CacheEntry, EntryRegistry};
