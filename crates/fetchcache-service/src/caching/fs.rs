use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::Config;

use super::{CacheContents, ResourceKey};

/// The extension of the sidecar file holding a record's metadata.
const METADATA_EXTENSION: &str = "meta";

/// A response kept in the persistent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentCacheRecord {
    /// The key the response was requested under.
    pub request_key: ResourceKey,
    /// The response body.
    pub response_bytes: Bytes,
    /// The HTTP status of the response.
    pub status: u16,
    /// The response headers, with lowercase names.
    pub headers: BTreeMap<String, String>,
    /// When the response was stored. Stamped by the cache, not taken from the headers.
    pub creation_timestamp: SystemTime,
}

/// A persistent key/response store.
///
/// Implementations synchronize their own access. Failures are reported as
/// [`CacheError`](super::CacheError)s and treated as misses by the cache.
pub trait PersistentStore: Send + Sync + fmt::Debug {
    /// Looks up the record stored under `key`.
    fn get(&self, key: &ResourceKey) -> CacheContents<Option<PersistentCacheRecord>>;

    /// Stores `record` under its request key, replacing any previous record.
    fn put(&self, record: &PersistentCacheRecord) -> CacheContents;

    /// Removes the record stored under `key`, if any.
    fn remove(&self, key: &ResourceKey) -> CacheContents;

    /// Removes all records.
    fn clear(&self) -> CacheContents;

    /// The total capacity of the store, in bytes.
    fn capacity(&self) -> u64;
}

/// The metadata sidecar of a record, serialized as JSON.
#[derive(Debug, Serialize, Deserialize)]
struct RecordMetadata {
    request_key: String,
    status: u16,
    headers: BTreeMap<String, String>,
    time_created: SystemTime,
    len: u64,
}

/// A [`PersistentStore`] in a local directory.
///
/// Each record consists of a payload file at the key's [`cache_path`](ResourceKey::cache_path)
/// and a JSON sidecar next to it. Both are written to a temporary directory first and then moved
/// into place, so readers never observe partially written files.
#[derive(Debug, Clone)]
pub struct FsStore {
    /// Directory holding the records.
    records_dir: PathBuf,
    /// Directory for files that are still being written.
    tmp_dir: PathBuf,
    /// Capacity (in bytes) of the records directory.
    capacity: u64,
}

impl FsStore {
    /// Opens the store under the configured `cache_dir`.
    ///
    /// Returns `None` if no `cache_dir` is configured.
    pub fn from_config(config: &Config) -> io::Result<Option<Self>> {
        match (config.cache_dir("responses"), config.cache_dir("tmp")) {
            (Some(records_dir), Some(tmp_dir)) => {
                Self::new(records_dir, tmp_dir, config.caches.disk_capacity).map(Some)
            }
            _ => Ok(None),
        }
    }

    pub fn new(records_dir: PathBuf, tmp_dir: PathBuf, capacity: u64) -> io::Result<Self> {
        fs::create_dir_all(&records_dir)?;
        fs::create_dir_all(&tmp_dir)?;
        Ok(Self {
            records_dir,
            tmp_dir,
            capacity,
        })
    }

    pub fn records_dir(&self) -> &Path {
        &self.records_dir
    }

    fn record_path(&self, key: &ResourceKey) -> PathBuf {
        self.records_dir.join(key.cache_path())
    }

    /// Clears out leftovers of writes that never finished.
    pub fn clear_tmp(&self) -> io::Result<()> {
        if self.tmp_dir.exists() {
            fs::remove_dir_all(&self.tmp_dir)?;
        }
        fs::create_dir_all(&self.tmp_dir)
    }

    /// Creates a new temporary file next to the records.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // `clear` or `cleanup` could remove the directory concurrently, so retry once.
        match tempfile::Builder::new()
            .prefix("tmp")
            .tempfile_in(&self.tmp_dir)
        {
            Ok(file) => Ok(file),
            Err(_) => {
                fs::create_dir_all(&self.tmp_dir)?;
                tempfile::Builder::new()
                    .prefix("tmp")
                    .tempfile_in(&self.tmp_dir)
            }
        }
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(contents)?;
        temp_file.flush()?;
        persist_tempfile(temp_file, path)?;
        Ok(())
    }

    /// Removes a record, ignoring parts that do not exist.
    fn remove_record(&self, path: &Path) -> io::Result<()> {
        for path in [path.to_path_buf(), metadata_path(path)] {
            if let Err(e) = fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Reads a record, returning `None` for missing or inconsistent records.
    fn read_record(&self, key: &ResourceKey, path: &Path) -> io::Result<Option<PersistentCacheRecord>> {
        let metadata = match catch_not_found(|| fs::read(metadata_path(path)))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let metadata: RecordMetadata = match serde_json::from_slice(&metadata) {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Discarding record with unreadable metadata"
                );
                self.remove_record(path)?;
                return Ok(None);
            }
        };

        let Some(data) = catch_not_found(|| fs::read(path))? else {
            self.remove_record(path)?;
            return Ok(None);
        };

        if data.len() as u64 != metadata.len || metadata.request_key != key.as_str() {
            tracing::debug!(path = %path.display(), "Discarding inconsistent record");
            self.remove_record(path)?;
            return Ok(None);
        }

        Ok(Some(PersistentCacheRecord {
            request_key: key.clone(),
            response_bytes: Bytes::from(data),
            status: metadata.status,
            headers: metadata.headers,
            creation_timestamp: metadata.time_created,
        }))
    }

    /// Lists all records with their size and creation time.
    ///
    /// Sidecars without payload and payloads without sidecar are reported as orphans.
    fn scan(&self) -> io::Result<Scan> {
        let mut scan = Scan::default();
        scan_directory_recursive(&self.records_dir, &mut scan)?;
        Ok(scan)
    }

    /// Removes the oldest records until the store fits its capacity again.
    fn trim_to_capacity(&self) -> io::Result<()> {
        let mut scan = self.scan()?;
        let mut total: u64 = scan.records.iter().map(|r| r.len).sum();
        if total <= self.capacity {
            return Ok(());
        }

        scan.records.sort_by_key(|r| r.time_created);
        let mut removed = 0;
        for record in &scan.records {
            if total <= self.capacity {
                break;
            }
            self.remove_record(&record.path)?;
            total = total.saturating_sub(record.len);
            removed += 1;
        }
        tracing::debug!(removed, "Trimmed persistent store to capacity");
        metric!(counter("caches.file.trimmed") += removed as i64);
        Ok(())
    }

    /// Removes all records created more than `max_age` ago, as well as orphaned files.
    pub fn cleanup(&self, max_age: Duration) -> io::Result<CleanupStats> {
        tracing::info!("Cleaning up `{}`", self.records_dir.display());
        let scan = self.scan()?;
        let mut stats = CleanupStats::default();

        for orphan in &scan.orphans {
            if catch_not_found(|| fs::remove_file(orphan))?.is_some() {
                stats.removed_files += 1;
            }
        }

        for record in &scan.records {
            let age = record.time_created.elapsed().unwrap_or_default();
            if age >= max_age {
                self.remove_record(&record.path)?;
                stats.removed_files += 1;
                stats.removed_bytes += record.len;
            } else {
                stats.retained_files += 1;
                stats.retained_bytes += record.len;
            }
        }

        tracing::info!(
            "Retained {} records, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64);

        Ok(stats)
    }
}

impl PersistentStore for FsStore {
    fn get(&self, key: &ResourceKey) -> CacheContents<Option<PersistentCacheRecord>> {
        let path = self.record_path(key);
        tracing::trace!("Trying persistent record at path {}", path.display());
        Ok(self.read_record(key, &path)?)
    }

    fn put(&self, record: &PersistentCacheRecord) -> CacheContents {
        let path = self.record_path(&record.request_key);
        tracing::trace!("Persisting `{}` at path {}", record.request_key, path.display());

        let metadata = RecordMetadata {
            request_key: record.request_key.as_str().to_owned(),
            status: record.status,
            headers: record.headers.clone(),
            time_created: record.creation_timestamp,
            len: record.response_bytes.len() as u64,
        };
        let metadata = serde_json::to_vec(&metadata)?;

        // The payload goes first, a record only becomes visible with its sidecar.
        self.write_file(&path, &record.response_bytes)?;
        self.write_file(&metadata_path(&path), &metadata)?;

        self.trim_to_capacity()?;
        Ok(())
    }

    fn remove(&self, key: &ResourceKey) -> CacheContents {
        Ok(self.remove_record(&self.record_path(key))?)
    }

    fn clear(&self) -> CacheContents {
        tracing::debug!("Clearing `{}`", self.records_dir.display());
        if catch_not_found(|| fs::remove_dir_all(&self.records_dir))?.is_none() {
            tracing::trace!("Records directory did not exist");
        }
        fs::create_dir_all(&self.records_dir)?;
        Ok(())
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }
}

/// Statistics of a [`FsStore::cleanup`] run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupStats {
    pub removed_files: u64,
    pub removed_bytes: u64,
    pub retained_files: u64,
    pub retained_bytes: u64,
}

#[derive(Debug)]
struct ScannedRecord {
    path: PathBuf,
    len: u64,
    time_created: SystemTime,
}

#[derive(Debug, Default)]
struct Scan {
    records: Vec<ScannedRecord>,
    orphans: Vec<PathBuf>,
}

fn scan_directory_recursive(dir: &Path, scan: &mut Scan) -> io::Result<()> {
    let Some(entries) = catch_not_found(|| fs::read_dir(dir))? else {
        return Ok(());
    };

    for entry in entries {
        let path = entry?.path();
        if path.is_dir() {
            scan_directory_recursive(&path, scan)?;
            continue;
        }

        let is_metadata = path.extension().is_some_and(|ext| ext == METADATA_EXTENSION);
        if is_metadata {
            // the data file may be missing, or the sidecar may be unreadable
            let data_path = path.with_extension("");
            if !data_path.exists() {
                scan.orphans.push(path);
            }
            continue;
        }

        let metadata = catch_not_found(|| fs::read(metadata_path(&path)))?
            .and_then(|bytes| serde_json::from_slice::<RecordMetadata>(&bytes).ok());
        match metadata {
            Some(metadata) => scan.records.push(ScannedRecord {
                path,
                len: metadata.len,
                time_created: metadata.time_created,
            }),
            None => scan.orphans.push(path),
        }
    }
    Ok(())
}

/// Returns the path of the metadata sidecar for the record at `path`.
pub(super) fn metadata_path(path: &Path) -> PathBuf {
    path.with_extension(METADATA_EXTENSION)
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<fs::File> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist record"))?;

    // `clear` could remove the parent directories we are operating in, so retry the fs
    // operations.
    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            tracing::error!(
                error = &e as &dyn std::error::Error,
                path = %parent.display(),
                "Failed to create cache directory"
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(file) => return Ok(file),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to persist temp file"
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn store(dir: &Path, capacity: u64) -> FsStore {
        FsStore::new(dir.join("responses"), dir.join("tmp"), capacity).unwrap()
    }

    fn record(url: &str, body: &'static [u8], created: SystemTime) -> PersistentCacheRecord {
        PersistentCacheRecord {
            request_key: ResourceKey::parse(url).unwrap(),
            response_bytes: Bytes::from_static(body),
            status: 200,
            headers: BTreeMap::from([("content-type".to_owned(), "image/png".to_owned())]),
            creation_timestamp: created,
        }
    }

    #[test]
    fn test_put_get_remove() {
        let dir = fetchcache_test::tempdir();
        let store = store(dir.path(), 1024);
        let record = record("https://example.com/a.png", b"png", SystemTime::now());

        assert_eq!(store.get(&record.request_key), Ok(None));

        store.put(&record).unwrap();
        assert_eq!(store.get(&record.request_key), Ok(Some(record.clone())));

        store.remove(&record.request_key).unwrap();
        assert_eq!(store.get(&record.request_key), Ok(None));
        // removing twice is fine
        store.remove(&record.request_key).unwrap();
    }

    #[test]
    fn test_clear() {
        let dir = fetchcache_test::tempdir();
        let store = store(dir.path(), 1024);
        let a = record("https://example.com/a.png", b"a", SystemTime::now());
        let b = record("https://example.com/b.png", b"b", SystemTime::now());
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        store.clear().unwrap();
        assert_eq!(store.get(&a.request_key), Ok(None));
        assert_eq!(store.get(&b.request_key), Ok(None));

        // still usable afterwards
        store.put(&a).unwrap();
        assert!(store.get(&a.request_key).unwrap().is_some());
    }

    #[test]
    fn test_inconsistent_record_is_discarded() {
        let dir = fetchcache_test::tempdir();
        let store = store(dir.path(), 1024);
        let record = record("https://example.com/a.png", b"png", SystemTime::now());
        store.put(&record).unwrap();

        let path = store.record_path(&record.request_key);
        fs::write(&path, b"truncated?").unwrap();

        assert_eq!(store.get(&record.request_key), Ok(None));
        assert!(!path.exists());
        assert!(!metadata_path(&path).exists());
    }

    #[test]
    fn test_garbage_metadata_is_discarded() {
        let dir = fetchcache_test::tempdir();
        let store = store(dir.path(), 1024);
        let record = record("https://example.com/a.png", b"png", SystemTime::now());
        store.put(&record).unwrap();

        let path = store.record_path(&record.request_key);
        fs::write(metadata_path(&path), b"{not json").unwrap();

        assert_eq!(store.get(&record.request_key), Ok(None));
        assert!(!path.exists());
    }

    #[test]
    fn test_trim_to_capacity_removes_oldest() {
        let dir = fetchcache_test::tempdir();
        let store = store(dir.path(), 10);
        let now = SystemTime::now();

        let old = record("https://example.com/old", b"aaaa", now - Duration::from_secs(30));
        let mid = record("https://example.com/mid", b"bbbb", now - Duration::from_secs(20));
        let new = record("https://example.com/new", b"cccc", now);

        store.put(&old).unwrap();
        store.put(&mid).unwrap();
        store.put(&new).unwrap();

        assert_eq!(store.get(&old.request_key), Ok(None));
        assert!(store.get(&mid.request_key).unwrap().is_some());
        assert!(store.get(&new.request_key).unwrap().is_some());
    }

    #[test]
    fn test_cleanup() {
        let dir = fetchcache_test::tempdir();
        let store = store(dir.path(), 1024);
        let now = SystemTime::now();

        let stale = record("https://example.com/stale", b"stale", now - Duration::from_secs(7200));
        let fresh = record("https://example.com/fresh", b"fresh!", now);
        store.put(&stale).unwrap();
        store.put(&fresh).unwrap();

        // an orphaned payload without sidecar
        let orphan = store.records_dir().join("ab/cdef01/orphan");
        fs::create_dir_all(orphan.parent().unwrap()).unwrap();
        fs::write(&orphan, b"?").unwrap();

        let stats = store.cleanup(Duration::from_secs(3600)).unwrap();
        assert_eq!(
            stats,
            CleanupStats {
                removed_files: 2,
                removed_bytes: 5,
                retained_files: 1,
                retained_bytes: 6,
            }
        );
        assert_eq!(store.get(&stale.request_key), Ok(None));
        assert!(store.get(&fresh.request_key).unwrap().is_some());
        assert!(!orphan.exists());
    }

    #[test]
    fn test_from_config() {
        let dir = fetchcache_test::tempdir();
        assert!(FsStore::from_config(&Config::default()).unwrap().is_none());

        let config = Config {
            cache_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let store = FsStore::from_config(&config).unwrap().unwrap();
        assert_eq!(store.capacity(), 50 * 1024 * 1024);
        assert!(dir.path().join("responses").is_dir());
        assert!(dir.path().join("tmp").is_dir());
    }
}
