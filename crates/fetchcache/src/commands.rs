//! Implementations of the command line subcommands.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use fetchcache_service::caching::{FsStore, PersistentStore};
use fetchcache_service::config::{CachePolicy, Config};
use fetchcache_service::coordinator::FetchCoordinator;

/// Requests all `urls` concurrently, `repeat` times, and prints the outcome of each request.
pub async fn fetch(
    config: &Config,
    urls: &[String],
    repeat: usize,
    policy: Option<CachePolicy>,
) -> Result<()> {
    let coordinator = FetchCoordinator::from_config(config, None)?;
    if let Some(policy) = policy {
        coordinator.set_cache_policy(policy);
    }

    let mut failures = 0;
    for round in 1..=repeat {
        let start = Instant::now();
        let results =
            futures::future::join_all(urls.iter().map(|url| coordinator.fetch(url))).await;

        for (url, result) in urls.iter().zip(results) {
            match result {
                Ok(payload) => println!("{url}: {} bytes", payload.len()),
                Err(err) => {
                    failures += 1;
                    println!("{url}: {err} ({})", err.kind());
                }
            }
        }

        let elapsed = Duration::from_millis(start.elapsed().as_millis() as u64);
        tracing::info!(
            round,
            "Round finished in {}",
            humantime::format_duration(elapsed)
        );
    }

    if failures > 0 {
        anyhow::bail!("{failures} requests failed");
    }
    Ok(())
}

fn open_store(config: &Config) -> Result<FsStore> {
    FsStore::from_config(config)
        .context("failed to open persistent store")?
        .context("no cache_dir configured")
}

/// Removes persisted responses older than the configured maximum age.
pub fn cleanup(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    store.clear_tmp()?;
    let stats = store.cleanup(config.caches.disk_cache_max_age)?;
    println!(
        "removed {} files ({} bytes), retained {} records ({} bytes)",
        stats.removed_files, stats.removed_bytes, stats.retained_files, stats.retained_bytes
    );
    Ok(())
}

/// Removes all persisted responses.
pub fn clear(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    store.clear()?;
    store.clear_tmp()?;
    println!("cleared {}", store.records_dir().display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use fetchcache_service::caching::ResourceKey;
    use fetchcache_test::HitCounter;

    use super::*;

    fn config(cache_dir: &std::path::Path) -> Config {
        Config {
            cache_dir: Some(cache_dir.to_path_buf()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_fetch_dedups_and_persists() {
        fetchcache_test::setup();
        let hitcounter = HitCounter::new();
        let cache_dir = fetchcache_test::tempdir();
        let url = hitcounter.url("/garbage_data/a.png").to_string();

        let urls = vec![url.clone(), url.clone(), url.clone()];
        fetch(&config(cache_dir.path()), &urls, 2, None).await.unwrap();
        assert_eq!(hitcounter.accesses(), 1);

        let store = open_store(&config(cache_dir.path())).unwrap();
        let key = ResourceKey::parse(&url).unwrap();
        assert!(store.get(&key).unwrap().is_some());

        clear(&config(cache_dir.path())).unwrap();
        assert!(store.get(&key).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fetch_reports_failures() {
        fetchcache_test::setup();
        let hitcounter = HitCounter::new();
        let url = hitcounter.url("/respond_statuscode/500/a.png").to_string();

        let err = fetch(&Config::default(), &[url], 1, None).await.unwrap_err();
        assert_eq!(err.to_string(), "1 requests failed");
    }

    #[test]
    fn test_cleanup_requires_cache_dir() {
        let err = cleanup(&Config::default()).unwrap_err();
        assert_eq!(err.to_string(), "no cache_dir configured");
    }

    #[test]
    fn test_cleanup() {
        let cache_dir = fetchcache_test::tempdir();
        cleanup(&config(cache_dir.path())).unwrap();
        assert!(cache_dir.path().join("responses").is_dir());
    }
}
