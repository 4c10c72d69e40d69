use std::sync::{Arc, Mutex};
use std::time::Duration;

use fetchcache_service::caching::{CacheError, ErrorKind, ResourceKey};
use fetchcache_service::config::{CacheConfig, CachePolicy, Config};
use fetchcache_service::coordinator::{FetchCoordinator, RequestStatus};
use fetchcache_service::delivery::{Delivery, FnSink, IdentityToken, ObserverId};
use fetchcache_test::HitCounter;

fn config(cache_dir: &std::path::Path) -> Config {
    Config {
        cache_dir: Some(cache_dir.to_path_buf()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_fetch_and_persist() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let cache_dir = fetchcache_test::tempdir();
    let url = hitcounter.url("/garbage_data/hello.png");

    let coordinator = FetchCoordinator::from_config(&config(cache_dir.path()), None).unwrap();
    let payload = coordinator.fetch(url.as_str()).await.unwrap();
    assert_eq!(payload, &b"hello.png"[..]);
    assert_eq!(hitcounter.accesses(), 1);

    // served from memory
    assert_eq!(coordinator.fetch(url.as_str()).await.unwrap(), payload);
    assert_eq!(hitcounter.accesses(), 0);

    // served from disk after a restart
    let coordinator = FetchCoordinator::from_config(&config(cache_dir.path()), None).unwrap();
    assert_eq!(coordinator.fetch(url.as_str()).await.unwrap(), payload);
    assert_eq!(hitcounter.accesses(), 0);
}

#[tokio::test]
async fn test_concurrent_requests_hit_server_once() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/delay/100ms/bytes/64/avatar.png");

    let coordinator = FetchCoordinator::from_config(&Config::default(), None).unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));

    let mut started = Vec::new();
    for _ in 0..8 {
        let received = received.clone();
        let sink = FnSink::new(move |delivery: Delivery| received.lock().unwrap().push(delivery));
        let status = coordinator.request(
            url.as_str(),
            ObserverId::next(),
            IdentityToken::default(),
            sink,
        );
        if let RequestStatus::Started(handle) = status {
            started.push(handle);
        }
    }
    assert_eq!(started.len(), 1);
    for handle in started {
        handle.await.unwrap();
    }

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 8);
    for delivery in received.iter() {
        assert_eq!(delivery.payload().map(|p| p.len()), Some(64));
    }
    // the delay route plus the redirect target
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_error_status() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/respond_statuscode/404/missing.png");

    let coordinator = FetchCoordinator::from_config(&Config::default(), None).unwrap();
    let err = coordinator.fetch(url.as_str()).await.unwrap_err();
    assert_eq!(err, CacheError::DownloadError("404 Not Found".into()));
    assert_eq!(err.kind(), ErrorKind::TransportFailure);

    // failures are not cached
    coordinator.fetch(url.as_str()).await.unwrap_err();
    assert_eq!(hitcounter.accesses(), 2);
}

#[tokio::test]
async fn test_timeout() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/delay/2s/garbage_data/slow.png");

    let config = Config {
        caches: CacheConfig {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        },
        ..Default::default()
    };
    let coordinator = FetchCoordinator::from_config(&config, None).unwrap();

    let err = coordinator.fetch(url.as_str()).await.unwrap_err();
    assert_eq!(err, CacheError::Timeout(Duration::from_millis(200)));
}

#[tokio::test]
async fn test_accept_header() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let url = hitcounter.url("/echo_accept/a.png");

    let config = Config {
        accept: "image/*".into(),
        ..Default::default()
    };
    let coordinator = FetchCoordinator::from_config(&config, None).unwrap();

    assert_eq!(coordinator.fetch(url.as_str()).await.unwrap(), &b"image/*"[..]);
}

#[tokio::test]
async fn test_cache_control_is_rewritten() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let cache_dir = fetchcache_test::tempdir();
    let url = hitcounter.url("/cache_headers/a.png");

    let config = Config {
        caches: CacheConfig {
            disk_cache_max_age: Duration::from_secs(3600),
            ..Default::default()
        },
        ..config(cache_dir.path())
    };
    let coordinator = FetchCoordinator::from_config(&config, None).unwrap();
    coordinator.fetch(url.as_str()).await.unwrap();

    let key = ResourceKey::from_url(&url);
    let record = coordinator.persistent().lookup(&key).unwrap();
    assert_eq!(record.headers["cache-control"], "max-age=3600");
    assert_eq!(record.status, 200);
}

#[tokio::test]
async fn test_return_cache_only() {
    fetchcache_test::setup();
    let hitcounter = HitCounter::new();
    let cache_dir = fetchcache_test::tempdir();
    let cached = hitcounter.url("/garbage_data/cached.png");
    let uncached = hitcounter.url("/garbage_data/uncached.png");

    let coordinator = FetchCoordinator::from_config(&config(cache_dir.path()), None).unwrap();
    coordinator.fetch(cached.as_str()).await.unwrap();
    assert_eq!(hitcounter.accesses(), 1);

    let config = Config {
        caches: CacheConfig {
            cache_policy: CachePolicy::ReturnCacheOnly,
            ..Default::default()
        },
        ..config(cache_dir.path())
    };
    let coordinator = FetchCoordinator::from_config(&config, None).unwrap();

    assert_eq!(
        coordinator.fetch(cached.as_str()).await.unwrap(),
        &b"cached.png"[..]
    );
    let err = coordinator.fetch(uncached.as_str()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::TransportFailure);
    assert_eq!(hitcounter.accesses(), 0);
}

#[test]
fn test_from_config_requires_runtime() {
    let err = FetchCoordinator::from_config(&Config::default(), None).unwrap_err();
    assert_eq!(err.to_string(), "no tokio runtime to run downloads on");
}
