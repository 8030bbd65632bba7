use std::time::Duration;

use fetchcache::caching::{FetchError, FsStore, PersistentStore, RequestOptions};
use serde_json::{Value, json};

use crate::{HitCounter, open_cache, persisted, setup_cache};

#[tokio::test]
async fn test_restart_serves_persisted_entries() {
    let (cache, cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();
    let url = server.url("json/lists");

    let value: Value = cache.fetch_json(&url, None, persisted()).await.unwrap();
    assert_eq!(value, json!({"path": "lists"}));
    assert_eq!(server.accesses(), 1);
    drop(cache);

    let restarted = open_cache(&cache_dir, |_| ());
    let value: Value = restarted.fetch_json(&url, None, persisted()).await.unwrap();
    assert_eq!(value, json!({"path": "lists"}));
    assert_eq!(server.accesses(), 0);
}

#[tokio::test]
async fn test_entries_without_ttl_stay_in_memory() {
    let (cache, cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();
    let url = server.url("text/hello");
    let options = RequestOptions {
        allow_cache: true,
        ..Default::default()
    };

    cache.fetch_cached(&url, None, options.clone()).await.unwrap();
    cache.fetch_cached(&url, None, options.clone()).await.unwrap();
    assert_eq!(server.accesses(), 1);

    let restarted = open_cache(&cache_dir, |_| ());
    restarted.fetch_cached(&url, None, options).await.unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_build_change() {
    let (cache, cache_dir) = setup_cache(|config| config.build = "a".into());
    let server = HitCounter::new();
    let url = server.url("text/hello");

    cache.fetch_cached(&url, None, persisted()).await.unwrap();
    assert_eq!(server.accesses(), 1);

    let same_build = open_cache(&cache_dir, |config| config.build = "a".into());
    same_build.fetch_cached(&url, None, persisted()).await.unwrap();
    assert_eq!(server.accesses(), 0);

    let new_build = open_cache(&cache_dir, |config| config.build = "b".into());
    new_build.fetch_cached(&url, None, persisted()).await.unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_failures_are_not_persisted() {
    let (cache, cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();
    let url = server.url("respond_statuscode/404/list");

    let err = cache.fetch_cached(&url, None, persisted()).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(err.data(), Some(&json!({"error": "list"})));

    // failures are kept in memory
    cache.fetch_cached(&url, None, persisted()).await.unwrap_err();
    assert_eq!(server.accesses(), 1);

    let restarted = open_cache(&cache_dir, |_| ());
    restarted.fetch_cached(&url, None, persisted()).await.unwrap_err();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_transport_failure() {
    let (cache, _cache_dir) = setup_cache(|config| {
        config.transport.connect_timeout = Duration::from_secs(1);
    });

    let err = cache
        .fetch_cached("http://127.0.0.1:1/unreachable", None, persisted())
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::Transport(_)));
    assert_eq!(err.status(), 0);
}

#[tokio::test]
async fn test_purge() {
    let (cache, cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();

    for path in ["text/a", "text/b"] {
        cache.fetch_cached(&server.url(path), None, persisted()).await.unwrap();
    }
    assert_eq!(server.accesses(), 2);

    insta::assert_debug_snapshot!(cache.purge(false), @r###"
    PurgeStats {
        removed_expired: 0,
        removed_legacy: 0,
        removed_orphans: 0,
        retained: 2,
    }
    "###);

    insta::assert_debug_snapshot!(cache.purge(true), @r###"
    PurgeStats {
        removed_expired: 2,
        removed_legacy: 0,
        removed_orphans: 0,
        retained: 0,
    }
    "###);

    let restarted = open_cache(&cache_dir, |_| ());
    restarted
        .fetch_cached(&server.url("text/a"), None, persisted())
        .await
        .unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_startup_purge() {
    let (cache, cache_dir) = setup_cache(|config| config.caches.purge_delay = Duration::ZERO);

    let store = FsStore::new(cache_dir.path()).unwrap();
    store.set("fetchcache:orphan", "{}").unwrap();

    let stats = cache.spawn_purge().unwrap().await.unwrap().unwrap();
    assert_eq!(stats.removed_orphans, 1);
    assert_eq!(store.get("fetchcache:orphan").unwrap(), None);
    assert!(cache.spawn_purge().is_none());
}
