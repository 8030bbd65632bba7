use std::time::Duration;

use fetchcache::FetchCache;
use fetchcache::caching::RequestOptions;
use fetchcache::config::Config;
use fetchcache_test as test;

pub use test::{HitCounter, TempDir, setup, tempdir};

/// Creates a cache persisting to the given directory.
///
/// The `update_config` closure can modify the default configuration before the cache is
/// created. Creating a second cache on the same directory simulates a process restart.
pub fn open_cache(cache_dir: &TempDir, update_config: impl FnOnce(&mut Config)) -> FetchCache {
    let mut config = Config {
        cache_dir: Some(cache_dir.path().to_owned()),
        build: "test".to_owned(),
        ..Default::default()
    };
    update_config(&mut config);

    FetchCache::from_config(&config).unwrap()
}

/// Setup tests and create a cache on a fresh temporary directory.
///
/// Keep the returned [`TempDir`] as guard until the test has finished.
pub fn setup_cache(update_config: impl FnOnce(&mut Config)) -> (FetchCache, TempDir) {
    test::setup();

    let cache_dir = test::tempdir();
    let cache = open_cache(&cache_dir, update_config);
    (cache, cache_dir)
}

/// Options allowing cached results, persisted for an hour.
pub fn persisted() -> RequestOptions {
    RequestOptions {
        allow_cache: true,
        local_storage_expiration: Some(Duration::from_secs(3600)),
        ..Default::default()
    }
}
