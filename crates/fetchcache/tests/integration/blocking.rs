use crate::{HitCounter, persisted, setup_cache};

#[test]
fn test_blocking_and_async_share_tiers() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let server = runtime.block_on(async { HitCounter::new() });
    let (cache, _cache_dir) = setup_cache(|_| ());
    let url = server.url("text/hello");

    let response = cache.fetch_cached_blocking(&url, None, persisted()).unwrap();
    assert_eq!(response.payload.as_text(), Some("hello"));
    assert_eq!(response.status, 200);

    cache.fetch_cached_blocking(&url, None, persisted()).unwrap();
    let response = runtime
        .block_on(cache.fetch_cached(&url, None, persisted()))
        .unwrap();
    assert_eq!(response.payload.as_text(), Some("hello"));
    assert_eq!(server.accesses(), 1);
}
