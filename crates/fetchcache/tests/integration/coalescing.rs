use std::time::Duration;

use bytes::Bytes;
use fetchcache::caching::{RequestOptions, normalize};
use futures::future::join_all;

use crate::{HitCounter, setup_cache};

#[tokio::test]
async fn test_concurrent_requests_coalesce() {
    let (cache, _cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();
    let url = server.url("delay/200ms/list");

    let requests = (0..3).map(|_| cache.fetch_cached(&url, None, Default::default()));
    for response in join_all(requests).await {
        assert_eq!(response.unwrap().payload.as_text(), Some("list"));
    }
    assert_eq!(server.accesses(), 1);

    // the request completed, so the next one starts over
    cache.fetch_cached(&url, None, Default::default()).await.unwrap();
    assert_eq!(server.accesses(), 1);
}

#[tokio::test]
async fn test_in_flight_tracking() {
    let (cache, _cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();
    let url = server.url("delay/200ms/list");
    let key = normalize(&url, false, Default::default()).cache_key.unwrap();

    let request = tokio::spawn({
        let cache = cache.clone();
        let url = url.clone();
        async move { cache.fetch_cached(&url, None, Default::default()).await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(cache.is_in_flight(&key));

    request.await.unwrap().unwrap();
    assert!(!cache.is_in_flight(&key));
}

#[tokio::test]
async fn test_requests_with_body() {
    let (cache, _cache_dir) = setup_cache(|_| ());
    let server = HitCounter::new();
    let url = server.url("echo/items");
    let body = || Some(Bytes::from_static(b"{\"query\": \"open\"}"));

    let requests = (0..2).map(|_| cache.fetch_cached(&url, body(), Default::default()));
    for response in join_all(requests).await {
        assert_eq!(response.unwrap().payload.as_text(), Some("{\"query\": \"open\"}"));
    }
    assert_eq!(server.accesses(), 2);

    // with a post cache key, requests with a body are coalesced and cached
    let options = RequestOptions {
        allow_cache: true,
        post_cache_key: Some("open".into()),
        ..Default::default()
    };
    let requests = (0..2).map(|_| cache.fetch_cached(&url, body(), options.clone()));
    for response in join_all(requests).await {
        response.unwrap();
    }
    cache.fetch_cached(&url, body(), options).await.unwrap();
    assert_eq!(server.accesses(), 1);
}
