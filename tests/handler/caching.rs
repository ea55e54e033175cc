use std::sync::Arc;

use httpmock::Method::GET;
use reqwest::Method;
use tenace::{
    JsonPayloadHandler, KeySource, RequestHandler, RequestOptions, ResponseCache, SqliteCache,
    TenaceError, Timer,
};

use crate::common::{
    api_key, api_repository_settings, fixed_getter, paged_repository_settings, setup_server,
    server_url,
};

async fn cached_handler() -> (Arc<SqliteCache>, RequestHandler) {
    let cache = Arc::new(SqliteCache::in_memory().repository_getter(fixed_getter("widgets")));
    cache
        .create_repository(api_repository_settings("widgets"))
        .await
        .unwrap();
    let handler = RequestHandler::builder()
        .cache(cache.clone())
        .build()
        .unwrap();
    handler.open().await.unwrap();
    (cache, handler)
}

#[tokio::test]
async fn cache_hits_skip_the_network() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/widgets");
        then.status(200).body(r#"{"n": 1}"#);
    });

    let (cache, handler) = cached_handler().await;
    let url = server_url(&server, "/api/widgets");

    let first = handler.get(url.clone()).await.unwrap();
    assert_eq!(mock.hits(), 1);

    let second = handler.get(url).await.unwrap();
    assert_eq!(mock.hits(), 1, "the repeat call must be served from cache");
    assert_eq!(first, second);

    let repository = cache.repository("widgets").unwrap();
    assert_eq!(repository.count(true).await.unwrap(), 1);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn query_params_are_part_of_the_cache_identity() {
    let server = setup_server();
    let page_one = server.mock(|when, then| {
        when.method(GET).path("/api/widgets").query_param("page", "1");
        then.status(200).body("page one");
    });
    let page_two = server.mock(|when, then| {
        when.method(GET).path("/api/widgets").query_param("page", "2");
        then.status(200).body("page two");
    });

    let cache = Arc::new(SqliteCache::in_memory().repository_getter(fixed_getter("widgets")));
    cache
        .create_repository(paged_repository_settings("widgets"))
        .await
        .unwrap();
    let handler = RequestHandler::builder()
        .cache(cache.clone())
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let url = server_url(&server, "/api/widgets");
    let first = handler
        .request(Method::GET, url.clone(), RequestOptions::new().query("page", "1"))
        .await
        .unwrap();
    assert_eq!(first.as_text(), Some("page one"));

    let second = handler
        .request(Method::GET, url.clone(), RequestOptions::new().query("page", "2"))
        .await
        .unwrap();
    assert_eq!(
        second.as_text(),
        Some("page two"),
        "a call differing only in its query must not reuse the first row"
    );

    let repeat = handler
        .request(Method::GET, url, RequestOptions::new().query("page", "2"))
        .await
        .unwrap();
    assert_eq!(repeat.as_text(), Some("page two"));
    assert_eq!(page_one.hits(), 1);
    assert_eq!(page_two.hits(), 1, "the repeat call must be served from cache");

    let repository = cache.repository("widgets").unwrap();
    assert_eq!(repository.count(true).await.unwrap(), 2);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn persist_false_bypasses_the_cache_in_both_directions() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/widgets");
        then.status(200).body("fresh");
    });

    let (cache, handler) = cached_handler().await;
    let url = server_url(&server, "/api/widgets");
    let repository = cache.repository("widgets").unwrap();

    handler
        .request(Method::GET, url.clone(), RequestOptions::new().persist(false))
        .await
        .unwrap();
    assert_eq!(mock.hits(), 1);
    assert_eq!(repository.count(true).await.unwrap(), 0, "nothing was written");

    // Populate the cache, then show persist(false) still goes upstream.
    handler.get(url.clone()).await.unwrap();
    assert_eq!(mock.hits(), 2);
    assert_eq!(repository.count(true).await.unwrap(), 1);

    handler
        .request(Method::GET, url, RequestOptions::new().persist(false))
        .await
        .unwrap();
    assert_eq!(mock.hits(), 3, "persist(false) must not read the cache");

    handler.close().await.unwrap();
}

#[tokio::test]
async fn failed_responses_are_never_persisted() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/api/widgets");
        then.status(404).body("no widgets today");
    });

    let (cache, handler) = cached_handler().await;

    let err = handler
        .get(server_url(&server, "/api/widgets"))
        .await
        .unwrap_err();
    assert!(matches!(err, TenaceError::Response(_)), "got {err:?}");
    mock.assert();

    let repository = cache.repository("widgets").unwrap();
    assert_eq!(repository.count(true).await.unwrap(), 0);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn uncacheable_urls_always_hit_the_network() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200).body("ok");
    });

    let (cache, handler) = cached_handler().await;
    let url = server_url(&server, "/health");

    handler.get(url.clone()).await.unwrap();
    handler.get(url).await.unwrap();

    assert_eq!(mock.hits(), 2);
    let repository = cache.repository("widgets").unwrap();
    assert_eq!(repository.count(true).await.unwrap(), 0);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn open_propagates_the_payload_handler_to_repositories() {
    let server = setup_server();
    server.mock(|when, then| {
        when.method(GET).path("/api/widgets");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"id": 7}"#);
    });

    let cache = Arc::new(SqliteCache::in_memory().repository_getter(fixed_getter("widgets")));
    cache
        .create_repository(api_repository_settings("widgets"))
        .await
        .unwrap();
    let handler = RequestHandler::builder()
        .cache(cache.clone())
        .payload_handler(JsonPayloadHandler::new())
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let payload = handler
        .get(server_url(&server, "/api/widgets"))
        .await
        .unwrap();
    assert_eq!(payload.as_json().unwrap()["id"], serde_json::json!(7));

    // The repository stores and returns JSON too, not plain text.
    let repository = cache.repository("widgets").unwrap();
    let cached = repository
        .get_response(KeySource::Key(api_key("GET", "/api/widgets")))
        .await
        .unwrap()
        .expect("a cached row");
    assert!(cached.as_json().is_some());

    handler.close().await.unwrap();
}

#[tokio::test]
async fn handler_lifecycle_drives_the_cache_connection() {
    let cache = Arc::new(SqliteCache::in_memory());
    cache
        .create_repository(api_repository_settings("widgets"))
        .await
        .unwrap();
    let handler = RequestHandler::builder()
        .cache(cache.clone())
        .build()
        .unwrap();

    assert!(!cache.is_connected());
    handler.open().await.unwrap();
    assert!(cache.is_connected());
    handler.close().await.unwrap();
    assert!(!cache.is_connected());
}

#[tokio::test]
async fn concurrent_calls_use_independent_retry_timers() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/flaky");
        then.status(500).body("down");
    });

    let handler = RequestHandler::builder()
        .retry_timer(Timer::step_count(0.02, 2, 0.0))
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let url = server_url(&server, "/flaky");
    let (a, b) = futures::future::join(handler.get(url.clone()), handler.get(url)).await;

    assert!(a.is_err());
    assert!(b.is_err());
    // Three attempts each; a shared timer would have cut the second call short.
    assert_eq!(mock.hits(), 6);

    handler.close().await.unwrap();
}
