use std::sync::{Arc, atomic::Ordering};

use httpmock::Method::GET;
use reqwest::Method;
use tenace::{RequestHandler, RequestOptions, ResponseCache, SqliteCache, TenaceError};

use crate::common::{CountingAuthoriser, FailingAuthoriser, setup_server, server_url};

#[tokio::test]
async fn requests_before_open_are_an_error() {
    let handler = RequestHandler::builder().build().unwrap();

    let err = handler
        .get(url::Url::parse("https://api.test/thing").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TenaceError::Request(_)), "got {err:?}");
}

#[tokio::test]
async fn double_open_errors_and_close_is_idempotent() {
    let handler = RequestHandler::builder().build().unwrap();

    handler.open().await.unwrap();
    assert!(handler.is_open());

    let err = handler.open().await.unwrap_err();
    assert!(matches!(err, TenaceError::Request(_)), "got {err:?}");

    handler.close().await.unwrap();
    assert!(!handler.is_open());
    handler.close().await.unwrap();

    let err = handler
        .get(url::Url::parse("https://api.test/thing").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TenaceError::Request(_)), "got {err:?}");
}

#[tokio::test]
async fn open_seeds_session_headers_from_the_authoriser() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/private")
            .header("authorization", "Bearer token-1");
        then.status(200).body("let in");
    });

    let (authoriser, calls) = CountingAuthoriser::new();
    let handler = RequestHandler::builder()
        .authoriser(authoriser)
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let payload = handler.get(server_url(&server, "/private")).await.unwrap();
    assert_eq!(payload.as_text(), Some("let in"));
    mock.assert();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn per_call_headers_override_session_headers() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET)
            .path("/traced")
            .header("x-trace", "call")
            .header_count("^x-trace$", ".*", 1);
        then.status(200).body("traced");
    });

    let handler = RequestHandler::builder()
        .header("x-trace", "session")
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let payload = handler
        .request(
            Method::GET,
            server_url(&server, "/traced"),
            RequestOptions::new().header("x-trace", "call"),
        )
        .await
        .unwrap();
    assert_eq!(payload.as_text(), Some("traced"));
    mock.assert();

    handler.close().await.unwrap();
}

#[tokio::test]
async fn authorise_refreshes_the_live_session() {
    let server = setup_server();
    let stale = server.mock(|when, then| {
        when.method(GET)
            .path("/private")
            .header("authorization", "Bearer token-1");
        then.status(200).body("first token");
    });
    let fresh = server.mock(|when, then| {
        when.method(GET)
            .path("/private")
            .header("authorization", "Bearer token-2");
        then.status(200).body("second token");
    });

    let (authoriser, calls) = CountingAuthoriser::new();
    let handler = RequestHandler::builder()
        .authoriser(authoriser)
        .build()
        .unwrap();
    handler.open().await.unwrap();

    handler.get(server_url(&server, "/private")).await.unwrap();
    handler.authorise().await.unwrap();
    let payload = handler.get(server_url(&server, "/private")).await.unwrap();

    assert_eq!(payload.as_text(), Some("second token"));
    stale.assert();
    fresh.assert();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn failed_authorisation_unwinds_open() {
    let cache: Arc<SqliteCache> = Arc::new(SqliteCache::in_memory());
    let handler = RequestHandler::builder()
        .authoriser(FailingAuthoriser)
        .cache(cache.clone())
        .build()
        .unwrap();

    let err = handler.open().await.unwrap_err();
    assert!(matches!(err, TenaceError::Auth(_)), "got {err:?}");
    assert!(!handler.is_open());
    assert!(!cache.is_connected());
}
