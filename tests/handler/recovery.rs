use std::sync::atomic::Ordering;

use httpmock::Method::GET;
use tenace::{RequestHandler, TenaceError, Timer, default_handlers};
use url::Url;

use crate::common::{CountingAuthoriser, setup_server, server_url};

#[tokio::test]
async fn bad_requests_are_terminal_even_with_retries_configured() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/bad");
        then.status(400).body("malformed query");
    });

    let handler = RequestHandler::builder()
        .response_handlers(default_handlers())
        .retry_timer(Timer::step_count(0.01, 5, 0.0))
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let err = handler.get(server_url(&server, "/bad")).await.unwrap_err();
    let TenaceError::Response(response) = err else {
        panic!("expected a response error, got {err:?}");
    };
    assert_eq!(response.status, 400);
    assert_eq!(response.body, "malformed query");
    assert_eq!(mock.hits(), 1, "client errors must not be retried");

    handler.close().await.unwrap();
}

#[tokio::test]
async fn unauthorised_calls_refresh_and_retry_once() {
    let server = setup_server();
    let rejected = server.mock(|when, then| {
        when.method(GET)
            .path("/private")
            .header("authorization", "Bearer token-1");
        then.status(401).body("token expired");
    });
    let accepted = server.mock(|when, then| {
        when.method(GET)
            .path("/private")
            .header("authorization", "Bearer token-2");
        then.status(200).body(r#"{"ok": true}"#);
    });

    let (authoriser, calls) = CountingAuthoriser::new();
    // A spent retry budget: recovery must come from the handler chain alone.
    let handler = RequestHandler::builder()
        .authoriser(authoriser)
        .response_handlers(default_handlers())
        .retry_timer(Timer::step_count(0.01, 0, 1.0))
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let payload = handler.get(server_url(&server, "/private")).await.unwrap();

    assert_eq!(payload.as_text(), Some(r#"{"ok": true}"#));
    rejected.assert();
    accepted.assert();
    assert_eq!(calls.load(Ordering::SeqCst), 2, "open plus one refresh");

    handler.close().await.unwrap();
}

#[tokio::test]
async fn server_errors_consume_the_retry_budget() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/flaky");
        then.status(500).body("upstream down");
    });

    let handler = RequestHandler::builder()
        .response_handlers(default_handlers())
        .retry_timer(Timer::step_count(0.01, 2, 0.0))
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let err = handler.get(server_url(&server, "/flaky")).await.unwrap_err();
    let TenaceError::Response(response) = err else {
        panic!("expected a response error, got {err:?}");
    };
    assert_eq!(response.status, 500);
    assert_eq!(mock.hits(), 3, "the first attempt plus two retries");

    handler.close().await.unwrap();
}

#[tokio::test]
async fn unhandled_statuses_without_a_budget_fail_immediately() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/busy");
        then.status(503).body("maintenance");
    });

    // No chain, no retry timer: the first bad status is final.
    let handler = RequestHandler::builder().build().unwrap();
    handler.open().await.unwrap();

    let err = handler.get(server_url(&server, "/busy")).await.unwrap_err();
    let TenaceError::Response(response) = err else {
        panic!("expected a response error, got {err:?}");
    };
    assert_eq!(response.status, 503);
    assert_eq!(mock.hits(), 1);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn rate_limited_calls_back_off_until_the_budget_is_spent() {
    let server = setup_server();
    let mock = server.mock(|when, then| {
        when.method(GET).path("/limited");
        then.status(429).body("slow down");
    });

    let handler = RequestHandler::builder()
        .response_handlers(default_handlers())
        .retry_timer(Timer::step_count(0.01, 2, 0.0))
        .wait_timer(Timer::step_ceiling(0.0, 0.05, 0.01))
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let err = handler
        .get(server_url(&server, "/limited"))
        .await
        .unwrap_err();
    let TenaceError::Response(response) = err else {
        panic!("expected a response error, got {err:?}");
    };
    assert_eq!(response.status, 429);
    assert_eq!(mock.hits(), 3);

    handler.close().await.unwrap();
}

#[tokio::test]
async fn transport_failures_without_a_timer_propagate_immediately() {
    // Nothing listens on port 1; the connection is refused outright.
    let handler = RequestHandler::builder().build().unwrap();
    handler.open().await.unwrap();

    let err = handler
        .get(Url::parse("http://127.0.0.1:1/unreachable").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TenaceError::Transport(_)), "got {err:?}");

    handler.close().await.unwrap();
}

#[tokio::test]
async fn transport_failures_with_a_timer_retry_then_reraise() {
    let handler = RequestHandler::builder()
        .retry_timer(Timer::step_count(0.01, 2, 0.0))
        .build()
        .unwrap();
    handler.open().await.unwrap();

    let err = handler
        .get(Url::parse("http://127.0.0.1:1/unreachable").unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, TenaceError::Transport(_)), "got {err:?}");

    handler.close().await.unwrap();
}
