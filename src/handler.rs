//! The request execution engine.
//!
//! [`RequestHandler`] drives one call through cache lookup, send, response
//! handling, and bounded retry. Configuration comes in through a builder;
//! the network session itself exists only between `open()` and `close()`.

use std::{sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use reqwest::{
    Method,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::{
    auth::Authoriser,
    cache::ResponseCache,
    core::{
        TenaceError,
        models::{RequestIdentity, ResponseRecord},
    },
    payload::{Payload, PayloadHandler, StringPayloadHandler},
    session::{RequestOptions, Session, SessionReply},
    status::{StatusHandler, StatusHandlerContext},
    timer::Timer,
};

/// Total per-request timeout when the builder sets none.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

const DEFAULT_USER_AGENT: &str = concat!("tenace/", env!("CARGO_PKG_VERSION"));

/// Why an attempt needs the retry budget: the send itself failed, or the
/// response came back bad and no handler resolved it.
enum Failure {
    Transport(reqwest::Error),
    Response(ResponseRecord),
}

/// Executes HTTP requests with caching, status-driven recovery, and backoff.
///
/// One handler is meant to be shared: every method takes `&self`, and
/// concurrent calls each run on a fresh copy of the retry timer while sharing
/// the session, the cache, and the rate-limit wait timer.
pub struct RequestHandler {
    client: reqwest::Client,
    base_headers: HeaderMap,
    authoriser: Option<Arc<dyn Authoriser>>,
    cache: Option<Arc<dyn ResponseCache>>,
    payload_handler: RwLock<Arc<dyn PayloadHandler>>,
    response_handlers: Vec<Arc<dyn StatusHandler>>,
    retry_timer: Option<Timer>,
    wait_timer: Option<Mutex<Timer>>,
    timeout: Duration,
    session: RwLock<Option<Arc<Session>>>,
}

impl RequestHandler {
    /// Create a new builder.
    pub fn builder() -> RequestHandlerBuilder {
        RequestHandlerBuilder::default()
    }

    /// Whether `open()` has run and `close()` has not.
    pub fn is_open(&self) -> bool {
        self.session.read().is_some()
    }

    /// The cache this handler persists through, when one is configured.
    pub fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        self.cache.as_ref()
    }

    /// The payload handler converting response bodies.
    pub fn payload_handler(&self) -> Arc<dyn PayloadHandler> {
        self.payload_handler.read().clone()
    }

    /// Replace the payload handler, propagating it to every cache repository
    /// so stored and returned payloads keep one format.
    pub fn set_payload_handler(&self, handler: Arc<dyn PayloadHandler>) {
        *self.payload_handler.write() = handler.clone();
        if let Some(cache) = &self.cache {
            cache.set_payload_handler(handler);
        }
    }

    fn session(&self) -> Option<Arc<Session>> {
        self.session.read().clone()
    }

    /* ----------------------- lifecycle ----------------------- */

    /// Open the session: connect the cache, align repository payload
    /// handlers, and seed the session headers from the authoriser.
    ///
    /// Opening an already-open handler is an error.
    pub async fn open(&self) -> Result<(), TenaceError> {
        if self.is_open() {
            return Err(TenaceError::Request("handler is already open".into()));
        }

        let session = Arc::new(Session::new(
            self.client.clone(),
            self.base_headers.clone(),
            self.cache.clone(),
            self.timeout,
        ));
        if let Some(cache) = &self.cache {
            cache.connect().await?;
            cache.set_payload_handler(self.payload_handler());
        }
        if let Some(authoriser) = &self.authoriser {
            match authoriser.authorise().await {
                Ok(headers) => session.merge_headers(&headers),
                Err(e) => {
                    // Unwind the cache connection so a failed open leaves
                    // the handler fully closed.
                    if let Some(cache) = &self.cache
                        && let Err(close_err) = cache.close().await
                    {
                        warn!(error = %close_err, "cache close failed while unwinding open");
                    }
                    return Err(e.into());
                }
            }
        }

        let mut guard = self.session.write();
        if guard.is_some() {
            return Err(TenaceError::Request("handler is already open".into()));
        }
        *guard = Some(session);
        debug!("request handler opened");
        Ok(())
    }

    /// Drop the session and close the cache. Safe to call at any point; the
    /// session is torn down even when the cache close fails.
    pub async fn close(&self) -> Result<(), TenaceError> {
        let session = self.session.write().take();
        if session.is_none() {
            return Ok(());
        }
        if let Some(cache) = &self.cache {
            cache.close().await?;
        }
        debug!("request handler closed");
        Ok(())
    }

    /// Re-run the authoriser and merge the fresh headers into the live
    /// session. No-op when no authoriser is configured.
    pub async fn authorise(&self) -> Result<(), TenaceError> {
        let Some(session) = self.session() else {
            return Err(TenaceError::Request("handler is not open".into()));
        };
        if let Some(authoriser) = &self.authoriser {
            let headers = authoriser.authorise().await?;
            session.merge_headers(&headers);
        }
        Ok(())
    }

    /* ----------------------- execution ----------------------- */

    /// Execute one request to completion: cached or fetched, recovered or
    /// failed, with retries bounded by this handler's retry timer.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        options: RequestOptions,
    ) -> Result<Payload, TenaceError> {
        self.execute(RequestIdentity::new(method, url), options).await
    }

    pub async fn get(&self, url: Url) -> Result<Payload, TenaceError> {
        self.request(Method::GET, url, RequestOptions::new()).await
    }

    pub async fn post(&self, url: Url, options: RequestOptions) -> Result<Payload, TenaceError> {
        self.request(Method::POST, url, options).await
    }

    pub async fn put(&self, url: Url, options: RequestOptions) -> Result<Payload, TenaceError> {
        self.request(Method::PUT, url, options).await
    }

    pub async fn delete(&self, url: Url) -> Result<Payload, TenaceError> {
        self.request(Method::DELETE, url, RequestOptions::new())
            .await
    }

    #[instrument(skip_all, fields(method = %identity.method, url = %identity.url))]
    async fn execute(
        &self,
        identity: RequestIdentity,
        options: RequestOptions,
    ) -> Result<Payload, TenaceError> {
        let Some(session) = self.session() else {
            return Err(TenaceError::Request("handler is not open".into()));
        };
        // Each call backs off independently; only the template lives on the
        // handler.
        let mut retry_timer = self.retry_timer.as_ref().map(Timer::fresh);

        loop {
            let failure = match session.request(&identity, &options).await {
                Ok(SessionReply::Cached(payload)) => return Ok(payload),
                Ok(SessionReply::Fetched(record)) => {
                    if record.is_success() {
                        let payload = self
                            .payload_handler()
                            .deserialize(Payload::Text(record.body))
                            .await?;
                        return Ok(payload);
                    }
                    if self.dispatch(&record, &session, retry_timer.as_ref()).await? {
                        continue;
                    }
                    Failure::Response(record)
                }
                Err(TenaceError::Transport(e)) => Failure::Transport(e),
                Err(e) => return Err(e),
            };
            self.backoff(&mut retry_timer, failure).await?;
        }
    }

    /// Walk the handler chain; the first handler matching the status decides.
    /// No match leaves the failure to the retry budget.
    async fn dispatch(
        &self,
        record: &ResponseRecord,
        session: &Session,
        retry_timer: Option<&Timer>,
    ) -> Result<bool, TenaceError> {
        let Some(handler) = self
            .response_handlers
            .iter()
            .find(|handler| handler.matches(record.status))
        else {
            debug!(
                status = record.status.as_u16(),
                body = record.excerpt(),
                "no response handler matches"
            );
            return Ok(false);
        };
        debug!(
            status = record.status.as_u16(),
            handler = handler.name(),
            "dispatching response handler"
        );
        let ctx = StatusHandlerContext {
            record,
            authoriser: self.authoriser.as_deref(),
            session: Some(session),
            retry_timer,
            wait_timer: self.wait_timer.as_ref(),
        };
        handler.handle(ctx).await
    }

    /// Spend one step of the retry budget, or fail with the attempt's cause
    /// when the budget is missing or spent.
    async fn backoff(
        &self,
        timer: &mut Option<Timer>,
        failure: Failure,
    ) -> Result<(), TenaceError> {
        match timer {
            Some(timer) if timer.can_increase() && *timer != 0.0 => {
                match &failure {
                    Failure::Transport(e) => warn!(
                        error = %e,
                        seconds = timer.value(),
                        "request failed, backing off"
                    ),
                    Failure::Response(record) => warn!(
                        status = record.status.as_u16(),
                        seconds = timer.value(),
                        "unresolved response status, backing off"
                    ),
                }
                timer.wait().await;
                timer.increase();
                Ok(())
            }
            _ => Err(match failure {
                Failure::Transport(e) => {
                    warn!(error = %e, "retries exhausted after transport failure");
                    TenaceError::Transport(e)
                }
                Failure::Response(record) => {
                    warn!(
                        status = record.status.as_u16(),
                        url = %record.identity.url,
                        "retries exhausted"
                    );
                    record.to_error().into()
                }
            }),
        }
    }
}

/* ----------------------- Builder ----------------------- */

/// Builder for [`RequestHandler`].
///
/// Everything is optional: the default handler performs plain requests with
/// no auth, no cache, no recovery chain, and no retries.
#[derive(Default)]
pub struct RequestHandlerBuilder {
    user_agent: Option<String>,
    headers: Vec<(String, String)>,
    authoriser: Option<Arc<dyn Authoriser>>,
    cache: Option<Arc<dyn ResponseCache>>,
    payload_handler: Option<Arc<dyn PayloadHandler>>,
    response_handlers: Vec<Arc<dyn StatusHandler>>,
    retry_timer: Option<Timer>,
    wait_timer: Option<Timer>,
    timeout: Option<Duration>,
}

impl RequestHandlerBuilder {
    /// Override the User-Agent.
    pub fn user_agent(mut self, ua: impl Into<String>) -> Self {
        self.user_agent = Some(ua.into());
        self
    }

    /// Add a default header sent with every request. Validated in `build()`.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Authorise requests with this collaborator. Its headers seed the
    /// session on `open()` and refresh after a 401.
    pub fn authoriser(mut self, authoriser: impl Authoriser + 'static) -> Self {
        self.authoriser = Some(Arc::new(authoriser));
        self
    }

    /// Persist successful responses through this cache. The handle is shared
    /// so the caller can keep registering repositories on it.
    pub fn cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Convert response bodies with this handler. Default: plain text.
    pub fn payload_handler(mut self, handler: impl PayloadHandler + 'static) -> Self {
        self.payload_handler = Some(Arc::new(handler));
        self
    }

    /// The recovery chain, walked in the given order. Default: empty, every
    /// unsuccessful status falls to the retry budget.
    pub fn response_handlers(mut self, handlers: Vec<Arc<dyn StatusHandler>>) -> Self {
        self.response_handlers = handlers;
        self
    }

    /// The per-call retry backoff template. Default: no retries.
    pub fn retry_timer(mut self, timer: Timer) -> Self {
        self.retry_timer = Some(timer);
        self
    }

    /// The shared backoff timer for rate limiting without `Retry-After`.
    /// Default: none.
    pub fn wait_timer(mut self, timer: Timer) -> Self {
        self.wait_timer = Some(timer);
        self
    }

    /// Set the total per-request timeout. Default: 300 seconds.
    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }

    pub fn build(self) -> Result<RequestHandler, TenaceError> {
        let mut base_headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            let value = HeaderValue::from_str(value)?;
            base_headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .user_agent(self.user_agent.as_deref().unwrap_or(DEFAULT_USER_AGENT))
            .build()?;

        Ok(RequestHandler {
            client,
            base_headers,
            authoriser: self.authoriser,
            cache: self.cache,
            payload_handler: RwLock::new(
                self.payload_handler
                    .unwrap_or_else(|| Arc::new(StringPayloadHandler)),
            ),
            response_handlers: self.response_handlers,
            retry_timer: self.retry_timer,
            wait_timer: self.wait_timer.map(Mutex::new),
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            session: RwLock::new(None),
        })
    }
}
