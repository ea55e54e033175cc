//! The send layer: one `reqwest` client plus the shared header set and the
//! optional response cache.
//!
//! A [`Session`] lives from `open()` to `close()` on the request handler.
//! Its header map is shared and mutable so a re-authorisation triggered by
//! one in-flight request benefits every later one.

use std::{sync::Arc, time::Duration};

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    cache::ResponseCache,
    core::{
        TenaceError,
        models::{RequestIdentity, ResponseRecord},
    },
    payload::Payload,
};

/// Per-call request configuration.
///
/// Defaults: no extra headers or query, no body, caching on, the session's
/// timeout.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<RequestBody>,
    persist: bool,
    timeout: Option<Duration>,
}

/// A request body, serialized at send time.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    /// Sent as `application/json`.
    Json(Value),
    /// Sent as-is, with no content type.
    Text(String),
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            headers: Vec::new(),
            query: Vec::new(),
            body: None,
            persist: true,
            timeout: None,
        }
    }
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header for this request only. Overrides a session header with
    /// the same name.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append a query parameter to the request URL.
    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    /// Send a JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Send a plain text body.
    pub fn text(mut self, body: impl Into<String>) -> Self {
        self.body = Some(RequestBody::Text(body.into()));
        self
    }

    /// Whether this call reads from and writes to the response cache.
    /// Default: true.
    pub fn persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Override the session timeout for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// The identity this call sends and caches under: the base URL with any
    /// per-call query parameters folded in.
    fn effective_identity(&self, base: &RequestIdentity) -> RequestIdentity {
        if self.query.is_empty() {
            return base.clone();
        }
        let mut url = base.url.clone();
        url.query_pairs_mut().extend_pairs(&self.query);
        RequestIdentity::new(base.method.clone(), url)
    }
}

/// What a session call produced: a cached payload, or a live exchange the
/// caller still has to judge.
#[derive(Debug)]
pub enum SessionReply {
    /// Served from the cache; no request went out.
    Cached(Payload),
    /// Fetched from the network. Any status, success or not.
    Fetched(ResponseRecord),
}

/// An open connection scope: client, shared headers, optional cache.
pub struct Session {
    client: reqwest::Client,
    headers: RwLock<HeaderMap>,
    cache: Option<Arc<dyn ResponseCache>>,
    timeout: Duration,
}

impl Session {
    pub fn new(
        client: reqwest::Client,
        headers: HeaderMap,
        cache: Option<Arc<dyn ResponseCache>>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            headers: RwLock::new(headers),
            cache,
            timeout,
        }
    }

    /// A snapshot of the current shared headers.
    pub fn headers(&self) -> HeaderMap {
        self.headers.read().clone()
    }

    /// Merge headers into the shared set, overriding same-named entries.
    pub fn merge_headers(&self, headers: &HeaderMap) {
        let mut guard = self.headers.write();
        for (name, value) in headers {
            guard.insert(name.clone(), value.clone());
        }
    }

    /// The cache this session persists through, when one is attached.
    pub fn cache(&self) -> Option<&Arc<dyn ResponseCache>> {
        self.cache.as_ref()
    }

    /// Execute one exchange: cache lookup, network send, persistence.
    ///
    /// Per-call query parameters are folded into the identity up front, so
    /// the cache is keyed on the same URL the request goes out with.
    ///
    /// With `persist` off the cache is bypassed in both directions. Cache
    /// failures never fail the call; they are logged and the network result
    /// stands.
    pub async fn request(
        &self,
        identity: &RequestIdentity,
        options: &RequestOptions,
    ) -> Result<SessionReply, TenaceError> {
        let identity = options.effective_identity(identity);
        if options.persist && let Some(cache) = &self.cache {
            match cache.get_response(&identity).await {
                Ok(Some(payload)) => {
                    debug!(method = %identity.method, url = %identity.url, "cache hit");
                    return Ok(SessionReply::Cached(payload));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(url = %identity.url, error = %e, "cache read failed, sending request");
                }
            }
        }

        let record = self.send(&identity, options).await?;

        if options.persist
            && record.is_success()
            && let Some(cache) = &self.cache
            && let Err(e) = cache.save_response(&record).await
        {
            warn!(url = %identity.url, error = %e, "cache write failed");
        }

        Ok(SessionReply::Fetched(record))
    }

    async fn send(
        &self,
        identity: &RequestIdentity,
        options: &RequestOptions,
    ) -> Result<ResponseRecord, TenaceError> {
        let mut headers = self.headers();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())?;
            let value = HeaderValue::from_str(value)?;
            headers.insert(name, value);
        }

        let mut builder = self
            .client
            .request(identity.method.clone(), identity.url.clone())
            .headers(headers)
            .timeout(options.timeout.unwrap_or(self.timeout));

        match &options.body {
            Some(RequestBody::Json(value)) => builder = builder.json(value),
            Some(RequestBody::Text(text)) => builder = builder.body(text.clone()),
            None => {}
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.text().await?;
        debug!(
            method = %identity.method,
            url = %identity.url,
            status = status.as_u16(),
            "received response"
        );

        Ok(ResponseRecord {
            identity: identity.clone(),
            status,
            headers,
            body,
        })
    }
}
