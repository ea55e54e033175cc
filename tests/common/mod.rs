#![allow(dead_code)]

use std::sync::{
    Arc, Once,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use httpmock::MockServer;
use reqwest::{
    Method, StatusCode,
    header::{AUTHORIZATION, HeaderMap, HeaderValue},
};
use tenace::{
    AuthError, Authoriser, CacheKey, KeyPart, RepositoryGetter, RepositorySettings,
    RequestIdentity, ResponseCache, ResponseRecord,
};
use url::Url;

static TRACING: Once = Once::new();

/// Install a fmt subscriber once per test binary; `RUST_LOG` selects output.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

pub fn setup_server() -> MockServer {
    init_tracing();
    MockServer::start()
}

pub fn server_url(server: &MockServer, path: &str) -> Url {
    Url::parse(&server.url(path)).unwrap()
}

/// A synthetic exchange for driving status handlers without a server.
pub fn record(status: u16, url: &str, body: &str) -> ResponseRecord {
    ResponseRecord {
        identity: RequestIdentity::new(Method::GET, Url::parse(url).unwrap()),
        status: StatusCode::from_u16(status).unwrap(),
        headers: HeaderMap::new(),
        body: body.to_string(),
    }
}

pub fn record_with_headers(
    status: u16,
    url: &str,
    headers: &[(&'static str, &str)],
) -> ResponseRecord {
    let mut record = record(status, url, "");
    for (name, value) in headers {
        record
            .headers
            .insert(*name, HeaderValue::from_str(value).unwrap());
    }
    record
}

/// Hands out `Bearer token-1`, `token-2`, ... and counts how often it ran.
pub struct CountingAuthoriser {
    calls: Arc<AtomicUsize>,
}

impl CountingAuthoriser {
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Self {
                calls: calls.clone(),
            },
            calls,
        )
    }
}

#[async_trait]
impl Authoriser for CountingAuthoriser {
    async fn authorise(&self) -> Result<HeaderMap, AuthError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let mut headers = HeaderMap::new();
        let value =
            HeaderValue::from_str(&format!("Bearer token-{call}")).map_err(AuthError::Encoding)?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}

/// An authoriser that always fails, for open() unwind tests.
pub struct FailingAuthoriser;

#[async_trait]
impl Authoriser for FailingAuthoriser {
    async fn authorise(&self) -> Result<HeaderMap, AuthError> {
        Err(AuthError::Failed("credentials rejected".into()))
    }
}

/// Settings keying on `(method, url path)`, cacheable only under `/api/`.
pub fn api_repository_settings(name: &str) -> RepositorySettings {
    RepositorySettings::builder(name)
        .fields(["method", "path"])
        .key(|identity| {
            if !identity.url.path().starts_with("/api/") {
                return None;
            }
            let mut key = CacheKey::new();
            key.push(identity.method.as_str());
            key.push(identity.url.path());
            Some(key)
        })
        .build()
        .unwrap()
}

/// A key for the settings above, from the raw method and path.
pub fn api_key(method: &str, path: &str) -> CacheKey {
    [KeyPart::from(method), KeyPart::from(path)]
        .into_iter()
        .collect()
}

/// Settings keying on `(method, path, query string)`, cacheable only under
/// `/api/`.
pub fn paged_repository_settings(name: &str) -> RepositorySettings {
    RepositorySettings::builder(name)
        .fields(["method", "path", "query"])
        .key(|identity| {
            if !identity.url.path().starts_with("/api/") {
                return None;
            }
            let mut key = CacheKey::new();
            key.push(identity.method.as_str());
            key.push(identity.url.path());
            key.push(identity.url.query().unwrap_or_default());
            Some(key)
        })
        .build()
        .unwrap()
}

/// Route every URL to the named repository.
pub fn fixed_getter(name: &str) -> RepositoryGetter {
    let name = name.to_string();
    Arc::new(move |cache: &dyn ResponseCache, _url: &Url| cache.repository(&name))
}
