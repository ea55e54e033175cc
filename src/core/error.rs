use thiserror::Error;

/// The primary error type for all fallible operations in this crate.
#[derive(Debug, Error)]
pub enum TenaceError {
    /// A connector-level failure: DNS resolution, connection reset, timeout.
    /// Retried when a retry timer is configured, otherwise fatal.
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// A provided URL could not be parsed.
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// A header name built from caller-supplied text was invalid.
    #[error("invalid header name: {0}")]
    HeaderName(#[from] reqwest::header::InvalidHeaderName),

    /// A header value built from caller-supplied text was invalid.
    #[error("invalid header value: {0}")]
    HeaderValue(#[from] reqwest::header::InvalidHeaderValue),

    /// The server returned a status no handler resolved and the retry budget
    /// could not absorb.
    #[error(transparent)]
    Response(#[from] ResponseError),

    /// A status handler was invoked outside its declared match set.
    #[error(transparent)]
    StatusHandler(#[from] StatusHandlerError),

    /// A response cache operation failed.
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// A payload could not be serialized or deserialized.
    #[error(transparent)]
    Payload(#[from] PayloadError),

    /// The authoriser could not produce credentials.
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Lifecycle misuse: the handler was opened twice or used while closed.
    #[error("request failed: {0}")]
    Request(String),
}

/// An unsuccessful HTTP response treated as terminal.
///
/// Carries the status, the URL that produced it, and an excerpt of the
/// response body for diagnostics.
#[derive(Debug, Clone, Error)]
#[error("unexpected response status {status} at {url}")]
pub struct ResponseError {
    /// The HTTP status code.
    pub status: u16,
    /// The URL that returned the error.
    pub url: String,
    /// A bounded excerpt of the response body.
    pub body: String,
}

/// A status handler was invoked on a response outside its match set.
///
/// This is a configuration bug in the caller's handler chain and is never
/// silently swallowed.
#[derive(Debug, Clone, Error)]
#[error("{handler} cannot handle status {status}")]
pub struct StatusHandlerError {
    /// Name of the misapplied handler.
    pub handler: &'static str,
    /// The status code the handler was asked to process.
    pub status: u16,
}

/// Errors raised by the response cache and its repositories.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A repository was used before `connect()` or after `close()`.
    #[error("cache is not connected")]
    Disconnected,

    /// A repository with this name is already registered.
    #[error("repository {0:?} is already registered")]
    DuplicateRepository(String),

    /// Repository settings were incomplete or inconsistent.
    #[error("invalid repository settings: {0}")]
    Settings(String),

    /// A batch of requests resolved to more than one repository.
    #[error("requests resolve to multiple repositories: {0}")]
    AmbiguousRepositories(String),

    /// A derived key's length does not match the repository's key fields.
    #[error("key has {got} parts but the repository declares {expected} fields")]
    KeyArity {
        /// Number of key fields declared in the repository settings.
        expected: usize,
        /// Number of parts in the offending key.
        got: usize,
    },

    /// The storage backend reported a failure.
    #[error("cache backend error: {0}")]
    Backend(String),

    /// A stored or storable payload could not be converted.
    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Errors raised while converting between wire bytes and payload values.
#[derive(Debug, Error)]
pub enum PayloadError {
    /// The payload was not valid JSON.
    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The payload was expected to be text but is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Errors raised by an [`Authoriser`](crate::auth::Authoriser).
#[derive(Debug, Error)]
pub enum AuthError {
    /// Credentials could not be encoded into a header value.
    #[error("invalid credential encoding: {0}")]
    Encoding(#[from] reqwest::header::InvalidHeaderValue),

    /// The authorisation flow itself failed.
    #[error("authorisation failed: {0}")]
    Failed(String),
}
