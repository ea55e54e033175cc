use reqwest::{Method, StatusCode, header::HeaderMap};
use url::Url;

use crate::core::error::ResponseError;

/// How many body characters error and log excerpts keep.
const EXCERPT_LEN: usize = 200;

/// Identity of one outbound request: the pair cache keys are derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestIdentity {
    /// The HTTP method.
    pub method: Method,
    /// The full request URL, query included.
    pub url: Url,
}

impl RequestIdentity {
    pub fn new(method: Method, url: Url) -> Self {
        Self { method, url }
    }
}

/// The buffered outcome of one HTTP exchange.
///
/// The engine reads the whole body before acting on a response, so one record
/// carries everything the handler chain, the cache, and the logs need.
#[derive(Debug, Clone)]
pub struct ResponseRecord {
    /// The request that produced this response.
    pub identity: RequestIdentity,
    /// The response status code.
    pub status: StatusCode,
    /// The response headers.
    pub headers: HeaderMap,
    /// The full response body.
    pub body: String,
}

impl ResponseRecord {
    /// Whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// A bounded excerpt of the body for logs and error messages.
    pub fn excerpt(&self) -> &str {
        let end = self
            .body
            .char_indices()
            .map(|(i, _)| i)
            .nth(EXCERPT_LEN)
            .unwrap_or(self.body.len());
        &self.body[..end]
    }

    /// Convert an unsuccessful record into its terminal error form.
    pub fn to_error(&self) -> ResponseError {
        ResponseError {
            status: self.status.as_u16(),
            url: self.identity.url.to_string(),
            body: self.excerpt().to_string(),
        }
    }
}
