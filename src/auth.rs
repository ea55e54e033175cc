//! Request authorisation.
//!
//! An [`Authoriser`] turns credentials into headers. The request handler
//! seeds its session's default headers from the authoriser when it opens, and
//! the 401 status handler re-invokes it to refresh expired credentials
//! mid-flight.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};

use crate::core::error::AuthError;

/// Produces the headers that prove a caller's identity.
#[async_trait]
pub trait Authoriser: Send + Sync {
    /// Run the authorisation flow and return the headers to attach to
    /// requests. Called once when the handler opens and again whenever a
    /// 401 response asks for fresh credentials.
    async fn authorise(&self) -> Result<HeaderMap, AuthError>;
}

/// HTTP Basic authorisation from a login and an optional password.
#[derive(Clone, Debug)]
pub struct BasicAuthoriser {
    login: String,
    password: Option<String>,
}

impl BasicAuthoriser {
    pub fn new(login: impl Into<String>, password: Option<String>) -> Self {
        Self {
            login: login.into(),
            password,
        }
    }
}

#[async_trait]
impl Authoriser for BasicAuthoriser {
    async fn authorise(&self) -> Result<HeaderMap, AuthError> {
        let credentials = format!(
            "{}:{}",
            self.login,
            self.password.as_deref().unwrap_or_default()
        );
        let token = format!("Basic {}", STANDARD.encode(credentials));
        let mut headers = HeaderMap::new();
        let mut value = HeaderValue::from_str(&token)?;
        value.set_sensitive(true);
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }
}
