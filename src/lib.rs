//! tenace: resilient async HTTP request execution.
//!
//! A [`RequestHandler`] drives every call through cache lookup, send,
//! status-driven recovery, and timer-bounded retry: backoff [`Timer`]s pace
//! the retries, a [`StatusHandler`] chain turns bad statuses into recovery
//! actions, and a TTL-bound [`ResponseCache`] short-circuits repeat requests.

pub mod auth;
pub mod cache;
pub mod core;
pub mod handler;
pub mod payload;
pub mod session;
pub mod status;
pub mod timer;

pub use auth::{Authoriser, BasicAuthoriser};
#[cfg(feature = "sqlite")]
pub use cache::sqlite::{SqliteCache, SqliteRepository};
pub use cache::{
    CacheKey, KeyPart, KeySource, RepositoryGetter, RepositorySettings,
    RepositorySettingsBuilder, ResponseCache, ResponseRepository,
};
pub use crate::core::{
    AuthError, CacheError, PayloadError, RequestIdentity, ResponseError, ResponseRecord,
    StatusHandlerError, TenaceError,
};
pub use handler::{RequestHandler, RequestHandlerBuilder};
pub use payload::{
    BytesPayloadHandler, JsonPayloadHandler, Payload, PayloadHandler, StringPayloadHandler,
};
pub use session::{RequestBody, RequestOptions, Session, SessionReply};
pub use status::{
    ClientErrorHandler, RateLimitHandler, StatusHandler, StatusHandlerContext,
    UnauthorisedHandler, default_handlers,
};
pub use timer::{Bound, Strategy, Timer};
