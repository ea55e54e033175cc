//! Status-driven recovery policies.
//!
//! A [`StatusHandler`] owns a set of status codes and decides what an
//! unsuccessful response in that set means: resolved (retry the call right
//! away), unresolved (leave it to the caller's retry budget), or terminal.
//! The request handler walks its chain in caller-given order and the first
//! handler whose set contains the status wins, so overlapping sets are
//! resolved by ordering rather than by set subtraction.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::{
    StatusCode,
    header::{HeaderMap, RETRY_AFTER},
};
use tracing::{debug, warn};

use crate::{
    auth::Authoriser,
    core::{
        error::{StatusHandlerError, TenaceError},
        models::ResponseRecord,
    },
    session::Session,
    timer::Timer,
};

/// Everything a handler may need to act on one response.
pub struct StatusHandlerContext<'a> {
    /// The buffered response being classified.
    pub record: &'a ResponseRecord,
    /// The authoriser, when the owning handler has one.
    pub authoriser: Option<&'a dyn Authoriser>,
    /// The live session, for handlers that refresh its default headers.
    pub session: Option<&'a Session>,
    /// The live retry timer for this call. Read-only: handlers may consult
    /// its remaining budget but never advance it.
    pub retry_timer: Option<&'a Timer>,
    /// The shared wait timer, advanced when the server asks for backpressure
    /// without saying for how long.
    pub wait_timer: Option<&'a Mutex<Timer>>,
}

/// A recovery policy for a fixed set of response statuses.
#[async_trait]
pub trait StatusHandler: Send + Sync {
    /// Handler name used in logs and mismatch errors.
    fn name(&self) -> &'static str;

    /// The status codes this handler takes responsibility for.
    fn status_codes(&self) -> &[StatusCode];

    /// Whether this handler matches the given status.
    fn matches(&self, status: StatusCode) -> bool {
        self.status_codes().contains(&status)
    }

    /// Act on a matching response.
    ///
    /// `Ok(true)` means the condition was resolved and the call should be
    /// retried immediately; `Ok(false)` means this handler could not resolve
    /// it and the retry budget decides; `Err` is terminal. Invoking a handler
    /// on a status outside its set is a [`StatusHandlerError`].
    async fn handle(&self, ctx: StatusHandlerContext<'_>) -> Result<bool, TenaceError>;
}

/// Mismatch guard shared by the concrete handlers.
fn ensure_matches(
    handler: &dyn StatusHandler,
    status: StatusCode,
) -> Result<(), StatusHandlerError> {
    if handler.matches(status) {
        Ok(())
    } else {
        Err(StatusHandlerError {
            handler: handler.name(),
            status: status.as_u16(),
        })
    }
}

/// The chain most deployments want: re-auth before rate limiting before the
/// terminal client-error catch-all.
pub fn default_handlers() -> Vec<Arc<dyn StatusHandler>> {
    vec![
        Arc::new(UnauthorisedHandler::new()),
        Arc::new(RateLimitHandler::new()),
        Arc::new(ClientErrorHandler::new()),
    ]
}

/// Treats every 4xx as terminal.
///
/// Matches the whole 400-499 range, so place it after any handler that
/// recovers from a specific client error or it will shadow them.
#[derive(Clone, Debug)]
pub struct ClientErrorHandler {
    codes: Vec<StatusCode>,
}

impl ClientErrorHandler {
    pub fn new() -> Self {
        let codes = (400..500)
            .filter_map(|code| StatusCode::from_u16(code).ok())
            .collect();
        Self { codes }
    }
}

impl Default for ClientErrorHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusHandler for ClientErrorHandler {
    fn name(&self) -> &'static str {
        "ClientErrorHandler"
    }

    fn status_codes(&self) -> &[StatusCode] {
        &self.codes
    }

    async fn handle(&self, ctx: StatusHandlerContext<'_>) -> Result<bool, TenaceError> {
        ensure_matches(self, ctx.record.status)?;
        warn!(
            status = ctx.record.status.as_u16(),
            url = %ctx.record.identity.url,
            "client error is terminal"
        );
        Err(ctx.record.to_error().into())
    }
}

/// Refreshes credentials on a 401 and retries immediately.
#[derive(Clone, Debug)]
pub struct UnauthorisedHandler {
    codes: Vec<StatusCode>,
}

impl UnauthorisedHandler {
    pub fn new() -> Self {
        Self {
            codes: vec![StatusCode::UNAUTHORIZED],
        }
    }
}

impl Default for UnauthorisedHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusHandler for UnauthorisedHandler {
    fn name(&self) -> &'static str {
        "UnauthorisedHandler"
    }

    fn status_codes(&self) -> &[StatusCode] {
        &self.codes
    }

    async fn handle(&self, ctx: StatusHandlerContext<'_>) -> Result<bool, TenaceError> {
        ensure_matches(self, ctx.record.status)?;
        let (Some(authoriser), Some(session)) = (ctx.authoriser, ctx.session) else {
            debug!("unauthorised response but no authoriser and session to refresh with");
            return Ok(false);
        };
        debug!(url = %ctx.record.identity.url, "refreshing credentials after 401");
        let headers = authoriser.authorise().await?;
        session.merge_headers(&headers);
        Ok(true)
    }
}

/// Absorbs 429 responses.
///
/// Honours a numeric `Retry-After` header when the wait fits the retry
/// timer's remaining budget; without the header it ratchets the shared wait
/// timer up one step and sleeps, leaving the retry budget to decide whether
/// the call is retried.
#[derive(Clone, Debug)]
pub struct RateLimitHandler {
    codes: Vec<StatusCode>,
}

impl RateLimitHandler {
    pub fn new() -> Self {
        Self {
            codes: vec![StatusCode::TOO_MANY_REQUESTS],
        }
    }
}

impl Default for RateLimitHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StatusHandler for RateLimitHandler {
    fn name(&self) -> &'static str {
        "RateLimitHandler"
    }

    fn status_codes(&self) -> &[StatusCode] {
        &self.codes
    }

    async fn handle(&self, ctx: StatusHandlerContext<'_>) -> Result<bool, TenaceError> {
        ensure_matches(self, ctx.record.status)?;

        if let Some(seconds) = retry_after_seconds(&ctx.record.headers) {
            if let Some(remaining) = ctx.retry_timer.and_then(Timer::total_remaining)
                && seconds > remaining
            {
                warn!(
                    retry_after = seconds,
                    budget = remaining,
                    url = %ctx.record.identity.url,
                    "server asked to wait longer than the remaining retry budget"
                );
                return Err(ctx.record.to_error().into());
            }
            debug!(seconds, url = %ctx.record.identity.url, "honouring Retry-After");
            tokio::time::sleep(clamp_seconds(seconds)).await;
            return Ok(true);
        }

        if let Some(wait_timer) = ctx.wait_timer {
            let snapshot = {
                let mut timer = wait_timer.lock();
                timer.increase();
                timer.clone()
            };
            debug!(
                seconds = snapshot.value(),
                url = %ctx.record.identity.url,
                "rate limited without Retry-After; backing off"
            );
            snapshot.wait().await;
        }
        Ok(false)
    }
}

/// Numeric `Retry-After` in seconds, if the response carries one.
fn retry_after_seconds(headers: &HeaderMap) -> Option<f64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<f64>()
        .ok()
}

fn clamp_seconds(seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds.max(0.0)).unwrap_or(Duration::MAX)
}
