//! Timeout enforcement.
//!
//! # Responsibilities
//! - Wrap single upstream attempts with a deadline
//! - Turn an elapsed deadline into the caller's own error type
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - The circuit breaker bounds a whole guarded call; this helper bounds one
//!   attempt inside it, so a slow attempt can be retried as a timeout

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

use crate::resilience::error::UpstreamError;

/// An attempt did not settle before its deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("attempt timed out after {elapsed:?}")]
pub struct TimedOut {
    pub elapsed: Duration,
}

impl From<TimedOut> for UpstreamError {
    fn from(_: TimedOut) -> Self {
        UpstreamError::Timeout
    }
}

/// Run `fut` with a deadline of `limit`.
pub async fn with_timeout<Fut, T, E>(limit: Duration, fut: Fut) -> Result<T, E>
where
    Fut: Future<Output = Result<T, E>>,
    E: From<TimedOut>,
{
    let started = Instant::now();
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TimedOut {
            elapsed: started.elapsed(),
        }
        .into()),
    }
}
