//! Error taxonomy for guarded calls.
//!
//! Every failure mode of the resilience layer is a distinct variant so callers
//! can tell a fast rejection from a timeout from a genuine upstream error.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Coarse class of an upstream failure, used to pick a retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Timeout,
    ConnectionReset,
    RateLimited,
    ServerError,
    Other,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionReset => "connection_reset",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that know which [`ErrorKind`] they belong to.
pub trait Classify {
    fn kind(&self) -> ErrorKind;

    /// Earliest moment a retry makes sense, if the upstream said so.
    fn retry_after(&self) -> Option<Duration> {
        None
    }
}

/// Ready-made error type for upstream operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("upstream timed out")]
    Timeout,

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("upstream rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("upstream returned status {0}")]
    Status(u16),

    #[error("{0}")]
    Other(String),
}

impl Classify for UpstreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::Timeout => ErrorKind::Timeout,
            UpstreamError::ConnectionReset(_) => ErrorKind::ConnectionReset,
            UpstreamError::RateLimited { .. } => ErrorKind::RateLimited,
            UpstreamError::Status(429) => ErrorKind::RateLimited,
            UpstreamError::Status(code) if *code >= 500 => ErrorKind::ServerError,
            UpstreamError::Status(_) | UpstreamError::Other(_) => ErrorKind::Other,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            UpstreamError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

/// Outcome of a call rejected or failed by the circuit breaker.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The circuit is open (or out of half-open probes); the call was not attempted.
    #[error("circuit open for service '{service}'")]
    Open {
        service: String,
        /// Time until the next probe is allowed, when known.
        retry_after: Option<Duration>,
    },

    /// The call did not settle before its deadline.
    #[error("call to '{service}' timed out after {elapsed:?}")]
    Timeout { service: String, elapsed: Duration },

    /// The operation itself returned an error.
    #[error("upstream '{service}' failed: {error}")]
    Upstream { service: String, error: E },
}

impl<E> BreakerError<E> {
    /// True when the call was rejected without being attempted.
    pub fn is_rejection(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn service(&self) -> &str {
        match self {
            BreakerError::Open { service, .. }
            | BreakerError::Timeout { service, .. }
            | BreakerError::Upstream { service, .. } => service,
        }
    }
}

impl<E: Classify> Classify for BreakerError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            BreakerError::Open { .. } => ErrorKind::Other,
            BreakerError::Timeout { .. } => ErrorKind::Timeout,
            BreakerError::Upstream { error, .. } => error.kind(),
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            BreakerError::Open { retry_after, .. } => *retry_after,
            BreakerError::Timeout { .. } => None,
            BreakerError::Upstream { error, .. } => error.retry_after(),
        }
    }
}

/// Terminal result of the retry engine.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// No attempts left (or the failure was not retryable); wraps the last error.
    #[error("retries exhausted after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: E },

    /// The caller cancelled while the engine was waiting to retry.
    #[error("retry cancelled after {attempts} attempt(s)")]
    Cancelled { attempts: u32, last_error: Option<E> },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } | RetryError::Cancelled { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_last_error(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last_error, .. } => Some(last_error),
            RetryError::Cancelled { last_error, .. } => last_error,
        }
    }
}

impl<E: Classify> Classify for RetryError<E> {
    fn kind(&self) -> ErrorKind {
        match self {
            RetryError::Exhausted { last_error, .. } => last_error.kind(),
            RetryError::Cancelled { last_error, .. } => {
                last_error.as_ref().map_or(ErrorKind::Other, Classify::kind)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_classification() {
        assert_eq!(UpstreamError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(UpstreamError::Status(503).kind(), ErrorKind::ServerError);
        assert_eq!(UpstreamError::Status(429).kind(), ErrorKind::RateLimited);
        assert_eq!(UpstreamError::Status(404).kind(), ErrorKind::Other);
        assert_eq!(
            UpstreamError::ConnectionReset("peer".into()).kind(),
            ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_breaker_error_kind_follows_inner() {
        let err: BreakerError<UpstreamError> = BreakerError::Upstream {
            service: "jobs".into(),
            error: UpstreamError::Status(502),
        };
        assert_eq!(err.kind(), ErrorKind::ServerError);
        assert_eq!(err.service(), "jobs");
        assert!(!err.is_rejection());
        assert_eq!(err.to_string(), "upstream 'jobs' failed: upstream returned status 502");
    }
}
