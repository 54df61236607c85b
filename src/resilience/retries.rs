//! Retry logic.
//!
//! # Responsibilities
//! - Pick a backoff policy from the error kind of each failure
//! - Execute retries with exponential backoff
//! - Stop on policy exhaustion, on non-idempotent work, or on cancellation
//!
//! # Design Decisions
//! - Never retry work the caller has not flagged idempotent
//! - Inter-attempt delays race the caller's cancellation token, so a
//!   disconnected client stops the retry loop
//! - An upstream "retry after" hint stretches the computed delay, never
//!   shortens it

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::{RetryConfig, RetryPolicy};
use crate::observability::metrics;
use crate::resilience::backoff::delay_for_retry;
use crate::resilience::error::{Classify, ErrorKind, RetryError};

/// Details handed to the attempt-failed callback.
#[derive(Debug, Clone)]
pub struct AttemptFailure {
    /// 1-indexed attempt that just failed.
    pub attempt: u32,
    pub kind: ErrorKind,
    pub error: String,
    /// Delay before the next attempt; `None` when no retry follows.
    pub next_delay: Option<Duration>,
}

pub type AttemptCallback = Arc<dyn Fn(&AttemptFailure) + Send + Sync>;

/// Error kind → policy registry with a default entry.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicies {
    default: RetryPolicy,
    by_kind: HashMap<ErrorKind, RetryPolicy>,
}

impl RetryPolicies {
    pub fn new(default: RetryPolicy) -> Self {
        Self {
            default,
            by_kind: HashMap::new(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let mut policies = Self::new(config.default.clone());
        for (kind, policy) in [
            (ErrorKind::Timeout, &config.timeout),
            (ErrorKind::ConnectionReset, &config.connection_reset),
            (ErrorKind::RateLimited, &config.rate_limited),
            (ErrorKind::ServerError, &config.server_error),
        ] {
            if let Some(policy) = policy {
                policies.by_kind.insert(kind, policy.clone());
            }
        }
        policies
    }

    pub fn with(mut self, kind: ErrorKind, policy: RetryPolicy) -> Self {
        self.by_kind.insert(kind, policy);
        self
    }

    pub fn policy_for(&self, kind: ErrorKind) -> &RetryPolicy {
        self.by_kind.get(&kind).unwrap_or(&self.default)
    }
}

/// Runs operations with per-error-kind backoff.
#[derive(Clone)]
pub struct RetryEngine {
    policies: RetryPolicies,
    enabled: bool,
    on_attempt_failed: Option<AttemptCallback>,
}

impl RetryEngine {
    pub fn new(policies: RetryPolicies) -> Self {
        Self {
            policies,
            enabled: true,
            on_attempt_failed: None,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            enabled: config.enabled,
            ..Self::new(RetryPolicies::from_config(config))
        }
    }

    /// Register an observer called after every failed attempt.
    pub fn with_callback(mut self, callback: AttemptCallback) -> Self {
        self.on_attempt_failed = Some(callback);
        self
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Execute `operation`, retrying failures by the policy of their kind.
    ///
    /// Work that is not `idempotent` runs exactly once.
    pub async fn execute<F, Fut, T, E>(
        &self,
        idempotent: bool,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        let retryable = self.enabled && idempotent;
        run(
            operation,
            |kind| self.policies.policy_for(kind),
            retryable,
            Some(cancel),
            self.on_attempt_failed.as_deref(),
        )
        .await
    }
}

/// Execute `operation` under a single policy; retries only if the policy is
/// flagged idempotent.
pub async fn execute_with_retry<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
{
    run(operation, |_| policy, policy.idempotent, None, None).await
}

async fn run<'p, F, Fut, T, E, P>(
    mut operation: F,
    policy_for: P,
    retryable: bool,
    cancel: Option<&CancellationToken>,
    on_attempt_failed: Option<&(dyn Fn(&AttemptFailure) + Send + Sync)>,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + fmt::Display,
    P: Fn(ErrorKind) -> &'p RetryPolicy,
{
    if cancel.is_some_and(CancellationToken::is_cancelled) {
        return Err(RetryError::Cancelled {
            attempts: 0,
            last_error: None,
        });
    }

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let error = match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::info!(attempt, "Operation recovered after retry");
                }
                return Ok(value);
            }
            Err(e) => e,
        };

        let kind = error.kind();
        let policy = policy_for(kind);
        let next_delay = (retryable && attempt <= policy.max_retries).then(|| {
            let computed = delay_for_retry(attempt, policy);
            error.retry_after().map_or(computed, |hint| computed.max(hint))
        });

        if let Some(callback) = on_attempt_failed {
            callback(&AttemptFailure {
                attempt,
                kind,
                error: error.to_string(),
                next_delay,
            });
        }

        let Some(delay) = next_delay else {
            tracing::debug!(attempt, kind = %kind, error = %error, "Giving up");
            return Err(RetryError::Exhausted {
                attempts: attempt,
                last_error: error,
            });
        };

        tracing::debug!(
            attempt,
            kind = %kind,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "Retrying after failure"
        );
        metrics::record_retry(kind.as_str());

        match cancel {
            Some(token) => {
                tokio::select! {
                    _ = token.cancelled() => {
                        tracing::debug!(attempt, "Retry cancelled by caller");
                        return Err(RetryError::Cancelled {
                            attempts: attempt,
                            last_error: Some(error),
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => tokio::time::sleep(delay).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::error::UpstreamError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
            idempotent: true,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let started = Instant::now();

        let result = execute_with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(UpstreamError::Status(503))
                } else {
                    Ok("done")
                }
            },
            &policy(3),
        )
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1000ms + 2000ms of backoff.
        assert_eq!(started.elapsed(), Duration::from_millis(3000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_wraps_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = execute_with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::ConnectionReset("peer".into()))
            },
            &policy(2),
        )
        .await;

        match result {
            Err(RetryError::Exhausted { attempts, last_error }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, UpstreamError::ConnectionReset("peer".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_idempotent_runs_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = execute_with_retry(
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Status(500))
            },
            &RetryPolicy {
                idempotent: false,
                ..policy(5)
            },
        )
        .await;

        assert_eq!(result.unwrap_err().attempts(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_engine_selects_policy_by_kind_and_reports_delays() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let engine = RetryEngine::new(
            RetryPolicies::new(policy(0)).with(ErrorKind::Timeout, policy(4)),
        )
        .with_callback(Arc::new(move |failure: &AttemptFailure| {
            sink.lock().unwrap().push((failure.attempt, failure.next_delay));
        }));

        let token = CancellationToken::new();
        let result: Result<(), _> = engine
            .execute(true, &token, || async { Err(UpstreamError::Timeout) })
            .await;
        assert_eq!(result.unwrap_err().attempts(), 5);

        let delays: Vec<_> = seen.lock().unwrap().iter().map(|(_, d)| *d).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::from_millis(1000)),
                Some(Duration::from_millis(2000)),
                Some(Duration::from_millis(4000)),
                Some(Duration::from_millis(8000)),
                None,
            ]
        );

        // Default policy allows no retries for other kinds.
        seen.lock().unwrap().clear();
        let result: Result<(), _> = engine
            .execute(true, &token, || async { Err(UpstreamError::Status(500)) })
            .await;
        assert_eq!(result.unwrap_err().attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_waiting() {
        let engine = RetryEngine::new(RetryPolicies::new(policy(10)));
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1500)).await;
            canceller.cancel();
        });

        let calls = AtomicU32::new(0);
        let result: Result<(), _> = engine
            .execute(true, &token, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(UpstreamError::Status(502))
            })
            .await;

        assert!(matches!(result, Err(RetryError::Cancelled { attempts: 2, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_extends_delay() {
        let started = Instant::now();
        let calls = AtomicU32::new(0);
        let _ = execute_with_retry(
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UpstreamError::RateLimited {
                        retry_after: Some(Duration::from_secs(5)),
                    })
                } else {
                    Ok(())
                }
            },
            &policy(1),
        )
        .await;
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_policies_from_config() {
        let config = RetryConfig::default();
        let policies = RetryPolicies::from_config(&config);
        assert_eq!(policies.policy_for(ErrorKind::Timeout).max_retries, 2);
        assert_eq!(policies.policy_for(ErrorKind::ServerError), &config.default);
    }
}
