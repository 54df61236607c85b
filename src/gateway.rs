//! The composed gateway.
//!
//! # Data Flow
//! ```text
//! call(service, options, operation)
//!     → Cancelled already? return without touching the breaker
//!     → RateLimiter::admit (fail fast on quota or blacklist)
//!     → ServiceBreaker (fail fast when open, deadline for the whole call)
//!         → RetryEngine (backoff between idempotent attempts)
//!             → operation
//!     → On rejection, failure of a degraded service, or an opted-in
//!       rate-limit denial:
//!         DegradationRegistry::resolve (marked fallback instead of an error)
//! ```
//!
//! One `Gateway` is built at start-up and shared as `Arc<Gateway>`.

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::GatewayConfig;
use crate::health::{HealthMonitor, HealthProbe, HealthReport, HttpProbe};
use crate::lifecycle::Shutdown;
use crate::observability::events::{EventBus, ResilienceEvent};
use crate::observability::metrics;
use crate::resilience::circuit_breaker::{BreakerSnapshot, CircuitBreakerRegistry, CircuitState};
use crate::resilience::degradation::DegradationRegistry;
use crate::resilience::error::{BreakerError, Classify, RetryError};
use crate::resilience::retries::RetryEngine;
use crate::security::rate_limit::{RateDecision, RateLimitStats, RateLimiter, ScopeKey};
use crate::security::store::{CounterStore, MemoryCounterStore};

/// Per-call settings.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Scopes the call counts against; empty skips rate limiting.
    pub scopes: Vec<ScopeKey>,
    /// Only idempotent calls are retried.
    pub idempotent: bool,
    /// Deadline for the whole call, retries included. Defaults to the
    /// service's `call_timeout_ms`.
    pub timeout: Option<Duration>,
    /// Cancels pending retry delays.
    pub cancel: CancellationToken,
    /// Merged over the registered fallback when one is served.
    pub fallback_override: Option<Value>,
    /// Serve the service's fallback instead of failing when the rate limiter
    /// denies the call.
    pub degrade_on_rate_limit: bool,
}

impl CallOptions {
    pub fn idempotent() -> Self {
        Self {
            idempotent: true,
            ..Self::default()
        }
    }

    pub fn scoped(mut self, scopes: Vec<ScopeKey>) -> Self {
        self.scopes = scopes;
        self
    }
}

/// A successful call: live data, or a fallback served in its place.
#[derive(Debug, Clone, PartialEq)]
pub enum CallOutcome<T> {
    Live(T),
    Degraded(Value),
}

impl<T> CallOutcome<T> {
    pub fn is_degraded(&self) -> bool {
        matches!(self, CallOutcome::Degraded(_))
    }

    pub fn live(self) -> Option<T> {
        match self {
            CallOutcome::Live(value) => Some(value),
            CallOutcome::Degraded(_) => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum GatewayError<E> {
    #[error("rate limit exceeded for {scope}")]
    RateLimitExceeded {
        scope: String,
        blacklisted: bool,
        /// Epoch milliseconds at which capacity frees up.
        reset_at_ms: u64,
    },

    /// The caller's cancellation token fired; the breaker did not count it.
    #[error("call to '{service}' cancelled after {attempts} attempt(s)")]
    Cancelled { service: String, attempts: u32 },

    #[error("{0}")]
    Call(BreakerError<RetryError<E>>),
}

impl<E> GatewayError<E> {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GatewayError::Call(e) if e.is_rejection())
    }
}

/// Summary for the admin status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStatus {
    pub uptime_secs: u64,
    pub services: usize,
    pub open_breakers: usize,
    pub degraded_services: usize,
    pub rate_limit_enabled: bool,
    pub event_subscribers: usize,
}

pub struct Gateway {
    config: ArcSwap<GatewayConfig>,
    events: EventBus,
    limiter: Arc<RateLimiter>,
    breakers: Arc<CircuitBreakerRegistry>,
    retries: ArcSwap<RetryEngine>,
    degradation: Arc<DegradationRegistry>,
    health: Arc<HealthMonitor>,
    started_at: Instant,
}

impl Gateway {
    /// Single-instance gateway backed by an in-process counter store.
    pub fn from_config(config: GatewayConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryCounterStore::new()))
    }

    pub fn with_store(config: GatewayConfig, store: Arc<dyn CounterStore>) -> Self {
        let events = EventBus::default();

        let breakers = config
            .services
            .iter()
            .filter_map(|s| s.breaker.clone().map(|b| (s.name.clone(), b)))
            .fold(
                CircuitBreakerRegistry::new(config.breaker.clone(), events.clone()),
                |registry, (name, breaker)| registry.with_override(name, breaker),
            );
        let breakers = Arc::new(breakers);
        let degradation = Arc::new(DegradationRegistry::from_services(&config.services));
        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.clone(),
            store,
            events.clone(),
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health_check.clone(),
            breakers.clone(),
            degradation.clone(),
            events.clone(),
        ));
        for service in &config.services {
            if let Some(url) = &service.health_url {
                health.register(&service.name, Arc::new(HttpProbe::new(url.clone())));
            }
        }

        tracing::info!(
            services = config.services.len(),
            fallbacks = degradation.strategies().len(),
            rate_limit = config.rate_limit.enabled,
            "Gateway initialized"
        );

        Self {
            retries: ArcSwap::from_pointee(RetryEngine::from_config(&config.retries)),
            config: ArcSwap::from_pointee(config),
            events,
            limiter,
            breakers,
            degradation,
            health,
            started_at: Instant::now(),
        }
    }

    /// Run `operation` against `service` with the full protection chain.
    pub async fn call<F, Fut, T, E>(
        &self,
        service: &str,
        options: CallOptions,
        operation: F,
    ) -> Result<CallOutcome<T>, GatewayError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Classify + fmt::Display,
    {
        if options.cancel.is_cancelled() {
            return Err(GatewayError::Cancelled {
                service: service.to_string(),
                attempts: 0,
            });
        }

        if !options.scopes.is_empty() {
            if let RateDecision::Denied {
                scope,
                blacklisted,
                info,
            } = self.limiter.admit(&options.scopes).await
            {
                if options.degrade_on_rate_limit {
                    if let Some(payload) = self.serve_fallback(service, &options) {
                        return Ok(CallOutcome::Degraded(payload));
                    }
                }
                return Err(GatewayError::RateLimitExceeded {
                    scope,
                    blacklisted,
                    reset_at_ms: info.reset_at_ms,
                });
            }
        }

        let breaker = self.breakers.breaker(service);
        let retries = self.retries.load_full();
        let timeout = options
            .timeout
            .unwrap_or_else(|| breaker.config().call_timeout());
        let cancel = &options.cancel;

        let result = breaker
            .execute_with_abandon(
                timeout,
                |e: &RetryError<E>| matches!(e, RetryError::Cancelled { .. }),
                || retries.execute(options.idempotent, cancel, operation),
            )
            .await;

        match result {
            Ok(value) => Ok(CallOutcome::Live(value)),
            Err(BreakerError::Upstream {
                error: RetryError::Cancelled { attempts, .. },
                ..
            }) => Err(GatewayError::Cancelled {
                service: service.to_string(),
                attempts,
            }),
            Err(error) => {
                let degrade = error.is_rejection() || self.degradation.is_active(service);
                match degrade.then(|| self.serve_fallback(service, &options)).flatten() {
                    Some(payload) => {
                        tracing::debug!(service = %service, error = %error, "Served fallback after failure");
                        Ok(CallOutcome::Degraded(payload))
                    }
                    None => Err(GatewayError::Call(error)),
                }
            }
        }
    }

    fn serve_fallback(&self, service: &str, options: &CallOptions) -> Option<Value> {
        let payload = self
            .degradation
            .resolve(service, options.fallback_override.as_ref())?;
        metrics::record_fallback(service);
        self.events.publish(ResilienceEvent::FallbackServed {
            service: service.to_string(),
        });
        Some(payload)
    }

    /// Apply a reloaded configuration.
    ///
    /// Rate limits, retry policies and fallbacks take effect immediately.
    /// Breaker settings apply to breakers created after the reload.
    pub fn apply_config(&self, config: GatewayConfig) {
        self.limiter.update_config(config.rate_limit.clone());
        self.retries
            .store(Arc::new(RetryEngine::from_config(&config.retries)));
        for service in &config.services {
            if let Some(fallback) = &service.fallback {
                self.degradation
                    .register_strategy(&service.name, fallback.clone());
            }
        }
        tracing::info!(services = config.services.len(), "Gateway configuration applied");
        self.config.store(Arc::new(config));
    }

    /// Register an additional health probe.
    pub fn monitor(&self, service: &str, probe: Arc<dyn HealthProbe>) {
        self.health.register(service, probe);
    }

    /// Start the health monitor; it stops when `shutdown` fires.
    pub fn spawn_health_monitor(&self, shutdown: &Shutdown) -> JoinHandle<()> {
        tokio::spawn(self.health.clone().run(shutdown.subscribe()))
    }

    pub fn config(&self) -> Arc<GatewayConfig> {
        self.config.load_full()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn degradation(&self) -> &Arc<DegradationRegistry> {
        &self.degradation
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn get_breaker_state(&self, service: &str) -> Option<BreakerSnapshot> {
        self.breakers.get_state(service)
    }

    pub fn rate_limit_stats(&self) -> RateLimitStats {
        self.limiter.stats()
    }

    pub fn health_report(&self) -> HealthReport {
        self.health.report()
    }

    pub fn status(&self) -> GatewayStatus {
        let open_breakers = self
            .breakers
            .snapshots()
            .iter()
            .filter(|b| b.state != CircuitState::Closed)
            .count();
        GatewayStatus {
            uptime_secs: self.started_at.elapsed().as_secs(),
            services: self.config.load().services.len(),
            open_breakers,
            degraded_services: self.degradation.active_count(),
            rate_limit_enabled: self.limiter.stats().enabled,
            event_subscribers: self.events.subscriber_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, ScopeLimit, ServiceConfig};
    use crate::resilience::error::UpstreamError;
    use serde_json::json;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn gateway() -> Gateway {
        let mut config = GatewayConfig::default();
        config.breaker = BreakerConfig {
            max_failures: 2,
            reset_timeout_ms: 1_000,
            call_timeout_ms: 5_000,
            ..BreakerConfig::default()
        };
        config.retries.default.base_delay_ms = 10;
        config.retries.server_error = Some(crate::config::RetryPolicy {
            max_retries: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
            ..Default::default()
        });
        config.rate_limit.ip = Some(ScopeLimit::new(60_000, 2));
        config.services = vec![ServiceConfig {
            name: "courses".into(),
            health_url: None,
            breaker: None,
            fallback: Some(json!({"courses": [], "cached": true})),
        }];
        Gateway::from_config(config)
    }

    #[tokio::test(start_paused = true)]
    async fn test_idempotent_call_recovers_through_retries() {
        let gw = gateway();
        let calls = AtomicU32::new(0);
        let outcome = gw
            .call("courses", CallOptions::idempotent(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(UpstreamError::Status(503))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::Live(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            gw.get_breaker_state("courses").unwrap().consecutive_failures,
            0
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_serves_fallback() {
        let gw = gateway();
        for _ in 0..2 {
            let result: Result<CallOutcome<()>, _> = gw
                .call("courses", CallOptions::default(), || async {
                    Err(UpstreamError::Status(500))
                })
                .await;
            assert!(matches!(result, Err(GatewayError::Call(_))));
        }

        let calls = AtomicU32::new(0);
        let outcome: CallOutcome<()> = gw
            .call(
                "courses",
                CallOptions {
                    fallback_override: Some(json!({"notice": "stale"})),
                    ..CallOptions::default()
                },
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), UpstreamError>(())
                },
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            outcome,
            CallOutcome::Degraded(json!({"courses": [], "cached": true, "notice": "stale"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_breaker_without_fallback_is_an_error() {
        let gw = gateway();
        gw.breakers().force_open("jobs", Duration::from_secs(10));
        let result: Result<CallOutcome<()>, GatewayError<UpstreamError>> = gw
            .call("jobs", CallOptions::default(), || async { Ok(()) })
            .await;
        assert!(result.unwrap_err().is_circuit_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_rejects_before_the_breaker() {
        let gw = gateway();
        let ip = ScopeKey::Ip(IpAddr::from([203, 0, 113, 5]));
        let options = || CallOptions::default().scoped(vec![ip.clone()]);

        for _ in 0..2 {
            let outcome = gw
                .call("jobs", options(), || async { Ok::<_, UpstreamError>(()) })
                .await;
            assert!(outcome.is_ok());
        }
        let denied = gw
            .call("jobs", options(), || async { Ok::<_, UpstreamError>(()) })
            .await;
        assert!(matches!(
            denied,
            Err(GatewayError::RateLimitExceeded { ref scope, blacklisted: false, .. })
                if scope == "ip:203.0.113.5"
        ));
        assert_eq!(gw.get_breaker_state("jobs").unwrap().stats.total_calls, 2);
        assert_eq!(gw.rate_limit_stats().denied, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_call_can_degrade() {
        let gw = gateway();
        let ip = ScopeKey::Ip(IpAddr::from([203, 0, 113, 6]));
        let options = || CallOptions {
            degrade_on_rate_limit: true,
            ..CallOptions::default().scoped(vec![ip.clone()])
        };

        for _ in 0..2 {
            let outcome = gw
                .call("courses", options(), || async { Ok::<_, UpstreamError>(1) })
                .await
                .unwrap();
            assert_eq!(outcome, CallOutcome::Live(1));
        }
        let outcome = gw
            .call("courses", options(), || async { Ok::<_, UpstreamError>(1) })
            .await
            .unwrap();
        assert_eq!(outcome, CallOutcome::Degraded(json!({"courses": [], "cached": true})));

        // Without a registered strategy the denial still surfaces.
        let denied = gw
            .call("jobs", options(), || async { Ok::<_, UpstreamError>(1) })
            .await;
        assert!(matches!(denied, Err(GatewayError::RateLimitExceeded { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_calls_never_open_the_breaker() {
        let gw = gateway();
        let calls = AtomicU32::new(0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        for _ in 0..5 {
            let result: Result<CallOutcome<()>, _> = gw
                .call(
                    "jobs",
                    CallOptions {
                        cancel: cancel.clone(),
                        ..CallOptions::default()
                    },
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err(UpstreamError::Status(503))
                    },
                )
                .await;
            assert!(matches!(
                result,
                Err(GatewayError::Cancelled { attempts: 0, .. })
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(gw.get_breaker_state("jobs").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_retry_is_not_a_breaker_failure() {
        let gw = gateway();
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let token = cancel.child_token();
            let call = gw.call(
                "jobs",
                CallOptions {
                    cancel: token.clone(),
                    ..CallOptions::idempotent()
                },
                || {
                    // Fail once, then the caller disconnects during the backoff.
                    calls.fetch_add(1, Ordering::SeqCst);
                    token.cancel();
                    async { Err::<(), _>(UpstreamError::Status(503)) }
                },
            );
            let result = call.await;
            assert!(matches!(
                result,
                Err(GatewayError::Cancelled { attempts: 1, .. })
            ));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = gw.get_breaker_state("jobs").unwrap();
        assert_eq!(snapshot.state, CircuitState::Closed);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_apply_config_swaps_rate_limits() {
        let gw = gateway();
        let mut config = (*gw.config()).clone();
        config.rate_limit.enabled = false;
        gw.apply_config(config);
        assert!(!gw.rate_limit_stats().enabled);
        assert!(!gw.status().rate_limit_enabled);
    }
}
