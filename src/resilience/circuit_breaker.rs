//! Circuit breaker for upstream service protection.
//!
//! # States
//! - Closed: normal operation, calls pass through
//! - Open: service assumed down, calls fail fast
//! - Half-Open: a bounded number of probe calls test for recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive_failures >= max_failures
//! Open → Half-Open: first call at or after next_probe_at
//! Half-Open → Closed: one probe succeeds
//! Half-Open → Open: one probe fails (next_probe_at rescheduled)
//! ```
//!
//! # Design Decisions
//! - Per-service circuit breaker (not global), created lazily on first use
//! - Fail fast in Open state (the operation is never invoked)
//! - Each breaker's state lives behind one mutex; every transition happens in
//!   a single critical section
//! - Each transition bumps a generation; outcomes of calls admitted under an
//!   older generation update statistics but never drive a transition
//! - The breaker never retries: retry is composed inside the operation

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::BreakerConfig;
use crate::observability::events::{EventBus, ResilienceEvent};
use crate::observability::metrics;
use crate::resilience::error::BreakerError;

const MIN_FORCE_OPEN: Duration = Duration::from_millis(1);

/// Circuit breaker state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    /// Prometheus gauge value (0=Closed, 1=Open, 2=HalfOpen).
    pub fn as_metric_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// Cumulative and rolling call statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BreakerStats {
    /// Calls that were attempted (rejections excluded).
    pub total_calls: u64,
    pub total_failures: u64,
    /// Calls rejected without being attempted.
    pub total_rejections: u64,
    /// Incremental mean over every attempted call.
    pub average_latency_ms: f64,
    /// Failure ratio over the most recent `stats_window` attempted calls.
    pub failure_rate: f64,
}

struct RollingStats {
    total_calls: u64,
    total_failures: u64,
    total_rejections: u64,
    average_latency_ms: f64,
    recent: VecDeque<bool>,
    window: usize,
}

impl RollingStats {
    fn new(window: usize) -> Self {
        Self {
            total_calls: 0,
            total_failures: 0,
            total_rejections: 0,
            average_latency_ms: 0.0,
            recent: VecDeque::with_capacity(window),
            window: window.max(1),
        }
    }

    fn record(&mut self, success: bool, latency: Duration) {
        self.total_calls += 1;
        if !success {
            self.total_failures += 1;
        }
        let sample = latency.as_secs_f64() * 1000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / self.total_calls as f64;

        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(success);
    }

    fn snapshot(&self) -> BreakerStats {
        let failures = self.recent.iter().filter(|ok| !**ok).count();
        let failure_rate = if self.recent.is_empty() {
            0.0
        } else {
            failures as f64 / self.recent.len() as f64
        };
        BreakerStats {
            total_calls: self.total_calls,
            total_failures: self.total_failures,
            total_rejections: self.total_rejections,
            average_latency_ms: self.average_latency_ms,
            failure_rate,
        }
    }
}

struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<Instant>,
    next_probe_at: Option<Instant>,
    half_open_in_flight: u32,
    generation: u64,
    stats: RollingStats,
}

impl BreakerState {
    fn new(stats_window: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            next_probe_at: None,
            half_open_in_flight: 0,
            generation: 0,
            stats: RollingStats::new(stats_window),
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub service: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub half_open_in_flight: u32,
    /// Milliseconds since the last failure.
    pub last_failure_ms_ago: Option<u64>,
    /// Milliseconds until a probe is allowed (0 once due).
    pub next_probe_in_ms: Option<u64>,
    #[serde(skip)]
    pub next_probe_at: Option<Instant>,
    pub stats: BreakerStats,
}

/// Circuit breaker guarding one logical service.
pub struct ServiceBreaker {
    service: String,
    config: BreakerConfig,
    inner: Mutex<BreakerState>,
    events: EventBus,
}

/// Admission ticket for one call.
///
/// A half-open probe slot is released when the ticket is dropped, so a call
/// future cancelled mid-flight does not leak probe capacity.
struct CallPermit<'a> {
    breaker: &'a ServiceBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn success(mut self, latency: Duration) {
        self.settled = true;
        self.breaker.on_success(self.generation, self.probe, latency);
    }

    fn failure(mut self, latency: Duration, error: String) {
        self.settled = true;
        self.breaker.on_failure(self.generation, self.probe, latency, error);
    }

    /// Give the slot back without recording an outcome.
    fn abandon(mut self) {
        self.settled = true;
        if self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.release_probe(self.generation);
        }
    }
}

impl ServiceBreaker {
    pub fn new(service: impl Into<String>, config: BreakerConfig, events: EventBus) -> Self {
        let stats_window = config.stats_window;
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerState::new(stats_window)),
            events,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current state, without applying any time-based transition.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = Instant::now();
        let s = self.lock();
        BreakerSnapshot {
            service: self.service.clone(),
            state: s.state,
            consecutive_failures: s.consecutive_failures,
            consecutive_successes: s.consecutive_successes,
            half_open_in_flight: s.half_open_in_flight,
            last_failure_ms_ago: s
                .last_failure_at
                .map(|t| now.saturating_duration_since(t).as_millis() as u64),
            next_probe_in_ms: s
                .next_probe_at
                .map(|t| t.saturating_duration_since(now).as_millis() as u64),
            next_probe_at: s.next_probe_at,
            stats: s.stats.snapshot(),
        }
    }

    /// Run `operation` under the configured call deadline.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with_timeout(self.config.call_timeout(), operation).await
    }

    /// Run `operation` unless the circuit rejects it; a call that does not
    /// settle within `timeout` counts as a failure.
    pub async fn execute_with_timeout<F, Fut, T, E>(
        &self,
        timeout: Duration,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.execute_with_abandon(timeout, |_: &E| false, operation).await
    }

    /// Like [`execute_with_timeout`](Self::execute_with_timeout), except that
    /// an error for which `abandoned` returns true (the caller went away)
    /// releases the permit without counting as a failure or a success.
    pub async fn execute_with_abandon<F, Fut, T, E, A>(
        &self,
        timeout: Duration,
        abandoned: A,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
        A: Fn(&E) -> bool,
    {
        let permit = self.acquire::<E>()?;
        let started = Instant::now();

        match tokio::time::timeout(timeout, operation()).await {
            Ok(Ok(value)) => {
                permit.success(started.elapsed());
                Ok(value)
            }
            Ok(Err(error)) if abandoned(&error) => {
                permit.abandon();
                tracing::debug!(service = %self.service, error = %error, "Call abandoned by caller");
                Err(BreakerError::Upstream {
                    service: self.service.clone(),
                    error,
                })
            }
            Ok(Err(error)) => {
                permit.failure(started.elapsed(), error.to_string());
                Err(BreakerError::Upstream {
                    service: self.service.clone(),
                    error,
                })
            }
            Err(_) => {
                let elapsed = started.elapsed();
                permit.failure(elapsed, format!("timed out after {timeout:?}"));
                Err(BreakerError::Timeout {
                    service: self.service.clone(),
                    elapsed,
                })
            }
        }
    }

    fn acquire<E>(&self) -> Result<CallPermit<'_>, BreakerError<E>> {
        let now = Instant::now();
        let mut s = self.lock();

        if s.state == CircuitState::Open {
            if matches!(s.next_probe_at, Some(at) if now >= at) {
                self.transition(&mut s, CircuitState::HalfOpen, now, None);
            }
        }

        let state = s.state;
        let probe = match state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if s.half_open_in_flight < self.config.half_open_probe_count => {
                s.half_open_in_flight += 1;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                s.stats.total_rejections += 1;
                let retry_after = s.next_probe_at.map(|at| at.saturating_duration_since(now));
                let stats = s.stats.snapshot();
                drop(s);

                tracing::debug!(service = %self.service, state = %state, "Call blocked by circuit breaker");
                metrics::record_rejected(&self.service);
                self.events.publish(ResilienceEvent::Blocked {
                    service: self.service.clone(),
                    state,
                    stats,
                });
                return Err(BreakerError::Open {
                    service: self.service.clone(),
                    retry_after,
                });
            }
        };

        Ok(CallPermit {
            breaker: self,
            generation: s.generation,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64, probe: bool, latency: Duration) {
        let now = Instant::now();
        let mut s = self.lock();
        s.stats.record(true, latency);

        let current = s.generation == generation;
        if current {
            if probe {
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
            }
            let state = s.state;
            match state {
                CircuitState::Closed => {
                    s.consecutive_failures = 0;
                    s.consecutive_successes += 1;
                }
                CircuitState::HalfOpen => {
                    self.transition(&mut s, CircuitState::Closed, now, None);
                }
                CircuitState::Open => {}
            }
        }

        let stats = s.stats.snapshot();
        drop(s);

        tracing::debug!(service = %self.service, latency_ms = latency.as_millis() as u64, "Call succeeded");
        metrics::record_call(&self.service, "success", latency);
        self.events.publish(ResilienceEvent::Success {
            service: self.service.clone(),
            latency_ms: latency.as_millis() as u64,
            stats,
        });
    }

    fn on_failure(&self, generation: u64, probe: bool, latency: Duration, error: String) {
        let now = Instant::now();
        let mut s = self.lock();
        s.stats.record(false, latency);
        s.last_failure_at = Some(now);

        let current = s.generation == generation;
        if current {
            if probe {
                s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
            }
            let state = s.state;
            match state {
                CircuitState::Closed => {
                    s.consecutive_successes = 0;
                    s.consecutive_failures += 1;
                    if s.consecutive_failures >= self.config.max_failures {
                        self.transition(&mut s, CircuitState::Open, now, None);
                    }
                }
                CircuitState::HalfOpen => {
                    s.consecutive_failures += 1;
                    self.transition(&mut s, CircuitState::Open, now, None);
                }
                CircuitState::Open => {}
            }
        }

        let stats = s.stats.snapshot();
        drop(s);

        tracing::debug!(service = %self.service, error = %error, "Call failed");
        metrics::record_call(&self.service, "failure", latency);
        self.events.publish(ResilienceEvent::Failure {
            service: self.service.clone(),
            latency_ms: latency.as_millis() as u64,
            error,
            stats,
        });
    }

    fn release_probe(&self, generation: u64) {
        let mut s = self.lock();
        if s.generation == generation {
            s.half_open_in_flight = s.half_open_in_flight.saturating_sub(1);
        }
    }

    /// Apply a transition inside the caller's critical section.
    ///
    /// `open_for` overrides the configured reset timeout when opening.
    fn transition(
        &self,
        s: &mut BreakerState,
        to: CircuitState,
        now: Instant,
        open_for: Option<Duration>,
    ) {
        let from = s.state;
        s.state = to;
        s.generation += 1;
        s.half_open_in_flight = 0;

        match to {
            CircuitState::Open => {
                let wait = open_for.unwrap_or_else(|| self.config.reset_timeout());
                s.next_probe_at = Some(now + wait);
                s.consecutive_successes = 0;
                tracing::warn!(
                    service = %self.service,
                    from = %from,
                    failures = s.consecutive_failures,
                    reopen_in_ms = wait.as_millis() as u64,
                    "Circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                s.consecutive_successes = 0;
                tracing::info!(service = %self.service, "Circuit half-open, probing");
            }
            CircuitState::Closed => {
                s.consecutive_failures = 0;
                s.consecutive_successes = 0;
                s.next_probe_at = None;
                tracing::info!(service = %self.service, from = %from, "Circuit closed");
            }
        }

        metrics::record_breaker_state(&self.service, to);
        self.events.publish(ResilienceEvent::StateChanged {
            service: self.service.clone(),
            from,
            to,
        });
    }

    /// Open the circuit for `duration`, regardless of failure counts.
    ///
    /// Durations below one millisecond are raised to one millisecond so an
    /// open circuit always has its next probe in the future.
    pub fn force_open(&self, duration: Duration) {
        let duration = duration.max(MIN_FORCE_OPEN);
        let now = Instant::now();
        let mut s = self.lock();
        if s.state == CircuitState::Open {
            s.next_probe_at = Some(now + duration);
            tracing::info!(service = %self.service, reopen_in_ms = duration.as_millis() as u64, "Open circuit rescheduled");
            return;
        }
        self.transition(&mut s, CircuitState::Open, now, Some(duration));
    }

    /// Close the circuit. A no-op when already closed.
    pub fn force_close(&self) {
        let mut s = self.lock();
        if s.state == CircuitState::Closed {
            return;
        }
        self.transition(&mut s, CircuitState::Closed, Instant::now(), None);
    }

    /// Return to a fresh Closed breaker with empty statistics.
    pub fn reset(&self) {
        let mut s = self.lock();
        let from = s.state;
        let generation = s.generation + 1;
        *s = BreakerState::new(self.config.stats_window);
        s.generation = generation;
        drop(s);

        tracing::info!(service = %self.service, "Circuit breaker reset");
        metrics::record_breaker_state(&self.service, CircuitState::Closed);
        if from != CircuitState::Closed {
            self.events.publish(ResilienceEvent::StateChanged {
                service: self.service.clone(),
                from,
                to: CircuitState::Closed,
            });
        }
    }
}

/// Per-service breakers, created on first use.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<ServiceBreaker>>,
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    events: EventBus,
}

impl CircuitBreakerRegistry {
    pub fn new(defaults: BreakerConfig, events: EventBus) -> Self {
        Self {
            breakers: DashMap::new(),
            defaults,
            overrides: HashMap::new(),
            events,
        }
    }

    /// Use `config` instead of the defaults for `service`.
    pub fn with_override(mut self, service: impl Into<String>, config: BreakerConfig) -> Self {
        self.overrides.insert(service.into(), config);
        self
    }

    /// The breaker for `service`, creating it on first access.
    pub fn breaker(&self, service: &str) -> Arc<ServiceBreaker> {
        if let Some(existing) = self.breakers.get(service) {
            return existing.value().clone();
        }
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(service)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                tracing::debug!(service = %service, "Creating circuit breaker");
                Arc::new(ServiceBreaker::new(service, config, self.events.clone()))
            })
            .value()
            .clone()
    }

    /// Run `operation` for `service` under an explicit deadline.
    pub async fn execute<F, Fut, T, E>(
        &self,
        service: &str,
        timeout: Duration,
        operation: F,
    ) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker = self.breaker(service);
        breaker.execute_with_timeout(timeout, operation).await
    }

    /// Run `operation` for `service` under the service's configured deadline.
    pub async fn call<F, Fut, T, E>(&self, service: &str, operation: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let breaker = self.breaker(service);
        breaker.execute(operation).await
    }

    /// Snapshot of an existing breaker; `None` if the service was never called.
    pub fn get_state(&self, service: &str) -> Option<BreakerSnapshot> {
        self.breakers.get(service).map(|b| b.value().snapshot())
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut all: Vec<_> = self.breakers.iter().map(|b| b.value().snapshot()).collect();
        all.sort_by(|a, b| a.service.cmp(&b.service));
        all
    }

    pub fn force_open(&self, service: &str, duration: Duration) {
        self.breaker(service).force_open(duration);
    }

    pub fn force_close(&self, service: &str) {
        self.breaker(service).force_close();
    }

    pub fn reset(&self, service: &str) -> bool {
        match self.breakers.get(service) {
            Some(b) => {
                b.value().reset();
                true
            }
            None => false,
        }
    }
}
