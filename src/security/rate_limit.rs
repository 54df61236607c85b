//! Sliding-window rate limiting with blacklist escalation.
//!
//! # Decision Order
//! ```text
//! whitelist hit       → allow, nothing counted
//! blacklist hit       → deny, nothing counted
//! every limited scope → atomic trim + count + conditional add
//!     any scope full  → withdraw this request's units, record a violation,
//!                       blacklist once violations reach the threshold
//! store unreachable   → allow (fail open)
//! ```

use arc_swap::ArcSwap;
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header::RETRY_AFTER, HeaderMap, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{RateLimitConfig, ScopeLimit};
use crate::observability::events::{EventBus, ResilienceEvent};
use crate::observability::metrics;
use crate::security::store::{CounterStore, StoreError};

/// A counting scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    Global,
    Ip(IpAddr),
    User(String),
    Endpoint { method: String, path: String },
}

impl ScopeKey {
    pub fn endpoint(method: impl Into<String>, path: impl Into<String>) -> Self {
        ScopeKey::Endpoint {
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
        }
    }

    fn limit<'c>(&self, config: &'c RateLimitConfig) -> Option<&'c ScopeLimit> {
        match self {
            ScopeKey::Global => config.global.as_ref(),
            ScopeKey::Ip(_) => config.ip.as_ref(),
            ScopeKey::User(_) => config.user.as_ref(),
            ScopeKey::Endpoint { .. } => config.endpoint.as_ref(),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::Global => f.write_str("global"),
            ScopeKey::Ip(ip) => write!(f, "ip:{ip}"),
            ScopeKey::User(id) => write!(f, "user:{id}"),
            ScopeKey::Endpoint { method, path } => write!(f, "endpoint:{method} {path}"),
        }
    }
}

/// Quota details attached to a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitInfo {
    pub limit: u64,
    pub remaining: u64,
    /// Epoch milliseconds at which capacity frees up.
    pub reset_at_ms: u64,
}

impl RateLimitInfo {
    /// Write the `X-RateLimit-*` headers (reset in epoch seconds).
    pub fn apply_headers(&self, headers: &mut HeaderMap) {
        headers.insert("x-ratelimit-limit", HeaderValue::from(self.limit));
        headers.insert("x-ratelimit-remaining", HeaderValue::from(self.remaining));
        headers.insert("x-ratelimit-reset", HeaderValue::from(self.reset_at_ms.div_ceil(1000)));
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateDecision {
    /// `info` describes the tightest counted scope; `None` when nothing was
    /// counted (whitelisted, disabled, no limited scope, or fail-open).
    Allowed { info: Option<RateLimitInfo> },
    Denied {
        scope: String,
        blacklisted: bool,
        info: RateLimitInfo,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn info(&self) -> Option<&RateLimitInfo> {
        match self {
            RateDecision::Allowed { info } => info.as_ref(),
            RateDecision::Denied { info, .. } => Some(info),
        }
    }
}

/// Epoch-millisecond clock driven by Tokio's clock, so paused-time tests can
/// move windows forward.
#[derive(Debug, Clone, Copy)]
pub struct EpochClock {
    origin_ms: u64,
    origin: Instant,
}

impl EpochClock {
    pub fn new() -> Self {
        let origin_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();
        Self::starting_at(origin_ms)
    }

    pub fn starting_at(origin_ms: u64) -> Self {
        Self {
            origin_ms,
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.origin_ms + self.origin.elapsed().as_millis() as u64
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct Counters {
    allowed: AtomicU64,
    denied: AtomicU64,
    blacklist_denials: AtomicU64,
    whitelisted: AtomicU64,
    fail_open: AtomicU64,
    blacklists_issued: AtomicU64,
}

/// Process-local decision counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub enabled: bool,
    pub allowed: u64,
    pub denied: u64,
    pub blacklist_denials: u64,
    pub whitelisted: u64,
    pub fail_open: u64,
    pub blacklists_issued: u64,
}

fn window_key(scope: &str) -> String {
    format!("ratelimit:{scope}")
}

fn violation_key(scope: &str) -> String {
    format!("violations:{scope}")
}

fn blacklist_key(scope: &str) -> String {
    format!("blacklist:{scope}")
}

fn whitelist_key(scope: &str) -> String {
    format!("whitelist:{scope}")
}

pub struct RateLimiter {
    config: ArcSwap<RateLimitConfig>,
    store: Arc<dyn CounterStore>,
    clock: EpochClock,
    events: EventBus,
    counters: Counters,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, store: Arc<dyn CounterStore>, events: EventBus) -> Self {
        Self::with_clock(config, store, events, EpochClock::new())
    }

    pub fn with_clock(
        config: RateLimitConfig,
        store: Arc<dyn CounterStore>,
        events: EventBus,
        clock: EpochClock,
    ) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            store,
            clock,
            events,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.load_full()
    }

    /// Swap in reloaded settings; in-flight decisions finish on the old ones.
    pub fn update_config(&self, config: RateLimitConfig) {
        self.config.store(Arc::new(config));
        tracing::info!("Rate limit configuration updated");
    }

    /// Decide on one unit of work under the current configuration.
    pub async fn admit(&self, scopes: &[ScopeKey]) -> RateDecision {
        let config = self.config.load_full();
        self.admit_with(scopes, &config).await
    }

    pub async fn admit_with(&self, scopes: &[ScopeKey], config: &RateLimitConfig) -> RateDecision {
        if !config.enabled {
            return RateDecision::Allowed { info: None };
        }
        match self.decide(scopes, config).await {
            Ok(decision) => {
                match &decision {
                    RateDecision::Allowed { .. } => {
                        self.counters.allowed.fetch_add(1, Ordering::Relaxed);
                        metrics::record_rate_limit("allowed");
                    }
                    RateDecision::Denied { scope, blacklisted, .. } => {
                        self.counters.denied.fetch_add(1, Ordering::Relaxed);
                        metrics::record_rate_limit(if *blacklisted { "blacklisted" } else { "denied" });
                        self.events.publish(ResilienceEvent::RateLimited {
                            scope: scope.clone(),
                            blacklisted: *blacklisted,
                        });
                    }
                }
                decision
            }
            Err(e) => {
                self.counters.fail_open.fetch_add(1, Ordering::Relaxed);
                metrics::record_fail_open();
                tracing::warn!(error = %e, "Counter store unavailable, allowing request");
                RateDecision::Allowed { info: None }
            }
        }
    }

    async fn decide(
        &self,
        scopes: &[ScopeKey],
        config: &RateLimitConfig,
    ) -> Result<RateDecision, StoreError> {
        let now_ms = self.clock.now_ms();
        let names: Vec<String> = scopes.iter().map(ToString::to_string).collect();

        for name in &names {
            if config.whitelist.iter().any(|w| w == name)
                || self.store.exists(&whitelist_key(name)).await?
            {
                self.counters.whitelisted.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = %name, "Whitelisted, skipping rate limit");
                return Ok(RateDecision::Allowed { info: None });
            }
        }

        for (scope, name) in scopes.iter().zip(&names) {
            if let Some(remaining) = self.store.ttl(&blacklist_key(name)).await? {
                self.counters.blacklist_denials.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(scope = %name, "Blacklisted scope denied");
                return Ok(RateDecision::Denied {
                    scope: name.clone(),
                    blacklisted: true,
                    info: RateLimitInfo {
                        limit: scope.limit(config).map_or(0, |l| l.max_requests),
                        remaining: 0,
                        reset_at_ms: now_ms + remaining.as_millis() as u64,
                    },
                });
            }
        }

        let member = Uuid::new_v4().to_string();
        let mut recorded: Vec<String> = Vec::new();
        let mut tightest: Option<RateLimitInfo> = None;

        for (scope, name) in scopes.iter().zip(&names) {
            let Some(limit) = scope.limit(config) else {
                continue;
            };
            let key = window_key(name);
            let snapshot = match self
                .store
                .window_try_add(&key, &member, now_ms, limit.window_ms, limit.max_requests)
                .await
            {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.withdraw(&recorded, &member).await;
                    return Err(e);
                }
            };
            let info = RateLimitInfo {
                limit: limit.max_requests,
                remaining: limit.max_requests.saturating_sub(snapshot.count),
                reset_at_ms: snapshot.oldest_ms.unwrap_or(now_ms) + limit.window_ms,
            };

            if !snapshot.admitted {
                self.withdraw(&recorded, &member).await;
                let blacklisted = self.record_violation(name, config, now_ms).await?;
                tracing::info!(scope = %name, limit = limit.max_requests, blacklisted, "Rate limit exceeded");
                return Ok(RateDecision::Denied {
                    scope: name.clone(),
                    blacklisted,
                    info,
                });
            }

            recorded.push(key);
            if tightest.map_or(true, |t| info.remaining < t.remaining) {
                tightest = Some(info);
            }
        }

        Ok(RateDecision::Allowed { info: tightest })
    }

    async fn withdraw(&self, keys: &[String], member: &str) {
        for key in keys {
            if let Err(e) = self.store.window_remove(key, member).await {
                tracing::warn!(key = %key, error = %e, "Failed to withdraw rate limit unit");
            }
        }
    }

    /// Returns true when this violation tipped the scope into the blacklist.
    async fn record_violation(
        &self,
        scope: &str,
        config: &RateLimitConfig,
        now_ms: u64,
    ) -> Result<bool, StoreError> {
        let key = violation_key(scope);
        let violations = self
            .store
            .window_try_add(
                &key,
                &Uuid::new_v4().to_string(),
                now_ms,
                config.blacklist_duration_ms,
                u64::MAX,
            )
            .await?;
        if violations.count < u64::from(config.violation_threshold) {
            return Ok(false);
        }

        let duration = Duration::from_millis(config.blacklist_duration_ms);
        self.store.set_with_ttl(&blacklist_key(scope), 1, duration).await?;
        self.store.remove(&key).await?;
        self.counters.blacklists_issued.fetch_add(1, Ordering::Relaxed);
        tracing::warn!(
            scope = %scope,
            violations = violations.count,
            duration_ms = config.blacklist_duration_ms,
            "Scope blacklisted after repeated violations"
        );
        self.events.publish(ResilienceEvent::Blacklisted {
            scope: scope.to_string(),
            duration_ms: config.blacklist_duration_ms,
        });
        Ok(true)
    }

    /// Deny `scope` outright for `duration`.
    pub async fn blacklist(&self, scope: &str, duration: Duration) -> Result<(), StoreError> {
        self.store.set_with_ttl(&blacklist_key(scope), 1, duration).await?;
        self.counters.blacklists_issued.fetch_add(1, Ordering::Relaxed);
        tracing::info!(scope = %scope, duration_ms = duration.as_millis() as u64, "Scope blacklisted");
        self.events.publish(ResilienceEvent::Blacklisted {
            scope: scope.to_string(),
            duration_ms: duration.as_millis() as u64,
        });
        Ok(())
    }

    pub async fn unblacklist(&self, scope: &str) -> Result<bool, StoreError> {
        let removed = self.store.remove(&blacklist_key(scope)).await?;
        self.store.remove(&violation_key(scope)).await?;
        if removed {
            tracing::info!(scope = %scope, "Scope removed from blacklist");
        }
        Ok(removed)
    }

    pub async fn is_blacklisted(&self, scope: &str) -> Result<bool, StoreError> {
        self.store.exists(&blacklist_key(scope)).await
    }

    /// Exempt `scope` from limiting for `duration`.
    pub async fn whitelist(&self, scope: &str, duration: Duration) -> Result<(), StoreError> {
        self.store.set_with_ttl(&whitelist_key(scope), 1, duration).await?;
        tracing::info!(scope = %scope, duration_ms = duration.as_millis() as u64, "Scope whitelisted");
        Ok(())
    }

    pub async fn unwhitelist(&self, scope: &str) -> Result<bool, StoreError> {
        self.store.remove(&whitelist_key(scope)).await
    }

    pub fn stats(&self) -> RateLimitStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        RateLimitStats {
            enabled: self.config.load().enabled,
            allowed: load(&self.counters.allowed),
            denied: load(&self.counters.denied),
            blacklist_denials: load(&self.counters.blacklist_denials),
            whitelisted: load(&self.counters.whitelisted),
            fail_open: load(&self.counters.fail_open),
            blacklists_issued: load(&self.counters.blacklists_issued),
        }
    }
}

/// Authenticated caller identity, inserted into request extensions by
/// whatever authenticates the request upstream of the limiter.
#[derive(Debug, Clone)]
pub struct UserId(pub String);

fn client_ip(request: &Request<Body>) -> Option<IpAddr> {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse().ok());
    forwarded.or_else(|| {
        request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip())
    })
}

/// Scopes a request counts against: global, client IP, user, endpoint.
pub fn request_scopes(request: &Request<Body>) -> Vec<ScopeKey> {
    let mut scopes = vec![ScopeKey::Global];
    if let Some(ip) = client_ip(request) {
        scopes.push(ScopeKey::Ip(ip));
    }
    if let Some(UserId(id)) = request.extensions().get::<UserId>() {
        scopes.push(ScopeKey::User(id.clone()));
    }
    scopes.push(ScopeKey::endpoint(request.method().as_str(), request.uri().path()));
    scopes
}

#[derive(Serialize)]
struct RateLimitBody {
    error: &'static str,
    message: String,
    scope: String,
    limit: u64,
    reset_time: u64,
}

/// Axum middleware: 429 with quota headers on denial, quota headers on the
/// upstream response otherwise.
pub async fn rate_limit_middleware(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let scopes = request_scopes(&request);
    match limiter.admit(&scopes).await {
        RateDecision::Allowed { info } => {
            let mut response = next.run(request).await;
            if let Some(info) = info {
                info.apply_headers(response.headers_mut());
            }
            response
        }
        RateDecision::Denied { scope, blacklisted, info } => {
            let message = if blacklisted {
                format!("{scope} is temporarily blocked")
            } else {
                format!("Rate limit exceeded. Maximum {} requests per window.", info.limit)
            };
            let body = RateLimitBody {
                error: "RATE_LIMIT_EXCEEDED",
                message,
                scope,
                limit: info.limit,
                reset_time: info.reset_at_ms.div_ceil(1000),
            };
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            info.apply_headers(response.headers_mut());
            let wait_secs = info.reset_at_ms.saturating_sub(limiter.clock.now_ms()).div_ceil(1000);
            response.headers_mut().insert(RETRY_AFTER, HeaderValue::from(wait_secs));
            response
        }
    }
}
