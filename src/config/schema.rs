//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the gateway.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// Root configuration for the resilience gateway.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    /// Admin API settings (bind address, API key).
    pub admin: AdminConfig,

    /// Default circuit breaker settings, applied to every service.
    pub breaker: BreakerConfig,

    /// Upstream services protected by the gateway.
    pub services: Vec<ServiceConfig>,

    /// Rate limiting configuration.
    pub rate_limit: RateLimitConfig,

    /// Retry policies keyed by error kind.
    pub retries: RetryConfig,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Effective breaker settings for a service (override or defaults).
    pub fn breaker_for(&self, service: &str) -> BreakerConfig {
        self.services
            .iter()
            .find(|s| s.name == service)
            .and_then(|s| s.breaker.clone())
            .unwrap_or_else(|| self.breaker.clone())
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// Bind address (e.g., "127.0.0.1:8081").
    pub bind_address: String,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Request timeout for admin handlers in seconds.
    pub request_timeout_secs: u64,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "127.0.0.1:8081".to_string(),
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures in Closed state before the circuit opens.
    pub max_failures: u32,

    /// How long the circuit stays open before a probe is allowed, in milliseconds.
    pub reset_timeout_ms: u64,

    /// Maximum concurrent probe calls while half-open.
    pub half_open_probe_count: u32,

    /// Deadline applied to every wrapped call, in milliseconds.
    pub call_timeout_ms: u64,

    /// Number of recent outcomes used for the failure rate.
    pub stats_window: usize,
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_failures: 5,
            reset_timeout_ms: 60_000,
            half_open_probe_count: 1,
            call_timeout_ms: 10_000,
            stats_window: 100,
        }
    }
}

/// A protected upstream service.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Logical service name (e.g., "payments").
    pub name: String,

    /// URL probed by the health monitor. Services without one are not probed.
    #[serde(default)]
    pub health_url: Option<Url>,

    /// Per-service breaker override.
    #[serde(default)]
    pub breaker: Option<BreakerConfig>,

    /// Fallback payload served while the service is degraded.
    #[serde(default)]
    pub fallback: Option<serde_json::Value>,
}

/// Window and quota for one scope kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ScopeLimit {
    /// Sliding window length in milliseconds.
    pub window_ms: u64,

    /// Maximum units admitted inside one window.
    pub max_requests: u64,
}

impl ScopeLimit {
    pub fn new(window_ms: u64, max_requests: u64) -> Self {
        Self { window_ms, max_requests }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Limit shared by every caller.
    pub global: Option<ScopeLimit>,

    /// Per client IP limit.
    pub ip: Option<ScopeLimit>,

    /// Per authenticated user limit.
    pub user: Option<ScopeLimit>,

    /// Per "METHOD /path" limit.
    pub endpoint: Option<ScopeLimit>,

    /// Blacklist TTL, also the window in which violations are counted.
    pub blacklist_duration_ms: u64,

    /// Denials inside the blacklist window that trigger a blacklist.
    pub violation_threshold: u32,

    /// Scope keys that are never limited (e.g. "ip:10.0.0.1").
    pub whitelist: Vec<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: None,
            ip: Some(ScopeLimit::new(60_000, 100)),
            user: None,
            endpoint: None,
            blacklist_duration_ms: 15 * 60 * 1000,
            violation_threshold: 3,
            whitelist: Vec::new(),
        }
    }
}

/// Backoff policy for one error kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,

    /// Delay before the first retry in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound for any single delay in milliseconds.
    pub max_delay_ms: u64,

    /// Growth factor between consecutive delays.
    pub backoff_multiplier: f64,

    /// Add up to 10% random jitter on top of each delay.
    pub jitter: bool,

    /// The wrapped operation is safe to repeat.
    pub idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            jitter: false,
            idempotent: false,
        }
    }
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Enable retries.
    pub enabled: bool,

    /// Policy for error kinds without a dedicated entry.
    pub default: RetryPolicy,

    pub timeout: Option<RetryPolicy>,
    pub connection_reset: Option<RetryPolicy>,
    pub rate_limited: Option<RetryPolicy>,
    pub server_error: Option<RetryPolicy>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default: RetryPolicy::default(),
            timeout: Some(RetryPolicy {
                max_retries: 2,
                base_delay_ms: 500,
                max_delay_ms: 5_000,
                ..RetryPolicy::default()
            }),
            connection_reset: Some(RetryPolicy {
                max_retries: 3,
                base_delay_ms: 200,
                max_delay_ms: 2_000,
                ..RetryPolicy::default()
            }),
            rate_limited: Some(RetryPolicy {
                max_retries: 2,
                base_delay_ms: 2_000,
                max_delay_ms: 30_000,
                ..RetryPolicy::default()
            }),
            server_error: None,
        }
    }
}

/// Health check configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Health check interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// How long the breaker is forced open when a service turns unhealthy.
    pub force_open_ms: u64,

    /// Number of consecutive failed probes before marking unhealthy.
    pub unhealthy_threshold: u32,

    /// Number of consecutive successful probes before marking healthy.
    pub healthy_threshold: u32,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn force_open(&self) -> Duration {
        Duration::from_millis(self.force_open_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 30_000,
            timeout_ms: 5_000,
            force_open_ms: 10_000,
            unhealthy_threshold: 1,
            healthy_threshold: 1,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Emit JSON log lines instead of the human-readable format.
    pub json_logs: bool,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_toml_uses_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [[services]]
            name = "payments"
            health_url = "http://127.0.0.1:4000/health"
            "#,
        )
        .unwrap();

        assert_eq!(config.services.len(), 1);
        assert_eq!(config.breaker.max_failures, 5);
        assert_eq!(config.rate_limit.violation_threshold, 3);
        assert_eq!(config.health_check.interval_ms, 30_000);
    }

    #[test]
    fn test_service_breaker_override() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [breaker]
            max_failures = 10

            [[services]]
            name = "jobs"

            [[services]]
            name = "payments"
            [services.breaker]
            max_failures = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.breaker_for("payments").max_failures, 3);
        // Fields missing from the override fall back to BreakerConfig defaults.
        assert_eq!(config.breaker_for("payments").half_open_probe_count, 1);
        assert_eq!(config.breaker_for("jobs").max_failures, 10);
        assert_eq!(config.breaker_for("unknown").max_failures, 10);
    }

    #[test]
    fn test_scope_limits_and_fallback_parse() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [rate_limit]
            whitelist = ["ip:10.0.0.1"]
            [rate_limit.endpoint]
            window_ms = 1000
            max_requests = 5

            [[services]]
            name = "courses"
            fallback = { items = [], degraded = true }
            "#,
        )
        .unwrap();

        assert_eq!(config.rate_limit.endpoint, Some(ScopeLimit::new(1000, 5)));
        assert_eq!(config.rate_limit.whitelist, vec!["ip:10.0.0.1".to_string()]);
        let fallback = config.services[0].fallback.as_ref().unwrap();
        assert_eq!(fallback["degraded"], serde_json::Value::Bool(true));
    }
}
