//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (thresholds > 0, windows > 0, multipliers >= 1)
//! - Detect duplicate service names
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;
use thiserror::Error;

use crate::config::schema::{BreakerConfig, GatewayConfig, RetryPolicy, ScopeLimit};

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{field}: must be greater than zero")]
    Zero { field: String },

    #[error("{field}: {reason}")]
    OutOfRange { field: String, reason: String },

    #[error("duplicate service name '{0}'")]
    DuplicateService(String),

    #[error("{field}: invalid socket address '{value}'")]
    InvalidAddress { field: String, value: String },
}

fn zero(field: impl Into<String>) -> ValidationError {
    ValidationError::Zero { field: field.into() }
}

/// Validate a parsed configuration.
pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    validate_breaker("breaker", &config.breaker, &mut errors);

    let mut seen = HashSet::new();
    for (i, service) in config.services.iter().enumerate() {
        if service.name.trim().is_empty() {
            errors.push(ValidationError::OutOfRange {
                field: format!("services[{i}].name"),
                reason: "must not be empty".to_string(),
            });
        }
        if !seen.insert(service.name.as_str()) {
            errors.push(ValidationError::DuplicateService(service.name.clone()));
        }
        if let Some(breaker) = &service.breaker {
            validate_breaker(&format!("services[{i}].breaker"), breaker, &mut errors);
        }
    }

    let rl = &config.rate_limit;
    for (name, limit) in [
        ("global", rl.global),
        ("ip", rl.ip),
        ("user", rl.user),
        ("endpoint", rl.endpoint),
    ] {
        if let Some(limit) = limit {
            validate_scope(&format!("rate_limit.{name}"), &limit, &mut errors);
        }
    }
    if rl.blacklist_duration_ms == 0 {
        errors.push(zero("rate_limit.blacklist_duration_ms"));
    }
    if rl.violation_threshold == 0 {
        errors.push(zero("rate_limit.violation_threshold"));
    }

    let retries = &config.retries;
    validate_policy("retries.default", &retries.default, &mut errors);
    for (name, policy) in [
        ("timeout", &retries.timeout),
        ("connection_reset", &retries.connection_reset),
        ("rate_limited", &retries.rate_limited),
        ("server_error", &retries.server_error),
    ] {
        if let Some(policy) = policy {
            validate_policy(&format!("retries.{name}"), policy, &mut errors);
        }
    }

    let hc = &config.health_check;
    if hc.interval_ms == 0 {
        errors.push(zero("health_check.interval_ms"));
    }
    if hc.timeout_ms == 0 {
        errors.push(zero("health_check.timeout_ms"));
    }
    if hc.force_open_ms == 0 {
        errors.push(zero("health_check.force_open_ms"));
    }
    if hc.unhealthy_threshold == 0 {
        errors.push(zero("health_check.unhealthy_threshold"));
    }
    if hc.healthy_threshold == 0 {
        errors.push(zero("health_check.healthy_threshold"));
    }

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidAddress {
            field: "admin.bind_address".to_string(),
            value: config.admin.bind_address.clone(),
        });
    }
    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidAddress {
            field: "observability.metrics_address".to_string(),
            value: config.observability.metrics_address.clone(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_breaker(prefix: &str, breaker: &BreakerConfig, errors: &mut Vec<ValidationError>) {
    if breaker.max_failures == 0 {
        errors.push(zero(format!("{prefix}.max_failures")));
    }
    if breaker.reset_timeout_ms == 0 {
        errors.push(zero(format!("{prefix}.reset_timeout_ms")));
    }
    if breaker.half_open_probe_count == 0 {
        errors.push(zero(format!("{prefix}.half_open_probe_count")));
    }
    if breaker.call_timeout_ms == 0 {
        errors.push(zero(format!("{prefix}.call_timeout_ms")));
    }
    if breaker.stats_window == 0 {
        errors.push(zero(format!("{prefix}.stats_window")));
    }
}

fn validate_scope(prefix: &str, limit: &ScopeLimit, errors: &mut Vec<ValidationError>) {
    if limit.window_ms == 0 {
        errors.push(zero(format!("{prefix}.window_ms")));
    }
    if limit.max_requests == 0 {
        errors.push(zero(format!("{prefix}.max_requests")));
    }
}

fn validate_policy(prefix: &str, policy: &RetryPolicy, errors: &mut Vec<ValidationError>) {
    if policy.backoff_multiplier < 1.0 || !policy.backoff_multiplier.is_finite() {
        errors.push(ValidationError::OutOfRange {
            field: format!("{prefix}.backoff_multiplier"),
            reason: "must be a finite value >= 1.0".to_string(),
        });
    }
    if policy.base_delay_ms > policy.max_delay_ms {
        errors.push(ValidationError::OutOfRange {
            field: format!("{prefix}.base_delay_ms"),
            reason: format!("{} exceeds max_delay_ms {}", policy.base_delay_ms, policy.max_delay_ms),
        });
    }
}
