use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::admin::AdminState;
use crate::config::RateLimitConfig;
use crate::gateway::GatewayStatus;
use crate::health::HealthReport;
use crate::resilience::circuit_breaker::BreakerSnapshot;
use crate::resilience::degradation::StrategyInfo;
use crate::security::rate_limit::RateLimitStats;
use crate::security::store::StoreError;

const DEFAULT_WHITELIST_MS: u64 = 60 * 60 * 1000;

/// JSON error body with a status code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({ "error": self.message })),
        )
            .into_response()
    }
}

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    pub gateway: GatewayStatus,
}

#[derive(Serialize)]
pub struct RateLimitView {
    pub stats: RateLimitStats,
    pub config: RateLimitConfig,
}

#[derive(Debug, Deserialize)]
pub struct ForceOpenParams {
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ScopeRequest {
    pub scope: String,
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct ScopeResponse {
    pub scope: String,
    pub duration_ms: u64,
}

#[derive(Debug, Serialize)]
pub struct Removed {
    pub scope: String,
    pub removed: bool,
}

fn validate_scope(scope: &str) -> Result<(), ApiError> {
    let known = scope == "global"
        || ["ip:", "user:", "endpoint:"]
            .iter()
            .any(|prefix| scope.len() > prefix.len() && scope.starts_with(prefix));
    if known {
        Ok(())
    } else {
        Err(ApiError::bad_request(format!(
            "invalid scope '{scope}', expected global, ip:<addr>, user:<id> or endpoint:<METHOD /path>"
        )))
    }
}

pub async fn get_status(State(state): State<AdminState>) -> Json<SystemStatus> {
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status: "operational",
        gateway: state.gateway.status(),
    })
}

pub async fn list_breakers(State(state): State<AdminState>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.gateway.breakers().snapshots())
}

pub async fn get_breaker(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    state
        .gateway
        .get_breaker_state(&service)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no breaker for service '{service}'")))
}

pub async fn open_breaker(
    State(state): State<AdminState>,
    Path(service): Path<String>,
    Query(params): Query<ForceOpenParams>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    if params.duration_ms == Some(0) {
        return Err(ApiError::bad_request("duration_ms must be greater than zero"));
    }
    let breaker = state.gateway.breakers().breaker(&service);
    let duration = params
        .duration_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| breaker.config().reset_timeout());
    breaker.force_open(duration);
    tracing::info!(service = %service, duration_ms = duration.as_millis() as u64, "Breaker forced open via admin API");
    Ok(Json(breaker.snapshot()))
}

pub async fn close_breaker(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Json<BreakerSnapshot> {
    let breaker = state.gateway.breakers().breaker(&service);
    breaker.force_close();
    tracing::info!(service = %service, "Breaker forced closed via admin API");
    Json(breaker.snapshot())
}

pub async fn reset_breaker(
    State(state): State<AdminState>,
    Path(service): Path<String>,
) -> Result<Json<BreakerSnapshot>, ApiError> {
    let breakers = state.gateway.breakers();
    if !breakers.reset(&service) {
        return Err(ApiError::not_found(format!("no breaker for service '{service}'")));
    }
    tracing::info!(service = %service, "Breaker reset via admin API");
    breakers
        .get_state(&service)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no breaker for service '{service}'")))
}

pub async fn get_rate_limit(State(state): State<AdminState>) -> Json<RateLimitView> {
    let limiter = state.gateway.limiter();
    Json(RateLimitView {
        stats: limiter.stats(),
        config: (*limiter.config()).clone(),
    })
}

pub async fn add_blacklist(
    State(state): State<AdminState>,
    Json(request): Json<ScopeRequest>,
) -> Result<(StatusCode, Json<ScopeResponse>), ApiError> {
    validate_scope(&request.scope)?;
    let limiter = state.gateway.limiter();
    let duration_ms = request
        .duration_ms
        .unwrap_or(limiter.config().blacklist_duration_ms);
    limiter
        .blacklist(&request.scope, Duration::from_millis(duration_ms))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ScopeResponse {
            scope: request.scope,
            duration_ms,
        }),
    ))
}

pub async fn remove_blacklist(
    State(state): State<AdminState>,
    Path(scope): Path<String>,
) -> Result<Json<Removed>, ApiError> {
    let removed = state.gateway.limiter().unblacklist(&scope).await?;
    Ok(Json(Removed { scope, removed }))
}

pub async fn add_whitelist(
    State(state): State<AdminState>,
    Json(request): Json<ScopeRequest>,
) -> Result<(StatusCode, Json<ScopeResponse>), ApiError> {
    validate_scope(&request.scope)?;
    let duration_ms = request.duration_ms.unwrap_or(DEFAULT_WHITELIST_MS);
    state
        .gateway
        .limiter()
        .whitelist(&request.scope, Duration::from_millis(duration_ms))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(ScopeResponse {
            scope: request.scope,
            duration_ms,
        }),
    ))
}

pub async fn remove_whitelist(
    State(state): State<AdminState>,
    Path(scope): Path<String>,
) -> Result<Json<Removed>, ApiError> {
    let removed = state.gateway.limiter().unwhitelist(&scope).await?;
    Ok(Json(Removed { scope, removed }))
}

pub async fn get_health(State(state): State<AdminState>) -> Json<HealthReport> {
    Json(state.gateway.health_report())
}

pub async fn get_degradation(State(state): State<AdminState>) -> Json<Vec<StrategyInfo>> {
    Json(state.gateway.degradation().strategies())
}
