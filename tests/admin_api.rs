//! Admin API behaviour through the full router stack.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use resilience_gateway::admin::{setup_admin_router, AdminState};
use resilience_gateway::config::{GatewayConfig, ServiceConfig};
use resilience_gateway::Gateway;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const KEY: &str = "test-admin-key";

fn gateway() -> Arc<Gateway> {
    let mut config = GatewayConfig::default();
    config.services = vec![ServiceConfig {
        name: "courses".into(),
        health_url: None,
        breaker: None,
        fallback: Some(json!({"courses": []})),
    }];
    Arc::new(Gateway::from_config(config))
}

fn router(gateway: Arc<Gateway>) -> Router {
    setup_admin_router(AdminState::new(gateway, KEY), Duration::from_secs(5))
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {KEY}"));
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_requests_without_key_are_rejected() {
    let app = router(gateway());

    let response = app
        .clone()
        .oneshot(Request::get("/admin/status").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(
            Request::get("/admin/status")
                .header("authorization", "Bearer wrong")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_empty_key_disables_admin_api() {
    let app = setup_admin_router(AdminState::new(gateway(), ""), Duration::from_secs(5));
    let response = app
        .oneshot(
            Request::get("/admin/status")
                .header("authorization", "Bearer ")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_status_carries_request_id() {
    let app = router(gateway());
    let response = app
        .oneshot(request(Method::GET, "/admin/status", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let body = json_body(response).await;
    assert_eq!(body["status"], "operational");
    assert_eq!(body["gateway"]["services"], 1);
    assert_eq!(body["gateway"]["open_breakers"], 0);
}

#[tokio::test]
async fn test_force_open_then_close_breaker() {
    let gateway = gateway();
    let app = router(gateway.clone());

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/admin/breakers/courses/open?duration_ms=60000",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await["state"], "OPEN");

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/admin/breakers/courses", None))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["state"], "OPEN");
    assert_eq!(gateway.status().open_breakers, 1);

    let response = app
        .clone()
        .oneshot(request(Method::POST, "/admin/breakers/courses/close", None))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["state"], "CLOSED");

    let response = app
        .oneshot(request(Method::GET, "/admin/breakers/unknown", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_zero_length_force_open_is_rejected() {
    let gateway = gateway();
    let app = router(gateway.clone());

    let response = app
        .oneshot(request(
            Method::POST,
            "/admin/breakers/courses/open?duration_ms=0",
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(gateway.get_breaker_state("courses").is_none());
    assert_eq!(gateway.status().open_breakers, 0);
}

#[tokio::test]
async fn test_blacklist_roundtrip() {
    let gateway = gateway();
    let app = router(gateway.clone());

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/admin/blacklist",
            Some(json!({"scope": "ip:203.0.113.7", "duration_ms": 60000})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert!(gateway.limiter().is_blacklisted("ip:203.0.113.7").await.unwrap());

    let response = app
        .clone()
        .oneshot(request(Method::DELETE, "/admin/blacklist/ip:203.0.113.7", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["scope"], "ip:203.0.113.7");
    assert_eq!(body["removed"], true);
    assert!(!gateway.limiter().is_blacklisted("ip:203.0.113.7").await.unwrap());

    let response = app
        .oneshot(request(
            Method::POST,
            "/admin/blacklist",
            Some(json!({"scope": "203.0.113.7"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rate_limit_view_counts_blacklists() {
    let gateway = gateway();
    let app = router(gateway.clone());

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/admin/blacklist",
            Some(json!({"scope": "user:mallory"})),
        ))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(
        body["duration_ms"],
        gateway.limiter().config().blacklist_duration_ms
    );

    let response = app
        .oneshot(request(Method::GET, "/admin/rate-limit", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["stats"]["blacklists_issued"], 1);
    assert!(body["config"]["enabled"].is_boolean());
}

#[tokio::test]
async fn test_degradation_and_health_views() {
    let gateway = gateway();
    gateway.degradation().activate("courses");
    let app = router(gateway);

    let response = app
        .clone()
        .oneshot(request(Method::GET, "/admin/degradation", None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body[0]["service"], "courses");
    assert_eq!(body[0]["active"], true);
    assert_eq!(body[0]["fallback"], json!({"courses": []}));

    let response = app
        .oneshot(request(Method::GET, "/admin/health", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["total"], 0);
    assert_eq!(body["degraded"], 1);
    assert_eq!(body["compliance"], "EXCELLENT");
}
