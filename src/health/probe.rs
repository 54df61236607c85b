//! Health probes.
//!
//! A probe answers one question: is the service answering right now.
//! [`HttpProbe`] issues `GET <health_url>` and treats any 2xx as healthy;
//! [`FnProbe`] adapts an async closure for in-process checks and tests.

use async_trait::async_trait;
use axum::body::Body;
use hyper::Request;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::resilience::timeouts::TimedOut;

/// Outcome of a probe that reached the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub latency: Duration,
}

impl ProbeResult {
    pub fn healthy(latency: Duration) -> Self {
        Self { ok: true, latency }
    }

    pub fn unhealthy(latency: Duration) -> Self {
        Self { ok: false, latency }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("probe request failed: {0}")]
    Request(String),
}

impl From<TimedOut> for ProbeError {
    fn from(t: TimedOut) -> Self {
        ProbeError::Timeout(t.elapsed)
    }
}

#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self) -> Result<ProbeResult, ProbeError>;
}

/// `GET` against a plain-HTTP health endpoint.
pub struct HttpProbe {
    url: Url,
    client: Client<HttpConnector, Body>,
}

impl HttpProbe {
    pub fn new(url: Url) -> Self {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        Self { url, client }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        let request = Request::builder()
            .method("GET")
            .uri(self.url.as_str())
            .header("user-agent", "resilience-gateway-health-check")
            .body(Body::empty())
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let started = Instant::now();
        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?;
        let latency = started.elapsed();

        if !response.status().is_success() {
            tracing::debug!(url = %self.url, status = %response.status(), "Health endpoint returned non-success");
        }
        Ok(ProbeResult {
            ok: response.status().is_success(),
            latency,
        })
    }
}

/// Probe backed by an async closure.
pub struct FnProbe<F> {
    check: F,
}

impl<F, Fut> FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResult, ProbeError>> + Send,
{
    pub fn new(check: F) -> Self {
        Self { check }
    }
}

#[async_trait]
impl<F, Fut> HealthProbe for FnProbe<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProbeResult, ProbeError>> + Send,
{
    async fn probe(&self) -> Result<ProbeResult, ProbeError> {
        (self.check)().await
    }
}
