//! Shared utilities for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use resilience_gateway::resilience::UpstreamError;
use resilience_gateway::security::store::{CounterStore, StoreError, WindowSnapshot};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Start a programmable mock upstream on an ephemeral port.
///
/// `f` receives the request path and returns the status code and body.
pub async fn start_programmable_backend<F, Fut>(f: F) -> SocketAddr
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = (u16, String)> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let f = Arc::new(f);

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    let f = f.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 2048];
                        let n = socket.read(&mut buf).await.unwrap_or(0);
                        let head = String::from_utf8_lossy(&buf[..n]);
                        let path = head
                            .lines()
                            .next()
                            .and_then(|line| line.split_whitespace().nth(1))
                            .unwrap_or("/")
                            .to_string();

                        let (status, body) = f(path).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            429 => "429 Too Many Requests",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// A client without connection pooling, so every call opens a fresh socket.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// GET `url`, mapping transport failures and non-2xx statuses to [`UpstreamError`].
pub async fn fetch(client: &reqwest::Client, url: &str) -> Result<String, UpstreamError> {
    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            UpstreamError::Timeout
        } else {
            UpstreamError::ConnectionReset(e.to_string())
        }
    })?;
    let status = response.status();
    if !status.is_success() {
        return Err(UpstreamError::Status(status.as_u16()));
    }
    response
        .text()
        .await
        .map_err(|e| UpstreamError::Other(e.to_string()))
}

/// A counter store whose backend is always down.
pub struct FailingStore;

fn down() -> StoreError {
    StoreError::Unavailable("connection refused".into())
}

#[async_trait]
impl CounterStore for FailingStore {
    async fn increment(&self, _: &str, _: Duration) -> Result<u64, StoreError> {
        Err(down())
    }

    async fn count(&self, _: &str) -> Result<u64, StoreError> {
        Err(down())
    }

    async fn exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn set_with_ttl(&self, _: &str, _: u64, _: Duration) -> Result<(), StoreError> {
        Err(down())
    }

    async fn ttl(&self, _: &str) -> Result<Option<Duration>, StoreError> {
        Err(down())
    }

    async fn remove(&self, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn window_try_add(
        &self,
        _: &str,
        _: &str,
        _: u64,
        _: u64,
        _: u64,
    ) -> Result<WindowSnapshot, StoreError> {
        Err(down())
    }

    async fn window_remove(&self, _: &str, _: &str) -> Result<bool, StoreError> {
        Err(down())
    }

    async fn window_count(&self, _: &str, _: u64, _: u64) -> Result<WindowSnapshot, StoreError> {
        Err(down())
    }
}
