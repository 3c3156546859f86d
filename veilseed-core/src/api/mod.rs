//! Externally facing status API.
//!
//! Started last and stopped last by the session, so no client observes a
//! half-initialized node.
//!
//! | Route            | Response                                  |
//! |------------------|-------------------------------------------|
//! | `GET /health`    | aggregate health, 503 when unhealthy      |
//! | `GET /circuits`  | pool summary per tier and every circuit   |
//! | `POST /shutdown` | triggers the session shutdown event       |

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::health::HealthChecker;
use crate::shutdown::ShutdownCoordinator;
use crate::socks::TunnelSlot;

pub mod handlers;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to bind status API on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Status API server failed: {0}")]
    Server(String),
}

/// Shared state for handlers
pub struct ApiState {
    pub health: HealthChecker,
    pub tunnel: TunnelSlot,
    pub shutdown: ShutdownCoordinator,
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/circuits", get(handlers::circuits))
        .route("/shutdown", post(handlers::shutdown))
        .with_state(state)
}

pub struct StatusApi {
    bind_address: SocketAddr,
    state: Arc<ApiState>,
    local_addr: Option<SocketAddr>,
    stop_tx: Option<oneshot::Sender<()>>,
    server: Option<JoinHandle<std::io::Result<()>>>,
}

impl StatusApi {
    pub fn new(bind_address: SocketAddr, state: ApiState) -> Self {
        Self {
            bind_address,
            state: Arc::new(state),
            local_addr: None,
            stop_tx: None,
            server: None,
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    pub async fn start(&mut self) -> Result<SocketAddr, ApiError> {
        if let Some(addr) = self.local_addr.filter(|_| self.is_running()) {
            return Ok(addr);
        }

        let listener = TcpListener::bind(self.bind_address)
            .await
            .map_err(|source| ApiError::Bind {
                addr: self.bind_address,
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| ApiError::Bind {
            addr: self.bind_address,
            source,
        })?;

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let router = build_router(self.state.clone());
        let server = tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async {
                    let _ = stop_rx.await;
                })
                .await
        });

        self.local_addr = Some(addr);
        self.stop_tx = Some(stop_tx);
        self.server = Some(server);

        info!(%addr, "Status API listening");
        Ok(addr)
    }

    pub async fn stop(&mut self) -> Result<(), ApiError> {
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        let Some(server) = self.server.take() else {
            return Ok(());
        };

        match server.await {
            Ok(Ok(())) => {
                info!("Status API stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(ApiError::Server(e.to_string())),
            Err(e) => {
                warn!(error = %e, "Status API task ended abnormally");
                Err(ApiError::Server(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{self, ComponentHealth};
    use std::sync::RwLock;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            method, path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    fn api(health: HealthChecker, shutdown: ShutdownCoordinator) -> StatusApi {
        StatusApi::new(
            SocketAddr::from(([127, 0, 0, 1], 0)),
            ApiState {
                health,
                tunnel: Arc::new(RwLock::new(None)),
                shutdown,
            },
        )
    }

    #[tokio::test]
    async fn test_health_reflects_components() {
        let health = HealthChecker::new("test");
        let mut api = api(health.clone(), ShutdownCoordinator::new());
        let addr = api.start().await.unwrap();

        health.report(ComponentHealth::healthy(health::OVERLAY)).await;
        assert!(request(addr, "GET", "/health").await.starts_with("HTTP/1.1 200"));

        health
            .report(ComponentHealth::unhealthy(health::OVERLAY, "stopped"))
            .await;
        assert!(request(addr, "GET", "/health").await.starts_with("HTTP/1.1 503"));

        api.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_circuits_without_tunnel_unavailable() {
        let mut api = api(HealthChecker::new("test"), ShutdownCoordinator::new());
        let addr = api.start().await.unwrap();

        assert!(request(addr, "GET", "/circuits").await.starts_with("HTTP/1.1 503"));
        api.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_route_triggers_event() {
        let shutdown = ShutdownCoordinator::new();
        let mut api = api(HealthChecker::new("test"), shutdown.clone());
        let addr = api.start().await.unwrap();

        assert!(request(addr, "POST", "/shutdown").await.starts_with("HTTP/1.1 202"));
        assert!(shutdown.is_shutting_down().await);

        api.stop().await.unwrap();
        assert!(!api.is_running());
    }
}
