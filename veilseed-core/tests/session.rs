//! Session lifecycle over an in-memory overlay

mod common;

use common::eventually;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use veilseed_core::components::LaunchError;
use veilseed_core::endpoint::MemoryNetwork;
use veilseed_core::health::{self, HealthStatus};
use veilseed_core::shutdown::ShutdownSignal;
use veilseed_core::{Config, DetachedEngine, Session, SessionError};

fn config() -> Config {
    let mut config = Config::default();
    config.libtorrent.socks_listen_ports = vec![0, 0];
    config.tunnel_community.tiers = vec![1, 2];
    config.tunnel_community.min_circuits = 0;
    config.discovery_community.walk_interval = Duration::from_millis(50);
    config
}

async fn http(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "{} {} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        method, path
    );
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    let status = response
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .unwrap();
    (status, response)
}

#[tokio::test]
async fn test_failed_start_leaves_earlier_steps_running() {
    let network = MemoryNetwork::new();
    let mut config = config();
    config.overlay.bootstrap = vec!["not a host".to_string()];

    let mut session =
        Session::with_endpoint(config, Box::new(DetachedEngine::new()), network.endpoint()).unwrap();

    let result = session.start().await;
    assert!(matches!(
        result,
        Err(SessionError::Launch(LaunchError::Start {
            component: "discovery",
            ..
        }))
    ));

    // SOCKS came up before components and stays up until shutdown
    assert!(session.socks().is_running());
    let ports = session.socks().ports();
    assert_eq!(ports.len(), 2);
    TcpStream::connect(("127.0.0.1", ports[0])).await.unwrap();
    assert!(!session.overlay().is_running());
    let socks = session.health().component(health::SOCKS).await.unwrap();
    assert_eq!(socks.status, HealthStatus::Healthy);

    session.shutdown().await.unwrap();
    assert!(!session.socks().is_running());
}

#[tokio::test]
async fn test_sessions_discover_each_other() {
    let network = MemoryNetwork::new();

    let first_endpoint = network.endpoint();
    let first_addr = first_endpoint.addr();
    let mut first =
        Session::with_endpoint(config(), Box::new(DetachedEngine::new()), first_endpoint).unwrap();

    let mut second_config = config();
    second_config.overlay.bootstrap = vec![first_addr.to_string()];
    let mut second =
        Session::with_endpoint(second_config, Box::new(DetachedEngine::new()), network.endpoint())
            .unwrap();

    first.start().await.unwrap();
    second.start().await.unwrap();

    let first_key = first.overlay().public_key();
    let second_key = second.overlay().public_key();
    assert!(
        eventually(Duration::from_secs(5), || {
            first.overlay().peers().get(&second_key).is_some()
                && second.overlay().peers().get(&first_key).is_some()
        })
        .await
    );

    second.shutdown().await.unwrap();
    first.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_status_api_reports_and_requests_shutdown() {
    let network = MemoryNetwork::new();
    let mut session =
        Session::with_endpoint(config(), Box::new(DetachedEngine::new()), network.endpoint()).unwrap();
    session.start().await.unwrap();
    assert!(session.tunnel().is_some());
    assert!(session.health().readiness_check().await);

    let api = session.api_addr().unwrap();
    let (status, body) = http(api, "GET", "/health").await;
    assert_eq!(status, 200);
    assert!(body.contains("socks"));

    let (status, body) = http(api, "GET", "/circuits").await;
    assert_eq!(status, 200);
    assert!(body.contains("tiers"));

    let (status, _) = http(api, "POST", "/shutdown").await;
    assert_eq!(status, 202);

    let signal = tokio::time::timeout(
        Duration::from_secs(2),
        session.shutdown_handle().wait_for_shutdown(),
    )
    .await
    .unwrap();
    assert_eq!(signal, ShutdownSignal::Graceful);

    session.shutdown().await.unwrap();
    assert!(TcpStream::connect(api).await.is_err());
}
