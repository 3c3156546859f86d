//! Shared harness: tunnel nodes on an in-memory network, a TCP echo target
//! and a minimal SOCKS5 client.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use veilseed_core::config::TunnelConfig;
use veilseed_core::endpoint::{MemoryEndpoint, MemoryNetwork};
use veilseed_core::health::HealthChecker;
use veilseed_core::notifier::Notifier;
use veilseed_core::overlay::{Capabilities, Identity, Overlay, PeerKey};
use veilseed_core::tunnel::{CircuitManager, TunnelCommunity};

/// Tunnel settings with maintenance effectively disabled; tests drive
/// `maintain` by hand.
pub fn tunnel_config(tiers: Vec<usize>, min: usize, max: usize) -> TunnelConfig {
    TunnelConfig {
        min_circuits: min,
        max_circuits: max,
        tiers,
        hop_timeout: Duration::from_secs(5),
        maintenance_interval: Duration::from_secs(3600),
        max_idle: Duration::from_secs(3600),
        first_hop_reuse_limit: 4,
        ..TunnelConfig::default()
    }
}

pub fn exit_config() -> TunnelConfig {
    TunnelConfig {
        exit_enabled: true,
        ..tunnel_config(vec![1], 0, 1)
    }
}

pub struct TestNode {
    pub endpoint: Arc<MemoryEndpoint>,
    pub overlay: Arc<Overlay>,
    pub notifier: Notifier,
    pub tunnel: TunnelCommunity,
}

impl TestNode {
    pub async fn start(network: &MemoryNetwork, config: TunnelConfig) -> Self {
        let mut capabilities = Capabilities::RELAY;
        if config.exit_enabled {
            capabilities = capabilities.with(Capabilities::EXIT);
        }

        let endpoint = network.endpoint();
        let overlay = Arc::new(Overlay::new(
            endpoint.clone(),
            Identity::generate(),
            capabilities,
            64,
        ));
        let notifier = Notifier::new();
        let tunnel = TunnelCommunity::new(
            overlay.clone(),
            notifier.clone(),
            HealthChecker::new("test"),
            config,
        );

        tunnel.start().await.unwrap();
        overlay.start().await.unwrap();

        Self {
            endpoint,
            overlay,
            notifier,
            tunnel,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.endpoint.addr()
    }

    pub fn public_key(&self) -> PeerKey {
        self.overlay.public_key()
    }

    pub fn manager(&self) -> &Arc<CircuitManager> {
        self.tunnel.manager()
    }

    /// Add `other` to this node's peer table
    pub fn learn(&self, other: &TestNode) {
        self.overlay
            .peers()
            .upsert(other.public_key(), other.addr(), other.overlay.capabilities());
    }
}

/// Start `count` relay nodes, all of them exits
pub async fn exit_relays(network: &MemoryNetwork, count: usize) -> Vec<TestNode> {
    let mut relays = Vec::with_capacity(count);
    for _ in 0..count {
        relays.push(TestNode::start(network, exit_config()).await);
    }
    relays
}

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn eventually(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// TCP server echoing every connection back to its sender
pub async fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });

    addr
}

/// SOCKS5 CONNECT to an IPv4 target. Returns the stream and the reply code.
pub async fn socks_connect(proxy: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let SocketAddr::V4(target) = target else {
        panic!("IPv4 target expected");
    };

    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&target.ip().octets());
    request.extend_from_slice(&target.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    (stream, reply[1])
}

/// Write `message` and read the same number of bytes back
pub async fn round_trip(stream: &mut TcpStream, message: &[u8]) -> Vec<u8> {
    stream.write_all(message).await.unwrap();
    let mut echoed = vec![0u8; message.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    echoed
}
