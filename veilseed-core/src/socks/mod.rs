/*
  SOCKS bridge

  One SOCKS5 listener per configured port. Port index i serves circuits of i + 1 hops.

  An accepted connection waits (bounded) for a READY circuit of its tier, opens a stream to the
  requested destination through the circuit's exit and relays bytes in both directions. When the
  bound circuit closes, the connection moves to another READY circuit once; a second loss, or no
  circuit within the wait timeout, resets the local connection.

  Only CONNECT without authentication is supported.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info};

use crate::config::LibtorrentConfig;
use crate::health::{self, ComponentHealth, HealthChecker};
use crate::metrics::{self, names};
use crate::tunnel::{CircuitManager, TunnelError};

mod connection;

#[derive(Debug, Error)]
pub enum SocksError {
    #[error("Failed to bind SOCKS port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported SOCKS command {0:#04x}")]
    UnsupportedCommand(u8),

    #[error("Unsupported address type {0:#04x}")]
    AddressType(u8),

    #[error("No tunnel attached")]
    NoTunnel,

    #[error("Destination refused: {0}")]
    Refused(String),

    #[error("Connection reset: {0}")]
    Reset(String),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Circuit manager shared by every listener, attached after the tunnel starts
pub type TunnelSlot = Arc<RwLock<Option<Arc<CircuitManager>>>>;

fn current(slot: &TunnelSlot) -> Option<Arc<CircuitManager>> {
    slot.read().unwrap_or_else(|poisoned| poisoned.into_inner()).clone()
}

type Connections = Arc<Mutex<HashMap<u64, AbortHandle>>>;

fn connections(map: &Connections) -> std::sync::MutexGuard<'_, HashMap<u64, AbortHandle>> {
    map.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A single listener
pub struct SocksServer {
    tier: usize,
    requested_port: u16,
    local_addr: Option<SocketAddr>,
    accept: Option<JoinHandle<()>>,
}

impl SocksServer {
    pub fn tier(&self) -> usize {
        self.tier
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

pub struct SocksBridge {
    servers: Vec<SocksServer>,
    tunnel: TunnelSlot,
    wait_timeout: Duration,
    health: HealthChecker,
    connections: Connections,
    next_connection: Arc<AtomicU64>,
}

impl SocksBridge {
    pub fn new(config: &LibtorrentConfig, health: HealthChecker) -> Self {
        let servers = config
            .socks_listen_ports
            .iter()
            .enumerate()
            .map(|(index, &port)| SocksServer {
                tier: index + 1,
                requested_port: port,
                local_addr: None,
                accept: None,
            })
            .collect();

        Self {
            servers,
            tunnel: Arc::new(RwLock::new(None)),
            wait_timeout: config.socks_wait_timeout,
            health,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn servers(&self) -> &[SocksServer] {
        &self.servers
    }

    /// Bound ports in tier order. Empty before `start`.
    pub fn ports(&self) -> Vec<u16> {
        self.servers
            .iter()
            .filter_map(|s| s.local_addr.map(|a| a.port()))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.servers.iter().any(|s| s.accept.is_some())
    }

    pub fn active_connections(&self) -> usize {
        connections(&self.connections).len()
    }

    /// The slot the tunnel component publishes its manager into
    pub fn tunnel_slot(&self) -> TunnelSlot {
        self.tunnel.clone()
    }

    /// Route new connections through `manager`
    pub fn attach(&self, manager: Arc<CircuitManager>) {
        *self.tunnel.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(manager);
    }

    pub fn detach(&self) {
        self.tunnel.write().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
    }

    /// Bind every listener on loopback and start accepting
    pub async fn start(&mut self) -> Result<Vec<SocketAddr>, SocksError> {
        let mut bound = Vec::with_capacity(self.servers.len());

        for server in &mut self.servers {
            if server.accept.is_some() {
                continue;
            }

            let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], server.requested_port)))
                .await
                .map_err(|source| SocksError::Bind {
                    port: server.requested_port,
                    source,
                })?;
            let addr = listener.local_addr()?;

            server.local_addr = Some(addr);
            server.accept = Some(tokio::spawn(accept_loop(
                listener,
                server.tier,
                self.tunnel.clone(),
                self.wait_timeout,
                self.connections.clone(),
                self.next_connection.clone(),
            )));

            info!(%addr, tier = server.tier, "SOCKS listener started");
            bound.push(addr);
        }

        self.health.report(ComponentHealth::healthy(health::SOCKS)).await;
        Ok(bound)
    }

    /// Close every listener and every open connection
    pub async fn stop(&mut self) {
        for server in &mut self.servers {
            if let Some(accept) = server.accept.take() {
                accept.abort();
                info!(addr = ?server.local_addr, tier = server.tier, "SOCKS listener stopped");
            }
        }

        let open: Vec<AbortHandle> = connections(&self.connections).drain().map(|(_, h)| h).collect();
        for handle in &open {
            handle.abort();
        }
        self.detach();

        self.health
            .report(ComponentHealth::unhealthy(health::SOCKS, "stopped"))
            .await;
        debug!(closed = open.len(), "SOCKS bridge stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    tier: usize,
    tunnel: TunnelSlot,
    wait: Duration,
    open: Connections,
    next_id: Arc<AtomicU64>,
) {
    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(tier, error = %e, "SOCKS accept failed");
                continue;
            }
        };
        metrics::record_counter(names::SOCKS_CONNECTIONS, 1);

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        let tunnel = tunnel.clone();
        let registry = open.clone();

        let mut map = connections(&open);
        let task = tokio::spawn(async move {
            if let Err(e) = connection::serve(socket, tier, tunnel, wait).await {
                debug!(%peer, tier, error = %e, "SOCKS connection ended");
            }
            connections(&registry).remove(&id);
        });
        map.insert(id, task.abort_handle());
    }
}
