/*
  Overlay endpoint adapter

  Every overlay consumer (discovery, tunnel, relay) sends and receives datagrams through one
  `OverlayEndpoint`. Two socket-backed implementations exist:

    - UdpEndpoint          single tokio UDP socket, driven by the runtime
    - AcceleratedEndpoint  dedicated OS threads for packet I/O, handing datagrams back to the
                           runtime over a queue

  `select_endpoint` picks one at startup. The accelerated endpoint is installed only when the
  host supports it, the configuration allows it, and statistics collection is off. The
  worker-thread setting is derived from `tunnel_community/max_circuits` when it is installed
  and cleared when it is not. Endpoint construction cannot fail (binding happens in `open`),
  so the endpoint and its settings are committed together or not at all.

  `memory::MemoryNetwork` is an in-process network used by tests.
*/

use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

use crate::config::Config;

pub mod accelerated;
pub mod memory;
pub mod udp;

pub use accelerated::AcceleratedEndpoint;
pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use udp::UdpEndpoint;

/// Largest datagram any endpoint accepts
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Failed to bind {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    #[error("Endpoint is not open")]
    NotOpen,

    #[error("Endpoint is closed")]
    Closed,

    #[error("Datagram of {0} bytes exceeds the maximum size")]
    TooLarge(usize),

    #[error("Send to {addr} failed: {reason}")]
    Send { addr: SocketAddr, reason: String },

    #[error("Receive failed: {0}")]
    Recv(String),
}

/// Which implementation backs an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Udp,
    Accelerated,
    Memory,
}

impl fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointKind::Udp => f.write_str("udp"),
            EndpointKind::Accelerated => f.write_str("accelerated"),
            EndpointKind::Memory => f.write_str("memory"),
        }
    }
}

/// Datagram transport shared by all overlay consumers.
///
/// Datagrams sent to the same destination are delivered in send order by
/// every implementation.
#[async_trait]
pub trait OverlayEndpoint: Send + Sync {
    fn kind(&self) -> EndpointKind;

    /// Bind and start accepting traffic. Returns the bound address.
    async fn open(&self) -> Result<SocketAddr, EndpointError>;

    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), EndpointError>;

    /// Wait for the next datagram. Fails with `Closed` once the endpoint is
    /// closed.
    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), EndpointError>;

    fn local_addr(&self) -> Option<SocketAddr>;

    fn is_open(&self) -> bool;

    /// Stop all I/O. Idempotent.
    async fn close(&self);
}

/// Runtime check for accelerated transport support
pub trait AccelerationProbe {
    fn available(&self) -> bool;
}

/// Probes the host: the accelerated endpoint needs more than one core
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl AccelerationProbe for SystemProbe {
    fn available(&self) -> bool {
        num_cpus::get() > 1
    }
}

/// Choose the overlay endpoint and commit the matching settings into
/// `config.overlay`.
pub fn select_endpoint(
    config: &mut Config,
    probe: &dyn AccelerationProbe,
) -> Arc<dyn OverlayEndpoint> {
    let bind = config.overlay.bind_address;
    let accelerate = !config.statistics && config.overlay.accelerated && probe.available();

    let (endpoint, worker_threads): (Arc<dyn OverlayEndpoint>, Option<usize>) = if accelerate {
        let workers = config.tunnel_community.max_circuits.max(1);
        (Arc::new(AcceleratedEndpoint::new(bind, workers)), Some(workers))
    } else {
        (Arc::new(UdpEndpoint::new(bind)), None)
    };

    config.overlay.worker_threads = worker_threads;

    info!(
        kind = %endpoint.kind(),
        worker_threads = ?worker_threads,
        "Selected overlay endpoint"
    );

    endpoint
}
