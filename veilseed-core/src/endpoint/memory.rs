//! In-process datagram network for tests and simulations.
//!
//! Endpoints created from one [`MemoryNetwork`] exchange datagrams through
//! unbounded queues, so delivery order per destination matches send order.
//! Datagrams to unknown, closed or offline endpoints are dropped silently,
//! like UDP.

use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use super::{EndpointError, EndpointKind, OverlayEndpoint, MAX_DATAGRAM_SIZE};

const MEMORY_PORT: u16 = 7759;

type Datagram = (SocketAddr, Vec<u8>);

struct Slot {
    tx: mpsc::UnboundedSender<Datagram>,
    offline: bool,
}

#[derive(Default)]
struct NetState {
    slots: HashMap<SocketAddr, Slot>,
    next_host: u32,
    dropped: u64,
}

/// Shared hub that routes datagrams between memory endpoints
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an endpoint with a fresh address on this network
    pub fn endpoint(&self) -> Arc<MemoryEndpoint> {
        let mut state = self.lock();
        state.next_host += 1;
        let host = Ipv4Addr::from(0x0a00_0000 | state.next_host);
        let addr = SocketAddr::from((host, MEMORY_PORT));
        drop(state);

        Arc::new(MemoryEndpoint {
            addr,
            network: self.clone(),
            inbound: AsyncMutex::new(None),
            sent: AtomicU64::new(0),
        })
    }

    /// Offline endpoints neither send nor receive
    pub fn set_offline(&self, addr: SocketAddr, offline: bool) {
        if let Some(slot) = self.lock().slots.get_mut(&addr) {
            slot.offline = offline;
        }
    }

    /// Datagrams dropped because the destination was unknown or offline
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, from: SocketAddr, to: SocketAddr, data: Vec<u8>) -> bool {
        let mut state = self.lock();

        let sender_offline = state.slots.get(&from).map(|s| s.offline).unwrap_or(true);
        let delivered = match state.slots.get(&to) {
            Some(slot) if !slot.offline && !sender_offline => slot.tx.send((from, data)).is_ok(),
            _ => false,
        };

        if !delivered {
            state.dropped += 1;
        }
        delivered
    }
}

pub struct MemoryEndpoint {
    addr: SocketAddr,
    network: MemoryNetwork,
    inbound: AsyncMutex<Option<mpsc::UnboundedReceiver<Datagram>>>,
    sent: AtomicU64,
}

impl MemoryEndpoint {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Datagrams this endpoint has handed to the network
    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl OverlayEndpoint for MemoryEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Memory
    }

    async fn open(&self) -> Result<SocketAddr, EndpointError> {
        let mut inbound = self.inbound.lock().await;
        if inbound.is_some() {
            return Ok(self.addr);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.network
            .lock()
            .slots
            .insert(self.addr, Slot { tx, offline: false });
        *inbound = Some(rx);
        Ok(self.addr)
    }

    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), EndpointError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(EndpointError::TooLarge(data.len()));
        }
        if !self.is_open() {
            return Err(EndpointError::NotOpen);
        }

        self.sent.fetch_add(1, Ordering::Relaxed);
        self.network.deliver(self.addr, addr, data.to_vec());
        Ok(())
    }

    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), EndpointError> {
        let mut inbound = self.inbound.lock().await;
        let rx = inbound.as_mut().ok_or(EndpointError::Closed)?;
        rx.recv().await.ok_or(EndpointError::Closed)
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.is_open().then_some(self.addr)
    }

    fn is_open(&self) -> bool {
        self.network.lock().slots.contains_key(&self.addr)
    }

    async fn close(&self) {
        // Dropping the slot's sender ends any pending recv
        self.network.lock().slots.remove(&self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_delivery() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        let b = net.endpoint();
        a.open().await.unwrap();
        b.open().await.unwrap();

        a.send_to(b.addr(), b"one").await.unwrap();
        a.send_to(b.addr(), b"two").await.unwrap();

        assert_eq!(b.recv_from().await.unwrap(), (a.addr(), b"one".to_vec()));
        assert_eq!(b.recv_from().await.unwrap(), (a.addr(), b"two".to_vec()));
        assert_eq!(a.sent(), 2);
    }

    #[tokio::test]
    async fn test_offline_endpoint_drops() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        let b = net.endpoint();
        a.open().await.unwrap();
        b.open().await.unwrap();

        net.set_offline(b.addr(), true);
        a.send_to(b.addr(), b"lost").await.unwrap();
        assert_eq!(net.dropped(), 1);

        net.set_offline(b.addr(), false);
        a.send_to(b.addr(), b"found").await.unwrap();
        assert_eq!(b.recv_from().await.unwrap().1, b"found".to_vec());
    }

    #[tokio::test]
    async fn test_close_ends_recv() {
        let net = MemoryNetwork::new();
        let a = net.endpoint();
        a.open().await.unwrap();
        a.close().await;

        assert!(!a.is_open());
        assert!(matches!(a.recv_from().await, Err(EndpointError::Closed)));
    }
}
