//! Default overlay endpoint: one tokio UDP socket.

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tracing::debug;

use super::{EndpointError, EndpointKind, OverlayEndpoint, MAX_DATAGRAM_SIZE};

pub struct UdpEndpoint {
    bind: SocketAddr,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

impl UdpEndpoint {
    pub fn new(bind: SocketAddr) -> Self {
        Self {
            bind,
            socket: RwLock::new(None),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, EndpointError> {
        self.socket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
            .ok_or(EndpointError::NotOpen)
    }
}

#[async_trait]
impl OverlayEndpoint for UdpEndpoint {
    fn kind(&self) -> EndpointKind {
        EndpointKind::Udp
    }

    async fn open(&self) -> Result<SocketAddr, EndpointError> {
        if let Some(addr) = self.local_addr() {
            return Ok(addr);
        }

        let socket = UdpSocket::bind(self.bind).await.map_err(|e| EndpointError::Bind {
            addr: self.bind,
            reason: e.to_string(),
        })?;
        let local = socket.local_addr().map_err(|e| EndpointError::Bind {
            addr: self.bind,
            reason: e.to_string(),
        })?;

        *self
            .socket
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::new(socket));

        debug!(%local, "UDP endpoint open");
        Ok(local)
    }

    async fn send_to(&self, addr: SocketAddr, data: &[u8]) -> Result<(), EndpointError> {
        if data.len() > MAX_DATAGRAM_SIZE {
            return Err(EndpointError::TooLarge(data.len()));
        }

        let socket = self.socket()?;
        socket
            .send_to(data, addr)
            .await
            .map_err(|e| EndpointError::Send {
                addr,
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(SocketAddr, Vec<u8>), EndpointError> {
        let socket = self.socket().map_err(|_| EndpointError::Closed)?;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        let (len, from) = socket
            .recv_from(&mut buf)
            .await
            .map_err(|e| EndpointError::Recv(e.to_string()))?;
        buf.truncate(len);
        Ok((from, buf))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.socket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    fn is_open(&self) -> bool {
        self.socket
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    async fn close(&self) {
        let socket = self
            .socket
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if socket.is_some() {
            debug!(bind = %self.bind, "UDP endpoint closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 0))
    }

    #[tokio::test]
    async fn test_send_and_receive() {
        let a = UdpEndpoint::new(loopback());
        let b = UdpEndpoint::new(loopback());
        let a_addr = a.open().await.unwrap();
        let b_addr = b.open().await.unwrap();

        a.send_to(b_addr, b"hello").await.unwrap();

        let (from, data) = tokio::time::timeout(Duration::from_secs(2), b.recv_from())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(from, a_addr);
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn test_send_before_open_fails() {
        let a = UdpEndpoint::new(loopback());
        let result = a.send_to(loopback(), b"x").await;
        assert!(matches!(result, Err(EndpointError::NotOpen)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let a = UdpEndpoint::new(loopback());
        a.open().await.unwrap();
        a.close().await;
        a.close().await;
        assert!(!a.is_open());
        assert!(matches!(a.recv_from().await, Err(EndpointError::Closed)));
    }
}
