/*
  Overlay handle

  Owns the node identity, the peer table and the selected endpoint. Each community registers a
  one-byte prefix; the dispatch loop reads datagrams from the endpoint and forwards the rest of
  the datagram to the community that owns its prefix.

    datagram := [prefix u8][community payload]

  Datagrams with an unknown prefix are dropped. Each community queue is bounded; when a
  community falls behind, new datagrams for it are dropped (UDP semantics) while order of the
  ones already queued is kept.

  The handle is created before the communities start, but no traffic flows until `start`.
*/

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::endpoint::{EndpointError, EndpointKind, OverlayEndpoint};
use crate::metrics;

pub mod peers;

pub use peers::{short_id, Capabilities, CandidateFilter, OverlayPeer, PeerKey, PeerTable};

/// Community prefix: peer discovery
pub const DISCOVERY_PREFIX: u8 = 0x01;

/// Community prefix: circuit cells
pub const TUNNEL_PREFIX: u8 = 0x02;

const COMMUNITY_QUEUE: usize = 1024;

/// A datagram addressed to one community
pub type Inbound = (SocketAddr, Vec<u8>);

#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Prefix {0:#04x} is already registered")]
    PrefixInUse(u8),

    #[error("Overlay is not running")]
    NotRunning,
}

/// Static X25519 identity of this node
pub struct Identity {
    secret: StaticSecret,
    public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self::from_secret(StaticSecret::from(bytes))
    }

    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    pub fn public_key(&self) -> PeerKey {
        *self.public.as_bytes()
    }
}

pub struct Overlay {
    endpoint: Arc<dyn OverlayEndpoint>,
    identity: Identity,
    capabilities: Capabilities,
    peers: Arc<PeerTable>,
    handlers: RwLock<HashMap<u8, mpsc::Sender<Inbound>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl Overlay {
    pub fn new(
        endpoint: Arc<dyn OverlayEndpoint>,
        identity: Identity,
        capabilities: Capabilities,
        max_peers: usize,
    ) -> Self {
        Self {
            endpoint,
            identity,
            capabilities,
            peers: Arc::new(PeerTable::new(max_peers)),
            handlers: RwLock::new(HashMap::new()),
            dispatch: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn public_key(&self) -> PeerKey {
        self.identity.public_key()
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    pub fn peers(&self) -> &Arc<PeerTable> {
        &self.peers
    }

    pub fn endpoint_kind(&self) -> EndpointKind {
        self.endpoint.kind()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn is_running(&self) -> bool {
        self.dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Claim a prefix. Datagrams carrying it arrive on the returned queue.
    pub fn register_handler(&self, prefix: u8) -> Result<mpsc::Receiver<Inbound>, OverlayError> {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if handlers.get(&prefix).is_some_and(|tx| !tx.is_closed()) {
            return Err(OverlayError::PrefixInUse(prefix));
        }

        let (tx, rx) = mpsc::channel(COMMUNITY_QUEUE);
        handlers.insert(prefix, tx);
        debug!(prefix, "Registered community handler");
        Ok(rx)
    }

    pub fn unregister_handler(&self, prefix: u8) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&prefix);
    }

    /// Open the endpoint and start dispatching datagrams
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, OverlayError> {
        let local = self.endpoint.open().await?;

        let mut dispatch = self
            .dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if dispatch.is_none() {
            let overlay = Arc::clone(self);
            *dispatch = Some(tokio::spawn(async move { overlay.dispatch_loop().await }));
            info!(%local, kind = %self.endpoint.kind(), "Overlay started");
        }

        Ok(local)
    }

    /// Stop dispatching and close the endpoint
    pub async fn stop(&self) {
        let task = self
            .dispatch
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.endpoint.close().await;
        info!("Overlay stopped");
    }

    /// Send a community payload to a peer
    pub async fn send(&self, prefix: u8, addr: SocketAddr, payload: &[u8]) -> Result<(), OverlayError> {
        let mut datagram = Vec::with_capacity(payload.len() + 1);
        datagram.push(prefix);
        datagram.extend_from_slice(payload);

        self.endpoint.send_to(addr, &datagram).await?;
        metrics::record_counter(metrics::names::DATAGRAMS_SENT, 1);
        Ok(())
    }

    async fn dispatch_loop(&self) {
        loop {
            let (from, datagram) = match self.endpoint.recv_from().await {
                Ok(received) => received,
                Err(EndpointError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "Overlay receive failed");
                    continue;
                }
            };

            metrics::record_counter(metrics::names::DATAGRAMS_RECEIVED, 1);

            let Some((&prefix, payload)) = datagram.split_first() else {
                continue;
            };

            let handler = self
                .handlers
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .get(&prefix)
                .cloned();

            match handler {
                Some(tx) => {
                    if let Err(e) = tx.try_send((from, payload.to_vec())) {
                        debug!(prefix, %from, error = %e, "Dropped datagram for busy community");
                    }
                }
                None => trace!(prefix, %from, "Dropped datagram with unknown prefix"),
            }
        }

        debug!("Overlay dispatch loop ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MemoryNetwork;
    use std::time::Duration;

    fn overlay(net: &MemoryNetwork) -> Arc<Overlay> {
        Arc::new(Overlay::new(
            net.endpoint(),
            Identity::generate(),
            Capabilities::RELAY,
            16,
        ))
    }

    #[tokio::test]
    async fn test_dispatch_by_prefix() {
        let net = MemoryNetwork::new();
        let a = overlay(&net);
        let b = overlay(&net);

        let mut discovery = b.register_handler(DISCOVERY_PREFIX).unwrap();
        let mut tunnel = b.register_handler(TUNNEL_PREFIX).unwrap();

        let a_addr = a.start().await.unwrap();
        let b_addr = b.start().await.unwrap();

        a.send(TUNNEL_PREFIX, b_addr, b"cell").await.unwrap();
        a.send(DISCOVERY_PREFIX, b_addr, b"hello").await.unwrap();
        a.send(0x7f, b_addr, b"nobody").await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), tunnel.recv()).await.unwrap();
        assert_eq!(got, Some((a_addr, b"cell".to_vec())));
        let got = tokio::time::timeout(Duration::from_secs(1), discovery.recv()).await.unwrap();
        assert_eq!(got, Some((a_addr, b"hello".to_vec())));
    }

    #[tokio::test]
    async fn test_prefix_cannot_be_claimed_twice() {
        let net = MemoryNetwork::new();
        let a = overlay(&net);

        let _rx = a.register_handler(TUNNEL_PREFIX).unwrap();
        assert!(matches!(
            a.register_handler(TUNNEL_PREFIX),
            Err(OverlayError::PrefixInUse(TUNNEL_PREFIX))
        ));

        a.unregister_handler(TUNNEL_PREFIX);
        assert!(a.register_handler(TUNNEL_PREFIX).is_ok());
    }

    #[tokio::test]
    async fn test_send_before_start_fails() {
        let net = MemoryNetwork::new();
        let a = overlay(&net);
        let result = a.send(TUNNEL_PREFIX, net.endpoint().addr(), b"x").await;
        assert!(matches!(result, Err(OverlayError::Endpoint(EndpointError::NotOpen))));
    }

    #[tokio::test]
    async fn test_stop_closes_endpoint() {
        let net = MemoryNetwork::new();
        let a = overlay(&net);
        a.start().await.unwrap();
        assert!(a.is_running());

        a.stop().await;
        assert!(!a.is_running());
        assert!(a.local_addr().is_none());
    }
}
