//! Client-side circuit state.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::time::Instant;
use tokio::sync::mpsc;

use super::cell::{CellType, RelayMessage};
use super::crypto::{CryptoError, HopCrypto, FLAG_DELIVER, FLAG_RELAY};
use super::TunnelError;
use crate::overlay::PeerKey;

/// Circuit identifier. Equal to the circuit id on the link to the first hop.
pub type CircuitId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "hops", rename_all = "snake_case")]
pub enum CircuitState {
    /// `k` hops confirmed, more to go
    Extending(usize),
    Ready,
    Breaking,
    Closed,
}

impl CircuitState {
    pub fn is_live(self) -> bool {
        matches!(self, CircuitState::Extending(_) | CircuitState::Ready)
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Extending(k) => write!(f, "EXTENDING({})", k),
            CircuitState::Ready => f.write_str("READY"),
            CircuitState::Breaking => f.write_str("BREAKING"),
            CircuitState::Closed => f.write_str("CLOSED"),
        }
    }
}

/// Events delivered to a stream's owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Opened,
    Data(Vec<u8>),
    /// The exit closed the stream
    End,
    /// The circuit carrying the stream went away
    CircuitClosed,
}

pub type StreamSink = mpsc::UnboundedSender<StreamEvent>;

pub struct Hop {
    pub peer: PeerKey,
    pub addr: SocketAddr,
    pub index: usize,
    crypto: HopCrypto,
}

impl Hop {
    pub fn new(peer: PeerKey, addr: SocketAddr, index: usize, crypto: HopCrypto) -> Self {
        Self {
            peer,
            addr,
            index,
            crypto,
        }
    }
}

impl fmt::Debug for Hop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hop")
            .field("peer", &crate::overlay::short_id(&self.peer))
            .field("addr", &self.addr)
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

pub struct Circuit {
    pub id: CircuitId,
    pub tier: usize,
    pub state: CircuitState,
    pub created_at: Instant,
    pub last_activity: Instant,
    /// Address of the first hop once the create cell has been sent
    pub link: Option<SocketAddr>,
    /// First hop chosen at insertion, before its `Created` arrives
    pub first_peer: Option<PeerKey>,
    hops: Vec<Hop>,
    streams: HashMap<u32, StreamSink>,
    next_stream_id: u32,
}

impl Circuit {
    pub fn new(id: CircuitId, tier: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            tier,
            state: CircuitState::Extending(0),
            created_at: now,
            last_activity: now,
            link: None,
            first_peer: None,
            hops: Vec::with_capacity(tier),
            streams: HashMap::new(),
            next_stream_id: 1,
        }
    }

    pub fn hops(&self) -> &[Hop] {
        &self.hops
    }

    pub fn hop_count(&self) -> usize {
        self.hops.len()
    }

    pub fn first_hop(&self) -> Option<&Hop> {
        self.hops.first()
    }

    pub fn contains_peer(&self, peer: &PeerKey) -> bool {
        self.hops.iter().any(|hop| &hop.peer == peer)
    }

    pub fn is_ready(&self) -> bool {
        self.state == CircuitState::Ready
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Append the next hop. The index must be the next contiguous one and
    /// the peer must not already be on the circuit.
    pub fn push_hop(&mut self, hop: Hop) -> Result<(), TunnelError> {
        let expected = self.hops.len();
        if hop.index != expected {
            return Err(TunnelError::HopIndexMismatch {
                circuit_id: self.id,
                expected,
                actual: hop.index,
            });
        }
        if expected >= self.tier {
            return Err(TunnelError::Protocol {
                circuit_id: self.id,
                reason: format!("circuit already has {} hops", expected),
            });
        }
        if self.contains_peer(&hop.peer) {
            return Err(TunnelError::Protocol {
                circuit_id: self.id,
                reason: "peer already on circuit".to_string(),
            });
        }

        self.hops.push(hop);
        self.state = if self.hops.len() == self.tier {
            CircuitState::Ready
        } else {
            CircuitState::Extending(self.hops.len())
        };
        self.touch();
        Ok(())
    }

    /// Onion-wrap `message` for hop `target`: layers for hops `target..=0`
    pub fn wrap(
        &mut self,
        cell_type: CellType,
        target: usize,
        message: &RelayMessage,
    ) -> Result<Vec<u8>, TunnelError> {
        if target >= self.hops.len() {
            return Err(TunnelError::Protocol {
                circuit_id: self.id,
                reason: format!("no hop {}", target),
            });
        }

        let circuit_id = self.id;
        let mut payload = message.encode()?;
        for hop in self.hops[..=target].iter_mut().rev() {
            let flag = if hop.index == target {
                FLAG_DELIVER
            } else {
                FLAG_RELAY
            };
            payload = hop
                .crypto
                .forward
                .seal(cell_type, flag, &payload)
                .map_err(|source| TunnelError::Crypto { circuit_id, source })?;
        }
        Ok(payload)
    }

    /// Peel backward layers starting at hop 0. Returns the index of the
    /// originating hop and its message.
    pub fn peel(
        &mut self,
        cell_type: CellType,
        payload: &[u8],
    ) -> Result<(usize, RelayMessage), TunnelError> {
        let circuit_id = self.id;
        let mut content = payload.to_vec();

        for hop in self.hops.iter_mut() {
            let (flag, inner) = hop
                .crypto
                .backward
                .open(cell_type, &content)
                .map_err(|source| TunnelError::Crypto { circuit_id, source })?;
            if flag == FLAG_DELIVER {
                let message = RelayMessage::decode(cell_type, &inner)?;
                return Ok((hop.index, message));
            }
            content = inner;
        }

        Err(TunnelError::Crypto {
            circuit_id,
            source: CryptoError::Integrity,
        })
    }

    pub fn add_stream(&mut self, sink: StreamSink) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.wrapping_add(1).max(1);
        self.streams.insert(id, sink);
        id
    }

    pub fn stream(&self, stream_id: u32) -> Option<&StreamSink> {
        self.streams.get(&stream_id)
    }

    pub fn remove_stream(&mut self, stream_id: u32) -> Option<StreamSink> {
        self.streams.remove(&stream_id)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    /// Detach every stream and tell its owner the circuit is gone
    pub fn release_streams(&mut self) {
        for (_, sink) in self.streams.drain() {
            let _ = sink.send(StreamEvent::CircuitClosed);
        }
    }
}

impl fmt::Debug for Circuit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Circuit")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("state", &self.state)
            .field("hops", &self.hops)
            .field("streams", &self.streams.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::crypto::{respond, ClientHandshake};
    use rand::RngCore;
    use x25519_dalek::{PublicKey, StaticSecret};

    struct TestRelay {
        secret: StaticSecret,
        public: PeerKey,
    }

    impl TestRelay {
        fn new() -> Self {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            let secret = StaticSecret::from(bytes);
            let public = *PublicKey::from(&secret).as_bytes();
            Self { secret, public }
        }

        fn hop(&self, index: usize) -> (Hop, HopCrypto) {
            let client = ClientHandshake::new(self.public);
            let (relay_side, reply) = respond(&self.secret, &client.public()).unwrap();
            let addr = SocketAddr::from(([10, 0, 0, index as u8 + 1], 7759));
            let hop = Hop::new(self.public, addr, index, client.complete(&reply).unwrap());
            (hop, relay_side)
        }
    }

    #[test]
    fn test_hops_are_contiguous() {
        let relays: Vec<TestRelay> = (0..3).map(|_| TestRelay::new()).collect();
        let mut circuit = Circuit::new(7, 3);

        let (hop0, _) = relays[0].hop(0);
        circuit.push_hop(hop0).unwrap();
        assert_eq!(circuit.state, CircuitState::Extending(1));

        let (skipped, _) = relays[1].hop(2);
        assert!(matches!(
            circuit.push_hop(skipped),
            Err(TunnelError::HopIndexMismatch { expected: 1, actual: 2, .. })
        ));
        assert_eq!(circuit.hop_count(), 1);

        let (hop1, _) = relays[1].hop(1);
        circuit.push_hop(hop1).unwrap();
        let (hop2, _) = relays[2].hop(2);
        circuit.push_hop(hop2).unwrap();
        assert_eq!(circuit.state, CircuitState::Ready);

        for (i, hop) in circuit.hops().iter().enumerate() {
            assert_eq!(hop.index, i);
        }
    }

    #[test]
    fn test_same_peer_twice_rejected() {
        let relay = TestRelay::new();
        let mut circuit = Circuit::new(1, 2);

        circuit.push_hop(relay.hop(0).0).unwrap();
        assert!(circuit.push_hop(relay.hop(1).0).is_err());
        assert_eq!(circuit.hop_count(), 1);
    }

    #[test]
    fn test_wrap_and_unwrap_through_relays() {
        let relays: Vec<TestRelay> = (0..2).map(|_| TestRelay::new()).collect();
        let mut circuit = Circuit::new(1, 2);
        let mut relay_sides = Vec::new();
        for (i, relay) in relays.iter().enumerate() {
            let (hop, relay_side) = relay.hop(i);
            circuit.push_hop(hop).unwrap();
            relay_sides.push(relay_side);
        }

        let message = RelayMessage::End { stream_id: 3 };
        let mut payload = circuit.wrap(CellType::Data, 1, &message).unwrap();
        let (flag, inner) = relay_sides[0].forward.open(CellType::Data, &payload).unwrap();
        assert_eq!(flag, FLAG_RELAY);
        payload = inner;
        let (flag, inner) = relay_sides[1].forward.open(CellType::Data, &payload).unwrap();
        assert_eq!(flag, FLAG_DELIVER);
        assert_eq!(RelayMessage::decode(CellType::Data, &inner).unwrap(), message);

        // Exit answers, the middle hop adds its layer
        let reply = RelayMessage::Opened { stream_id: 3 };
        let layer = relay_sides[1]
            .backward
            .seal(CellType::Data, FLAG_DELIVER, &reply.encode().unwrap())
            .unwrap();
        let layer = relay_sides[0].backward.seal(CellType::Data, FLAG_RELAY, &layer).unwrap();

        assert_eq!(circuit.peel(CellType::Data, &layer).unwrap(), (1, reply));
    }

    #[test]
    fn test_release_streams_signals_owners() {
        let mut circuit = Circuit::new(1, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = circuit.add_stream(tx);
        assert_eq!(id, 1);

        circuit.release_streams();
        assert_eq!(circuit.stream_count(), 0);
        assert_eq!(rx.try_recv().unwrap(), StreamEvent::CircuitClosed);
    }
}
