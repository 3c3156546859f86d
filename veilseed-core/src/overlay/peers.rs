//! Known overlay peers and candidate selection.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::RwLock;
use std::time::Instant;

/// X25519 public key identifying a peer
pub type PeerKey = [u8; 32];

/// Short printable form of a peer key
pub fn short_id(key: &PeerKey) -> String {
    hex::encode(&key[..6])
}

/// Services a peer offers to circuits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const NONE: Self = Self(0);
    pub const RELAY: Self = Self(0b01);
    pub const EXIT: Self = Self(0b10);

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits & (Self::RELAY.0 | Self::EXIT.0))
    }

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn with(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::RELAY) {
            names.push("relay");
        }
        if self.contains(Self::EXIT) {
            names.push("exit");
        }
        write!(f, "[{}]", names.join(","))
    }
}

/// A remote overlay node
#[derive(Debug, Clone)]
pub struct OverlayPeer {
    pub public_key: PeerKey,
    pub addr: SocketAddr,
    pub last_seen: Instant,
    pub capabilities: Capabilities,
    /// Accumulated misbehavior score; lower is preferred
    pub penalty: u32,
    pub failures: u32,
}

impl OverlayPeer {
    pub fn new(public_key: PeerKey, addr: SocketAddr, capabilities: Capabilities) -> Self {
        Self {
            public_key,
            addr,
            last_seen: Instant::now(),
            capabilities,
            penalty: 0,
            failures: 0,
        }
    }

    pub fn id(&self) -> String {
        short_id(&self.public_key)
    }
}

/// Constraints for choosing the next hop of a circuit
#[derive(Debug, Default)]
pub struct CandidateFilter<'a> {
    /// Peers that must not be chosen (e.g. already in the circuit)
    pub exclude: HashSet<PeerKey>,
    pub require: Capabilities,
    /// Peers offering these are chosen only when nobody else qualifies
    pub avoid: Capabilities,
    /// First-hop usage counts and the reuse limit, when choosing a first hop
    pub first_hop: Option<(&'a HashMap<PeerKey, usize>, usize)>,
}

/// Peer table shared by the overlay's communities
pub struct PeerTable {
    peers: RwLock<HashMap<PeerKey, OverlayPeer>>,
    max_peers: usize,
}

impl PeerTable {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            max_peers: max_peers.max(1),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<PeerKey, OverlayPeer>> {
        self.peers.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<PeerKey, OverlayPeer>> {
        self.peers.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Insert or refresh a peer. Returns true when the peer is new.
    ///
    /// When the table is full the least recently seen peer is evicted.
    pub fn upsert(&self, public_key: PeerKey, addr: SocketAddr, capabilities: Capabilities) -> bool {
        let mut peers = self.write();

        if let Some(peer) = peers.get_mut(&public_key) {
            peer.addr = addr;
            peer.capabilities = capabilities;
            peer.last_seen = Instant::now();
            return false;
        }

        if peers.len() >= self.max_peers {
            let stalest = peers
                .values()
                .min_by_key(|p| p.last_seen)
                .map(|p| p.public_key);
            if let Some(key) = stalest {
                peers.remove(&key);
            }
        }

        peers.insert(public_key, OverlayPeer::new(public_key, addr, capabilities));
        true
    }

    pub fn get(&self, key: &PeerKey) -> Option<OverlayPeer> {
        self.read().get(key).cloned()
    }

    pub fn by_addr(&self, addr: SocketAddr) -> Option<OverlayPeer> {
        self.read().values().find(|p| p.addr == addr).cloned()
    }

    pub fn remove(&self, key: &PeerKey) -> Option<OverlayPeer> {
        self.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<OverlayPeer> {
        self.read().values().cloned().collect()
    }

    /// Up to `n` random peers other than `exclude`
    pub fn sample(&self, n: usize, exclude: Option<&PeerKey>) -> Vec<OverlayPeer> {
        let mut pool: Vec<OverlayPeer> = self
            .read()
            .values()
            .filter(|p| Some(&p.public_key) != exclude)
            .cloned()
            .collect();

        let mut rng = rand::rng();
        let mut picked = Vec::with_capacity(n.min(pool.len()));
        while picked.len() < n && !pool.is_empty() {
            let index = rng.random_range(0..pool.len());
            picked.push(pool.swap_remove(index));
        }
        picked
    }

    /// Raise a peer's penalty. Returns the new score.
    pub fn penalize(&self, key: &PeerKey, amount: u32) -> Option<u32> {
        let mut peers = self.write();
        let peer = peers.get_mut(key)?;
        peer.penalty = peer.penalty.saturating_add(amount);
        peer.failures = peer.failures.saturating_add(1);
        Some(peer.penalty)
    }

    /// Choose a candidate: lowest penalty wins, then peers without the
    /// avoided capabilities; remaining ties are broken at random
    pub fn pick_candidate(&self, filter: &CandidateFilter<'_>) -> Option<OverlayPeer> {
        let peers = self.read();

        let eligible: Vec<&OverlayPeer> = peers
            .values()
            .filter(|p| !filter.exclude.contains(&p.public_key))
            .filter(|p| p.capabilities.contains(filter.require))
            .filter(|p| match filter.first_hop {
                Some((usage, limit)) => usage.get(&p.public_key).copied().unwrap_or(0) < limit,
                None => true,
            })
            .collect();

        let rank = |p: &OverlayPeer| {
            let avoided = filter.avoid != Capabilities::NONE && p.capabilities.contains(filter.avoid);
            (p.penalty, avoided)
        };
        let best = eligible.iter().map(|p| rank(*p)).min()?;
        let ties: Vec<&&OverlayPeer> = eligible.iter().filter(|p| rank(**p) == best).collect();
        let index = rand::rng().random_range(0..ties.len());
        Some((*ties[index]).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> PeerKey {
        [n; 32]
    }

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 0, n], 7759))
    }

    fn relay_table(n: u8) -> PeerTable {
        let table = PeerTable::new(64);
        for i in 1..=n {
            table.upsert(key(i), addr(i), Capabilities::RELAY);
        }
        table
    }

    #[test]
    fn test_upsert_refreshes_existing() {
        let table = PeerTable::new(8);
        assert!(table.upsert(key(1), addr(1), Capabilities::RELAY));
        assert!(!table.upsert(key(1), addr(2), Capabilities::RELAY.with(Capabilities::EXIT)));

        let peer = table.get(&key(1)).unwrap();
        assert_eq!(peer.addr, addr(2));
        assert!(peer.capabilities.contains(Capabilities::EXIT));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_table_evicts_stalest() {
        let table = PeerTable::new(2);
        table.upsert(key(1), addr(1), Capabilities::RELAY);
        std::thread::sleep(std::time::Duration::from_millis(2));
        table.upsert(key(2), addr(2), Capabilities::RELAY);
        table.upsert(key(3), addr(3), Capabilities::RELAY);

        assert_eq!(table.len(), 2);
        assert!(table.get(&key(1)).is_none());
    }

    #[test]
    fn test_pick_excludes_and_requires() {
        let table = relay_table(3);
        table.upsert(key(4), addr(4), Capabilities::RELAY.with(Capabilities::EXIT));

        let filter = CandidateFilter {
            require: Capabilities::EXIT,
            ..Default::default()
        };
        assert_eq!(table.pick_candidate(&filter).unwrap().public_key, key(4));

        let filter = CandidateFilter {
            exclude: HashSet::from([key(4)]),
            require: Capabilities::EXIT,
            ..Default::default()
        };
        assert!(table.pick_candidate(&filter).is_none());
    }

    #[test]
    fn test_pick_prefers_lowest_penalty() {
        let table = relay_table(3);
        table.penalize(&key(1), 10);
        table.penalize(&key(2), 10);

        for _ in 0..20 {
            let picked = table.pick_candidate(&CandidateFilter::default()).unwrap();
            assert_eq!(picked.public_key, key(3));
        }
    }

    #[test]
    fn test_pick_avoids_exits_when_possible() {
        let table = relay_table(1);
        table.upsert(key(2), addr(2), Capabilities::RELAY.with(Capabilities::EXIT));

        let filter = CandidateFilter {
            require: Capabilities::RELAY,
            avoid: Capabilities::EXIT,
            ..Default::default()
        };
        for _ in 0..20 {
            assert_eq!(table.pick_candidate(&filter).unwrap().public_key, key(1));
        }
    }

    #[test]
    fn test_first_hop_reuse_limit() {
        let table = relay_table(2);
        let usage = HashMap::from([(key(1), 2usize)]);

        let filter = CandidateFilter {
            first_hop: Some((&usage, 2)),
            ..Default::default()
        };
        for _ in 0..20 {
            assert_eq!(table.pick_candidate(&filter).unwrap().public_key, key(2));
        }
    }

    #[test]
    fn test_sample_excludes_requester() {
        let table = relay_table(5);
        let sample = table.sample(10, Some(&key(1)));
        assert_eq!(sample.len(), 4);
        assert!(sample.iter().all(|p| p.public_key != key(1)));
    }
}
