//! The set of live circuits, partitioned by tier.

use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use super::circuit::{Circuit, CircuitId, CircuitState};
use crate::overlay::PeerKey;

/// Per-tier counts reported by the status API
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TierSummary {
    pub tier: usize,
    pub ready: usize,
    pub extending: usize,
    pub streams: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitSummary {
    pub id: CircuitId,
    pub tier: usize,
    pub state: CircuitState,
    pub hops: usize,
    pub streams: usize,
    pub age_secs: u64,
}

#[derive(Default)]
pub struct CircuitPool {
    circuits: HashMap<CircuitId, Circuit>,
}

impl CircuitPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fresh non-zero id not used by any live circuit
    pub fn allocate_id(&self) -> CircuitId {
        let mut rng = rand::rng();
        loop {
            let id: CircuitId = rng.random();
            if id != 0 && !self.circuits.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, circuit: Circuit) {
        self.circuits.insert(circuit.id, circuit);
    }

    pub fn get(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn get_mut(&mut self, id: CircuitId) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn remove(&mut self, id: CircuitId) -> Option<Circuit> {
        self.circuits.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }

    pub fn ids(&self) -> Vec<CircuitId> {
        self.circuits.keys().copied().collect()
    }

    pub fn ready_count(&self, tier: usize) -> usize {
        self.circuits
            .values()
            .filter(|c| c.tier == tier && c.is_ready())
            .count()
    }

    pub fn extending_count(&self, tier: usize) -> usize {
        self.circuits
            .values()
            .filter(|c| c.tier == tier && matches!(c.state, CircuitState::Extending(_)))
            .count()
    }

    /// READY or EXTENDING circuits of a tier
    pub fn live_count(&self, tier: usize) -> usize {
        self.circuits
            .values()
            .filter(|c| c.tier == tier && c.state.is_live())
            .count()
    }

    /// The READY circuit of `tier` carrying the fewest streams
    pub fn least_loaded_ready(&self, tier: usize, exclude: Option<CircuitId>) -> Option<CircuitId> {
        self.circuits
            .values()
            .filter(|c| c.tier == tier && c.is_ready() && Some(c.id) != exclude)
            .min_by_key(|c| (c.stream_count(), c.created_at))
            .map(|c| c.id)
    }

    /// How many live circuits use each peer as their first hop, counting
    /// builds that have chosen a first peer but not yet confirmed it
    pub fn first_hop_usage(&self) -> HashMap<PeerKey, usize> {
        let mut usage = HashMap::new();
        for circuit in self.circuits.values().filter(|c| c.state.is_live()) {
            let peer = circuit.first_hop().map(|hop| hop.peer).or(circuit.first_peer);
            if let Some(peer) = peer {
                *usage.entry(peer).or_insert(0) += 1;
            }
        }
        usage
    }

    /// READY circuits without traffic for longer than `max_idle`
    pub fn idle(&self, max_idle: Duration, now: Instant) -> Vec<CircuitId> {
        self.circuits
            .values()
            .filter(|c| c.is_ready() && now.duration_since(c.last_activity) > max_idle)
            .map(|c| c.id)
            .collect()
    }

    pub fn tier_summary(&self, tier: usize) -> TierSummary {
        let mut summary = TierSummary {
            tier,
            ..TierSummary::default()
        };
        for circuit in self.circuits.values().filter(|c| c.tier == tier) {
            match circuit.state {
                CircuitState::Ready => summary.ready += 1,
                CircuitState::Extending(_) => summary.extending += 1,
                _ => {}
            }
            summary.streams += circuit.stream_count();
        }
        summary
    }

    pub fn circuits(&self) -> Vec<CircuitSummary> {
        let now = Instant::now();
        let mut list: Vec<CircuitSummary> = self
            .circuits
            .values()
            .map(|c| CircuitSummary {
                id: c.id,
                tier: c.tier,
                state: c.state,
                hops: c.hop_count(),
                streams: c.stream_count(),
                age_secs: now.duration_since(c.created_at).as_secs(),
            })
            .collect();
        list.sort_by_key(|c| (c.tier, c.id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_by_tier_and_state() {
        let mut pool = CircuitPool::new();

        let mut ready = Circuit::new(pool.allocate_id(), 1);
        ready.state = CircuitState::Ready;
        pool.insert(ready);

        let extending = Circuit::new(pool.allocate_id(), 1);
        pool.insert(extending);

        let mut other = Circuit::new(pool.allocate_id(), 3);
        other.state = CircuitState::Ready;
        pool.insert(other);

        assert_eq!(pool.ready_count(1), 1);
        assert_eq!(pool.extending_count(1), 1);
        assert_eq!(pool.live_count(1), 2);
        assert_eq!(pool.ready_count(3), 1);
        assert_eq!(pool.live_count(2), 0);

        let summary = pool.tier_summary(1);
        assert_eq!((summary.ready, summary.extending), (1, 1));
    }

    #[test]
    fn test_idle_only_considers_ready() {
        let mut pool = CircuitPool::new();
        let mut ready = Circuit::new(1, 1);
        ready.state = CircuitState::Ready;
        pool.insert(ready);
        pool.insert(Circuit::new(2, 1));

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(pool.idle(Duration::from_secs(60), later), vec![1]);
        assert!(pool.idle(Duration::from_secs(600), later).is_empty());
    }

    #[test]
    fn test_least_loaded_respects_exclude() {
        let mut pool = CircuitPool::new();
        for id in [1, 2] {
            let mut circuit = Circuit::new(id, 2);
            circuit.state = CircuitState::Ready;
            pool.insert(circuit);
        }

        assert!(pool.least_loaded_ready(2, Some(1)) == Some(2));
        assert!(pool.least_loaded_ready(1, None).is_none());
    }

    #[test]
    fn test_first_hop_usage_counts_unconfirmed_builds() {
        let mut pool = CircuitPool::new();
        for id in [1, 2] {
            let mut circuit = Circuit::new(id, 3);
            circuit.first_peer = Some([9; 32]);
            pool.insert(circuit);
        }
        let mut closed = Circuit::new(3, 3);
        closed.first_peer = Some([9; 32]);
        closed.state = CircuitState::Breaking;
        pool.insert(closed);
        pool.insert(Circuit::new(4, 3));

        let usage = pool.first_hop_usage();
        assert_eq!(usage.get(&[9; 32]), Some(&2));
        assert_eq!(usage.len(), 1);
    }
}
