//! Circuit manager: construction, pool maintenance and streams.
//!
//! A build reserves a slot in the pool, then adds hops one at a time. Hop 0
//! is reached with a `Create` cell; every later hop with an `Extend` message
//! delivered to the current last hop, which creates the next link and
//! answers with `Extended`. Each hop gets its own timeout. Any failure closes
//! the circuit; a fresh circuit is built on a later maintenance tick.
//!
//! Maintenance runs on a fixed interval, closes idle circuits and starts
//! builds for tiers below `min_circuits`, never exceeding `max_circuits`
//! live circuits per tier.

use serde::Serialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use super::cell::{Cell, CellType, CreatedPayload, DestroyReason, RelayMessage, MAX_STREAM_CHUNK};
use super::circuit::{Circuit, CircuitId, CircuitState, Hop, StreamEvent};
use super::crypto::{ClientHandshake, HandshakeReply};
use super::pool::{CircuitPool, CircuitSummary, TierSummary};
use super::{CellSender, TunnelError};
use crate::config::TunnelConfig;
use crate::health::{checks, HealthChecker};
use crate::metrics::{self, names, Timer};
use crate::notifier::{payload, Notifier, Topic};
use crate::overlay::{short_id, CandidateFilter, Capabilities, Overlay, OverlayPeer, PeerKey};

/// Penalty for a protocol violation during construction
const PROTOCOL_PENALTY: u32 = 10;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ManagerStats {
    pub builds_started: u64,
    pub circuits_built: u64,
    pub builds_failed: u64,
    pub circuits_closed: u64,
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    built: AtomicU64,
    failed: AtomicU64,
    closed: AtomicU64,
}

#[derive(Default)]
struct Capacity {
    below_min: HashMap<usize, u32>,
    degraded: HashSet<usize>,
}

pub struct CircuitManager {
    config: TunnelConfig,
    overlay: Arc<Overlay>,
    outbound: CellSender,
    notifier: Notifier,
    health: HealthChecker,
    pool: Mutex<CircuitPool>,
    pending: Mutex<HashMap<CircuitId, oneshot::Sender<Cell>>>,
    ready: Notify,
    builds: Mutex<HashMap<u64, AbortHandle>>,
    next_build: AtomicU64,
    maintenance: Mutex<Option<JoinHandle<()>>>,
    capacity: Mutex<Capacity>,
    shut_down: AtomicBool,
    counters: Counters,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl CircuitManager {
    pub fn new(
        config: TunnelConfig,
        overlay: Arc<Overlay>,
        outbound: CellSender,
        notifier: Notifier,
        health: HealthChecker,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            overlay,
            outbound,
            notifier,
            health,
            pool: Mutex::new(CircuitPool::new()),
            pending: Mutex::new(HashMap::new()),
            ready: Notify::new(),
            builds: Mutex::new(HashMap::new()),
            next_build: AtomicU64::new(0),
            maintenance: Mutex::new(None),
            capacity: Mutex::new(Capacity::default()),
            shut_down: AtomicBool::new(false),
            counters: Counters::default(),
        })
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            builds_started: self.counters.started.load(Ordering::Relaxed),
            circuits_built: self.counters.built.load(Ordering::Relaxed),
            builds_failed: self.counters.failed.load(Ordering::Relaxed),
            circuits_closed: self.counters.closed.load(Ordering::Relaxed),
        }
    }

    pub fn circuit_state(&self, id: CircuitId) -> Option<CircuitState> {
        locked(&self.pool).get(id).map(|c| c.state)
    }

    pub fn hop_peers(&self, id: CircuitId) -> Vec<PeerKey> {
        locked(&self.pool)
            .get(id)
            .map(|c| c.hops().iter().map(|h| h.peer).collect())
            .unwrap_or_default()
    }

    pub fn tier_summaries(&self) -> Vec<TierSummary> {
        let pool = locked(&self.pool);
        self.config
            .tiers
            .iter()
            .map(|&tier| pool.tier_summary(tier))
            .collect()
    }

    pub fn circuits(&self) -> Vec<CircuitSummary> {
        locked(&self.pool).circuits()
    }

    pub fn degraded_tiers(&self) -> Vec<usize> {
        let mut tiers: Vec<usize> = locked(&self.capacity).degraded.iter().copied().collect();
        tiers.sort_unstable();
        tiers
    }

    /// Start periodic pool maintenance. The first pass runs one interval
    /// after start.
    pub fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let period = self.config.maintenance_interval;

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                manager.maintain();
            }
        });

        if let Some(previous) = locked(&self.maintenance).replace(task) {
            previous.abort();
        }
        info!(
            tiers = ?self.config.tiers,
            min = self.config.min_circuits,
            max = self.config.max_circuits,
            "Circuit manager started"
        );
    }

    /// One maintenance pass. Returns the number of builds started.
    pub fn maintain(self: &Arc<Self>) -> usize {
        if self.is_shut_down() || !self.overlay.is_running() {
            return 0;
        }

        let idle = locked(&self.pool).idle(self.config.max_idle, Instant::now());
        for id in idle {
            info!(circuit_id = id, "Closing idle circuit");
            self.close_with(id, DestroyReason::Idle, true);
        }

        let mut started = 0;
        for &tier in &self.config.tiers {
            let (ready, live) = {
                let pool = locked(&self.pool);
                (pool.ready_count(tier), pool.live_count(tier))
            };
            metrics::record_ready_circuits(tier, ready);

            let wanted = self.config.min_circuits.saturating_sub(live);
            let room = self.config.max_circuits.saturating_sub(live);
            let builds = wanted.min(room);
            for _ in 0..builds {
                self.spawn_build(tier);
            }
            started += builds;

            self.track_capacity(tier, ready);
        }

        if started > 0 {
            debug!(started, "Maintenance started circuit builds");
        }
        started
    }

    fn spawn_build(self: &Arc<Self>, tier: usize) {
        let key = self.next_build.fetch_add(1, Ordering::Relaxed);
        let manager = Arc::clone(self);

        let mut builds = locked(&self.builds);
        let handle = tokio::spawn(async move {
            if let Err(TunnelError::NoCandidates { hop, .. }) = manager.build_circuit(tier).await {
                manager.mark_degraded(tier, &format!("no eligible peer for hop {}", hop));
            }
            locked(&manager.builds).remove(&key);
        });
        builds.insert(key, handle.abort_handle());
    }

    /// Build one circuit of `tier` hops
    pub async fn build_circuit(self: &Arc<Self>, tier: usize) -> Result<CircuitId, TunnelError> {
        if self.is_shut_down() {
            return Err(TunnelError::ShuttingDown);
        }
        if !self.config.tiers.contains(&tier) {
            return Err(TunnelError::UnknownTier(tier));
        }

        let (id, first) = {
            let mut pool = locked(&self.pool);
            if pool.live_count(tier) >= self.config.max_circuits {
                return Err(TunnelError::PoolFull { tier });
            }

            let usage = pool.first_hop_usage();
            let first = self
                .pick(tier, 0, HashSet::new(), Some(&usage))
                .ok_or(TunnelError::NoCandidates { tier, hop: 0 })?;

            let id = pool.allocate_id();
            let mut circuit = Circuit::new(id, tier);
            circuit.first_peer = Some(first.public_key);
            pool.insert(circuit);
            (id, first)
        };

        self.counters.started.fetch_add(1, Ordering::Relaxed);
        metrics::record_counter(names::CIRCUITS_STARTED, 1);
        debug!(circuit_id = id, tier, "Building circuit");

        let timer = Timer::new(names::CIRCUIT_BUILD_MS);
        match self.extend_all(id, tier, first).await {
            Ok(()) => {
                timer.stop();
                self.on_ready(id, tier);
                Ok(id)
            }
            Err(e @ (TunnelError::Abandoned(_) | TunnelError::ShuttingDown)) => {
                debug!(circuit_id = id, tier, error = %e, "Circuit build abandoned");
                Err(e)
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                metrics::record_counter(names::CIRCUITS_FAILED, 1);
                warn!(circuit_id = id, tier, error = %e, "Circuit build failed");

                let reason = match e {
                    TunnelError::HopTimeout { .. } => DestroyReason::Timeout,
                    _ => DestroyReason::Protocol,
                };
                self.close_with(id, reason, true);
                Err(e)
            }
        }
    }

    fn pick(
        &self,
        tier: usize,
        hop: usize,
        exclude: HashSet<PeerKey>,
        usage: Option<&HashMap<PeerKey, usize>>,
    ) -> Option<OverlayPeer> {
        let final_hop = hop + 1 == tier;
        let filter = CandidateFilter {
            exclude,
            require: if final_hop {
                Capabilities::RELAY.with(Capabilities::EXIT)
            } else {
                Capabilities::RELAY
            },
            avoid: if final_hop {
                Capabilities::NONE
            } else {
                Capabilities::EXIT
            },
            first_hop: usage.map(|usage| (usage, self.config.first_hop_reuse_limit)),
        };
        self.overlay.peers().pick_candidate(&filter)
    }

    async fn extend_all(&self, id: CircuitId, tier: usize, first: OverlayPeer) -> Result<(), TunnelError> {
        let mut candidate = first;

        for hop in 0..tier {
            if hop > 0 {
                let exclude = {
                    let pool = locked(&self.pool);
                    let circuit = pool.get(id).ok_or(TunnelError::Abandoned(id))?;
                    circuit.hops().iter().map(|h| h.peer).collect()
                };
                candidate = self
                    .pick(tier, hop, exclude, None)
                    .ok_or(TunnelError::NoCandidates { tier, hop })?;
            }

            self.add_hop(id, hop, &candidate).await?;
            debug!(circuit_id = id, hop, peer = %candidate.id(), "Hop added");
        }

        Ok(())
    }

    async fn add_hop(&self, id: CircuitId, hop: usize, candidate: &OverlayPeer) -> Result<(), TunnelError> {
        let handshake = ClientHandshake::new(candidate.public_key);

        let (rx, extender) = {
            let mut pool = locked(&self.pool);
            let circuit = pool.get_mut(id).ok_or(TunnelError::Abandoned(id))?;

            let (addr, cell, extender) = if hop == 0 {
                circuit.link = Some(candidate.addr);
                let cell = Cell::new(CellType::Create, id, handshake.public().to_vec());
                (candidate.addr, cell, None)
            } else {
                let link = circuit.link.ok_or(TunnelError::Abandoned(id))?;
                let extender = circuit.hops()[hop - 1].peer;
                let message = RelayMessage::Extend {
                    hop_index: hop as u8,
                    next_addr: candidate.addr,
                    next_key: candidate.public_key,
                    client_ephemeral: handshake.public(),
                };
                let payload = circuit.wrap(CellType::Extend, hop - 1, &message)?;
                (link, Cell::new(CellType::Extend, id, payload), Some(extender))
            };

            let (tx, rx) = oneshot::channel();
            locked(&self.pending).insert(id, tx);
            self.outbound.send(addr, &cell)?;
            metrics::record_counter(names::CELLS_SENT, 1);
            (rx, extender)
        };

        let reply = match tokio::time::timeout(self.config.hop_timeout, rx).await {
            Ok(Ok(cell)) => cell,
            Ok(Err(_)) => return Err(TunnelError::Abandoned(id)),
            Err(_) => {
                locked(&self.pending).remove(&id);
                return Err(TunnelError::HopTimeout { circuit_id: id, hop });
            }
        };

        let reply = match extender {
            None => {
                if reply.cell_type != CellType::Created {
                    self.penalize(&candidate.public_key, "unexpected reply to create");
                    return Err(TunnelError::Protocol {
                        circuit_id: id,
                        reason: format!("expected created, got {}", reply.cell_type),
                    });
                }
                let created = match CreatedPayload::from_bytes(&reply.payload) {
                    Ok(created) => created,
                    Err(e) => {
                        self.penalize(&candidate.public_key, "malformed created");
                        return Err(e.into());
                    }
                };
                HandshakeReply {
                    relay_ephemeral: created.relay_ephemeral,
                    auth: created.auth,
                }
            }
            Some(extender) => {
                if reply.cell_type != CellType::Extended {
                    self.penalize(&extender, "unexpected reply to extend");
                    return Err(TunnelError::Protocol {
                        circuit_id: id,
                        reason: format!("expected extended, got {}", reply.cell_type),
                    });
                }

                let peeled = {
                    let mut pool = locked(&self.pool);
                    let circuit = pool.get_mut(id).ok_or(TunnelError::Abandoned(id))?;
                    circuit.peel(CellType::Extended, &reply.payload)
                };
                let (origin, message) = match peeled {
                    Ok(peeled) => peeled,
                    Err(e) => {
                        self.penalize(&extender, "extended failed verification");
                        return Err(e);
                    }
                };

                if origin != hop - 1 {
                    self.penalize(&extender, "extended from wrong hop");
                    return Err(TunnelError::Protocol {
                        circuit_id: id,
                        reason: format!("extended by hop {}, expected hop {}", origin, hop - 1),
                    });
                }

                match message {
                    RelayMessage::Extended {
                        hop_index,
                        relay_ephemeral,
                        auth,
                    } => {
                        if hop_index as usize != hop {
                            self.penalize(&extender, "hop index mismatch");
                            return Err(TunnelError::HopIndexMismatch {
                                circuit_id: id,
                                expected: hop,
                                actual: hop_index as usize,
                            });
                        }
                        HandshakeReply {
                            relay_ephemeral,
                            auth,
                        }
                    }
                    other => {
                        self.penalize(&extender, "unexpected relay message");
                        return Err(TunnelError::Protocol {
                            circuit_id: id,
                            reason: format!("expected extended message, got {:?}", other),
                        });
                    }
                }
            }
        };

        let crypto = match handshake.complete(&reply) {
            Ok(crypto) => crypto,
            Err(source) => {
                self.penalize(&candidate.public_key, "handshake verification failed");
                return Err(TunnelError::Crypto {
                    circuit_id: id,
                    source,
                });
            }
        };

        let mut pool = locked(&self.pool);
        let circuit = pool.get_mut(id).ok_or(TunnelError::Abandoned(id))?;
        circuit.push_hop(Hop::new(candidate.public_key, candidate.addr, hop, crypto))
    }

    fn penalize(&self, peer: &PeerKey, reason: &str) {
        let Some(penalty) = self.overlay.peers().penalize(peer, PROTOCOL_PENALTY) else {
            return;
        };

        warn!(peer = %short_id(peer), penalty, reason, "Penalized peer");
        metrics::record_counter(names::PEERS_PENALIZED, 1);
        self.notifier.notify(
            Topic::PeerPenalized,
            payload([
                ("peer", json!(short_id(peer))),
                ("penalty", json!(penalty)),
                ("reason", json!(reason)),
            ]),
        );
    }

    fn on_ready(&self, id: CircuitId, tier: usize) {
        let (ready, hops) = {
            let pool = locked(&self.pool);
            match pool.get(id) {
                Some(circuit) if circuit.is_ready() => (pool.ready_count(tier), circuit.hop_count()),
                _ => return,
            }
        };

        self.counters.built.fetch_add(1, Ordering::Relaxed);
        metrics::record_counter(names::CIRCUITS_BUILT, 1);
        metrics::record_ready_circuits(tier, ready);
        info!(circuit_id = id, tier, hops, "Circuit ready");

        self.ready.notify_waiters();
        self.notifier.notify(
            Topic::CircuitReady,
            payload([("circuit_id", json!(id)), ("tier", json!(tier))]),
        );

        if ready >= self.config.min_circuits {
            self.track_capacity(tier, ready);
        }
    }

    fn track_capacity(&self, tier: usize, ready: usize) {
        enum Change {
            Recovered,
            Degraded(u32),
            None,
        }

        let change = {
            let mut guard = locked(&self.capacity);
            let capacity = &mut *guard;
            if ready >= self.config.min_circuits {
                capacity.below_min.remove(&tier);
                if capacity.degraded.remove(&tier) {
                    Change::Recovered
                } else {
                    Change::None
                }
            } else {
                let ticks = capacity.below_min.entry(tier).or_insert(0);
                *ticks += 1;
                if *ticks >= self.config.degraded_after && !capacity.degraded.contains(&tier) {
                    Change::Degraded(*ticks)
                } else {
                    Change::None
                }
            }
        };

        match change {
            Change::Recovered => {
                info!(tier, ready, "Tier capacity restored");
                self.report_health();
            }
            Change::Degraded(ticks) => self.mark_degraded(
                tier,
                &format!("below {} READY circuits for {} maintenance passes", self.config.min_circuits, ticks),
            ),
            Change::None => {}
        }
    }

    fn mark_degraded(&self, tier: usize, reason: &str) {
        if !locked(&self.capacity).degraded.insert(tier) {
            return;
        }

        warn!(tier, reason, "Tier capacity degraded");
        self.notifier.notify(
            Topic::CapacityDegraded,
            payload([
                ("tier", json!(tier)),
                ("reason", json!(reason)),
                ("min_circuits", json!(self.config.min_circuits)),
            ]),
        );
        self.report_health();
    }

    fn report_health(&self) {
        let health = self.health.clone();
        let report = checks::check_tunnel(&self.degraded_tiers());
        tokio::spawn(async move { health.report(report).await });
    }

    /// True when `cell` belongs to a circuit this node built
    pub fn owns(&self, from: SocketAddr, circuit_id: CircuitId) -> bool {
        locked(&self.pool)
            .get(circuit_id)
            .is_some_and(|c| c.link == Some(from))
    }

    /// Process a cell arriving from the first hop of one of our circuits
    pub fn handle_cell(&self, cell: Cell) {
        metrics::record_counter(names::CELLS_RECEIVED, 1);
        let id = cell.circuit_id;

        match cell.cell_type {
            CellType::Created | CellType::Extended => match locked(&self.pending).remove(&id) {
                Some(tx) => {
                    let _ = tx.send(cell);
                }
                None => debug!(circuit_id = id, kind = %cell.cell_type, "Unexpected reply cell"),
            },
            CellType::Data => self.handle_data(cell),
            CellType::Destroy => {
                let reason = DestroyReason::from_payload(&cell.payload);
                info!(circuit_id = id, ?reason, "Circuit destroyed by first hop");
                self.close_with(id, reason, false);
            }
            CellType::Create | CellType::Extend => {
                warn!(circuit_id = id, kind = %cell.cell_type, "Forward cell on own circuit");
                self.close_with(id, DestroyReason::Protocol, true);
            }
        }
    }

    fn handle_data(&self, cell: Cell) {
        let id = cell.circuit_id;

        let result = {
            let mut pool = locked(&self.pool);
            let Some(circuit) = pool.get_mut(id) else {
                return;
            };
            if !circuit.is_ready() {
                Err(TunnelError::NotReady(id))
            } else {
                let exit = circuit.hop_count() - 1;
                match circuit.peel(CellType::Data, &cell.payload) {
                    Ok((origin, message)) if origin == exit => {
                        circuit.touch();
                        deliver(circuit, message)
                    }
                    Ok((origin, _)) => Err(TunnelError::Protocol {
                        circuit_id: id,
                        reason: format!("data originated at hop {}", origin),
                    }),
                    Err(e) => Err(e),
                }
            }
        };

        if let Err(e) = result {
            warn!(circuit_id = id, error = %e, "Tearing down circuit");
            self.close_with(id, DestroyReason::Protocol, true);
        }
    }

    /// Close a circuit and tell its first hop. Returns false if unknown.
    pub fn close_circuit(&self, id: CircuitId) -> bool {
        self.close_with(id, DestroyReason::Requested, true)
    }

    fn close_with(&self, id: CircuitId, reason: DestroyReason, send_destroy: bool) -> bool {
        let circuit = {
            let mut pool = locked(&self.pool);
            let Some(circuit) = pool.get_mut(id) else {
                return false;
            };

            circuit.state = CircuitState::Breaking;
            circuit.release_streams();
            if send_destroy {
                if let Some(link) = circuit.link {
                    if let Err(e) = self.outbound.send(link, &Cell::destroy(id, reason)) {
                        debug!(circuit_id = id, error = %e, "Destroy not sent");
                    }
                }
            }

            let Some(mut circuit) = pool.remove(id) else {
                return false;
            };
            circuit.state = CircuitState::Closed;
            circuit
        };

        locked(&self.pending).remove(&id);
        self.on_closed(&circuit, &format!("{:?}", reason).to_lowercase());
        true
    }

    fn on_closed(&self, circuit: &Circuit, reason: &str) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        metrics::record_counter(names::CIRCUITS_CLOSED, 1);
        info!(circuit_id = circuit.id, tier = circuit.tier, reason, "Circuit closed");

        self.notifier.notify(
            Topic::CircuitClosed,
            payload([
                ("circuit_id", json!(circuit.id)),
                ("tier", json!(circuit.tier)),
                ("hops", json!(circuit.hop_count())),
                ("reason", json!(reason)),
            ]),
        );
    }

    /// A READY circuit of `tier`, preferring the least loaded
    pub fn select_ready(&self, tier: usize, exclude: Option<CircuitId>) -> Option<CircuitId> {
        if self.is_shut_down() {
            return None;
        }
        locked(&self.pool).least_loaded_ready(tier, exclude)
    }

    /// Wait up to `timeout` for a READY circuit of `tier`
    pub async fn wait_for_ready(&self, tier: usize, timeout: Duration) -> Result<CircuitId, TunnelError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            if self.is_shut_down() {
                return Err(TunnelError::ShuttingDown);
            }

            let notified = self.ready.notified();
            if let Some(id) = self.select_ready(tier, None) {
                return Ok(id);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(TunnelError::WaitTimeout { tier });
            }
        }
    }

    fn with_ready<R>(
        &self,
        id: CircuitId,
        f: impl FnOnce(&mut Circuit, SocketAddr) -> Result<R, TunnelError>,
    ) -> Result<R, TunnelError> {
        if self.is_shut_down() {
            return Err(TunnelError::ShuttingDown);
        }

        let mut pool = locked(&self.pool);
        let circuit = pool.get_mut(id).ok_or(TunnelError::UnknownCircuit(id))?;
        if !circuit.is_ready() {
            return Err(TunnelError::NotReady(id));
        }
        let link = circuit.link.ok_or(TunnelError::NotReady(id))?;
        f(circuit, link)
    }

    fn send_to_exit(
        &self,
        circuit: &mut Circuit,
        link: SocketAddr,
        message: &RelayMessage,
    ) -> Result<(), TunnelError> {
        let exit = circuit.hop_count() - 1;
        let payload = circuit.wrap(CellType::Data, exit, message)?;
        self.outbound
            .send(link, &Cell::new(CellType::Data, circuit.id, payload))?;
        circuit.touch();
        metrics::record_counter(names::CELLS_SENT, 1);
        Ok(())
    }

    /// Ask the exit to connect to `host:port`. Events for the stream arrive
    /// on the returned receiver.
    pub fn open_stream(
        &self,
        id: CircuitId,
        host: &str,
        port: u16,
    ) -> Result<(u32, mpsc::UnboundedReceiver<StreamEvent>), TunnelError> {
        self.with_ready(id, |circuit, link| {
            let (tx, rx) = mpsc::unbounded_channel();
            let stream_id = circuit.add_stream(tx);

            let message = RelayMessage::Open {
                stream_id,
                host: host.to_string(),
                port,
            };
            if let Err(e) = self.send_to_exit(circuit, link, &message) {
                circuit.remove_stream(stream_id);
                return Err(e);
            }
            Ok((stream_id, rx))
        })
    }

    pub fn send_stream_data(&self, id: CircuitId, stream_id: u32, data: &[u8]) -> Result<(), TunnelError> {
        self.with_ready(id, |circuit, link| {
            if circuit.stream(stream_id).is_none() {
                return Err(TunnelError::UnknownStream {
                    circuit_id: id,
                    stream_id,
                });
            }
            for chunk in data.chunks(MAX_STREAM_CHUNK) {
                let message = RelayMessage::Data {
                    stream_id,
                    bytes: chunk.to_vec(),
                };
                self.send_to_exit(circuit, link, &message)?;
            }
            Ok(())
        })
    }

    /// Detach a stream and tell the exit to close it
    pub fn end_stream(&self, id: CircuitId, stream_id: u32) {
        let result = self.with_ready(id, |circuit, link| {
            if circuit.remove_stream(stream_id).is_none() {
                return Ok(());
            }
            self.send_to_exit(circuit, link, &RelayMessage::End { stream_id })
        });
        if let Err(e) = result {
            debug!(circuit_id = id, stream_id, error = %e, "Stream end not sent");
        }
    }

    /// Cancel builds and close every circuit without destroy handshakes.
    /// Nothing is sent after this returns.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.outbound.close();

        if let Some(task) = locked(&self.maintenance).take() {
            task.abort();
        }
        for (_, build) in locked(&self.builds).drain() {
            build.abort();
        }
        locked(&self.pending).clear();

        let circuits: Vec<Circuit> = {
            let mut pool = locked(&self.pool);
            pool.ids().into_iter().filter_map(|id| pool.remove(id)).collect()
        };

        let closed = circuits.len();
        for mut circuit in circuits {
            circuit.state = CircuitState::Breaking;
            circuit.release_streams();
            circuit.state = CircuitState::Closed;
            self.on_closed(&circuit, "shutdown");
        }

        self.ready.notify_waiters();
        info!(closed, "Circuit manager shut down");
    }
}

fn deliver(circuit: &mut Circuit, message: RelayMessage) -> Result<(), TunnelError> {
    match message {
        RelayMessage::Opened { stream_id } => {
            if let Some(sink) = circuit.stream(stream_id) {
                let _ = sink.send(StreamEvent::Opened);
            }
        }
        RelayMessage::Data { stream_id, bytes } => {
            if let Some(sink) = circuit.stream(stream_id) {
                let _ = sink.send(StreamEvent::Data(bytes));
            }
        }
        RelayMessage::End { stream_id } => {
            if let Some(sink) = circuit.remove_stream(stream_id) {
                let _ = sink.send(StreamEvent::End);
            }
        }
        other => {
            return Err(TunnelError::Protocol {
                circuit_id: circuit.id,
                reason: format!("unexpected message from exit: {:?}", other),
            })
        }
    }
    Ok(())
}
