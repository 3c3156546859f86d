//! Relay role: forward cells for circuits built by other nodes.
//!
//! Each relayed circuit has an entry keyed by the previous link
//! `(prev_addr, prev_cid)`. Forward cells lose one onion layer here; cells
//! coming back from the next hop gain one. A relay only ever knows its two
//! neighbours on a circuit.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cell::{create_payload, Cell, CellType, CreatedPayload, DestroyReason, RelayMessage};
use super::crypto::{respond, HopCrypto, FLAG_DELIVER, FLAG_RELAY};
use super::exit::{ExitReply, ExitService, LinkKey};
use super::{CellSender, TunnelError};
use crate::config::TunnelConfig;
use crate::metrics::{self, names};
use crate::overlay::Overlay;

struct RelayEntry {
    crypto: HopCrypto,
    next: Option<LinkKey>,
    /// Hop index the client asked for in a pending extend
    pending_extend: Option<u8>,
    last_activity: Instant,
}

#[derive(Default)]
struct RelayTable {
    forward: HashMap<LinkKey, RelayEntry>,
    backward: HashMap<LinkKey, LinkKey>,
}

impl RelayTable {
    fn allocate_next_id(&self, addr: SocketAddr) -> u32 {
        let mut rng = rand::rng();
        loop {
            let id: u32 = rng.random();
            if id != 0 && !self.backward.contains_key(&(addr, id)) {
                return id;
            }
        }
    }

    /// Remove a relayed circuit. Returns its next link, if any.
    fn remove(&mut self, prev: &LinkKey) -> Option<Option<LinkKey>> {
        let entry = self.forward.remove(prev)?;
        if let Some(next) = entry.next {
            self.backward.remove(&next);
        }
        Some(entry.next)
    }
}

pub struct RelayService {
    overlay: Arc<Overlay>,
    outbound: CellSender,
    exit: ExitService,
    max_idle: Duration,
    table: Mutex<RelayTable>,
    replies: Mutex<Option<mpsc::UnboundedReceiver<ExitReply>>>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl RelayService {
    pub fn new(overlay: Arc<Overlay>, outbound: CellSender, config: &TunnelConfig) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            overlay,
            outbound,
            exit: ExitService::new(config.exit_enabled, config.stream_open_timeout, tx),
            max_idle: config.max_idle,
            table: Mutex::new(RelayTable::default()),
            replies: Mutex::new(Some(rx)),
            pump: Mutex::new(None),
        })
    }

    fn table(&self) -> MutexGuard<'_, RelayTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn relayed_circuits(&self) -> usize {
        self.table().forward.len()
    }

    pub fn exit(&self) -> &ExitService {
        &self.exit
    }

    /// Start forwarding exit replies back into their circuits
    pub fn start(self: &Arc<Self>) {
        let Some(mut replies) = self
            .replies
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
        else {
            return;
        };

        let relay = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(reply) = replies.recv().await {
                if let Err(e) = relay.send_backward(reply.link, &reply.message) {
                    debug!(error = %e, "Exit reply dropped");
                }
            }
        });
        *self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);
    }

    /// Drop all relay state. Neighbours are not notified.
    pub fn stop(&self) {
        if let Some(task) = self.pump.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take() {
            task.abort();
        }
        self.exit.shutdown();
        self.outbound.close();

        let mut table = self.table();
        let relayed = table.forward.len();
        table.forward.clear();
        table.backward.clear();
        info!(relayed, "Relay stopped");
    }

    fn send(&self, addr: SocketAddr, cell: &Cell) {
        match self.outbound.send(addr, cell) {
            Ok(()) => metrics::record_counter(names::CELLS_RELAYED, 1),
            Err(e) => debug!(%addr, error = %e, "Relay cell not sent"),
        }
    }

    /// Process a cell for a circuit this node did not build
    pub fn handle_cell(&self, from: SocketAddr, cell: Cell) {
        let key = (from, cell.circuit_id);

        let result = match cell.cell_type {
            CellType::Create => self.on_create(key, &cell),
            CellType::Destroy => {
                self.on_destroy(key, DestroyReason::from_payload(&cell.payload));
                Ok(())
            }
            _ => {
                let (forward, backward) = {
                    let table = self.table();
                    (table.forward.contains_key(&key), table.backward.get(&key).copied())
                };
                match (forward, backward) {
                    (true, _) if matches!(cell.cell_type, CellType::Extend | CellType::Data) => {
                        self.on_forward(key, cell)
                    }
                    (_, Some(prev)) => self.on_backward(prev, cell),
                    _ => {
                        debug!(%from, circuit_id = cell.circuit_id, kind = %cell.cell_type, "Cell for unknown circuit");
                        Ok(())
                    }
                }
            }
        };

        if let Err(e) = result {
            warn!(%from, circuit_id = key.1, error = %e, "Relay teardown");
            self.teardown(key, DestroyReason::Protocol);
        }
    }

    fn on_create(&self, key: LinkKey, cell: &Cell) -> Result<(), TunnelError> {
        let mut table = self.table();
        if table.forward.contains_key(&key) || table.backward.contains_key(&key) {
            debug!(circuit_id = key.1, "Duplicate create ignored");
            return Ok(());
        }

        let client_ephemeral = create_payload(cell)?;
        let (crypto, reply) = respond(self.overlay.identity().secret(), &client_ephemeral)
            .map_err(|source| TunnelError::Crypto {
                circuit_id: key.1,
                source,
            })?;

        table.forward.insert(
            key,
            RelayEntry {
                crypto,
                next: None,
                pending_extend: None,
                last_activity: Instant::now(),
            },
        );

        let created = CreatedPayload {
            relay_ephemeral: reply.relay_ephemeral,
            auth: reply.auth,
        };
        self.send(key.0, &Cell::new(CellType::Created, key.1, created.to_bytes()));
        debug!(from = %key.0, circuit_id = key.1, "Joined circuit");
        Ok(())
    }

    fn on_forward(&self, key: LinkKey, cell: Cell) -> Result<(), TunnelError> {
        let mut table = self.table();
        let Some(entry) = table.forward.get_mut(&key) else {
            return Ok(());
        };
        entry.last_activity = Instant::now();

        let (flag, content) = entry
            .crypto
            .forward
            .open(cell.cell_type, &cell.payload)
            .map_err(|source| TunnelError::Crypto {
                circuit_id: key.1,
                source,
            })?;

        if flag == FLAG_RELAY {
            let (addr, next_cid) = entry.next.ok_or_else(|| TunnelError::Protocol {
                circuit_id: key.1,
                reason: "relay layer at the last hop".to_string(),
            })?;
            self.send(addr, &Cell::new(cell.cell_type, next_cid, content));
            return Ok(());
        }

        match RelayMessage::decode(cell.cell_type, &content)? {
            RelayMessage::Extend {
                hop_index,
                next_addr,
                client_ephemeral,
                ..
            } => {
                if entry.next.is_some() {
                    return Err(TunnelError::Protocol {
                        circuit_id: key.1,
                        reason: "circuit already extended".to_string(),
                    });
                }
                let next_cid = table.allocate_next_id(next_addr);
                if let Some(entry) = table.forward.get_mut(&key) {
                    entry.next = Some((next_addr, next_cid));
                    entry.pending_extend = Some(hop_index);
                }
                table.backward.insert((next_addr, next_cid), key);
                drop(table);

                debug!(circuit_id = key.1, %next_addr, hop_index, "Extending circuit");
                self.send(next_addr, &Cell::new(CellType::Create, next_cid, client_ephemeral.to_vec()));
                Ok(())
            }
            message @ (RelayMessage::Open { .. } | RelayMessage::Data { .. } | RelayMessage::End { .. }) => {
                if entry.next.is_some() {
                    return Err(TunnelError::Protocol {
                        circuit_id: key.1,
                        reason: "stream message at a middle hop".to_string(),
                    });
                }
                drop(table);
                self.exit.handle(key, message);
                Ok(())
            }
            other => Err(TunnelError::Protocol {
                circuit_id: key.1,
                reason: format!("unexpected forward message {:?}", other),
            }),
        }
    }

    fn on_backward(&self, prev: LinkKey, cell: Cell) -> Result<(), TunnelError> {
        let mut table = self.table();
        let Some(entry) = table.forward.get_mut(&prev) else {
            return Ok(());
        };
        entry.last_activity = Instant::now();

        let (cell_type, layer) = match cell.cell_type {
            CellType::Created => {
                let hop_index = entry.pending_extend.take().ok_or_else(|| TunnelError::Protocol {
                    circuit_id: prev.1,
                    reason: "created without pending extend".to_string(),
                })?;
                let created = CreatedPayload::from_bytes(&cell.payload)?;
                let message = RelayMessage::Extended {
                    hop_index,
                    relay_ephemeral: created.relay_ephemeral,
                    auth: created.auth,
                };
                let layer = entry
                    .crypto
                    .backward
                    .seal(CellType::Extended, FLAG_DELIVER, &message.encode()?)
                    .map_err(|source| TunnelError::Crypto {
                        circuit_id: prev.1,
                        source,
                    })?;
                (CellType::Extended, layer)
            }
            CellType::Extended | CellType::Data => {
                let layer = entry
                    .crypto
                    .backward
                    .seal(cell.cell_type, FLAG_RELAY, &cell.payload)
                    .map_err(|source| TunnelError::Crypto {
                        circuit_id: prev.1,
                        source,
                    })?;
                (cell.cell_type, layer)
            }
            other => {
                return Err(TunnelError::Protocol {
                    circuit_id: prev.1,
                    reason: format!("unexpected backward {} cell", other),
                })
            }
        };

        self.send(prev.0, &Cell::new(cell_type, prev.1, layer));
        Ok(())
    }

    /// Seal an exit reply for the client and send it to the previous hop
    pub fn send_backward(&self, prev: LinkKey, message: &RelayMessage) -> Result<(), TunnelError> {
        let mut table = self.table();
        let entry = table
            .forward
            .get_mut(&prev)
            .ok_or(TunnelError::UnknownCircuit(prev.1))?;
        entry.last_activity = Instant::now();

        let layer = entry
            .crypto
            .backward
            .seal(CellType::Data, FLAG_DELIVER, &message.encode()?)
            .map_err(|source| TunnelError::Crypto {
                circuit_id: prev.1,
                source,
            })?;
        self.send(prev.0, &Cell::new(CellType::Data, prev.1, layer));
        Ok(())
    }

    fn on_destroy(&self, key: LinkKey, reason: DestroyReason) {
        let mut table = self.table();

        if let Some(next) = table.remove(&key) {
            drop(table);
            self.exit.close_link(key);
            if let Some((addr, cid)) = next {
                self.send(addr, &Cell::destroy(cid, reason));
            }
            debug!(circuit_id = key.1, ?reason, "Relayed circuit destroyed by previous hop");
            return;
        }

        if let Some(prev) = table.backward.get(&key).copied() {
            table.remove(&prev);
            drop(table);
            self.send(prev.0, &Cell::destroy(prev.1, reason));
            debug!(circuit_id = prev.1, ?reason, "Relayed circuit destroyed by next hop");
        }
    }

    /// Tear a relayed circuit down in both directions
    fn teardown(&self, key: LinkKey, reason: DestroyReason) {
        let prev = {
            let table = self.table();
            if table.forward.contains_key(&key) {
                Some(key)
            } else {
                table.backward.get(&key).copied()
            }
        };
        let Some(prev) = prev else {
            return;
        };

        let next = self.table().remove(&prev).flatten();
        self.exit.close_link(prev);
        self.send(prev.0, &Cell::destroy(prev.1, reason));
        if let Some((addr, cid)) = next {
            self.send(addr, &Cell::destroy(cid, reason));
        }
    }

    /// Drop relayed circuits without traffic for longer than the idle limit.
    /// Returns how many were removed.
    pub fn expire(&self, now: Instant) -> usize {
        let stale: Vec<LinkKey> = self
            .table()
            .forward
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_activity) > self.max_idle)
            .map(|(key, _)| *key)
            .collect();

        for key in &stale {
            self.teardown(*key, DestroyReason::Idle);
        }
        if !stale.is_empty() {
            info!(expired = stale.len(), "Expired idle relayed circuits");
        }
        stale.len()
    }
}
