/*
  Tunnel subsystem

  Builds and maintains multi-hop encrypted circuits across overlay peers, and relays cells for
  circuits built by other nodes.

    cell       wire format of circuit cells and end-to-end relay messages
    crypto     hop handshake, onion layer encryption
    circuit    client-side circuit state (hops, streams)
    pool       live circuits by tier
    manager    circuit construction, pool maintenance, streams (client role)
    relay      per-link relay state (relay role)
    exit       TCP streams opened on behalf of circuits (exit role)
    community  overlay community tying the three roles together

  Cells for one circuit direction are encrypted and queued in the same critical section, and a
  single writer task drains each queue, so cells leave in sequence-number order.
*/

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::overlay::{Overlay, OverlayError, TUNNEL_PREFIX};

pub mod cell;
pub mod circuit;
pub mod community;
pub mod crypto;
pub mod exit;
pub mod manager;
pub mod pool;
pub mod relay;

pub use cell::{Cell, CellError, CellType, DestroyReason, RelayMessage};
pub use circuit::{Circuit, CircuitId, CircuitState, StreamEvent};
pub use community::TunnelCommunity;
pub use crypto::CryptoError;
pub use manager::{CircuitManager, ManagerStats};
pub use pool::{CircuitSummary, TierSummary};
pub use relay::RelayService;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Cell error: {0}")]
    Cell(#[from] CellError),

    #[error("Circuit {circuit_id}: {source}")]
    Crypto {
        circuit_id: CircuitId,
        #[source]
        source: CryptoError,
    },

    #[error("Circuit {circuit_id}: expected hop {expected}, peer claimed hop {actual}")]
    HopIndexMismatch {
        circuit_id: CircuitId,
        expected: usize,
        actual: usize,
    },

    #[error("Circuit {circuit_id}: hop {hop} timed out")]
    HopTimeout { circuit_id: CircuitId, hop: usize },

    #[error("No eligible peer for hop {hop} of a {tier}-hop circuit")]
    NoCandidates { tier: usize, hop: usize },

    #[error("Circuit {circuit_id}: protocol violation: {reason}")]
    Protocol { circuit_id: CircuitId, reason: String },

    #[error("Circuit {0} was closed")]
    Abandoned(CircuitId),

    #[error("Unknown circuit {0}")]
    UnknownCircuit(CircuitId),

    #[error("Circuit {0} is not ready")]
    NotReady(CircuitId),

    #[error("Circuit {circuit_id} has no stream {stream_id}")]
    UnknownStream { circuit_id: CircuitId, stream_id: u32 },

    #[error("Tier {tier} already has the maximum number of circuits")]
    PoolFull { tier: usize },

    #[error("No READY {tier}-hop circuit became available in time")]
    WaitTimeout { tier: usize },

    #[error("Tier {0} is not configured")]
    UnknownTier(usize),

    #[error("Tunnel is shutting down")]
    ShuttingDown,

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

/// Ordered queue of outgoing cells drained by one writer task
#[derive(Clone)]
pub struct CellSender {
    inner: Arc<SenderInner>,
}

struct SenderInner {
    tx: mpsc::UnboundedSender<(SocketAddr, Vec<u8>)>,
    closed: AtomicBool,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl CellSender {
    pub fn spawn(overlay: Arc<Overlay>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(SocketAddr, Vec<u8>)>();

        let writer = tokio::spawn(async move {
            while let Some((addr, bytes)) = rx.recv().await {
                if let Err(e) = overlay.send(TUNNEL_PREFIX, addr, &bytes).await {
                    debug!(%addr, error = %e, "Cell send failed");
                }
            }
        });

        Self {
            inner: Arc::new(SenderInner {
                tx,
                closed: AtomicBool::new(false),
                writer: Mutex::new(Some(writer)),
            }),
        }
    }

    /// Encode and queue a cell
    pub fn send(&self, addr: SocketAddr, cell: &Cell) -> Result<(), TunnelError> {
        if self.is_closed() {
            return Err(TunnelError::ShuttingDown);
        }
        let bytes = cell.encode()?;
        self.inner
            .tx
            .send((addr, bytes))
            .map_err(|_| TunnelError::ShuttingDown)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop the writer. Queued cells are discarded.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let writer = self
            .inner
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(writer) = writer {
            writer.abort();
        }
    }
}
