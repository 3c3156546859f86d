//! Metrics for the overlay and tunnel subsystems
//!
//! Values go through the `metrics` facade; without an installed recorder
//! every call is a no-op.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Metric names
pub mod names {
    pub const DATAGRAMS_SENT: &str = "overlay.datagrams.sent";
    pub const DATAGRAMS_RECEIVED: &str = "overlay.datagrams.received";
    pub const PEERS_KNOWN: &str = "overlay.peers.known";

    pub const CIRCUITS_STARTED: &str = "tunnel.circuits.started";
    pub const CIRCUITS_BUILT: &str = "tunnel.circuits.built";
    pub const CIRCUITS_FAILED: &str = "tunnel.circuits.failed";
    pub const CIRCUITS_CLOSED: &str = "tunnel.circuits.closed";
    pub const CIRCUITS_READY: &str = "tunnel.circuits.ready";
    pub const CIRCUIT_BUILD_MS: &str = "tunnel.circuit.build_ms";
    pub const CELLS_SENT: &str = "tunnel.cells.sent";
    pub const CELLS_RECEIVED: &str = "tunnel.cells.received";
    pub const CELLS_RELAYED: &str = "tunnel.cells.relayed";
    pub const PEERS_PENALIZED: &str = "tunnel.peers.penalized";

    pub const SOCKS_CONNECTIONS: &str = "socks.connections.accepted";
    pub const SOCKS_REBINDS: &str = "socks.connections.rebound";
    pub const SOCKS_RESETS: &str = "socks.connections.reset";
}

/// Initialize metrics with descriptions
pub fn init_metrics() {
    describe_counter!(names::DATAGRAMS_SENT, "Overlay datagrams sent");
    describe_counter!(names::DATAGRAMS_RECEIVED, "Overlay datagrams received");
    describe_gauge!(names::PEERS_KNOWN, "Peers in the overlay peer table");

    describe_counter!(names::CIRCUITS_STARTED, "Circuit builds started");
    describe_counter!(names::CIRCUITS_BUILT, "Circuits that reached READY");
    describe_counter!(names::CIRCUITS_FAILED, "Circuit builds abandoned");
    describe_counter!(names::CIRCUITS_CLOSED, "Circuits closed");
    describe_gauge!(names::CIRCUITS_READY, "READY circuits per tier");
    describe_histogram!(names::CIRCUIT_BUILD_MS, "Circuit build duration in milliseconds");
    describe_counter!(names::CELLS_SENT, "Cells sent on own circuits");
    describe_counter!(names::CELLS_RECEIVED, "Cells received on own circuits");
    describe_counter!(names::CELLS_RELAYED, "Cells forwarded for other circuits");
    describe_counter!(names::PEERS_PENALIZED, "Peers penalized for protocol violations");

    describe_counter!(names::SOCKS_CONNECTIONS, "SOCKS connections accepted");
    describe_counter!(names::SOCKS_REBINDS, "SOCKS connections moved to a new circuit");
    describe_counter!(names::SOCKS_RESETS, "SOCKS connections reset");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record the READY circuit count of one tier
pub fn record_ready_circuits(tier: usize, ready: usize) {
    gauge!(names::CIRCUITS_READY, "tier" => tier.to_string()).set(ready as f64);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: &'static str,
    start: Instant,
}

impl Timer {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration in milliseconds
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
        record_counter(names::CIRCUITS_STARTED, 1);
        record_ready_circuits(3, 1);
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new(names::CIRCUIT_BUILD_MS);
        std::thread::sleep(std::time::Duration::from_millis(5));
        timer.stop();
    }
}
