//! Tunnel community: routes tunnel datagrams to the client or relay role.

use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::cell::Cell;
use super::manager::CircuitManager;
use super::relay::RelayService;
use super::CellSender;
use crate::components::LaunchError;
use crate::config::TunnelConfig;
use crate::health::{self, ComponentHealth, HealthChecker};
use crate::notifier::Notifier;
use crate::overlay::{Inbound, Overlay, TUNNEL_PREFIX};

pub struct TunnelCommunity {
    overlay: Arc<Overlay>,
    health: HealthChecker,
    config: TunnelConfig,
    manager: Arc<CircuitManager>,
    relay: Arc<RelayService>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelCommunity {
    pub const NAME: &'static str = "tunnel";

    /// Must be called inside a tokio runtime
    pub fn new(overlay: Arc<Overlay>, notifier: Notifier, health: HealthChecker, config: TunnelConfig) -> Self {
        let manager = CircuitManager::new(
            config.clone(),
            overlay.clone(),
            CellSender::spawn(overlay.clone()),
            notifier,
            health.clone(),
        );
        let relay = RelayService::new(overlay.clone(), CellSender::spawn(overlay.clone()), &config);

        Self {
            overlay,
            health,
            config,
            manager,
            relay,
            task: Mutex::new(None),
        }
    }

    pub fn manager(&self) -> &Arc<CircuitManager> {
        &self.manager
    }

    pub fn relay(&self) -> &Arc<RelayService> {
        &self.relay
    }

    pub async fn start(&self) -> Result<(), LaunchError> {
        let inbound = self.overlay.register_handler(TUNNEL_PREFIX)?;

        self.health.register_component(health::TUNNEL).await;
        self.relay.start();
        self.manager.start();

        let handle = tokio::spawn(dispatch(
            self.manager.clone(),
            self.relay.clone(),
            inbound,
            self.config.maintenance_interval,
        ));
        if let Some(previous) = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle)
        {
            previous.abort();
        }

        info!(
            exit = self.config.exit_enabled,
            tiers = ?self.config.tiers,
            "Tunnel community started"
        );
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), LaunchError> {
        self.manager.shutdown();

        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.relay.stop();
        self.overlay.unregister_handler(TUNNEL_PREFIX);
        self.health
            .report(ComponentHealth::unhealthy(health::TUNNEL, "stopped"))
            .await;

        info!("Tunnel community stopped");
        Ok(())
    }
}

async fn dispatch(
    manager: Arc<CircuitManager>,
    relay: Arc<RelayService>,
    mut inbound: mpsc::Receiver<Inbound>,
    sweep_every: std::time::Duration,
) {
    let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            message = inbound.recv() => {
                let Some((from, bytes)) = message else {
                    break;
                };
                match Cell::decode(&bytes) {
                    Ok(cell) if manager.owns(from, cell.circuit_id) => manager.handle_cell(cell),
                    Ok(cell) => relay.handle_cell(from, cell),
                    Err(e) => debug!(%from, error = %e, "Dropping malformed cell"),
                }
            }
            _ = sweep.tick() => {
                relay.expire(Instant::now());
            }
        }
    }

    debug!("Tunnel dispatch ended");
}
