/*
  Session - top-level orchestration

  Startup (strict order):
    1. construct: validate config, select the overlay endpoint, create the overlay handle,
       SOCKS bridge and status API
    2. start SOCKS listeners
    3. hand the bound ports to the download engine, initialize and start it
    4. register and start components (discovery, tunnel) in order
    5. start the overlay endpoint
    6. start the status API

  A failing step aborts startup and is returned to the caller. Whatever already started stays
  running until the caller invokes `shutdown`.

  Shutdown runs the reverse, announcing each step on the ShutdownState topic first:
    components (reverse) -> overlay -> engine -> SOCKS -> status API
  Every step is attempted and bounded by `session/shutdown_timeout`; failures are collected and
  reported together at the end.
*/

use serde_json::json;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::api::{ApiError, ApiState, StatusApi};
use crate::components::{Component, ComponentRegistry, LaunchContext, LaunchError};
use crate::config::{Config, ConfigError};
use crate::endpoint::{select_endpoint, OverlayEndpoint, SystemProbe};
use crate::engine::{DownloadEngine, EngineError};
use crate::health::{checks, HealthChecker};
use crate::notifier::{payload, Notifier, Topic};
use crate::overlay::{Capabilities, Identity, Overlay, OverlayError};
use crate::shutdown::ShutdownCoordinator;
use crate::socks::{SocksBridge, SocksError};
use crate::tunnel::CircuitManager;

/// One failed shutdown step
#[derive(Debug, Clone)]
pub struct ShutdownFailure {
    pub phase: &'static str,
    pub error: String,
}

impl fmt::Display for ShutdownFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.phase, self.error)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("SOCKS error: {0}")]
    Socks(#[from] SocksError),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Component error: {0}")]
    Launch(#[from] LaunchError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Status API error: {0}")]
    Api(#[from] ApiError),

    #[error("Session already started")]
    AlreadyStarted,

    #[error("Shutdown finished with {} failure(s): {}", .0.len(), join_failures(.0))]
    Shutdown(Vec<ShutdownFailure>),
}

fn join_failures(failures: &[ShutdownFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Session {
    config: Config,
    notifier: Notifier,
    health: HealthChecker,
    shutdown: ShutdownCoordinator,
    overlay: Arc<Overlay>,
    engine: Box<dyn DownloadEngine>,
    socks: SocksBridge,
    registry: ComponentRegistry,
    api: Option<StatusApi>,
    started: bool,
    stopped: bool,
}

impl Session {
    /// Build a session, choosing the overlay endpoint for this host
    pub fn new(mut config: Config, engine: Box<dyn DownloadEngine>) -> Result<Self, SessionError> {
        config.validate()?;
        let endpoint = select_endpoint(&mut config, &SystemProbe);
        Self::with_endpoint(config, engine, endpoint)
    }

    /// Build a session on a given endpoint
    pub fn with_endpoint(
        config: Config,
        engine: Box<dyn DownloadEngine>,
        endpoint: Arc<dyn OverlayEndpoint>,
    ) -> Result<Self, SessionError> {
        config.validate()?;

        let notifier = Notifier::new();
        let health = HealthChecker::new(env!("CARGO_PKG_VERSION"));
        let shutdown = ShutdownCoordinator::new();

        let mut capabilities = Capabilities::RELAY;
        if config.tunnel_community.exit_enabled {
            capabilities = capabilities.with(Capabilities::EXIT);
        }
        let overlay = Arc::new(Overlay::new(
            endpoint,
            Identity::generate(),
            capabilities,
            config.discovery_community.max_peers,
        ));

        let socks = SocksBridge::new(&config.libtorrent, health.clone());
        let api = config.api.enabled.then(|| {
            StatusApi::new(
                config.api.bind_address,
                ApiState {
                    health: health.clone(),
                    tunnel: socks.tunnel_slot(),
                    shutdown: shutdown.clone(),
                },
            )
        });

        Ok(Self {
            config,
            notifier,
            health,
            shutdown,
            overlay,
            engine,
            socks,
            registry: ComponentRegistry::new(),
            api,
            started: false,
            stopped: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    pub fn health(&self) -> &HealthChecker {
        &self.health
    }

    pub fn overlay(&self) -> &Arc<Overlay> {
        &self.overlay
    }

    pub fn socks(&self) -> &SocksBridge {
        &self.socks
    }

    /// The session's shutdown event
    pub fn shutdown_handle(&self) -> ShutdownCoordinator {
        self.shutdown.clone()
    }

    pub fn api_addr(&self) -> Option<SocketAddr> {
        self.api.as_ref().and_then(StatusApi::local_addr)
    }

    pub fn component_names(&self) -> Vec<&'static str> {
        self.registry.names()
    }

    pub fn tunnel(&self) -> Option<Arc<CircuitManager>> {
        self.registry
            .components()
            .iter()
            .find_map(Component::tunnel)
            .map(|tunnel| tunnel.manager().clone())
    }

    pub async fn start(&mut self) -> Result<(), SessionError> {
        if self.started {
            return Err(SessionError::AlreadyStarted);
        }
        self.started = true;

        let socks = self.socks.start().await?;
        info!(listeners = socks.len(), "SOCKS bridge started");

        self.engine.set_socks_listen_ports(self.socks.ports());
        self.engine.initialize().await?;
        self.engine.start().await?;
        info!("Download engine started");

        let context = LaunchContext::new(self.notifier.clone(), self.health.clone())
            .with_tunnel_slot(self.socks.tunnel_slot());
        for component in Component::from_config(&self.config, &self.overlay, &context) {
            self.registry.register(component)?;
        }
        self.registry.start_all(&context).await?;

        let local = self.overlay.start().await?;
        self.health
            .report(checks::check_overlay(true, self.overlay.peers().len()))
            .await;

        if let Some(api) = &mut self.api {
            api.start().await?;
        }

        info!(
            overlay = %local,
            endpoint = %self.overlay.endpoint_kind(),
            components = ?self.registry.names(),
            "Session started"
        );
        Ok(())
    }

    fn announce(&self, state: &str) {
        info!(phase = state, "Shutdown step");
        self.notifier
            .notify(Topic::ShutdownState, payload([("state", json!(state))]));
    }

    /// Stop every subsystem. Each step runs even if earlier ones failed.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;

        let limit = self.config.session.shutdown_timeout;
        let mut failures = Vec::new();

        self.announce("Shutting down overlay communities.");
        match tokio::time::timeout(limit, self.registry.stop_all()).await {
            Ok(errors) => failures.extend(errors.into_iter().map(|e| ShutdownFailure {
                phase: "components",
                error: e.to_string(),
            })),
            Err(_) => failures.push(timed_out("components", limit)),
        }

        self.announce("Shutting down overlay endpoint.");
        let overlay = self.overlay.clone();
        failures.extend(bounded("overlay", limit, async move {
            overlay.stop().await;
            Ok::<(), OverlayError>(())
        })
        .await);
        self.health.report(checks::check_overlay(false, 0)).await;

        self.announce("Shutting down download engine.");
        failures.extend(bounded("engine", limit, self.engine.shutdown()).await);

        self.announce("Shutting down local SOCKS5 interface.");
        failures.extend(bounded("socks", limit, async {
            self.socks.stop().await;
            Ok::<(), SocksError>(())
        })
        .await);

        self.announce("Shutting down status API. Going dark.");
        if let Some(api) = &mut self.api {
            failures.extend(bounded("api", limit, api.stop()).await);
        }

        self.shutdown.mark_complete().await;

        if failures.is_empty() {
            info!("Session shut down");
            Ok(())
        } else {
            for failure in &failures {
                error!(phase = failure.phase, error = %failure.error, "Shutdown step failed");
            }
            Err(SessionError::Shutdown(failures))
        }
    }

    /// Start, wait for the shutdown event, then shut down. A start failure
    /// still tears down whatever had started.
    pub async fn run(&mut self) -> Result<(), SessionError> {
        if let Err(e) = self.start().await {
            error!(error = %e, "Session startup failed");
            if let Err(shutdown) = self.shutdown().await {
                warn!(error = %shutdown, "Cleanup after failed startup was incomplete");
            }
            return Err(e);
        }

        let signal = self.shutdown.wait_for_shutdown().await;
        info!(?signal, "Shutdown event received");
        self.shutdown().await
    }
}

fn timed_out(phase: &'static str, limit: Duration) -> ShutdownFailure {
    ShutdownFailure {
        phase,
        error: format!("timed out after {:?}", limit),
    }
}

async fn bounded<F, E>(phase: &'static str, limit: Duration, step: F) -> Option<ShutdownFailure>
where
    F: Future<Output = Result<(), E>>,
    E: fmt::Display,
{
    match tokio::time::timeout(limit, step).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(ShutdownFailure {
            phase,
            error: e.to_string(),
        }),
        Err(_) => Some(timed_out(phase, limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::MemoryNetwork;
    use crate::engine::DetachedEngine;
    use std::sync::Mutex;

    fn config() -> Config {
        let mut config = Config::default();
        config.libtorrent.socks_listen_ports = vec![0];
        config.tunnel_community.tiers = vec![1];
        config
    }

    #[tokio::test]
    async fn test_shutdown_announces_every_step() {
        let network = MemoryNetwork::new();
        let mut session =
            Session::with_endpoint(config(), Box::new(DetachedEngine::new()), network.endpoint()).unwrap();

        let states = Arc::new(Mutex::new(Vec::new()));
        let seen = states.clone();
        session.notifier().subscribe(Topic::ShutdownState, move |payload| {
            seen.lock().unwrap().push(payload["state"].as_str().unwrap_or_default().to_string());
            Ok(())
        });

        session.start().await.unwrap();
        assert_eq!(session.component_names(), vec!["discovery", "tunnel"]);
        assert!(session.api_addr().is_some());

        session.shutdown().await.unwrap();
        let states = states.lock().unwrap();
        assert_eq!(states.len(), 5);
        assert!(states[0].contains("communities"));
        assert!(states[4].contains("status API"));
    }

    #[tokio::test]
    async fn test_start_twice_rejected() {
        let network = MemoryNetwork::new();
        let mut session =
            Session::with_endpoint(config(), Box::new(DetachedEngine::new()), network.endpoint()).unwrap();

        session.start().await.unwrap();
        assert!(matches!(session.start().await, Err(SessionError::AlreadyStarted)));
        session.shutdown().await.unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = config();
        config.tunnel_community.min_circuits = 9;
        config.tunnel_community.max_circuits = 2;

        let network = MemoryNetwork::new();
        assert!(matches!(
            Session::with_endpoint(config, Box::new(DetachedEngine::new()), network.endpoint()),
            Err(SessionError::Config(_))
        ));
    }
}
