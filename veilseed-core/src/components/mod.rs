//! Launchable overlay components and the registry that runs them.
//!
//! Components are a closed set of variants behind one start/stop contract.
//! Soft dependencies between them are expressed only by registration
//! order: the registry starts in order and stops in reverse.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::config::Config;
use crate::discovery::DiscoveryCommunity;
use crate::health::HealthChecker;
use crate::notifier::Notifier;
use crate::overlay::{Overlay, OverlayError};
use crate::socks::TunnelSlot;
use crate::tunnel::TunnelCommunity;

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Component {component} failed to start: {reason}")]
    Start { component: &'static str, reason: String },

    #[error("Component {component} failed to stop: {reason}")]
    Stop { component: &'static str, reason: String },

    #[error("Component {0} is already registered")]
    Duplicate(&'static str),

    #[error("Registry already started")]
    AlreadyStarted,

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),
}

/// Session services handed to components at start
#[derive(Clone)]
pub struct LaunchContext {
    pub notifier: Notifier,
    pub health: HealthChecker,
    /// Where the tunnel publishes its circuit manager for the SOCKS bridge
    pub tunnel_slot: Option<TunnelSlot>,
}

impl LaunchContext {
    pub fn new(notifier: Notifier, health: HealthChecker) -> Self {
        Self {
            notifier,
            health,
            tunnel_slot: None,
        }
    }

    pub fn with_tunnel_slot(mut self, slot: TunnelSlot) -> Self {
        self.tunnel_slot = Some(slot);
        self
    }
}

#[async_trait]
pub trait Launchable: Send + Sync {
    fn name(&self) -> &'static str;

    async fn start(&self, context: &LaunchContext) -> Result<(), LaunchError>;

    async fn stop(&self) -> Result<(), LaunchError>;
}

pub enum Component {
    Discovery(DiscoveryCommunity),
    Tunnel(TunnelCommunity),
}

impl Component {
    /// The enabled components for `config`, in start order
    pub fn from_config(config: &Config, overlay: &Arc<Overlay>, context: &LaunchContext) -> Vec<Component> {
        let mut components = Vec::new();

        if config.discovery_community.enabled {
            components.push(Component::Discovery(DiscoveryCommunity::new(
                overlay.clone(),
                context.notifier.clone(),
                config.discovery_community.clone(),
                config.overlay.bootstrap.clone(),
            )));
        }
        if config.tunnel_community.enabled {
            components.push(Component::Tunnel(TunnelCommunity::new(
                overlay.clone(),
                context.notifier.clone(),
                context.health.clone(),
                config.tunnel_community.clone(),
            )));
        }

        components
    }

    pub fn tunnel(&self) -> Option<&TunnelCommunity> {
        match self {
            Component::Tunnel(tunnel) => Some(tunnel),
            _ => None,
        }
    }
}

#[async_trait]
impl Launchable for Component {
    fn name(&self) -> &'static str {
        match self {
            Component::Discovery(_) => DiscoveryCommunity::NAME,
            Component::Tunnel(_) => TunnelCommunity::NAME,
        }
    }

    async fn start(&self, context: &LaunchContext) -> Result<(), LaunchError> {
        match self {
            Component::Discovery(discovery) => discovery.start().await,
            Component::Tunnel(tunnel) => {
                tunnel.start().await?;
                if let Some(slot) = &context.tunnel_slot {
                    *slot.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tunnel.manager().clone());
                }
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<(), LaunchError> {
        match self {
            Component::Discovery(discovery) => discovery.stop().await,
            Component::Tunnel(tunnel) => tunnel.stop().await,
        }
    }
}

/// Ordered set of components
pub struct ComponentRegistry<C: Launchable = Component> {
    components: Vec<C>,
    started: usize,
    stopped: bool,
}

impl<C: Launchable> Default for ComponentRegistry<C> {
    fn default() -> Self {
        Self {
            components: Vec::new(),
            started: 0,
            stopped: false,
        }
    }
}

impl<C: Launchable> ComponentRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a component. Only allowed before `start_all`.
    pub fn register(&mut self, component: C) -> Result<(), LaunchError> {
        if self.started > 0 || self.stopped {
            return Err(LaunchError::AlreadyStarted);
        }
        if self.components.iter().any(|c| c.name() == component.name()) {
            return Err(LaunchError::Duplicate(component.name()));
        }
        self.components.push(component);
        Ok(())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.components.iter().map(|c| c.name()).collect()
    }

    pub fn components(&self) -> &[C] {
        &self.components
    }

    pub fn started(&self) -> usize {
        self.started
    }

    /// Start in registration order. The first failure is returned at once;
    /// components already started stay running.
    pub async fn start_all(&mut self, context: &LaunchContext) -> Result<(), LaunchError> {
        while self.started < self.components.len() {
            let component = &self.components[self.started];
            if let Err(e) = component.start(context).await {
                error!(component = component.name(), error = %e, "Component failed to start");
                return Err(e);
            }
            info!(component = component.name(), "Component started");
            self.started += 1;
        }
        Ok(())
    }

    /// Stop every registered component once, in reverse order, collecting
    /// failures instead of stopping early
    pub async fn stop_all(&mut self) -> Vec<LaunchError> {
        if self.stopped {
            return Vec::new();
        }
        self.stopped = true;

        let mut failures = Vec::new();
        for component in self.components.iter().rev() {
            match component.stop().await {
                Ok(()) => info!(component = component.name(), "Component stopped"),
                Err(e) => {
                    error!(component = component.name(), error = %e, "Component failed to stop");
                    failures.push(e);
                }
            }
        }
        self.started = 0;
        failures
    }
}
