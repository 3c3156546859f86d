//! Health aggregation for the status API

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::RwLock;

/// Component names reported by a session
pub const OVERLAY: &str = "overlay";
pub const TUNNEL: &str = "tunnel";
pub const SOCKS: &str = "socks";

/// Health status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Degraded => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub timestamp: SystemTime,
    pub components: Vec<ComponentHealth>,
    pub version: String,
    pub uptime_seconds: u64,
}

/// Component health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: SystemTime,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            message: None,
            last_check: SystemTime::now(),
        }
    }

    pub fn degraded(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            last_check: SystemTime::now(),
        }
    }

    pub fn unhealthy(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            last_check: SystemTime::now(),
        }
    }
}

/// Health checker service. Cloning shares the component list.
#[derive(Clone)]
pub struct HealthChecker {
    start_time: SystemTime,
    version: String,
    components: Arc<RwLock<Vec<ComponentHealth>>>,
}

impl HealthChecker {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            start_time: SystemTime::now(),
            version: version.into(),
            components: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Register a component for health checking. Re-registering resets it
    /// to healthy.
    pub async fn register_component(&self, name: impl Into<String>) {
        let name = name.into();
        let mut components = self.components.write().await;
        components.retain(|c| c.name != name);
        components.push(ComponentHealth::healthy(name));
    }

    /// Replace a component's entry with a fresh check result, registering
    /// the component if needed
    pub async fn report(&self, health: ComponentHealth) {
        let mut components = self.components.write().await;
        match components.iter_mut().find(|c| c.name == health.name) {
            Some(component) => *component = health,
            None => components.push(health),
        }
    }

    pub async fn component(&self, name: &str) -> Option<ComponentHealth> {
        self.components
            .read()
            .await
            .iter()
            .find(|c| c.name == name)
            .cloned()
    }

    /// Get current health status
    pub async fn check_health(&self) -> HealthCheck {
        let components = self.components.read().await.clone();

        let status = if components.iter().any(|c| c.status == HealthStatus::Unhealthy) {
            HealthStatus::Unhealthy
        } else if components.iter().any(|c| c.status == HealthStatus::Degraded) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        let uptime = self
            .start_time
            .elapsed()
            .unwrap_or(Duration::from_secs(0))
            .as_secs();

        HealthCheck {
            status,
            timestamp: SystemTime::now(),
            components,
            version: self.version.clone(),
            uptime_seconds: uptime,
        }
    }

    /// Readiness: the session can carry traffic
    pub async fn readiness_check(&self) -> bool {
        let health = self.check_health().await;
        health.status != HealthStatus::Unhealthy
    }
}

/// Built-in health checks
pub mod checks {
    use super::*;

    /// Overlay health from the size of the peer table
    pub fn check_overlay(running: bool, peer_count: usize) -> ComponentHealth {
        if !running {
            ComponentHealth::unhealthy(OVERLAY, "Overlay is not running")
        } else if peer_count == 0 {
            ComponentHealth::degraded(OVERLAY, "No known peers")
        } else {
            ComponentHealth::healthy(OVERLAY)
        }
    }

    /// Tunnel health from the tiers currently below their minimum
    pub fn check_tunnel(degraded_tiers: &[usize]) -> ComponentHealth {
        if degraded_tiers.is_empty() {
            ComponentHealth::healthy(TUNNEL)
        } else {
            ComponentHealth::degraded(
                TUNNEL,
                format!("Tiers below minimum circuits: {:?}", degraded_tiers),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_health_checker() {
        let checker = HealthChecker::new("1.0.0");

        checker.register_component(TUNNEL).await;

        let health = checker.check_health().await;
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.components.len(), 1);
    }

    #[tokio::test]
    async fn test_degraded_tunnel() {
        let checker = HealthChecker::new("1.0.0");

        checker.register_component(TUNNEL).await;
        checker.report(checks::check_tunnel(&[3])).await;

        let health = checker.check_health().await;
        assert_eq!(health.status, HealthStatus::Degraded);
        assert_eq!(health.status.to_http_status(), 200);
        assert!(checker.readiness_check().await);
    }

    #[tokio::test]
    async fn test_readiness_check() {
        let checker = HealthChecker::new("1.0.0");
        assert!(checker.readiness_check().await);

        checker.register_component(OVERLAY).await;
        checker.report(checks::check_overlay(false, 0)).await;

        assert!(!checker.readiness_check().await);
        assert_eq!(
            checker.check_health().await.status.to_http_status(),
            503
        );
    }

    #[tokio::test]
    async fn test_reregister_resets() {
        let checker = HealthChecker::new("1.0.0");
        checker.register_component(SOCKS).await;
        checker.report(ComponentHealth::unhealthy(SOCKS, "down")).await;
        checker.register_component(SOCKS).await;

        let component = checker.component(SOCKS).await.unwrap();
        assert_eq!(component.status, HealthStatus::Healthy);
        assert_eq!(checker.check_health().await.components.len(), 1);
    }
}
