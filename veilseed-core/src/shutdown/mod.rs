//! Session shutdown event
//!
//! The coordinator is the one place that says "stop now". OS signals, the
//! status API and embedding code all trigger it; `Session::run` waits on it
//! and then performs the ordered shutdown.

use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{error, info, warn};

/// Shutdown signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// Ordered shutdown through every subsystem
    Graceful,
    /// Skip waiting for in-flight work
    Immediate,
}

/// Shutdown state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    ShuttingDown,
    Shutdown,
}

/// Shutdown coordinator. Cloning shares the same event.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    state: Arc<RwLock<ShutdownState>>,
    signal_tx: Arc<watch::Sender<Option<ShutdownSignal>>>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (signal_tx, _) = watch::channel(None);

        Self {
            state: Arc::new(RwLock::new(ShutdownState::Running)),
            signal_tx: Arc::new(signal_tx),
        }
    }

    /// Request graceful shutdown. Later requests are ignored.
    pub async fn trigger(&self) {
        self.request(ShutdownSignal::Graceful).await;
    }

    /// Request immediate shutdown
    pub async fn trigger_immediately(&self) {
        self.request(ShutdownSignal::Immediate).await;
    }

    async fn request(&self, signal: ShutdownSignal) {
        let mut state = self.state.write().await;
        if *state != ShutdownState::Running {
            warn!(?signal, "Shutdown already in progress");
            return;
        }
        *state = ShutdownState::ShuttingDown;
        drop(state);

        info!(?signal, "Shutdown requested");
        self.signal_tx.send_replace(Some(signal));
    }

    /// Record that every subsystem has stopped
    pub async fn mark_complete(&self) {
        *self.state.write().await = ShutdownState::Shutdown;
        info!("Shutdown complete");
    }

    pub async fn is_shutting_down(&self) -> bool {
        *self.state.read().await != ShutdownState::Running
    }

    pub async fn state(&self) -> ShutdownState {
        *self.state.read().await
    }

    /// Wait until shutdown is requested. Returns immediately if it already was.
    pub async fn wait_for_shutdown(&self) -> ShutdownSignal {
        let mut rx = self.signal_tx.subscribe();
        loop {
            if let Some(signal) = *rx.borrow_and_update() {
                return signal;
            }
            if rx.changed().await.is_err() {
                error!("Shutdown channel closed");
                return ShutdownSignal::Immediate;
            }
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Install signal handlers that trigger graceful shutdown
#[cfg(unix)]
pub fn install_signal_handlers(coordinator: ShutdownCoordinator) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        coordinator.trigger().await;
    });
    Ok(())
}

/// Install signal handlers that trigger graceful shutdown (Windows)
#[cfg(windows)]
pub fn install_signal_handlers(coordinator: ShutdownCoordinator) -> std::io::Result<()> {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C");
                coordinator.trigger().await;
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        assert_eq!(coordinator.state().await, ShutdownState::Running);

        coordinator.trigger().await;
        assert!(coordinator.is_shutting_down().await);

        coordinator.mark_complete().await;
        assert_eq!(coordinator.state().await, ShutdownState::Shutdown);
    }

    #[tokio::test]
    async fn test_waiter_is_released() {
        let coordinator = ShutdownCoordinator::new();
        let waiter = coordinator.clone();

        let task = tokio::spawn(async move { waiter.wait_for_shutdown().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        coordinator.trigger().await;

        let signal = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Graceful);
    }

    #[tokio::test]
    async fn test_late_waiter_returns_immediately() {
        let coordinator = ShutdownCoordinator::new();
        coordinator.trigger_immediately().await;
        coordinator.trigger().await;

        let signal = tokio::time::timeout(Duration::from_secs(1), coordinator.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(signal, ShutdownSignal::Immediate);
    }
}
