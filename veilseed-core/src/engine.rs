//! Download engine boundary.
//!
//! The session drives the engine through this trait only. The engine is
//! told which local SOCKS ports to route its peer connections through
//! before it starts.

use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine initialization failed: {0}")]
    Initialize(String),

    #[error("Engine failed to start: {0}")]
    Start(String),

    #[error("Engine failed to shut down: {0}")]
    Shutdown(String),

    #[error("Engine is not initialized")]
    NotInitialized,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait DownloadEngine: Send + Sync {
    /// Local SOCKS ports, index `i` carrying `i + 1` hops
    fn set_socks_listen_ports(&mut self, ports: Vec<u16>);

    async fn initialize(&mut self) -> Result<(), EngineError>;

    async fn start(&mut self) -> Result<(), EngineError>;

    async fn shutdown(&mut self) -> Result<(), EngineError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Initialized,
    Running,
    Stopped,
}

/// Engine for nodes that run without a torrent engine attached, e.g. pure
/// relays. Tracks lifecycle and ports but moves no data.
#[derive(Debug)]
pub struct DetachedEngine {
    state: EngineState,
    socks_ports: Vec<u16>,
}

impl Default for DetachedEngine {
    fn default() -> Self {
        Self {
            state: EngineState::Created,
            socks_ports: Vec::new(),
        }
    }
}

impl DetachedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn socks_ports(&self) -> &[u16] {
        &self.socks_ports
    }
}

#[async_trait]
impl DownloadEngine for DetachedEngine {
    fn set_socks_listen_ports(&mut self, ports: Vec<u16>) {
        self.socks_ports = ports;
    }

    async fn initialize(&mut self) -> Result<(), EngineError> {
        self.state = EngineState::Initialized;
        Ok(())
    }

    async fn start(&mut self) -> Result<(), EngineError> {
        if self.state != EngineState::Initialized {
            return Err(EngineError::NotInitialized);
        }
        self.state = EngineState::Running;
        info!(socks_ports = ?self.socks_ports, "Detached engine running");
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), EngineError> {
        self.state = EngineState::Stopped;
        Ok(())
    }
}
