pub mod api;
pub mod components;
pub mod config;
pub mod discovery;
pub mod endpoint;
pub mod engine;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod notifier;
pub mod overlay;
pub mod session;
pub mod shutdown;
pub mod socks;
pub mod tunnel;

pub use config::Config;
pub use engine::{DetachedEngine, DownloadEngine};
pub use logging::{init_logging, LogLevel};
pub use notifier::{Notifier, Topic};
pub use session::{Session, SessionError};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = Topic::ShutdownState;
        assert_eq!(Config::default().tunnel_community.min_circuits, 1);
    }
}
