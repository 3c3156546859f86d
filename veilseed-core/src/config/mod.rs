//! Configuration management for veilseed
//!
//! Configuration is a typed tree. Every section fills absent keys with its
//! defaults, so a partial TOML file is always a complete configuration.
//! Components read values either through the typed sections or through
//! path-like keys:
//!
//! ```
//! use veilseed_core::config::Config;
//!
//! let config = Config::default();
//! let min = config.get_as::<usize>("tunnel_community/min_circuits").unwrap();
//! assert_eq!(min, 1);
//! ```
//!
//! The core only reads configuration; it never writes it back.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

mod error;

pub use error::ConfigError;

/// Upper bound for any hop-count tier
pub const MAX_SUPPORTED_HOPS: usize = 8;

/// Prefix for environment overrides, e.g. `VEILSEED_TUNNEL_MIN_CIRCUITS=2`
const ENV_PREFIX: &str = "VEILSEED_";

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,

    /// Collect per-community statistics. Disables the accelerated endpoint.
    pub statistics: bool,

    pub overlay: OverlayConfig,

    pub discovery_community: DiscoveryConfig,

    pub tunnel_community: TunnelConfig,

    pub libtorrent: LibtorrentConfig,

    pub logging: LoggingConfig,

    pub session: SessionConfig,
}

/// Status API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: SocketAddr,
}

/// Overlay transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    /// UDP bind address for overlay traffic
    pub bind_address: SocketAddr,

    /// Bootstrap peers, `host:port`
    pub bootstrap: Vec<String>,

    /// Prefer the accelerated endpoint when the host supports it
    pub accelerated: bool,

    /// Worker threads of the accelerated endpoint. Managed by the endpoint
    /// adapter: set when the accelerated endpoint is installed, cleared
    /// otherwise.
    pub worker_threads: Option<usize>,
}

/// Peer discovery community configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,

    #[serde(with = "humantime_serde")]
    pub walk_interval: Duration,

    /// Peers kept in the peer table
    pub max_peers: usize,

    /// Peers included in one introduction response
    pub peer_exchange_size: usize,
}

/// Tunnel community configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub enabled: bool,

    /// READY circuits kept per tier
    pub min_circuits: usize,

    /// Upper bound on live circuits per tier
    pub max_circuits: usize,

    /// Hop counts for which circuit pools are maintained
    pub tiers: Vec<usize>,

    pub max_hops: usize,

    #[serde(with = "humantime_serde")]
    pub hop_timeout: Duration,

    /// Circuits without traffic for this long are closed
    #[serde(with = "humantime_serde")]
    pub max_idle: Duration,

    #[serde(with = "humantime_serde")]
    pub maintenance_interval: Duration,

    /// How many live circuits may share the same first hop
    pub first_hop_reuse_limit: usize,

    /// Maintenance ticks below minimum before capacity is reported degraded
    pub degraded_after: u32,

    /// Act as an exit for stream-open requests
    pub exit_enabled: bool,

    #[serde(with = "humantime_serde")]
    pub stream_open_timeout: Duration,
}

/// Download engine configuration (only the keys the core reads)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LibtorrentConfig {
    /// One SOCKS5 listener per entry; index `i` serves hop-count `i + 1`.
    /// Port 0 picks an ephemeral port.
    pub socks_listen_ports: Vec<u16>,

    /// How long a new SOCKS connection waits for a READY circuit
    #[serde(with = "humantime_serde")]
    pub socks_wait_timeout: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    pub json_format: bool,
    pub with_timestamp: bool,
    pub with_target: bool,
}

/// Session lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound for each shutdown step
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            bootstrap: vec![],
            accelerated: true,
            worker_threads: None,
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            walk_interval: Duration::from_secs(5),
            max_peers: 64,
            peer_exchange_size: 8,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_circuits: 1,
            max_circuits: 8,
            tiers: vec![1, 2, 3],
            max_hops: 3,
            hop_timeout: Duration::from_secs(10),
            max_idle: Duration::from_secs(600),
            maintenance_interval: Duration::from_secs(5),
            first_hop_reuse_limit: 2,
            degraded_after: 3,
            exit_enabled: false,
            stream_open_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LibtorrentConfig {
    fn default() -> Self {
        Self {
            socks_listen_ports: vec![0, 0, 0],
            socks_wait_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
            with_timestamp: true,
            with_target: true,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file. Missing keys take defaults.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `VEILSEED_*` variables from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(env::vars())
    }

    /// Apply `VEILSEED_*` style overrides from any key/value source.
    /// Unrelated keys are ignored.
    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };

            match name {
                "API_ENABLED" => self.api.enabled = parse_value(name, &value)?,
                "API_BIND_ADDRESS" => self.api.bind_address = parse_value(name, &value)?,
                "STATISTICS" => self.statistics = parse_value(name, &value)?,
                "OVERLAY_BIND_ADDRESS" => self.overlay.bind_address = parse_value(name, &value)?,
                "OVERLAY_BOOTSTRAP" => self.overlay.bootstrap = parse_list(name, &value)?,
                "OVERLAY_ACCELERATED" => self.overlay.accelerated = parse_value(name, &value)?,
                "TUNNEL_ENABLED" => self.tunnel_community.enabled = parse_value(name, &value)?,
                "TUNNEL_MIN_CIRCUITS" => {
                    self.tunnel_community.min_circuits = parse_value(name, &value)?
                }
                "TUNNEL_MAX_CIRCUITS" => {
                    self.tunnel_community.max_circuits = parse_value(name, &value)?
                }
                "TUNNEL_TIERS" => self.tunnel_community.tiers = parse_list(name, &value)?,
                "TUNNEL_EXIT_ENABLED" => {
                    self.tunnel_community.exit_enabled = parse_value(name, &value)?
                }
                "SOCKS_LISTEN_PORTS" => {
                    self.libtorrent.socks_listen_ports = parse_list(name, &value)?
                }
                "LOG_LEVEL" => self.logging.level = value,
                "LOG_JSON" => self.logging.json_format = parse_value(name, &value)?,
                _ => {}
            }
        }
        Ok(())
    }

    /// Resolve a path-like key such as `tunnel_community/max_circuits`
    pub fn get(&self, path: &str) -> Result<Value, ConfigError> {
        let tree = serde_json::to_value(self)
            .map_err(|e| ConfigError::invalid(path, e))?;

        let mut node = &tree;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            node = match node {
                Value::Object(map) => map.get(part),
                Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
                _ => None,
            }
            .ok_or_else(|| ConfigError::UnknownKey(path.to_string()))?;
        }
        Ok(node.clone())
    }

    /// Resolve a path-like key and deserialize it
    pub fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigError> {
        let value = self.get(path)?;
        serde_json::from_value(value)
            .map_err(|e| ConfigError::invalid(path, e))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let tunnel = &self.tunnel_community;

        if tunnel.max_circuits == 0 {
            return Err(ConfigError::ValidationFailed(
                "tunnel_community/max_circuits must be greater than 0".to_string(),
            ));
        }

        if tunnel.min_circuits > tunnel.max_circuits {
            return Err(ConfigError::ValidationFailed(format!(
                "tunnel_community/min_circuits ({}) exceeds max_circuits ({})",
                tunnel.min_circuits, tunnel.max_circuits
            )));
        }

        if tunnel.max_hops == 0 || tunnel.max_hops > MAX_SUPPORTED_HOPS {
            return Err(ConfigError::ValidationFailed(format!(
                "tunnel_community/max_hops must be within 1..={}",
                MAX_SUPPORTED_HOPS
            )));
        }

        if tunnel.tiers.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "tunnel_community/tiers must not be empty".to_string(),
            ));
        }

        if let Some(tier) = tunnel.tiers.iter().find(|t| **t == 0 || **t > tunnel.max_hops) {
            return Err(ConfigError::ValidationFailed(format!(
                "tunnel_community/tiers contains {} outside 1..={}",
                tier, tunnel.max_hops
            )));
        }

        if tunnel.enabled && self.libtorrent.socks_listen_ports.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "libtorrent/socks_listen_ports must not be empty while the tunnel is enabled"
                    .to_string(),
            ));
        }

        if self.discovery_community.max_peers == 0 {
            return Err(ConfigError::ValidationFailed(
                "discovery_community/max_peers must be greater than 0".to_string(),
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "warning", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid log level: {}",
                self.logging.level
            )));
        }

        Ok(())
    }
}

fn parse_value<T>(name: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::invalid(format!("{}{}", ENV_PREFIX, name), format!("'{}': {}", raw, e)))
}

fn parse_list<T>(name: &str, raw: &str) -> Result<Vec<T>, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_value(name, item))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tunnel_community.min_circuits, 1);
        assert_eq!(config.tunnel_community.max_circuits, 8);
        assert_eq!(config.libtorrent.socks_listen_ports.len(), 3);
        assert!(config.overlay.worker_threads.is_none());
    }

    #[test]
    fn test_path_lookup() {
        let config = Config::default();

        assert_eq!(config.get("tunnel_community/max_circuits").unwrap(), Value::from(8));
        assert_eq!(
            config.get_as::<Vec<u16>>("libtorrent/socks_listen_ports").unwrap(),
            vec![0, 0, 0]
        );
        assert_eq!(config.get_as::<usize>("tunnel_community/tiers/2").unwrap(), 3);
        assert!(config.get_as::<bool>("statistics").is_ok());
        assert!(matches!(
            config.get("tunnel_community/no_such_key"),
            Err(ConfigError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_partial_file_takes_defaults() {
        let config = Config::from_toml_str(
            r#"
            [tunnel_community]
            min_circuits = 2
            hop_timeout = "3s"

            [libtorrent]
            socks_listen_ports = [1080]
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel_community.min_circuits, 2);
        assert_eq!(config.tunnel_community.max_circuits, 8);
        assert_eq!(config.tunnel_community.hop_timeout, Duration::from_secs(3));
        assert_eq!(config.libtorrent.socks_listen_ports, vec![1080]);
        assert!(config.api.enabled);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("veilseed.toml");
        std::fs::write(&path, "[discovery_community]\nmax_peers = 12\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.discovery_community.max_peers, 12);

        assert!(matches!(
            Config::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_parse_error() {
        assert!(matches!(
            Config::from_toml_str("[tunnel_community\nmin_circuits = "),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.tunnel_community.max_circuits = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel_community.min_circuits = 9;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel_community.tiers = vec![1, 4];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.tunnel_community.tiers.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.libtorrent.socks_listen_ports.clear();
        assert!(config.validate().is_err());
        config.tunnel_community.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_log_level_validation() {
        let mut config = Config::default();

        config.logging.level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(vars(&[
                ("VEILSEED_TUNNEL_MIN_CIRCUITS", "3"),
                ("VEILSEED_SOCKS_LISTEN_PORTS", "1080, 1081"),
                ("VEILSEED_OVERLAY_BOOTSTRAP", "10.0.0.1:7759,10.0.0.2:7759"),
                ("VEILSEED_LOG_LEVEL", "debug"),
                ("HOME", "/root"),
            ]))
            .unwrap();

        assert_eq!(config.tunnel_community.min_circuits, 3);
        assert_eq!(config.libtorrent.socks_listen_ports, vec![1080, 1081]);
        assert_eq!(config.overlay.bootstrap.len(), 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_override_rejects_bad_value() {
        let mut config = Config::default();
        let result = config.apply_overrides(vars(&[("VEILSEED_TUNNEL_MAX_CIRCUITS", "lots")]));
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref key, .. }) if key == "VEILSEED_TUNNEL_MAX_CIRCUITS"
        ));
    }
}
