//! Configuration system for simpub.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $SIMPUB_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/simpub/config.toml
//!   3. ~/.config/simpub/config.toml

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::wire::PortRole;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpubConfig {
    pub identity: IdentityConfig,
    pub network: NetworkConfig,
    pub discovery: DiscoveryConfig,
    pub streaming: StreamingConfig,
    pub proxy: ProxyConfig,
    pub daemon: DaemonConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Display name announced to peers. Peers look us up by this name.
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the topic, service and discovery sockets bind to.
    pub host: IpAddr,
    /// Address announced to peers. Unset = derived from `host`, or probed
    /// from the routing table when `host` is unspecified.
    pub advertise_addr: Option<IpAddr>,
    /// 0 = OS-assigned for all three ports.
    pub discovery_port: u16,
    pub service_port: u16,
    pub topic_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Periodically announce ourselves.
    pub announce: bool,
    /// Listen for announcements and populate the peer registry.
    pub listen: bool,
    pub announce_interval_ms: u64,
    /// Peers not heard from within this window are evicted.
    pub peer_ttl_ms: u64,
    /// Where announcements are sent. Broadcast by default; unicast
    /// addresses work for hosts on different subnets.
    pub targets: Vec<SocketAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Default publish tick for topics registered without their own rate.
    pub publish_interval_ms: u64,
    /// Frames buffered per subscriber before the slowest one starts losing them.
    pub subscriber_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub request_timeout_ms: u64,
    /// How often a waiting proxy re-checks the peer registry.
    pub discovery_poll_ms: u64,
    /// First restart delay of a failed per-peer loop; doubles per failure.
    pub restart_base_ms: u64,
    pub restart_max_ms: u64,
    /// Consecutive failures before a proxy gives up and goes Disconnected.
    pub max_restarts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Local HTTP status endpoint.
    pub status_port: u16,
    /// Serialized scene description served by the `Scene` service.
    pub scene_path: PathBuf,
    /// Directory of asset blobs served by the `Asset` service, keyed by file name.
    pub asset_dir: PathBuf,
    /// Producer thread rate.
    pub step_hz: u32,
    /// Tracked signals that are never published.
    pub no_tracked_objects: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for SimpubConfig {
    fn default() -> Self {
        Self {
            identity: IdentityConfig::default(),
            network: NetworkConfig::default(),
            discovery: DiscoveryConfig::default(),
            streaming: StreamingConfig::default(),
            proxy: ProxyConfig::default(),
            daemon: DaemonConfig::default(),
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            name: "SimPublisher".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_addr: None,
            discovery_port: PortRole::Discovery.default_port(),
            service_port: PortRole::Service.default_port(),
            topic_port: PortRole::Topic.default_port(),
        }
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce: true,
            listen: true,
            announce_interval_ms: 1_000,
            peer_ttl_ms: 5_000,
            targets: vec![SocketAddr::new(
                IpAddr::V4(Ipv4Addr::BROADCAST),
                PortRole::Discovery.default_port(),
            )],
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: 20, // 50 Hz
            subscriber_buffer: 256,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 5_000,
            discovery_poll_ms: 10,
            restart_base_ms: 100,
            restart_max_ms: 5_000,
            max_restarts: 10,
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            status_port: 7723,
            scene_path: data_dir().join("scene.xml"),
            asset_dir: data_dir().join("assets"),
            step_hz: 500,
            no_tracked_objects: Vec::new(),
        }
    }
}

// ── Durations ─────────────────────────────────────────────────────────────────

impl DiscoveryConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(1))
    }

    pub fn peer_ttl(&self) -> Duration {
        Duration::from_millis(self.peer_ttl_ms.max(1))
    }
}

impl StreamingConfig {
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms.max(1))
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms.max(1))
    }

    pub fn discovery_poll(&self) -> Duration {
        Duration::from_millis(self.discovery_poll_ms.max(1))
    }

    pub fn restart_base(&self) -> Duration {
        Duration::from_millis(self.restart_base_ms)
    }

    pub fn restart_max(&self) -> Duration {
        Duration::from_millis(self.restart_max_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("simpub")
}

pub fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("simpub")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl SimpubConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            SimpubConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("SIMPUB_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&SimpubConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Single-host setup: loopback only, OS-assigned ports, no broadcast.
    /// Peers are wired together by adding each other's discovery address
    /// to `discovery.targets`.
    pub fn local(name: &str) -> Self {
        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let mut config = SimpubConfig::default();
        config.identity.name = name.to_string();
        config.network = NetworkConfig {
            host: loopback,
            advertise_addr: Some(loopback),
            discovery_port: 0,
            service_port: 0,
            topic_port: 0,
        };
        config.discovery.targets.clear();
        config.discovery.announce_interval_ms = 100;
        config.discovery.peer_ttl_ms = 2_000;
        config
    }

    /// Apply SIMPUB_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SIMPUB_IDENTITY__NAME") {
            if !v.is_empty() {
                self.identity.name = v;
            }
        }
        if let Ok(v) = std::env::var("SIMPUB_NETWORK__HOST") {
            if let Ok(addr) = v.parse() {
                self.network.host = addr;
            }
        }
        if let Ok(v) = std::env::var("SIMPUB_NETWORK__ADVERTISE_ADDR") {
            self.network.advertise_addr = v.parse().ok();
        }
        if let Ok(v) = std::env::var("SIMPUB_NETWORK__DISCOVERY_PORT") {
            if let Ok(p) = v.parse() {
                self.network.discovery_port = p;
            }
        }
        if let Ok(v) = std::env::var("SIMPUB_NETWORK__SERVICE_PORT") {
            if let Ok(p) = v.parse() {
                self.network.service_port = p;
            }
        }
        if let Ok(v) = std::env::var("SIMPUB_NETWORK__TOPIC_PORT") {
            if let Ok(p) = v.parse() {
                self.network.topic_port = p;
            }
        }
        if let Ok(v) = std::env::var("SIMPUB_DISCOVERY__ANNOUNCE") {
            self.discovery.announce = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("SIMPUB_DISCOVERY__LISTEN") {
            self.discovery.listen = v == "true" || v == "1";
        }
    }
}
