use crate::fts::FtsConfig;
use crate::timesync::{TimeRelayConfig, TimeSyncConfig, TimeSyncTransport};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

const APP_QUALIFIER: &str = "com";
const APP_ORGANIZATION: &str = "showlink";
const APP_NAME: &str = "showlink";
const CONFIG_FILE: &str = "config.json";
/// Overrides the platform config directory.
pub const CONFIG_DIR_ENV: &str = "SHOWLINK_CONFIG_DIR";

fn home_dir() -> PathBuf {
    directories::UserDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
        .join("showlink")
}

fn default_device_name() -> String {
    hostname::get()
        .ok()
        .and_then(|s| s.into_string().ok())
        .unwrap_or_else(|| "Unknown-PC".to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FtsSection {
    pub enabled: bool,
    pub port: u16,
    pub is_server: bool,
    pub share_dir: PathBuf,
    pub download_dir: PathBuf,
    pub chunk_size: Option<u32>,
    pub retry_interval_ms: u64,
    pub max_retries: u32,
    pub resource_ttl_secs: u64,
    pub memory_limit: u64,
    pub max_file_size: u64,
    /// `None` disables periodic discovery broadcasts.
    pub discovery_interval_secs: Option<u64>,
    pub auto_accept_push: bool,
}

impl Default for FtsSection {
    fn default() -> Self {
        let fts = FtsConfig::default();
        let home = home_dir();
        Self {
            enabled: true,
            port: fts.port,
            is_server: fts.is_server,
            share_dir: home.join("share"),
            download_dir: home.join("downloads"),
            chunk_size: fts.chunk_size,
            retry_interval_ms: fts.retry_interval.as_millis() as u64,
            max_retries: fts.max_retries,
            resource_ttl_secs: fts.resource_ttl.as_secs(),
            memory_limit: fts.memory_limit,
            max_file_size: fts.max_file_size,
            discovery_interval_secs: fts.discovery_interval.map(|d| d.as_secs()),
            auto_accept_push: fts.auto_accept_push,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeSyncSection {
    pub enabled: bool,
    pub transport: TimeSyncTransport,
    pub server: String,
    pub port: u16,
    pub url: Option<String>,
    pub attempts: u32,
    pub resync_interval_secs: Option<u64>,
    /// Relay listener ports; the relay runs when any is set.
    pub relay_udp_port: Option<u16>,
    pub relay_tcp_port: Option<u16>,
    pub relay_ws_port: Option<u16>,
}

impl Default for TimeSyncSection {
    fn default() -> Self {
        let sync = TimeSyncConfig::default();
        Self {
            enabled: true,
            transport: sync.transport,
            server: sync.server,
            port: sync.port,
            url: sync.url,
            attempts: sync.attempts,
            resync_interval_secs: sync.resync_interval.map(|d| d.as_secs()),
            relay_udp_port: None,
            relay_tcp_port: None,
            relay_ws_port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub device_name: String,
    /// Bind address for every service; `None` uses all interfaces.
    pub local_ip: Option<IpAddr>,
    pub fts: FtsSection,
    pub timesync: TimeSyncSection,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            local_ip: None,
            fts: FtsSection::default(),
            timesync: TimeSyncSection::default(),
        }
    }
}

impl NodeConfig {
    /// `$SHOWLINK_CONFIG_DIR/config.json`, else the platform config dir.
    pub fn config_path() -> Option<PathBuf> {
        if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
            return Some(PathBuf::from(dir).join(CONFIG_FILE));
        }
        ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }

    /// Load config from disk or return default
    pub fn load() -> Self {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!("Ignoring invalid config {}: {}", path.display(), e);
                Self::default()
            }),
            Err(_) => Self::default(),
        }
    }

    pub fn save(&self) -> io::Result<()> {
        let path = Self::config_path()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no config directory"))?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)
    }

    pub fn fts_config(&self) -> FtsConfig {
        let fts = &self.fts;
        FtsConfig {
            port: fts.port,
            local_ip: self.local_ip,
            device_name: self.device_name.clone(),
            is_server: fts.is_server,
            share_dir: fts.share_dir.clone(),
            download_dir: fts.download_dir.clone(),
            chunk_size: fts.chunk_size,
            retry_interval: Duration::from_millis(fts.retry_interval_ms),
            max_retries: fts.max_retries,
            resource_ttl: Duration::from_secs(fts.resource_ttl_secs),
            memory_limit: fts.memory_limit,
            max_file_size: fts.max_file_size,
            discovery_interval: fts.discovery_interval_secs.map(Duration::from_secs),
            auto_accept_push: fts.auto_accept_push,
            ..Default::default()
        }
    }

    pub fn timesync_config(&self) -> TimeSyncConfig {
        let sync = &self.timesync;
        TimeSyncConfig {
            transport: sync.transport,
            server: sync.server.clone(),
            port: sync.port,
            url: sync.url.clone(),
            local_ip: self.local_ip,
            attempts: sync.attempts,
            resync_interval: sync.resync_interval_secs.map(Duration::from_secs),
            ..Default::default()
        }
    }

    /// Relay settings, or `None` when no relay port is configured.
    pub fn relay_config(&self) -> Option<TimeRelayConfig> {
        let sync = &self.timesync;
        if sync.relay_udp_port.is_none() && sync.relay_tcp_port.is_none() && sync.relay_ws_port.is_none()
        {
            return None;
        }
        Some(TimeRelayConfig {
            local_ip: self.local_ip,
            udp_port: sync.relay_udp_port,
            tcp_port: sync.relay_tcp_port,
            ws_port: sync.relay_ws_port,
        })
    }
}
