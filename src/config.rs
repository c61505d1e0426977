//! Settings File
//!
//! Persisted key/value settings in TOML. Unknown keys are ignored on load and
//! missing keys take their defaults. Saving rewrites every known key with its
//! current value, each preceded by a one-line description.

use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::timeout::TimeoutConfig;
use crate::network::client::ClientConfig;
use crate::network::server::ServerConfig;
use crate::network::serverless::ServerlessConfig;

/// Settings errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the file failed.
    #[error("{path}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for these settings.
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Settings could not be serialized.
    #[error("serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range or malformed.
    #[error("invalid {key}: {reason}")]
    Invalid {
        /// Offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

/// A saved server for the client's list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Display name.
    pub name: String,
    /// `host:port`.
    pub endpoint: String,
}

/// All persisted settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// TCP port the server listens on.
    pub listen_port: u16,
    /// Bind address.
    pub bind_address: String,
    /// Extra bind attempts.
    pub bind_retry_count: u32,
    /// Minimum milliseconds between ticks.
    pub tick_interval_ms: u64,
    /// Milliseconds before an idle peer is dropped.
    pub overdue_timeout_ms: u64,
    /// Milliseconds a disconnected id is remembered.
    pub disconnect_retention_ms: u64,
    /// Client reconnect window.
    pub reconnect_timeout_ms: u64,
    /// Connection open limit.
    pub connect_timeout_ms: u64,
    /// Serverless relay cutoff offset.
    pub pre_timeout_offset_ms: u64,
    /// Window in which a new appearance goes to everyone.
    pub appearance_recency_ms: u64,
    /// Enforce the allow list.
    pub allow_list_enabled: bool,
    /// Allow list specification.
    pub allow_list: String,
    /// Block list specification.
    pub block_list: String,
    /// Relay world-state payloads.
    pub world_sync: bool,
    /// World time scale.
    pub time_scale: f32,
    /// Advertise on the LAN.
    pub lan_advertise: bool,
    /// LAN discovery name.
    pub server_name: String,
    /// Monitoring port, 0 disables.
    pub monitor_port: u16,
    /// Client display name.
    pub display_name: String,
    /// Client appearance descriptor.
    pub appearance: String,
    /// Serverless UDP port.
    pub serverless_port: u16,
    /// Serverless bootstrap endpoints.
    pub serverless_peers: Vec<String>,
    /// Saved servers.
    pub servers: Vec<ServerEntry>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_port: 7777,
            bind_address: "::".to_string(),
            bind_retry_count: 3,
            tick_interval_ms: 10,
            overdue_timeout_ms: 5000,
            disconnect_retention_ms: 10000,
            reconnect_timeout_ms: 10000,
            connect_timeout_ms: 5000,
            pre_timeout_offset_ms: 500,
            appearance_recency_ms: 5000,
            allow_list_enabled: false,
            allow_list: String::new(),
            block_list: String::new(),
            world_sync: false,
            time_scale: 1.0,
            lan_advertise: false,
            server_name: String::new(),
            monitor_port: 0,
            display_name: "Player".to_string(),
            appearance: String::new(),
            serverless_port: 7778,
            serverless_peers: Vec::new(),
            servers: Vec::new(),
        }
    }
}

/// Every key in save order, with its description.
const KEYS: &[(&str, &str)] = &[
    ("listen_port", "TCP port the server listens on"),
    ("bind_address", "Address to bind; \"::\" binds dual-stack where possible"),
    ("bind_retry_count", "Extra bind attempts if the port is busy"),
    ("tick_interval_ms", "Minimum milliseconds between ticks on one connection"),
    ("overdue_timeout_ms", "Milliseconds without an update before a peer is dropped"),
    ("disconnect_retention_ms", "Milliseconds a disconnected id is remembered"),
    ("reconnect_timeout_ms", "Milliseconds the client keeps reconnecting after a drop"),
    ("connect_timeout_ms", "Milliseconds allowed to open a connection"),
    ("pre_timeout_offset_ms", "Serverless: stop relaying a peer this long before it times out"),
    ("appearance_recency_ms", "Milliseconds a new appearance is pushed to everyone"),
    ("allow_list_enabled", "Only admit addresses on the allow list"),
    ("allow_list", "Comma-separated addresses, ranges or CIDR blocks to admit"),
    ("block_list", "Comma-separated addresses, ranges or CIDR blocks to reject"),
    ("world_sync", "Relay level state and save data between players"),
    ("time_scale", "World time scale sent to clients"),
    ("lan_advertise", "Advertise the server on the local network"),
    ("server_name", "Name shown in LAN discovery"),
    ("monitor_port", "Monitoring HTTP/WebSocket port, 0 to disable"),
    ("display_name", "Client: your display name"),
    ("appearance", "Client: your appearance descriptor"),
    ("serverless_port", "Serverless: UDP port"),
    ("serverless_peers", "Serverless: endpoints to contact at startup"),
    ("servers", "Client: saved servers"),
];

impl Settings {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(text) => Self::from_toml(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(source) => Err(ConfigError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Parse TOML text.
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Render every key with its description.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let value = toml::Value::try_from(self)?;
        let Some(table) = value.as_table() else {
            return Ok(String::new());
        };
        let mut out = String::new();
        for (key, description) in KEYS {
            let Some(value) = table.get(*key) else {
                continue;
            };
            out.push_str(&format!("# {}\n{} = {}\n\n", description, key, value));
        }
        Ok(out)
    }

    /// Write to `path`.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let text = self.to_toml()?;
        fs::write(path, text).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    // -------------------------------------------------------------------------
    // Derived configs
    // -------------------------------------------------------------------------

    /// Timeouts.
    pub fn timeout_config(&self) -> TimeoutConfig {
        TimeoutConfig {
            overdue: ms(self.overdue_timeout_ms),
            disconnect_retention: ms(self.disconnect_retention_ms),
            pre_timeout_offset: ms(self.pre_timeout_offset_ms),
            ..TimeoutConfig::default()
        }
    }

    /// Server configuration.
    pub fn server_config(&self) -> Result<ServerConfig, ConfigError> {
        if !self.time_scale.is_finite() || self.time_scale < 0.0 {
            return Err(ConfigError::Invalid {
                key: "time_scale",
                reason: format!("{} is not a non-negative number", self.time_scale),
            });
        }
        Ok(ServerConfig {
            bind_addr: self.bind_ip()?,
            port: self.listen_port,
            bind_retry_count: self.bind_retry_count,
            tick_interval: ms(self.tick_interval_ms),
            timeouts: self.timeout_config(),
            appearance_recency: ms(self.appearance_recency_ms),
            allow_list_enabled: self.allow_list_enabled,
            allow_list: self.allow_list.clone(),
            block_list: self.block_list.clone(),
            world_sync: self.world_sync,
            time_scale: self.time_scale,
            lan_advertise: self.lan_advertise,
            server_name: self.server_name.clone(),
            monitor_port: (self.monitor_port != 0).then_some(self.monitor_port),
            ..ServerConfig::default()
        })
    }

    /// Client configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connect_timeout: ms(self.connect_timeout_ms),
            overdue_timeout: ms(self.overdue_timeout_ms),
            reconnect_timeout: ms(self.reconnect_timeout_ms),
            world_sync: self.world_sync,
            ..ClientConfig::default()
        }
    }

    /// Serverless configuration.
    pub fn serverless_config(&self) -> Result<ServerlessConfig, ConfigError> {
        let bootstrap = self
            .serverless_peers
            .iter()
            .map(|p| {
                p.parse::<SocketAddr>().map_err(|e| ConfigError::Invalid {
                    key: "serverless_peers",
                    reason: format!("{:?}: {}", p, e),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ServerlessConfig {
            bind_addr: self.bind_ip()?,
            port: self.serverless_port,
            bootstrap,
            timeouts: self.timeout_config(),
            ..ServerlessConfig::default()
        })
    }

    /// Saved server by name (case-insensitive).
    pub fn find_server(&self, name: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    fn bind_ip(&self) -> Result<IpAddr, ConfigError> {
        self.bind_address.parse().map_err(|e| ConfigError::Invalid {
            key: "bind_address",
            reason: format!("{:?}: {}", self.bind_address, e),
        })
    }
}

fn ms(v: u64) -> Duration {
    Duration::from_millis(v)
}
