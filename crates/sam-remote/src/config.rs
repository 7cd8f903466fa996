// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Remote sharing configuration.
//!
//! One TOML file carries an optional `[server]` table, an optional `[client]`
//! table, or both. Durations are given in seconds.
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! family_set = "lib20"
//! equipment = 20
//! discovery_port = 7090
//!
//! [[server.clients]]
//! host = "10.0.0.7"
//! media = [{ eq = 20, media = "lt", pattern = "^SCR" }]
//!
//! [client]
//! family_set = "lib20"
//! equipment = 30
//! server_host = "tapehost"
//! ```

use crate::catalog::MediaType;
use crate::protocol::FamilySetName;
use crate::registry::MAX_CLIENTS;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Server role settings.
    #[serde(default)]
    pub server: Option<ServerConfig>,

    /// Client role settings.
    #[serde(default)]
    pub client: Option<ClientConfig>,

    /// Log level (overridden by `--log-level` or `RUST_LOG`).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl RemoteConfig {
    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_none() && self.client.is_none() {
            return Err(ConfigError::Invalid(
                "Neither [server] nor [client] configured".into(),
            ));
        }
        if let Some(server) = &self.server {
            server.validate()?;
        }
        if let Some(client) = &self.client {
            client.validate()?;
        }
        Ok(())
    }
}

/// One VSN sharing rule for a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaRuleConfig {
    /// Equipment ordinal of the library.
    pub eq: u16,
    /// Media type code.
    pub media: MediaType,
    /// Regular expression matched against the VSN.
    pub pattern: String,
}

/// One authorized client host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizedClientConfig {
    /// Host name or literal address.
    pub host: String,
    /// Sharing rules, tried in order.
    #[serde(default)]
    pub media: Vec<MediaRuleConfig>,
}

/// Server role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Family set served by this host.
    pub family_set: String,

    /// Equipment ordinal of the shared device.
    pub equipment: u16,

    /// Device name used in logs.
    #[serde(default = "default_server_device")]
    pub device_name: String,

    /// Service name registered with the directory.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Address both listeners bind to.
    #[serde(default = "default_bind_address")]
    pub bind_address: IpAddr,

    /// Discovery (rendezvous) port. 0 picks a free port.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// First candidate session port. 0 picks a free port.
    #[serde(default = "default_session_port_base")]
    pub session_port_base: u16,

    /// Offset added to the base so several servers can share a host.
    #[serde(default)]
    pub ordinal: u16,

    /// Distance between two candidate session ports.
    #[serde(default = "default_port_stride")]
    pub port_stride: u16,

    /// Number of candidate session ports.
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,

    /// Maximum live client handlers.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Records buffered per client before sends fail.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    /// Authorized clients.
    #[serde(default)]
    pub clients: Vec<AuthorizedClientConfig>,
}

impl ServerConfig {
    /// Minimal server configuration with defaults.
    pub fn new(family_set: impl Into<String>, equipment: u16) -> Self {
        Self {
            family_set: family_set.into(),
            equipment,
            device_name: default_server_device(),
            service_name: default_service_name(),
            bind_address: default_bind_address(),
            discovery_port: default_discovery_port(),
            session_port_base: default_session_port_base(),
            ordinal: 0,
            port_stride: default_port_stride(),
            port_attempts: default_port_attempts(),
            max_connections: default_max_connections(),
            outbound_queue_depth: default_outbound_queue_depth(),
            clients: Vec::new(),
        }
    }

    pub fn family_set_name(&self) -> Result<FamilySetName, ConfigError> {
        parse_family_set(&self.family_set)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.family_set_name()?;
        if self.service_name.is_empty() {
            return Err(ConfigError::Invalid("Empty server service_name".into()));
        }
        if self.clients.len() > MAX_CLIENTS {
            return Err(ConfigError::Invalid(format!(
                "{} authorized clients configured (max {})",
                self.clients.len(),
                MAX_CLIENTS
            )));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be > 0".into()));
        }
        if self.outbound_queue_depth == 0 {
            return Err(ConfigError::Invalid(
                "outbound_queue_depth must be > 0".into(),
            ));
        }
        if self.port_attempts == 0 {
            return Err(ConfigError::Invalid("port_attempts must be > 0".into()));
        }
        for client in &self.clients {
            if client.host.is_empty() {
                return Err(ConfigError::Invalid("Authorized client with empty host".into()));
            }
            for rule in &client.media {
                regex::Regex::new(&rule.pattern).map_err(|e| {
                    ConfigError::Invalid(format!("Bad pattern for {}: {}", client.host, e))
                })?;
            }
        }
        Ok(())
    }
}

/// Client role configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Family set requested from the server.
    pub family_set: String,

    /// Equipment ordinal of the local pseudo-device.
    pub equipment: u16,

    /// Host running the server.
    pub server_host: String,

    /// Device name used in logs.
    #[serde(default = "default_client_device")]
    pub device_name: String,

    /// Service name looked up in the directory.
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Discovery port on the server host.
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,

    /// Send heartbeats when the session is idle.
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Idle time before a heartbeat (seconds).
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_secs: f64,

    /// Wait between connection attempts (seconds).
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_secs: f64,

    /// TCP connect timeout (seconds).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: f64,

    /// Time to wait for a command acknowledgement (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
}

impl ClientConfig {
    /// Minimal client configuration with defaults.
    pub fn new(family_set: impl Into<String>, equipment: u16, server_host: impl Into<String>) -> Self {
        Self {
            family_set: family_set.into(),
            equipment,
            server_host: server_host.into(),
            device_name: default_client_device(),
            service_name: default_service_name(),
            discovery_port: default_discovery_port(),
            keepalive: true,
            keepalive_interval_secs: default_keepalive_interval(),
            reconnect_backoff_secs: default_reconnect_backoff(),
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
        }
    }

    pub fn family_set_name(&self) -> Result<FamilySetName, ConfigError> {
        parse_family_set(&self.family_set)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs_f64(self.keepalive_interval_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.reconnect_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.family_set_name()?;
        if self.server_host.is_empty() {
            return Err(ConfigError::Invalid("Empty client server_host".into()));
        }
        for (name, value) in [
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("reconnect_backoff_secs", self.reconnect_backoff_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
            ("request_timeout_secs", self.request_timeout_secs),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(ConfigError::Invalid(format!(
                    "{} must be a positive number of seconds, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

fn parse_family_set(name: &str) -> Result<FamilySetName, ConfigError> {
    FamilySetName::new(name)
        .ok_or_else(|| ConfigError::Invalid(format!("Invalid family set name {:?}", name)))
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_service_name() -> String {
    "rmtsam".to_string()
}

fn default_server_device() -> String {
    "rmtsam-server".to_string()
}

fn default_client_device() -> String {
    "rmtsam-client".to_string()
}

fn default_bind_address() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_discovery_port() -> u16 {
    7090
}

fn default_session_port_base() -> u16 {
    7100
}

fn default_port_stride() -> u16 {
    16
}

fn default_port_attempts() -> u16 {
    32
}

fn default_max_connections() -> usize {
    MAX_CLIENTS
}

fn default_outbound_queue_depth() -> usize {
    256
}

fn default_true() -> bool {
    true
}

fn default_keepalive_interval() -> f64 {
    60.0
}

fn default_reconnect_backoff() -> f64 {
    30.0
}

fn default_connect_timeout() -> f64 {
    10.0
}

fn default_request_timeout() -> f64 {
    120.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = r#"
log_level = "debug"

[server]
family_set = "lib20"
equipment = 20
discovery_port = 0
session_port_base = 0
max_connections = 4

[[server.clients]]
host = "10.0.0.7"
media = [
    { eq = 20, media = "lt", pattern = "^SCR" },
    { eq = 20, media = "li", pattern = ".*" },
]

[client]
family_set = "lib20"
equipment = 30
server_host = "tapehost"
keepalive_interval_secs = 0.5
"#;

    #[test]
    fn test_parse_full() {
        let config: RemoteConfig = toml::from_str(FULL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.log_level, "debug");

        let server = config.server.unwrap();
        assert_eq!(server.family_set_name().unwrap().as_str(), "lib20");
        assert_eq!(server.service_name, "rmtsam");
        assert_eq!(server.max_connections, 4);
        assert_eq!(server.port_stride, 16);
        assert_eq!(server.clients.len(), 1);
        assert_eq!(server.clients[0].media[1].media.as_str(), "li");

        let client = config.client.unwrap();
        assert!(client.keepalive);
        assert_eq!(client.keepalive_interval(), Duration::from_millis(500));
        assert_eq!(client.reconnect_backoff(), Duration::from_secs(30));
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::new("fs1", 5);
        config.validate().unwrap();
        assert_eq!(config.discovery_port, 7090);
        assert_eq!(config.max_connections, MAX_CLIENTS);

        let client = ClientConfig::new("fs1", 6, "localhost");
        client.validate().unwrap();
        assert_eq!(client.request_timeout(), Duration::from_secs(120));
    }

    #[test]
    fn test_empty_rejected() {
        let config: RemoteConfig = toml::from_str("").unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut server = ServerConfig::new("", 1);
        assert!(server.validate().is_err());
        server.family_set = "fs".into();
        server.clients.push(AuthorizedClientConfig {
            host: "h".into(),
            media: vec![MediaRuleConfig {
                eq: 1,
                media: MediaType::new("lt").unwrap(),
                pattern: "(".into(),
            }],
        });
        assert!(server.validate().is_err());

        let mut client = ClientConfig::new("fs", 1, "h");
        client.reconnect_backoff_secs = 0.0;
        assert!(client.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sam-remote.toml");
        std::fs::write(&path, FULL).unwrap();
        let config = RemoteConfig::from_file(&path).unwrap();
        assert!(config.server.is_some());

        std::fs::write(&path, "[server]\nequipment = 1\n").unwrap();
        assert!(matches!(
            RemoteConfig::from_file(&path),
            Err(ConfigError::Toml(_))
        ));
        assert!(matches!(
            RemoteConfig::from_file(dir.path().join("missing.toml")),
            Err(ConfigError::Io(_))
        ));
    }
}
