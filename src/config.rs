//! Node configuration loaded from the environment.

use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use crate::sync::{HostAddress, MemberName, SyncConfig};

/// Errors that can occur while loading the configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Largest accepted reactive window
pub const MAX_REACTIVE_WINDOW: usize = 1000;

/// Configuration of a single peer
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Name this peer goes by in the mesh
    pub member_name: MemberName,
    /// Interface to listen on
    pub bind_addr: String,
    pub port: u16,
    /// Address other peers use to reach us
    pub public_host: HostAddress,
    /// Every host of the mesh
    pub peers: Vec<HostAddress>,
    pub request_timeout: Duration,
    pub sync: SyncConfig,
}

impl NodeConfig {
    /// Create a config for `member_name` listening on `port`
    pub fn new(member_name: impl Into<String>, port: u16) -> Self {
        Self {
            member_name: member_name.into(),
            bind_addr: "0.0.0.0".to_string(),
            port,
            public_host: format!("http://127.0.0.1:{}", port),
            peers: Vec::new(),
            request_timeout: Duration::from_millis(5000),
            sync: SyncConfig::default(),
        }
    }

    /// Create from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let member_name = lookup("SYNC_MEMBER_NAME")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let port = parse(&lookup, "PORT")?.unwrap_or(9000);

        let mut config = Self::new(member_name, port);
        if let Some(bind_addr) = lookup("SYNC_BIND_ADDR") {
            config.bind_addr = bind_addr;
        }
        if let Some(host) = lookup("SYNC_PUBLIC_HOST") {
            config = config.with_public_host(host);
        }
        if let Some(peers) = lookup("SYNC_PEERS") {
            config = config.with_peers(
                peers
                    .split(',')
                    .map(str::trim)
                    .filter(|peer| !peer.is_empty())
                    .map(String::from)
                    .collect(),
            );
        }
        if let Some(window) = parse(&lookup, "SYNC_REACTIVE_WINDOW")? {
            config = config.with_reactive_window(window);
        }
        if let Some(ms) = parse(&lookup, "SYNC_REQUEST_TIMEOUT_MS")? {
            config = config.with_request_timeout(Duration::from_millis(ms));
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_public_host(mut self, host: impl Into<String>) -> Self {
        self.public_host = host.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_peers(mut self, peers: Vec<HostAddress>) -> Self {
        self.peers = peers
            .into_iter()
            .map(|peer| peer.trim_end_matches('/').to_string())
            .collect();
        self
    }

    pub fn with_reactive_window(mut self, window: usize) -> Self {
        self.sync.reactive_window = window;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Socket address to bind the HTTP server to
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|_| ConfigError::InvalidValue {
                name: "SYNC_BIND_ADDR",
                value: self.bind_addr.clone(),
            })
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.member_name.is_empty() {
            return Err(ConfigError::Invalid("Member name is empty".to_string()));
        }
        if self.public_host.is_empty() {
            return Err(ConfigError::Invalid("Public host is empty".to_string()));
        }
        if !(1..=MAX_REACTIVE_WINDOW).contains(&self.sync.reactive_window) {
            return Err(ConfigError::InvalidValue {
                name: "SYNC_REACTIVE_WINDOW",
                value: self.sync.reactive_window.to_string(),
            });
        }
        if self.request_timeout.is_zero() {
            return Err(ConfigError::InvalidValue {
                name: "SYNC_REQUEST_TIMEOUT_MS",
                value: "0".to_string(),
            });
        }
        self.socket_addr()?;
        Ok(())
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), 9000)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<NodeConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        NodeConfig::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[]).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.public_host, "http://127.0.0.1:9000");
        assert_eq!(config.sync.reactive_window, 20);
        assert_eq!(config.request_timeout, Duration::from_millis(5000));
        assert!(config.peers.is_empty());
        assert!(uuid::Uuid::parse_str(&config.member_name).is_ok());
    }

    #[test]
    fn test_from_variables() {
        let config = load(&[
            ("SYNC_MEMBER_NAME", "anna"),
            ("PORT", "9100"),
            ("SYNC_PUBLIC_HOST", "http://10.0.0.2:9100/"),
            ("SYNC_PEERS", "http://10.0.0.2:9100, http://10.0.0.3:9100,"),
            ("SYNC_REACTIVE_WINDOW", "50"),
            ("SYNC_REQUEST_TIMEOUT_MS", "250"),
        ])
        .unwrap();

        assert_eq!(config.member_name, "anna");
        assert_eq!(config.public_host, "http://10.0.0.2:9100");
        assert_eq!(
            config.peers,
            vec!["http://10.0.0.2:9100".to_string(), "http://10.0.0.3:9100".to_string()]
        );
        assert_eq!(config.sync.reactive_window, 50);
        assert_eq!(config.request_timeout, Duration::from_millis(250));
        assert_eq!(config.socket_addr().unwrap().port(), 9100);
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            load(&[("PORT", "ninety")]).unwrap_err(),
            ConfigError::InvalidValue {
                name: "PORT",
                value: "ninety".to_string()
            }
        );
        assert!(load(&[("SYNC_REACTIVE_WINDOW", "0")]).is_err());
        assert!(load(&[("SYNC_REACTIVE_WINDOW", "1001")]).is_err());
        assert!(load(&[("SYNC_REQUEST_TIMEOUT_MS", "0")]).is_err());
        assert!(load(&[("SYNC_BIND_ADDR", "not an address")]).is_err());
    }

    #[test]
    fn test_builders() {
        let config = NodeConfig::new("max", 9000)
            .with_reactive_window(5)
            .with_peers(vec!["http://a/".to_string()]);
        assert_eq!(config.sync.reactive_window, 5);
        assert_eq!(config.peers, vec!["http://a".to_string()]);
        assert!(config.validate().is_ok());
    }
}
