//! Configuration handling for tunlink
//!
//! Settings are TOML-based and arrive pre-validated at the session layer:
//! `Config::load` parses, `Config::validate` enforces the structural rules,
//! and the session only ever sees a checked value.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use thiserror::Error;

use crate::policy::hostname_is_well_formed;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Authentication methods understood by the protocol engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    #[default]
    Password,
    Certificate,
    Anonymous,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Log verbosity: "error", "warn", "info", "debug" or "trace"
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            policy: PolicyConfig::default(),
            routing: RoutingConfig::default(),
            tunnel: TunnelConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server hostname or address
    pub hostname: String,
    /// Server port (usually 443)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Logical hub/realm on the server
    #[serde(default = "default_hub")]
    pub hub: String,
    /// Connect timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: default_port(),
            hub: default_hub(),
            timeout_secs: default_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub method: AuthMethod,
    #[serde(default)]
    pub username: String,
    /// Omit to be prompted interactively
    #[serde(default)]
    pub password: Option<String>,
}

/// Host-validation lists consumed by [`crate::policy::ListHostPolicy`]
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PolicyConfig {
    /// Domain suffixes that may be connected to; empty means "any"
    #[serde(default)]
    pub allow: Vec<String>,
    /// Domain suffixes that are always rejected
    #[serde(default)]
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Divert default traffic through the tunnel once it is up
    #[serde(default = "default_true")]
    pub auto_route: bool,
    /// Pin configured DNS resolvers to the tunnel
    #[serde(default = "default_true")]
    pub dns_override: bool,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            auto_route: true,
            dns_override: true,
        }
    }
}

/// Tunnel interface addressing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Local address assigned to the tunnel device
    #[serde(default = "default_tunnel_address")]
    pub address: Ipv4Addr,
    /// Peer/gateway address on the tunnel network
    #[serde(default = "default_tunnel_gateway")]
    pub gateway: Ipv4Addr,
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Resolvers routed through the tunnel when dns_override is on
    #[serde(default = "default_name_servers")]
    pub name_servers: Vec<Ipv4Addr>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            address: default_tunnel_address(),
            gateway: default_tunnel_gateway(),
            prefix_len: default_prefix_len(),
            mtu: default_mtu(),
            name_servers: default_name_servers(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    443
}

fn default_hub() -> String {
    "DEFAULT".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_tunnel_address() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 2)
}

fn default_tunnel_gateway() -> Ipv4Addr {
    Ipv4Addr::new(10, 0, 0, 1)
}

fn default_prefix_len() -> u8 {
    24
}

fn default_mtu() -> u16 {
    1500
}

fn default_name_servers() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)]
}

impl Config {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Invalid(format!("serialization failed: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Default config location: `<config dir>/tunlink/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tunlink").join("config.toml"))
    }

    /// Structural validation; the session relies on a validated value
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !hostname_is_well_formed(&self.server.hostname) {
            return Err(ConfigError::Invalid(format!(
                "server hostname {:?} is malformed",
                self.server.hostname
            )));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Invalid("server port must be 1-65535".to_string()));
        }
        if self.server.timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "connect timeout must be at least 1 second".to_string(),
            ));
        }
        if self.tunnel.prefix_len > 30 {
            return Err(ConfigError::Invalid(format!(
                "tunnel prefix length /{} leaves no room for a peer",
                self.tunnel.prefix_len
            )));
        }
        if self.tunnel.mtu < 576 {
            return Err(ConfigError::Invalid(format!(
                "tunnel MTU {} is below the IPv4 minimum",
                self.tunnel.mtu
            )));
        }
        Ok(())
    }
}
