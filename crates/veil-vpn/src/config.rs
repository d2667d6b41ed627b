//! VPN Configuration
//!
//! The serde model loaded from `veil.toml`. Every section has defaults so
//! a minimal file only names the protocol and its credentials.
//!
//! ```toml
//! protocol = "wireguard"
//!
//! [wireguard]
//! private_key = "..."
//! address = "10.0.0.2/24"
//!
//! [wireguard.peer]
//! public_key = "..."
//! endpoint = "vpn.example.com:51820"
//! ```

use crate::keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Tunnel protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    WireGuard,
    OpenVpn,
    Ssh,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::WireGuard => "wireguard",
            Protocol::OpenVpn => "openvpn",
            Protocol::Ssh => "ssh",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Protocol::WireGuard => "WireGuard",
            Protocol::OpenVpn => "OpenVPN",
            Protocol::Ssh => "SSH",
        };
        f.write_str(name)
    }
}

/// Complete client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub protocol: Protocol,
    /// Connect automatically when the service starts
    pub autostart: bool,
    pub wireguard: WireGuardConfig,
    pub openvpn: OpenVpnConfig,
    pub ssh: SshConfig,
    pub routing: RoutingConfig,
    pub dns: DnsSettings,
    pub interface: InterfaceConfig,
    pub kill_switch: KillSwitchSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardConfig {
    /// Base64 private key
    pub private_key: String,
    /// Local tunnel address in CIDR form
    pub address: String,
    pub peer: WireGuardPeer,
}

impl Default for WireGuardConfig {
    fn default() -> Self {
        Self {
            private_key: String::new(),
            address: "10.0.0.2/24".to_string(),
            peer: WireGuardPeer::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WireGuardPeer {
    pub public_key: String,
    /// `host:port`
    pub endpoint: String,
    /// Seconds; 0 disables
    pub persistent_keepalive: u16,
    pub preshared_key: Option<String>,
}

impl Default for WireGuardPeer {
    fn default() -> Self {
        Self {
            public_key: String::new(),
            endpoint: String::new(),
            persistent_keepalive: 25,
            preshared_key: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenVpnConfig {
    /// Path to the `.ovpn` profile
    pub config_path: Option<PathBuf>,
    pub auth_user: Option<String>,
    pub auth_pass: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
    /// Remote end of the point-to-point link
    pub remote_tun_addr: String,
    /// Local end, CIDR; `/24` is assumed when no prefix is given
    pub local_tun_addr: String,
    /// Seconds between keepalive requests
    pub keepalive_interval: u64,
    /// Consecutive failures before reconnecting
    pub keepalive_retries: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_ssh_port(),
            user: String::new(),
            key_path: None,
            password: None,
            remote_tun_addr: "10.0.0.1".to_string(),
            local_tun_addr: "10.0.0.2/24".to_string(),
            keepalive_interval: 10,
            keepalive_retries: 3,
        }
    }
}

fn default_ssh_port() -> u16 {
    22
}

impl SshConfig {
    pub fn keepalive_interval(&self) -> Duration {
        if self.keepalive_interval == 0 {
            Duration::from_secs(10)
        } else {
            Duration::from_secs(self.keepalive_interval)
        }
    }

    pub fn keepalive_retries(&self) -> u32 {
        if self.keepalive_retries == 0 { 3 } else { self.keepalive_retries }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    /// Send all traffic through the tunnel
    pub default_route: bool,
    pub include_ips: Vec<String>,
    pub include_domains: Vec<String>,
    /// Seconds between domain re-resolution passes
    pub dns_refresh_interval: u64,
    /// Local route list file
    pub route_list: Option<PathBuf>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            default_route: false,
            include_ips: Vec::new(),
            include_domains: Vec::new(),
            dns_refresh_interval: 300,
            route_list: None,
        }
    }
}

impl RoutingConfig {
    /// Refresh interval; anything under a minute falls back to five.
    pub fn refresh_interval(&self) -> Duration {
        let interval = Duration::from_secs(self.dns_refresh_interval);
        if interval < Duration::from_secs(60) {
            Duration::from_secs(300)
        } else {
            interval
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DnsSettings {
    pub servers: Vec<String>,
    /// Only resolve `domains` through the tunnel's servers
    pub split_dns: bool,
    pub domains: Vec<String>,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            servers: vec!["1.1.1.1".to_string(), "8.8.8.8".to_string()],
            split_dns: true,
            domains: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    pub name: String,
    pub mtu: u16,
    pub metric: u32,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "veil0".to_string(),
            mtu: 1420,
            metric: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KillSwitchSettings {
    pub enabled: bool,
    pub allow_lan: bool,
    pub allowed_processes: Vec<String>,
}

impl Default for KillSwitchSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_lan: true,
            allowed_processes: Vec::new(),
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Serialize back to TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check everything the selected protocol needs before anything is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.protocol {
            Protocol::WireGuard => self.validate_wireguard()?,
            Protocol::OpenVpn => {
                if self.openvpn.config_path.is_none() {
                    return Err(ConfigError::missing(Protocol::OpenVpn, "config file path"));
                }
            }
            Protocol::Ssh => self.validate_ssh()?,
        }

        if self.interface.name.is_empty() {
            return Err(ConfigError::InvalidInterface("name is empty".to_string()));
        }
        if !(576..=9000).contains(&self.interface.mtu) {
            return Err(ConfigError::InvalidInterface(format!(
                "MTU {} out of range 576-9000",
                self.interface.mtu
            )));
        }

        if !self.routing.default_route {
            for entry in &self.routing.include_ips {
                parse_destination(entry)
                    .map_err(|_| ConfigError::InvalidRoute(entry.clone()))?;
            }
        }

        Ok(())
    }

    fn validate_wireguard(&self) -> Result<(), ConfigError> {
        let wg = &self.wireguard;
        if wg.private_key.is_empty() {
            return Err(ConfigError::missing(Protocol::WireGuard, "private key"));
        }
        if wg.address.is_empty() {
            return Err(ConfigError::missing(Protocol::WireGuard, "address"));
        }
        if wg.peer.public_key.is_empty() {
            return Err(ConfigError::missing(Protocol::WireGuard, "peer public key"));
        }
        if wg.peer.endpoint.is_empty() {
            return Err(ConfigError::missing(Protocol::WireGuard, "peer endpoint"));
        }
        if wg.address.parse::<IpNet>().is_err() {
            return Err(ConfigError::InvalidAddress {
                protocol: Protocol::WireGuard,
                value: wg.address.clone(),
            });
        }
        split_host_port(&wg.peer.endpoint).ok_or_else(|| ConfigError::InvalidAddress {
            protocol: Protocol::WireGuard,
            value: wg.peer.endpoint.clone(),
        })?;

        PrivateKey::from_base64(&wg.private_key)?;
        PublicKey::from_base64(&wg.peer.public_key)?;
        if let Some(psk) = &wg.peer.preshared_key {
            PresharedKey::from_base64(psk)?;
        }
        Ok(())
    }

    fn validate_ssh(&self) -> Result<(), ConfigError> {
        let ssh = &self.ssh;
        if ssh.host.is_empty() {
            return Err(ConfigError::missing(Protocol::Ssh, "host"));
        }
        if ssh.user.is_empty() {
            return Err(ConfigError::missing(Protocol::Ssh, "user"));
        }
        if ssh.key_path.is_none() && ssh.password.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::missing(Protocol::Ssh, "key_path or password"));
        }
        if ssh.remote_tun_addr.parse::<IpAddr>().is_err() {
            return Err(ConfigError::InvalidAddress {
                protocol: Protocol::Ssh,
                value: ssh.remote_tun_addr.clone(),
            });
        }
        local_tun_net(&ssh.local_tun_addr).ok_or_else(|| ConfigError::InvalidAddress {
            protocol: Protocol::Ssh,
            value: ssh.local_tun_addr.clone(),
        })?;
        Ok(())
    }

    /// Host the tunnel connects to, where the configuration names it directly.
    pub fn server_host(&self) -> Option<String> {
        match self.protocol {
            Protocol::WireGuard => {
                split_host_port(&self.wireguard.peer.endpoint).map(|(host, _)| host.to_string())
            }
            Protocol::Ssh => Some(self.ssh.host.clone()),
            Protocol::OpenVpn => None,
        }
    }
}

/// Split `host:port`, accepting bracketed IPv6.
pub fn split_host_port(endpoint: &str) -> Option<(&str, u16)> {
    let (host, port) = endpoint.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host, port))
}

/// Local SSH tunnel address, adding `/24` when the prefix is missing.
pub(crate) fn local_tun_net(value: &str) -> Option<IpNet> {
    if value.contains('/') {
        value.parse().ok()
    } else {
        format!("{value}/24").parse().ok()
    }
}

/// Parse a route destination; bare addresses become host prefixes.
pub fn parse_destination(value: &str) -> Result<IpNet, ConfigError> {
    let value = value.trim();
    if value.contains('/') {
        return value
            .parse::<IpNet>()
            .map(|net| net.trunc())
            .map_err(|_| ConfigError::InvalidRoute(value.to_string()));
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ConfigError::InvalidRoute(value.to_string()))
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Io(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),

    #[error("{protocol}: {field} is required")]
    MissingField { protocol: Protocol, field: &'static str },

    #[error("{protocol}: invalid address '{value}'")]
    InvalidAddress { protocol: Protocol, value: String },

    #[error("Invalid key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("Invalid interface settings: {0}")]
    InvalidInterface(String),

    #[error("Invalid route destination '{0}'")]
    InvalidRoute(String),
}

impl ConfigError {
    fn missing(protocol: Protocol, field: &'static str) -> Self {
        ConfigError::MissingField { protocol, field }
    }
}
