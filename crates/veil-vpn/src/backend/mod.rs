//! System network backend
//!
//! The policy engines (routing, kill switch, DNS) and the tunnels only talk
//! to the operating system through [`NetworkBackend`]. The primitives are
//! small: interfaces, routes, gateway and interface lookups,
//! tagged firewall rules, and per-interface DNS.

#[cfg(target_os = "linux")]
mod linux;
#[cfg(test)]
pub(crate) mod testing;

#[cfg(target_os = "linux")]
pub use linux::LinuxBackend;

use crate::tun::TunDevice;
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

/// An interface as the routing table sees it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InterfaceHandle {
    pub name: String,
    pub index: u32,
}

/// The route traffic takes when no VPN route matches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gateway {
    pub address: IpAddr,
    pub interface: InterfaceHandle,
}

/// One routing table entry to install or remove
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpec {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: Option<InterfaceHandle>,
    pub metric: u32,
}

/// Firewall primitives the kill switch composes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FirewallRule {
    /// Block all outbound traffic not allowed by another rule
    DefaultDeny,
    AllowLoopback,
    /// DHCP client to server
    AllowDhcp,
    AllowAddress(IpAddr),
    AllowInterface(String),
    AllowNetwork(IpNet),
    AllowProcess(String),
}

impl fmt::Display for FirewallRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirewallRule::DefaultDeny => write!(f, "deny all"),
            FirewallRule::AllowLoopback => write!(f, "allow loopback"),
            FirewallRule::AllowDhcp => write!(f, "allow dhcp"),
            FirewallRule::AllowAddress(ip) => write!(f, "allow {}", ip),
            FirewallRule::AllowInterface(name) => write!(f, "allow interface {}", name),
            FirewallRule::AllowNetwork(net) => write!(f, "allow network {}", net),
            FirewallRule::AllowProcess(name) => write!(f, "allow process {}", name),
        }
    }
}

/// DNS settings applied to one interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAssignment {
    pub interface: String,
    pub servers: Vec<IpAddr>,
    /// Empty means every query goes to `servers`
    pub routing_domains: Vec<String>,
}

/// Operating-system primitives used by the VPN core
#[async_trait]
pub trait NetworkBackend: Send + Sync {
    /// Create a TUN device; it is destroyed when the last handle drops.
    async fn create_tun(&self, name: &str, mtu: u16) -> Result<Arc<dyn TunDevice>, BackendError>;

    async fn assign_address(
        &self,
        interface: &str,
        address: IpNet,
        peer: Option<IpAddr>,
    ) -> Result<(), BackendError>;

    async fn set_link_state(&self, interface: &str, up: bool) -> Result<(), BackendError>;

    async fn add_route(&self, route: &RouteSpec) -> Result<(), BackendError>;

    async fn remove_route(&self, route: &RouteSpec) -> Result<(), BackendError>;

    async fn default_gateway(&self) -> Result<Gateway, BackendError>;

    async fn interface_by_name(&self, name: &str) -> Result<InterfaceHandle, BackendError>;

    async fn interface_by_address(&self, address: IpAddr) -> Result<InterfaceHandle, BackendError>;

    /// Install `rule` at position `slot` of the rule group `tag`.
    async fn add_firewall_rule(
        &self,
        tag: &str,
        slot: usize,
        rule: &FirewallRule,
    ) -> Result<(), BackendError>;

    /// Swap the rule at `slot` in place.
    async fn replace_firewall_rule(
        &self,
        tag: &str,
        slot: usize,
        rule: &FirewallRule,
    ) -> Result<(), BackendError>;

    /// Remove every rule in the group and restore default-allow.
    async fn remove_firewall_rules(&self, tag: &str) -> Result<(), BackendError>;

    async fn set_dns(&self, assignment: &DnsAssignment) -> Result<(), BackendError>;

    /// Put the interface's DNS back the way it was before `set_dns`.
    async fn restore_dns(&self, interface: &str) -> Result<(), BackendError>;

    async fn flush_dns_cache(&self) -> Result<(), BackendError>;
}

/// Backend for the running platform
pub fn system_backend() -> Result<Arc<dyn NetworkBackend>, BackendError> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxBackend::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(BackendError::Unsupported(std::env::consts::OS.to_string()))
    }
}

/// Run an operation whose failure must not abort the caller.
///
/// Logs the error and reports whether it succeeded.
pub fn best_effort<T, E: fmt::Display>(what: &str, result: Result<T, E>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            warn!("{} failed: {}", what, e);
            false
        }
    }
}

/// Network backend errors
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Not supported on this platform: {0}")]
    Unsupported(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unexpected output: {0}")]
    Parse(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_best_effort() {
        assert!(best_effort("noop", Ok::<_, BackendError>(())));
        assert!(!best_effort(
            "route",
            Err::<(), _>(BackendError::NotFound("eth9".to_string()))
        ));
    }

    #[test]
    fn test_rule_display() {
        let rule = FirewallRule::AllowNetwork("10.0.0.0/8".parse().unwrap());
        assert_eq!(rule.to_string(), "allow network 10.0.0.0/8");
    }
}
