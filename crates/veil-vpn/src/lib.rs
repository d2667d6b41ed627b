//! Veil VPN - Multi-protocol VPN client core
//!
//! Brings up a WireGuard, OpenVPN or SSH tunnel on a local TUN device and
//! applies the connection policy around it: split or full-tunnel routing,
//! DNS, and an optional kill switch.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                          VpnService                          │
//! │                                                              │
//! │  ┌────────────┐  ┌────────────┐  ┌───────────┐  ┌─────────┐  │
//! │  │  Tunnel    │  │  Routing   │  │   Kill    │  │   DNS   │  │
//! │  │ WG/OVPN/SSH│  │  Engine    │  │  Switch   │  │ Engine  │  │
//! │  └─────┬──────┘  └─────┬──────┘  └─────┬─────┘  └────┬────┘  │
//! │        │               │               │             │       │
//! └────────│───────────────│───────────────│─────────────│───────┘
//!          ▼               ▼               ▼             ▼
//!     ┌─────────┐   ┌────────────────────────────────────────┐
//!     │  TUN    │   │            NetworkBackend              │
//!     │ device  │   │  routes · firewall · DNS · interfaces  │
//!     └─────────┘   └────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Userspace WireGuard**: boringtun drives the protocol over a TUN device
//! - **OpenVPN**: the `openvpn` daemon, controlled over its management port
//! - **SSH bridge**: packets framed over an SSH session to a remote TUN
//! - **Split tunneling**: per-address and per-domain routes, refreshed
//! - **Kill switch**: outbound traffic blocked unless it uses the tunnel

pub mod backend;
mod config;
mod dns;
mod events;
mod keys;
mod kill_switch;
pub mod openvpn;
pub mod route_list;
mod routing;
mod service;
pub mod ssh;
mod tun;
mod tunnel;
pub mod wireguard;

pub use backend::{BackendError, NetworkBackend, system_backend};
pub use config::{
    Config, ConfigError, DnsSettings, InterfaceConfig, KillSwitchSettings, OpenVpnConfig, Protocol,
    RoutingConfig, SshConfig, WireGuardConfig, WireGuardPeer,
};
pub use dns::{DnsConfig, DnsEngine, DnsEngineError};
pub use events::{EventBus, StateChange, StateChanges};
pub use keys::{KeyError, PresharedKey, PrivateKey, PublicKey};
pub use kill_switch::{KillSwitch, KillSwitchConfig, KillSwitchError, KillSwitchState};
pub use openvpn::OpenVpnTunnel;
pub use route_list::{RouteEntries, RouteList, RouteListError};
pub use routing::{Route, RouteOrigin, RoutingEngine, RoutingError};
pub use service::{
    ServiceState, StatusListener, StatusPayload, SystemTunnels, TunnelFactory, VpnError, VpnService,
};
pub use ssh::SshTunnel;
pub use tun::{TunAdapter, TunDevice};
pub use tunnel::{
    TrafficCounters, Tunnel, TunnelAddresses, TunnelCore, TunnelError, TunnelState, TunnelStats,
};
pub use wireguard::WireGuardTunnel;
