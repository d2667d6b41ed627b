//! Tunnel abstraction
//!
//! Every protocol implements [`Tunnel`]. The shared bookkeeping (state,
//! events, counters, addresses) lives in [`TunnelCore`] so each protocol
//! only drives its own transitions.

use crate::backend::BackendError;
use crate::config::Protocol;
use crate::events::{EventBus, StateChange, StateChanges};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Tunnel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Reconnecting,
    Error,
}

impl TunnelState {
    /// Check if tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, TunnelState::Connected)
    }

    /// Connected or on its way there
    pub fn is_active(&self) -> bool {
        matches!(self, TunnelState::Connected | TunnelState::Connecting)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, TunnelState::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::Disconnected => "disconnected",
            TunnelState::Connecting => "connecting",
            TunnelState::Connected => "connected",
            TunnelState::Disconnecting => "disconnecting",
            TunnelState::Reconnecting => "reconnecting",
            TunnelState::Error => "error",
        }
    }
}

impl std::fmt::Display for TunnelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
}

impl TunnelStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts)",
            self.bytes_sent as f64 / (1024.0 * 1024.0),
            self.packets_sent,
            self.bytes_received as f64 / (1024.0 * 1024.0),
            self.packets_received,
        )
    }
}

/// Cumulative traffic counters shared with the packet pumps
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
}

impl TrafficCounters {
    pub fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Overwrite byte totals reported by an external process
    pub fn set_bytes(&self, sent: u64, received: u64) {
        self.bytes_sent.store(sent, Ordering::Relaxed);
        self.bytes_received.store(received, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TunnelStats {
        TunnelStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
        }
    }
}

/// Addresses learned while the tunnel comes up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TunnelAddresses {
    pub local: Option<IpAddr>,
    pub gateway: Option<IpAddr>,
    pub server: Option<IpAddr>,
}

/// State machine helper embedded in every tunnel
pub struct TunnelCore {
    protocol: Protocol,
    interface: String,
    state: RwLock<TunnelState>,
    events: EventBus,
    counters: Arc<TrafficCounters>,
    addresses: RwLock<TunnelAddresses>,
}

impl TunnelCore {
    pub fn new(protocol: Protocol, interface: impl Into<String>) -> Self {
        Self {
            protocol,
            interface: interface.into(),
            state: RwLock::new(TunnelState::Disconnected),
            events: EventBus::new(),
            counters: Arc::new(TrafficCounters::default()),
            addresses: RwLock::new(TunnelAddresses::default()),
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn state(&self) -> TunnelState {
        *self.state.read()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.counters
    }

    pub fn addresses(&self) -> TunnelAddresses {
        *self.addresses.read()
    }

    pub fn set_addresses(&self, addresses: TunnelAddresses) {
        *self.addresses.write() = addresses;
    }

    pub fn set_local(&self, local: IpAddr) {
        self.addresses.write().local = Some(local);
    }

    /// Move to `state` and publish the transition.
    pub fn transition(&self, state: TunnelState, message: impl Into<String>) {
        let message = message.into();
        *self.state.write() = state;
        debug!("{} tunnel -> {}: {}", self.protocol, state, message);
        self.events.emit(StateChange::new(state, message));
    }

    /// Move to `Error` and publish the cause.
    pub fn fail(&self, message: impl Into<String>, error: &dyn std::fmt::Display) {
        let message = message.into();
        *self.state.write() = TunnelState::Error;
        warn!("{} tunnel error: {}: {}", self.protocol, message, error);
        self.events.emit(StateChange::failed(message, error));
    }

    /// Atomically claim the tunnel for a start attempt.
    pub fn begin_start(&self) -> Result<(), TunnelError> {
        {
            let mut state = self.state.write();
            if state.is_active() {
                return Err(TunnelError::AlreadyConnected);
            }
            *state = TunnelState::Connecting;
        }
        self.events.emit(StateChange::new(TunnelState::Connecting, "Connecting"));
        Ok(())
    }

    /// Claim the tunnel for a stop; false when there is nothing to stop.
    pub fn begin_stop(&self) -> bool {
        {
            let mut state = self.state.write();
            if matches!(*state, TunnelState::Disconnected | TunnelState::Disconnecting) {
                return false;
            }
            *state = TunnelState::Disconnecting;
        }
        self.events.emit(StateChange::new(TunnelState::Disconnecting, "Disconnecting"));
        true
    }

    /// Final transition of a lifecycle: publish `Disconnected` and close the stream.
    pub fn finish_stop(&self) {
        self.transition(TunnelState::Disconnected, "Disconnected");
        self.events.close();
    }
}

/// A running (or runnable) VPN tunnel
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Bring the tunnel up. Long-running work is bound to `cancel`.
    async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError>;

    /// Tear everything down. Stopping a stopped tunnel succeeds.
    async fn stop(&self) -> Result<(), TunnelError>;

    /// Re-establish the tunnel, re-opening its event stream.
    async fn reconnect(&self) -> Result<(), TunnelError>;

    fn core(&self) -> &TunnelCore;

    fn protocol(&self) -> Protocol {
        self.core().protocol()
    }

    fn state(&self) -> TunnelState {
        self.core().state()
    }

    fn stats(&self) -> TunnelStats {
        self.core().counters().snapshot()
    }

    fn local_ip(&self) -> Option<IpAddr> {
        self.core().addresses().local
    }

    fn gateway_ip(&self) -> Option<IpAddr> {
        self.core().addresses().gateway
    }

    fn server_ip(&self) -> Option<IpAddr> {
        self.core().addresses().server
    }

    fn interface_name(&self) -> &str {
        self.core().interface()
    }

    fn state_changes(&self) -> Option<StateChanges> {
        self.core().events().subscribe()
    }
}

/// Tunnel errors
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("already connected")]
    AlreadyConnected,

    #[error("Invalid tunnel configuration: {0}")]
    Config(String),

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("connection timeout: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    pub(crate) fn resolve(host: &str, err: impl ToString) -> Self {
        TunnelError::Resolve {
            host: host.to_string(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_helpers() {
        assert!(TunnelState::Connected.is_connected());
        assert!(TunnelState::Connecting.is_active());
        assert!(!TunnelState::Reconnecting.is_active());
        assert!(TunnelState::Error.is_error());
        assert_eq!(TunnelState::Disconnecting.to_string(), "disconnecting");
    }

    #[test]
    fn test_begin_start_rejects_active() {
        let core = TunnelCore::new(Protocol::WireGuard, "veil0");
        core.begin_start().unwrap();
        assert!(matches!(core.begin_start(), Err(TunnelError::AlreadyConnected)));

        core.transition(TunnelState::Connected, "up");
        let err = core.begin_start().unwrap_err();
        assert_eq!(err.to_string(), "already connected");
        assert_eq!(core.state(), TunnelState::Connected);
    }

    #[test]
    fn test_begin_start_after_error() {
        let core = TunnelCore::new(Protocol::Ssh, "veil0");
        core.fail("handshake", &"refused");
        assert!(core.begin_start().is_ok());
    }

    #[test]
    fn test_begin_stop_idempotent() {
        let core = TunnelCore::new(Protocol::OpenVpn, "veil0");
        assert!(!core.begin_stop());

        core.transition(TunnelState::Connected, "up");
        assert!(core.begin_stop());
        core.finish_stop();
        assert!(!core.begin_stop());
        assert!(core.events().is_closed());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let core = TunnelCore::new(Protocol::WireGuard, "veil0");
        let mut changes = core.events().subscribe().unwrap();

        core.begin_start().unwrap();
        core.fail("endpoint", &"unreachable");

        assert_eq!(changes.recv().await.unwrap().state, TunnelState::Connecting);
        let failed = changes.recv().await.unwrap();
        assert_eq!(failed.state, TunnelState::Error);
        assert_eq!(failed.error.as_deref(), Some("unreachable"));
    }

    #[test]
    fn test_counters() {
        let counters = TrafficCounters::default();
        counters.record_sent(100);
        counters.record_sent(50);
        counters.record_received(1400);

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_received, 1400);
        assert_eq!(stats.packets_received, 1);

        counters.set_bytes(10, 20);
        assert_eq!(counters.snapshot().bytes_received, 20);
        assert!(counters.snapshot().format().contains("TX: 0.00MB"));
    }
}
