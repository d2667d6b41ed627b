//! VPN Service
//!
//! Top-level orchestrator. Owns one active tunnel plus the routing, kill
//! switch and DNS engines, and sequences them:
//!
//! ```text
//! connect:    validate ─► build tunnel ─► arm kill switch ─► start tunnel
//!             ─► wait Connected ─► routes ─► DNS ─► kill switch interface
//!             ─► monitor
//! disconnect: domain resolver ─► routes ─► server route ─► DNS
//!             ─► kill switch ─► tunnel
//! ```
//!
//! Any failure on the way up unwinds what was already applied before the
//! error is returned. Disconnect never fails; it always ends Disconnected.
//!
//! # Usage
//!
//! ```rust,ignore
//! let resolver = Arc::new(DnsResolver::with_defaults().await?);
//! let service = VpnService::new(config, system_backend()?, resolver);
//! service.set_status_listener(Arc::new(|status| println!("{}", status.state)));
//! service.connect().await?;
//! // ...
//! service.disconnect().await;
//! ```

use crate::backend::{BackendError, InterfaceHandle, NetworkBackend, best_effort};
use crate::config::{Config, ConfigError, Protocol};
use crate::dns::{DnsConfig, DnsEngine};
use crate::events::StateChanges;
use crate::kill_switch::{KillSwitch, KillSwitchConfig, KillSwitchError};
use crate::openvpn::{self, OpenVpnTunnel};
use crate::route_list::{RouteEntries, RouteList, RouteListError, looks_like_ip};
use crate::routing::{Route, RouteOrigin, RoutingEngine, RoutingError};
use crate::ssh::SshTunnel;
use crate::tunnel::{Tunnel, TunnelError, TunnelState};
use crate::wireguard::WireGuardTunnel;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use veil_net::HostResolver;

/// Tunnel state polls after start
const CONNECT_POLL_ATTEMPTS: u32 = 30;
const CONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Bound on teardown before the state is forced to Disconnected
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(15);
/// Settle time after wake-up before reconnecting
const RESUME_DELAY: Duration = Duration::from_secs(5);
const NETWORK_CHANGE_DEBOUNCE: Duration = Duration::from_secs(2);
const AUTOSTART_DELAY: Duration = Duration::from_secs(2);

/// Service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Disconnected => "disconnected",
            ServiceState::Connecting => "connecting",
            ServiceState::Connected => "connected",
            ServiceState::Disconnecting => "disconnecting",
            ServiceState::Error => "error",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot pushed to the status listener on every transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub state: ServiceState,
    pub protocol: Option<Protocol>,
    pub server_address: Option<IpAddr>,
    pub local_ip: Option<IpAddr>,
    /// Unix seconds
    pub connected_at: Option<u64>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub error: Option<String>,
}

pub type StatusListener = Arc<dyn Fn(&StatusPayload) + Send + Sync>;

/// Builds the tunnel for the configured protocol
pub trait TunnelFactory: Send + Sync {
    fn build(&self, config: &Config) -> Result<Arc<dyn Tunnel>, VpnError>;
}

/// The real tunnels
pub struct SystemTunnels {
    backend: Arc<dyn NetworkBackend>,
    resolver: Arc<dyn HostResolver>,
}

impl SystemTunnels {
    pub fn new(backend: Arc<dyn NetworkBackend>, resolver: Arc<dyn HostResolver>) -> Self {
        Self { backend, resolver }
    }
}

impl TunnelFactory for SystemTunnels {
    fn build(&self, config: &Config) -> Result<Arc<dyn Tunnel>, VpnError> {
        let interface = config.interface.clone();
        let tunnel: Arc<dyn Tunnel> = match config.protocol {
            Protocol::WireGuard => {
                info!("Creating WireGuard tunnel");
                Arc::new(WireGuardTunnel::new(
                    config.wireguard.clone(),
                    interface,
                    self.backend.clone(),
                    self.resolver.clone(),
                ))
            }
            Protocol::OpenVpn => {
                info!("Creating OpenVPN tunnel");
                Arc::new(OpenVpnTunnel::new(config.openvpn.clone(), interface, self.resolver.clone()))
            }
            Protocol::Ssh => {
                info!("Creating SSH tunnel");
                Arc::new(SshTunnel::new(
                    config.ssh.clone(),
                    interface,
                    self.backend.clone(),
                    self.resolver.clone(),
                ))
            }
        };
        Ok(tunnel)
    }
}

struct ServiceInner {
    state: ServiceState,
    protocol: Option<Protocol>,
    tunnel: Option<Arc<dyn Tunnel>>,
    /// Parent of everything the current connection runs
    session: Option<CancellationToken>,
    connected_at: Option<SystemTime>,
    last_error: Option<String>,
    /// Connected when the system went to sleep
    resume: bool,
}

/// VPN Service
pub struct VpnService {
    config: RwLock<Arc<Config>>,
    backend: Arc<dyn NetworkBackend>,
    tunnels: Arc<dyn TunnelFactory>,
    resolver: Arc<dyn HostResolver>,
    routing: Arc<RoutingEngine>,
    dns: DnsEngine,
    kill_switch: KillSwitch,
    inner: RwLock<ServiceInner>,
    listener: Mutex<Option<StatusListener>>,
    /// Pending debounced network-change reconnect
    network_change: Mutex<Option<CancellationToken>>,
    cancel: CancellationToken,
}

impl VpnService {
    pub fn new(config: Config, backend: Arc<dyn NetworkBackend>, resolver: Arc<dyn HostResolver>) -> Arc<Self> {
        let tunnels = Arc::new(SystemTunnels::new(backend.clone(), resolver.clone()));
        Self::with_tunnels(config, backend, resolver, tunnels)
    }

    pub fn with_tunnels(
        config: Config,
        backend: Arc<dyn NetworkBackend>,
        resolver: Arc<dyn HostResolver>,
        tunnels: Arc<dyn TunnelFactory>,
    ) -> Arc<Self> {
        info!("VPN service initialized");
        Arc::new(Self {
            config: RwLock::new(Arc::new(config)),
            routing: Arc::new(RoutingEngine::new(backend.clone(), resolver.clone())),
            dns: DnsEngine::new(backend.clone()),
            kill_switch: KillSwitch::new(backend.clone()),
            backend,
            tunnels,
            resolver,
            inner: RwLock::new(ServiceInner {
                state: ServiceState::Disconnected,
                protocol: None,
                tunnel: None,
                session: None,
                connected_at: None,
                last_error: None,
                resume: false,
            }),
            listener: Mutex::new(None),
            network_change: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.read().clone()
    }

    /// Replace the configuration. Takes effect on the next connect.
    pub fn update_config(&self, config: Config) {
        *self.config.write() = Arc::new(config);
    }

    pub fn set_status_listener(&self, listener: StatusListener) {
        *self.listener.lock() = Some(listener);
    }

    pub fn state(&self) -> ServiceState {
        self.inner.read().state
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.inner.read().tunnel.as_ref().and_then(|t| t.local_ip())
    }

    pub fn kill_switch(&self) -> &KillSwitch {
        &self.kill_switch
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.routing.routes().await
    }

    pub fn status(&self) -> StatusPayload {
        let inner = self.inner.read();
        let mut status = StatusPayload {
            state: inner.state,
            protocol: None,
            server_address: None,
            local_ip: None,
            connected_at: inner
                .connected_at
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs()),
            bytes_sent: 0,
            bytes_received: 0,
            error: inner.last_error.clone(),
        };
        if let Some(tunnel) = &inner.tunnel {
            let stats = tunnel.stats();
            status.protocol = inner.protocol;
            status.server_address = tunnel.server_ip();
            status.local_ip = tunnel.local_ip();
            status.bytes_sent = stats.bytes_sent;
            status.bytes_received = stats.bytes_received;
        }
        status
    }

    fn broadcast(&self) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener(&self.status());
        }
    }

    fn set_state(&self, state: ServiceState) {
        self.inner.write().state = state;
        self.broadcast();
    }

    /// Record `err` as the last error, move to Error and hand it back.
    fn fail(&self, err: VpnError) -> VpnError {
        {
            let mut inner = self.inner.write();
            inner.state = ServiceState::Error;
            inner.last_error = Some(err.to_string());
        }
        self.broadcast();
        err
    }

    /// Connect automatically after a short settle delay when configured.
    pub fn start(self: &Arc<Self>) {
        info!("Starting VPN service");
        if !self.config().autostart {
            return;
        }

        info!("Auto-connect enabled, connecting in {:?}", AUTOSTART_DELAY);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = service.cancel.cancelled() => {}
                _ = tokio::time::sleep(AUTOSTART_DELAY) => {
                    if let Err(e) = service.connect().await {
                        warn!("Auto-connect failed: {}", e);
                    }
                }
            }
        });
    }

    /// Disconnect if needed and stop all background work.
    pub async fn shutdown(self: &Arc<Self>) {
        info!("Stopping VPN service");
        if self.state() != ServiceState::Disconnected {
            self.disconnect().await;
        }
        self.cancel.cancel();
        info!("VPN service stopped");
    }

    /// Remove firewall rules left by a process that died while armed.
    pub async fn reconcile(&self) -> Result<(), VpnError> {
        info!("Removing stale kill switch rules ({})", self.kill_switch.tag());
        self.kill_switch.purge().await?;
        Ok(())
    }

    /// Bring the VPN up.
    pub async fn connect(self: &Arc<Self>) -> Result<(), VpnError> {
        {
            let mut inner = self.inner.write();
            if matches!(inner.state, ServiceState::Connected | ServiceState::Connecting) {
                warn!("Connection attempt ignored: already connected or connecting");
                return Err(VpnError::AlreadyConnected);
            }
            inner.state = ServiceState::Connecting;
        }
        self.broadcast();

        let config = self.config();
        if let Err(e) = config.validate() {
            error!("Configuration validation failed: {}", e);
            return Err(self.fail(e.into()));
        }

        info!("Initiating {} connection", config.protocol);
        let tunnel = match self.tunnels.build(&config) {
            Ok(tunnel) => tunnel,
            Err(e) => return Err(self.fail(e)),
        };

        let kill_switch = config.kill_switch.enabled;
        if kill_switch {
            info!("Enabling kill switch");
            let rules = KillSwitchConfig {
                allow_lan: config.kill_switch.allow_lan,
                vpn_server: self.server_ip(&config).await,
                vpn_interface: Some(config.interface.name.clone()),
                allowed_processes: config.kill_switch.allowed_processes.clone(),
            };
            if let Err(e) = self.kill_switch.enable(rules).await {
                error!("Failed to enable kill switch: {}", e);
                return Err(self.fail(e.into()));
            }
        }

        let session = self.cancel.child_token();
        {
            let mut inner = self.inner.write();
            inner.tunnel = Some(tunnel.clone());
            inner.protocol = Some(config.protocol);
            inner.session = Some(session.clone());
        }

        info!("Starting tunnel");
        let started = match tunnel.start(&session).await {
            Ok(()) => self.wait_connected(tunnel.as_ref()).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = started {
            error!("Tunnel failed to connect: {}", e);
            self.rollback(&tunnel, kill_switch).await;
            return Err(self.fail(e));
        }

        // Subscribe before the next await; the monitor must see every
        // transition after Connected.
        let changes = tunnel.state_changes();

        info!("Tunnel connected, configuring routing");
        self.apply_policy(&config, tunnel.as_ref(), &session).await;

        {
            let mut inner = self.inner.write();
            inner.state = ServiceState::Connected;
            inner.connected_at = Some(SystemTime::now());
            inner.last_error = None;
        }
        info!(
            "VPN connected via {} (local {:?}, server {:?})",
            config.protocol,
            tunnel.local_ip(),
            tunnel.server_ip()
        );
        self.broadcast();

        self.spawn_monitor(tunnel, session, changes);
        Ok(())
    }

    /// Poll the tunnel until it reports Connected.
    async fn wait_connected(&self, tunnel: &dyn Tunnel) -> Result<(), VpnError> {
        for attempt in 1..=CONNECT_POLL_ATTEMPTS {
            match tunnel.state() {
                TunnelState::Connected => return Ok(()),
                TunnelState::Error => return Err(VpnError::TunnelFailed),
                state => debug!("Tunnel state check {}/{}: {}", attempt, CONNECT_POLL_ATTEMPTS, state),
            }
            tokio::time::sleep(CONNECT_POLL_INTERVAL).await;
        }

        match tunnel.state() {
            TunnelState::Connected => Ok(()),
            state => {
                error!("Connection timeout, final tunnel state: {}", state);
                Err(VpnError::Timeout)
            }
        }
    }

    async fn rollback(&self, tunnel: &Arc<dyn Tunnel>, kill_switch: bool) {
        if kill_switch {
            best_effort("Disabling kill switch", self.kill_switch.disable().await);
        }
        best_effort("Stopping tunnel", tunnel.stop().await);

        let session = {
            let mut inner = self.inner.write();
            inner.tunnel = None;
            inner.protocol = None;
            inner.session.take()
        };
        if let Some(session) = session {
            session.cancel();
        }
    }

    /// Routes, DNS and the kill switch interface for a connected tunnel.
    /// Every step is best-effort.
    async fn apply_policy(&self, config: &Config, tunnel: &dyn Tunnel, session: &CancellationToken) {
        let interface = self.tunnel_interface(tunnel).await;
        self.routing
            .initialize(interface.clone(), None, config.interface.metric)
            .await;

        if let Some(server) = tunnel.server_ip() {
            best_effort(
                &format!("Routing VPN server {} via the original gateway", server),
                self.routing.ensure_vpn_server_route(server).await,
            );
        }
        if let Some(gateway) = tunnel.gateway_ip() {
            self.routing.remove_stale_route(gateway).await;
        }

        if config.routing.default_route {
            info!("Default route enabled: routing all traffic through VPN");
            for half in ["0.0.0.0/1", "128.0.0.0/1"] {
                best_effort(
                    &format!("Adding default route {}", half),
                    self.routing.add_route(half, RouteOrigin::Default).await,
                );
            }
        } else {
            info!("Split tunneling: routing {} configured entries", config.routing.include_ips.len());
            if let Some(gateway) = tunnel.gateway_ip() {
                best_effort(
                    "Adding tunnel gateway route",
                    self.routing.add_route(&gateway.to_string(), RouteOrigin::Tunnel).await,
                );
            }
            for entry in &config.routing.include_ips {
                best_effort(
                    &format!("Adding route {}", entry),
                    self.routing.add_route(entry, RouteOrigin::Static).await,
                );
            }
        }

        let mut domains = config.routing.include_domains.clone();
        if let Some(list) = self.route_list() {
            match list.read().await {
                Ok(entries) => {
                    info!(
                        "Loaded {} addresses and {} domains from {}",
                        entries.ips.len(),
                        entries.domains.len(),
                        list.path().display()
                    );
                    for ip in &entries.ips {
                        best_effort(
                            &format!("Adding route {}", ip),
                            self.routing.add_route(ip, RouteOrigin::Static).await,
                        );
                    }
                    domains.extend(entries.domains);
                }
                Err(e) => warn!("Failed to read route list: {}", e),
            }
        }

        if !domains.is_empty() {
            self.routing
                .start_domain_resolver(domains, config.routing.refresh_interval(), session);
        }

        if !config.dns.servers.is_empty() {
            let dns = DnsConfig {
                interface: interface.name.clone(),
                servers: config.dns.servers.clone(),
                split_dns: config.dns.split_dns,
                domains: config.dns.domains.clone(),
            };
            best_effort("DNS configuration", self.dns.configure(&dns).await);
            best_effort("DNS cache flush", self.dns.flush_cache().await);
        }

        if config.kill_switch.enabled {
            best_effort(
                "Updating kill switch interface",
                self.kill_switch.update_vpn_interface(&interface.name).await,
            );
        }
    }

    /// The tunnel's interface: by local address, then by name.
    async fn tunnel_interface(&self, tunnel: &dyn Tunnel) -> InterfaceHandle {
        if let Some(local) = tunnel.local_ip() {
            match self.backend.interface_by_address(local).await {
                Ok(handle) => return handle,
                Err(e) => warn!("No interface holds {}: {}", local, e),
            }
        }
        match self.backend.interface_by_name(tunnel.interface_name()).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Failed to look up {}, using index 0: {}", tunnel.interface_name(), e);
                InterfaceHandle {
                    name: tunnel.interface_name().to_string(),
                    index: 0,
                }
            }
        }
    }

    /// VPN server address for the kill switch, before the tunnel exists.
    async fn server_ip(&self, config: &Config) -> Option<IpAddr> {
        let host = match config.protocol {
            Protocol::OpenVpn => match &config.openvpn.config_path {
                Some(path) => openvpn::read_remote(path).await,
                None => None,
            },
            _ => config.server_host(),
        }?;

        match self.resolver.resolve_one(&host).await {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!("Could not resolve VPN server {} for the kill switch: {}", host, e);
                None
            }
        }
    }

    /// Tear the VPN down. Always ends Disconnected.
    pub async fn disconnect(self: &Arc<Self>) {
        let tunnel = {
            let mut inner = self.inner.write();
            if matches!(inner.state, ServiceState::Disconnected | ServiceState::Disconnecting) {
                return;
            }
            inner.state = ServiceState::Disconnecting;
            inner.tunnel.clone()
        };
        info!("Disconnecting VPN");
        self.broadcast();

        let service = Arc::clone(self);
        let teardown = tokio::spawn(async move { service.teardown(tunnel).await });
        match tokio::time::timeout(DISCONNECT_TIMEOUT, teardown).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Disconnect task failed: {}", e),
            Err(_) => warn!("Disconnect timed out after {:?}, forcing state reset", DISCONNECT_TIMEOUT),
        }

        let session = {
            let mut inner = self.inner.write();
            inner.state = ServiceState::Disconnected;
            inner.tunnel = None;
            inner.protocol = None;
            inner.connected_at = None;
            inner.session.take()
        };
        if let Some(session) = session {
            session.cancel();
        }

        info!("VPN disconnected");
        self.broadcast();
    }

    async fn teardown(&self, tunnel: Option<Arc<dyn Tunnel>>) {
        self.routing.stop_domain_resolver().await;

        info!("Removing VPN routes");
        self.routing.remove_all_routes().await;
        self.routing.remove_vpn_server_route().await;

        info!("Resetting DNS configuration");
        best_effort("DNS reset", self.dns.reset().await);

        if self.kill_switch.is_armed().await {
            info!("Disabling kill switch");
            best_effort("Disabling kill switch", self.kill_switch.disable().await);
        }

        if let Some(tunnel) = tunnel {
            info!("Stopping tunnel");
            best_effort("Stopping tunnel", tunnel.stop().await);
        }
    }

    /// Follow the tunnel's events for the rest of this connection,
    /// re-attaching after each reconnect.
    fn spawn_monitor(
        self: &Arc<Self>,
        tunnel: Arc<dyn Tunnel>,
        session: CancellationToken,
        changes: Option<StateChanges>,
    ) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut current = changes;
            loop {
                let generation = match current.take() {
                    Some(mut changes) => {
                        loop {
                            let change = tokio::select! {
                                _ = session.cancelled() => return,
                                change = changes.recv() => change,
                            };
                            let Some(change) = change else {
                                break;
                            };
                            service.on_tunnel_event(&tunnel, change.state, change.error.unwrap_or(change.message));
                        }
                        changes.generation()
                    }
                    None => {
                        debug!("Tunnel event stream closed before the monitor attached");
                        service.sync_with_tunnel(&tunnel);
                        tunnel.core().events().generation()
                    }
                };

                if !service.is_current(&tunnel) || session.is_cancelled() {
                    return;
                }

                info!("Tunnel event stream closed, re-attaching");
                current = tokio::select! {
                    _ = session.cancelled() => return,
                    next = tunnel.core().events().next_lifecycle(generation) => Some(next),
                };

                // Transitions published before we re-attached
                service.sync_with_tunnel(&tunnel);
            }
        });
    }

    /// Catch up with the tunnel's current state after events were missed.
    fn sync_with_tunnel(self: &Arc<Self>, tunnel: &Arc<dyn Tunnel>) {
        let state = tunnel.state();
        match state {
            TunnelState::Connected | TunnelState::Disconnected | TunnelState::Reconnecting => {
                self.on_tunnel_event(tunnel, state, String::new())
            }
            TunnelState::Error => {
                self.on_tunnel_event(tunnel, state, "tunnel failed while reconnecting".to_string())
            }
            TunnelState::Connecting | TunnelState::Disconnecting => {}
        }
    }

    fn is_current(&self, tunnel: &Arc<dyn Tunnel>) -> bool {
        self.inner
            .read()
            .tunnel
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, tunnel))
    }

    fn on_tunnel_event(self: &Arc<Self>, tunnel: &Arc<dyn Tunnel>, state: TunnelState, detail: String) {
        if !self.is_current(tunnel) {
            return;
        }

        match state {
            TunnelState::Disconnected => {
                let changed = {
                    let mut inner = self.inner.write();
                    let connected = inner.state == ServiceState::Connected;
                    if connected {
                        inner.state = ServiceState::Disconnected;
                    }
                    connected
                };
                if changed {
                    self.broadcast();
                }
            }
            TunnelState::Error => {
                let was_connected = self.state() == ServiceState::Connected;
                self.fail(VpnError::Tunnel(TunnelError::Protocol(detail)));
                if was_connected {
                    info!("Tunnel reported an error, reconnecting");
                    let tunnel = tunnel.clone();
                    tokio::spawn(async move {
                        if let Err(e) = tunnel.reconnect().await {
                            warn!("Reconnect failed: {}", e);
                        }
                    });
                }
            }
            TunnelState::Reconnecting => self.set_state(ServiceState::Connecting),
            TunnelState::Connected => {
                {
                    let mut inner = self.inner.write();
                    if inner.state == ServiceState::Connected {
                        return;
                    }
                    inner.state = ServiceState::Connected;
                    inner.connected_at.get_or_insert_with(SystemTime::now);
                    inner.last_error = None;
                }
                self.broadcast();
            }
            TunnelState::Connecting | TunnelState::Disconnecting => {}
        }
    }

    /// System power hook. Suspend disconnects and remembers; resume
    /// reconnects once networking has had time to settle.
    pub async fn handle_power_event(self: &Arc<Self>, suspend: bool) {
        if suspend {
            let connected = {
                let mut inner = self.inner.write();
                inner.resume = inner.state == ServiceState::Connected;
                inner.resume
            };
            if connected {
                info!("System suspending, disconnecting");
                self.disconnect().await;
            }
            return;
        }

        let resume = std::mem::take(&mut self.inner.write().resume);
        if !resume {
            return;
        }

        info!("System resumed, reconnecting in {:?}", RESUME_DELAY);
        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = service.cancel.cancelled() => {}
                _ = tokio::time::sleep(RESUME_DELAY) => {
                    if let Err(e) = service.connect().await {
                        warn!("Reconnect after resume failed: {}", e);
                    }
                }
            }
        });
    }

    /// Network change hook. Signals within the debounce window collapse
    /// into one tunnel reconnect.
    pub fn handle_network_change(self: &Arc<Self>) {
        if self.state() != ServiceState::Connected {
            return;
        }

        let token = self.cancel.child_token();
        if let Some(previous) = self.network_change.lock().replace(token.clone()) {
            previous.cancel();
        }

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(NETWORK_CHANGE_DEBOUNCE) => {}
            }
            let tunnel = service.inner.read().tunnel.clone();
            if let Some(tunnel) = tunnel {
                info!("Network changed, reconnecting tunnel");
                if let Err(e) = tunnel.reconnect().await {
                    warn!("Reconnect after network change failed: {}", e);
                }
            }
        });
    }

    fn route_list(&self) -> Option<RouteList> {
        self.config().routing.route_list.clone().map(RouteList::new)
    }

    fn require_route_list(&self) -> Result<RouteList, VpnError> {
        self.route_list().ok_or(VpnError::NoRouteList)
    }

    pub async fn route_entries(&self) -> Result<RouteEntries, VpnError> {
        Ok(self.require_route_list()?.read().await?)
    }

    pub async fn check_route_list_writable(&self) -> Result<(), VpnError> {
        Ok(self.require_route_list()?.check_writable().await?)
    }

    /// Append to the route list and, while connected, route it right away.
    pub async fn add_route_entry(&self, value: &str) -> Result<bool, VpnError> {
        let added = self.require_route_list()?.append(value).await?;
        info!("Route entry added: {}", value);

        if self.state() == ServiceState::Connected {
            let value = value.trim();
            if looks_like_ip(value) {
                best_effort(
                    &format!("Adding route {}", value),
                    self.routing.add_route(value, RouteOrigin::Static).await,
                );
            } else {
                best_effort(
                    &format!("Adding domain route {}", value),
                    self.routing.add_domain_route(value).await,
                );
            }
        }
        Ok(added)
    }

    /// Delete from the route list and, while connected, drop its route.
    /// Domain routes stay until the next connect.
    pub async fn remove_route_entry(&self, value: &str) -> Result<bool, VpnError> {
        let removed = self.require_route_list()?.delete(value).await?;
        info!("Route entry removed: {}", value);

        if self.state() == ServiceState::Connected {
            let value = value.trim();
            if looks_like_ip(value) {
                self.routing.remove_route(value).await;
            } else {
                debug!("Resolved routes for {} remain until reconnect", value);
            }
        }
        Ok(removed)
    }
}

/// Service errors
#[derive(Debug, thiserror::Error)]
pub enum VpnError {
    #[error("already connected or connecting")]
    AlreadyConnected,

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Tunnel(#[from] TunnelError),

    #[error("failed to enable kill switch: {0}")]
    KillSwitch(#[from] KillSwitchError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),

    #[error("Route list error: {0}")]
    RouteList(#[from] RouteListError),

    #[error("no route list file configured")]
    NoRouteList,

    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("tunnel connection failed")]
    TunnelFailed,

    #[error("connection timeout")]
    Timeout,
}
