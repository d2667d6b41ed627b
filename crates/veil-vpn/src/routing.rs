//! Routing policy engine
//!
//! Decides which destinations go through the tunnel and is the only
//! component that edits the system routing table on the VPN's behalf.
//! Routes are keyed by their canonical prefix, so each one is installed
//! at most once no matter how many sources ask for it.

use crate::backend::{BackendError, InterfaceHandle, NetworkBackend, RouteSpec, best_effort};
use crate::config::parse_destination;
use ipnet::IpNet;
use parking_lot::Mutex as SyncMutex;
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use veil_net::HostResolver;

/// Metric used for the VPN server exception route
const SERVER_ROUTE_METRIC: u32 = 1;

/// Why a route exists
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteOrigin {
    /// Configured include list or local route list
    Static,
    /// Resolved from a domain
    Domain,
    /// Needed by the tunnel itself
    Tunnel,
    /// Half of the full-tunnel default route
    Default,
}

impl fmt::Display for RouteOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RouteOrigin::Static => "static",
            RouteOrigin::Domain => "domain",
            RouteOrigin::Tunnel => "tunnel",
            RouteOrigin::Default => "default",
        };
        f.write_str(name)
    }
}

/// An installed route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub interface: InterfaceHandle,
    pub metric: u32,
    pub origin: RouteOrigin,
    /// Domain this route was resolved from
    pub domain: Option<String>,
}

impl Route {
    fn spec(&self) -> RouteSpec {
        RouteSpec {
            destination: self.destination,
            gateway: self.gateway,
            interface: Some(self.interface.clone()),
            metric: self.metric,
        }
    }
}

struct VpnLink {
    interface: InterfaceHandle,
    gateway: Option<IpAddr>,
    metric: u32,
}

#[derive(Default)]
struct RoutingState {
    link: Option<VpnLink>,
    routes: BTreeMap<String, Route>,
    server_route: Option<RouteSpec>,
}

struct DomainTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Routing policy engine
pub struct RoutingEngine {
    backend: Arc<dyn NetworkBackend>,
    resolver: Arc<dyn HostResolver>,
    state: Mutex<RoutingState>,
    domain_task: SyncMutex<Option<DomainTask>>,
}

impl RoutingEngine {
    pub fn new(backend: Arc<dyn NetworkBackend>, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            backend,
            resolver,
            state: Mutex::new(RoutingState::default()),
            domain_task: SyncMutex::new(None),
        }
    }

    /// Bind the engine to the tunnel interface.
    pub async fn initialize(&self, interface: InterfaceHandle, gateway: Option<IpAddr>, metric: u32) {
        info!(
            "Routing via {} (index {}, metric {})",
            interface.name, interface.index, metric
        );
        self.state.lock().await.link = Some(VpnLink {
            interface,
            gateway,
            metric,
        });
    }

    /// Route `destination` (CIDR or bare address) through the tunnel.
    ///
    /// Returns `false` when the route was already installed.
    pub async fn add_route(&self, destination: &str, origin: RouteOrigin) -> Result<bool, RoutingError> {
        let destination = parse_destination(destination)
            .map_err(|_| RoutingError::InvalidDestination(destination.to_string()))?;
        self.install(destination, origin, None).await
    }

    async fn install(
        &self,
        destination: IpNet,
        origin: RouteOrigin,
        domain: Option<&str>,
    ) -> Result<bool, RoutingError> {
        let key = destination.to_string();
        let mut state = self.state.lock().await;

        if state.routes.contains_key(&key) {
            debug!("Route {} already installed", key);
            return Ok(false);
        }

        let link = state.link.as_ref().ok_or(RoutingError::NotInitialized)?;
        let route = Route {
            destination,
            gateway: link.gateway,
            interface: link.interface.clone(),
            metric: link.metric,
            origin,
            domain: domain.map(str::to_string),
        };

        self.backend.add_route(&route.spec()).await?;
        debug!("Added {} route {}", origin, key);
        state.routes.insert(key, route);
        Ok(true)
    }

    /// Resolve `domain` and route each address. `*.` prefixes are stripped.
    ///
    /// Addresses that fail to install are skipped; returns how many were added.
    pub async fn add_domain_route(&self, domain: &str) -> Result<usize, RoutingError> {
        let host = domain.trim().trim_start_matches("*.");
        let addresses = self
            .resolver
            .resolve(host)
            .await
            .map_err(|e| RoutingError::Resolve {
                domain: domain.to_string(),
                reason: e.to_string(),
            })?;

        let mut added = 0;
        for address in addresses {
            match self.install(IpNet::from(address), RouteOrigin::Domain, Some(host)).await {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!("Skipping {} for {}: {}", address, domain, e),
            }
        }

        if added > 0 {
            info!("Routed {} new addresses for {}", added, domain);
        }
        Ok(added)
    }

    /// Remove one route. Backend failures are logged, never returned.
    pub async fn remove_route(&self, destination: &str) -> bool {
        let Ok(destination) = parse_destination(destination) else {
            warn!("Ignoring removal of invalid destination {}", destination);
            return false;
        };

        let removed = self.state.lock().await.routes.remove(&destination.to_string());
        match removed {
            Some(route) => {
                best_effort(
                    &format!("Removing route {}", route.destination),
                    self.backend.remove_route(&route.spec()).await,
                );
                true
            }
            None => false,
        }
    }

    /// Remove every route this engine installed.
    pub async fn remove_all_routes(&self) {
        let routes = std::mem::take(&mut self.state.lock().await.routes);
        if routes.is_empty() {
            return;
        }

        info!("Removing {} VPN routes", routes.len());
        for route in routes.values() {
            best_effort(
                &format!("Removing route {}", route.destination),
                self.backend.remove_route(&route.spec()).await,
            );
        }
    }

    /// Keep the VPN server reachable through the original default gateway.
    pub async fn ensure_vpn_server_route(&self, server: IpAddr) -> Result<(), RoutingError> {
        let gateway = self.backend.default_gateway().await?;
        let spec = RouteSpec {
            destination: IpNet::from(server),
            gateway: Some(gateway.address),
            interface: Some(gateway.interface),
            metric: SERVER_ROUTE_METRIC,
        };

        let mut state = self.state.lock().await;
        if state.server_route.as_ref() == Some(&spec) {
            return Ok(());
        }

        self.backend.add_route(&spec).await?;
        info!("VPN server {} routed via {}", server, gateway.address);
        state.server_route = Some(spec);
        Ok(())
    }

    pub async fn remove_vpn_server_route(&self) {
        let spec = self.state.lock().await.server_route.take();
        if let Some(spec) = spec {
            best_effort(
                &format!("Removing VPN server route {}", spec.destination),
                self.backend.remove_route(&spec).await,
            );
        }
    }

    /// Drop a host route left behind by someone else. Not tracked.
    pub async fn remove_stale_route(&self, address: IpAddr) {
        let spec = RouteSpec {
            destination: IpNet::from(address),
            gateway: None,
            interface: None,
            metric: 0,
        };
        if self.backend.remove_route(&spec).await.is_ok() {
            debug!("Removed stale route to {}", address);
        }
    }

    pub async fn routes(&self) -> Vec<Route> {
        self.state.lock().await.routes.values().cloned().collect()
    }

    /// Re-resolve `domains` now and then every `interval` until stopped.
    pub fn start_domain_resolver(
        self: &Arc<Self>,
        domains: Vec<String>,
        interval: Duration,
        parent: &CancellationToken,
    ) {
        let mut slot = self.domain_task.lock();
        if let Some(previous) = slot.take() {
            previous.cancel.cancel();
        }

        let cancel = parent.child_token();
        let engine = Arc::clone(self);
        let token = cancel.clone();
        info!(
            "Starting domain resolver for {} domains every {:?}",
            domains.len(),
            interval
        );

        let handle = tokio::spawn(async move {
            loop {
                for domain in &domains {
                    if token.is_cancelled() {
                        return;
                    }
                    if let Err(e) = engine.add_domain_route(domain).await {
                        warn!("Domain resolution failed: {}", e);
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        *slot = Some(DomainTask { cancel, handle });
    }

    pub async fn stop_domain_resolver(&self) {
        let task = self.domain_task.lock().take();
        if let Some(task) = task {
            task.cancel.cancel();
            if let Err(e) = task.handle.await {
                warn!("Domain resolver ended abnormally: {}", e);
            }
            debug!("Domain resolver stopped");
        }
    }

    pub fn domain_resolver_running(&self) -> bool {
        self.domain_task
            .lock()
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }
}

/// Routing errors
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Routing engine is not bound to an interface")]
    NotInitialized,

    #[error("Invalid route destination '{0}'")]
    InvalidDestination(String),

    #[error("Failed to resolve {domain}: {reason}")]
    Resolve { domain: String, reason: String },

    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),
}
