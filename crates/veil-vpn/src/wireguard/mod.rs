//! WireGuard tunnel
//!
//! Brings up a TUN adapter and runs an in-process WireGuard device engine
//! on it. There is no retry loop here: a reconnect is a stop followed by
//! a start.

mod engine;

pub use engine::{BoringtunEngine, DeviceEngine, EngineFactory, boringtun_engines};

use crate::backend::NetworkBackend;
use crate::config::{InterfaceConfig, Protocol, WireGuardConfig, split_host_port};
use crate::keys::{PresharedKey, PrivateKey, PublicKey};
use crate::tun::TunAdapter;
use crate::tunnel::{Tunnel, TunnelAddresses, TunnelCore, TunnelError, TunnelState};
use async_trait::async_trait;
use ipnet::IpNet;
use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use veil_net::HostResolver;

/// Device configuration block for one peer routing everything.
pub fn uapi_config(
    private_key: &PrivateKey,
    public_key: &PublicKey,
    preshared_key: Option<&PresharedKey>,
    endpoint: SocketAddr,
    persistent_keepalive: u16,
) -> String {
    let mut config = String::new();
    let _ = writeln!(config, "private_key={}", private_key.to_hex());
    let _ = writeln!(config, "public_key={}", public_key.to_hex());
    if let Some(psk) = preshared_key {
        let _ = writeln!(config, "preshared_key={}", psk.to_hex());
    }
    let _ = writeln!(config, "endpoint={}", endpoint);
    config.push_str("allowed_ip=0.0.0.0/0\n");
    config.push_str("allowed_ip=::/0\n");
    if persistent_keepalive > 0 {
        let _ = writeln!(config, "persistent_keepalive_interval={}", persistent_keepalive);
    }
    config
}

/// The tunnel gateway: the masked network address plus one.
pub fn gateway_for(address: IpNet) -> IpAddr {
    match address.trunc().addr() {
        IpAddr::V4(network) => u32::from(network)
            .checked_add(1)
            .map_or(IpAddr::V4(network), |host| IpAddr::V4(Ipv4Addr::from(host))),
        IpAddr::V6(network) => u128::from(network)
            .checked_add(1)
            .map_or(IpAddr::V6(network), |host| IpAddr::V6(Ipv6Addr::from(host))),
    }
}

struct Session {
    adapter: TunAdapter,
    engine: Box<dyn DeviceEngine>,
    cancel: CancellationToken,
}

/// WireGuard tunnel
pub struct WireGuardTunnel {
    core: TunnelCore,
    config: WireGuardConfig,
    interface: InterfaceConfig,
    backend: Arc<dyn NetworkBackend>,
    resolver: Arc<dyn HostResolver>,
    engines: EngineFactory,
    session: Mutex<Option<Session>>,
    parent: parking_lot::Mutex<Option<CancellationToken>>,
}

impl WireGuardTunnel {
    pub fn new(
        config: WireGuardConfig,
        interface: InterfaceConfig,
        backend: Arc<dyn NetworkBackend>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self::with_engine(config, interface, backend, resolver, boringtun_engines())
    }

    /// Use a different device engine.
    pub fn with_engine(
        config: WireGuardConfig,
        interface: InterfaceConfig,
        backend: Arc<dyn NetworkBackend>,
        resolver: Arc<dyn HostResolver>,
        engines: EngineFactory,
    ) -> Self {
        Self {
            core: TunnelCore::new(Protocol::WireGuard, interface.name.clone()),
            config,
            interface,
            backend,
            resolver,
            engines,
            session: Mutex::new(None),
            parent: parking_lot::Mutex::new(None),
        }
    }

    async fn bring_up(&self, parent: &CancellationToken) -> Result<Session, TunnelError> {
        let address: IpNet = self
            .config
            .address
            .trim()
            .parse()
            .map_err(|_| TunnelError::Config(format!("invalid address '{}'", self.config.address)))?;

        let (host, port) = split_host_port(&self.config.peer.endpoint).ok_or_else(|| {
            TunnelError::Config(format!("invalid endpoint '{}'", self.config.peer.endpoint))
        })?;

        let private_key = PrivateKey::from_base64(&self.config.private_key)
            .map_err(|e| TunnelError::Config(format!("invalid private key: {e}")))?;
        let public_key = PublicKey::from_base64(&self.config.peer.public_key)
            .map_err(|e| TunnelError::Config(format!("invalid public key: {e}")))?;
        let preshared_key = match self.config.peer.preshared_key.as_deref() {
            Some(psk) if !psk.trim().is_empty() => Some(
                PresharedKey::from_base64(psk)
                    .map_err(|e| TunnelError::Config(format!("invalid preshared key: {e}")))?,
            ),
            _ => None,
        };

        let server = self
            .resolver
            .resolve_one(host)
            .await
            .map_err(|e| TunnelError::resolve(host, e))?;
        self.core.set_addresses(TunnelAddresses {
            local: Some(address.addr()),
            gateway: None,
            server: Some(server),
        });

        let uapi = uapi_config(
            &private_key,
            &public_key,
            preshared_key.as_ref(),
            SocketAddr::new(server, port),
            self.config.peer.persistent_keepalive,
        );

        let adapter =
            TunAdapter::create(self.backend.clone(), &self.interface.name, self.interface.mtu).await?;
        if let Err(e) = adapter.configure(address, None).await {
            adapter.close().await;
            return Err(e.into());
        }

        let mut engine = (self.engines)(adapter.device(), self.core.counters().clone());
        let cancel = parent.child_token();

        let started: Result<(), TunnelError> = async {
            engine.configure(&uapi).await?;
            engine.up(&cancel).await?;
            adapter.up().await?;
            Ok(())
        }
        .await;

        if let Err(e) = started {
            cancel.cancel();
            engine.close().await;
            adapter.close().await;
            return Err(e);
        }

        self.core.set_addresses(TunnelAddresses {
            local: Some(address.addr()),
            gateway: Some(gateway_for(address)),
            server: Some(server),
        });

        Ok(Session {
            adapter,
            engine,
            cancel,
        })
    }
}

#[async_trait]
impl Tunnel for WireGuardTunnel {
    async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let mut session = self.session.lock().await;
        self.core.begin_start()?;
        *self.parent.lock() = Some(cancel.clone());

        match self.bring_up(cancel).await {
            Ok(up) => {
                *session = Some(up);
                self.core.transition(TunnelState::Connected, "WireGuard tunnel established");
                info!("WireGuard connected to {:?}", self.core.addresses().server);
                Ok(())
            }
            Err(e) => {
                self.core.fail("Failed to start WireGuard tunnel", &e);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        let mut session = self.session.lock().await;
        if !self.core.begin_stop() {
            return Ok(());
        }

        if let Some(mut up) = session.take() {
            up.cancel.cancel();
            up.engine.close().await;
            up.adapter.close().await;
        }

        self.core.finish_stop();
        info!("WireGuard tunnel stopped");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TunnelError> {
        self.core.transition(TunnelState::Reconnecting, "Reconnecting");
        self.stop().await?;
        self.core.events().reopen();

        let parent = self
            .parent
            .lock()
            .clone()
            .filter(|token| !token.is_cancelled())
            .unwrap_or_default();
        self.start(&parent).await
    }

    fn core(&self) -> &TunnelCore {
        &self.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{BackendCall, RecordingBackend};
    use crate::tun::TunDevice;
    use crate::tunnel::TrafficCounters;
    use veil_net::StaticResolver;

    const PRIVATE: &str = "dwdtCnMYpX08FsFyUbJmRd9ML4frwJkqsXf7pR25LCo=";
    const PEER: &str = "hSDwCYkwp1R0i33ctD73Wg2/Og0mOBr066SpjqqbTmo=";

    #[derive(Default)]
    struct EngineLog {
        configured: parking_lot::Mutex<Vec<String>>,
        closed: parking_lot::Mutex<usize>,
        fail_up: bool,
    }

    struct FakeEngine(Arc<EngineLog>);

    #[async_trait]
    impl DeviceEngine for FakeEngine {
        async fn configure(&mut self, uapi: &str) -> Result<(), TunnelError> {
            self.0.configured.lock().push(uapi.to_string());
            Ok(())
        }

        async fn up(&mut self, _cancel: &CancellationToken) -> Result<(), TunnelError> {
            if self.0.fail_up {
                return Err(TunnelError::Device("bind failed".into()));
            }
            Ok(())
        }

        async fn close(&mut self) {
            *self.0.closed.lock() += 1;
        }
    }

    fn fake_engines(log: Arc<EngineLog>) -> EngineFactory {
        Arc::new(move |_device: Arc<dyn TunDevice>, _counters: Arc<TrafficCounters>| {
            Box::new(FakeEngine(log.clone())) as Box<dyn DeviceEngine>
        })
    }

    fn config() -> WireGuardConfig {
        let mut config = WireGuardConfig::default();
        config.private_key = PRIVATE.to_string();
        config.peer.public_key = PEER.to_string();
        config.peer.endpoint = "vpn.example.com:51820".to_string();
        config
    }

    fn tunnel(backend: Arc<RecordingBackend>, log: Arc<EngineLog>) -> WireGuardTunnel {
        let resolver = StaticResolver::new().with_host("vpn.example.com", &["203.0.113.7".parse().unwrap()]);
        WireGuardTunnel::with_engine(
            config(),
            InterfaceConfig::default(),
            backend,
            Arc::new(resolver),
            fake_engines(log),
        )
    }

    #[test]
    fn test_device_config_routes_everything() {
        let private = PrivateKey::from_base64(PRIVATE).unwrap();
        let public = PublicKey::from_base64(PEER).unwrap();
        let uapi = uapi_config(&private, &public, None, "203.0.113.7:51820".parse().unwrap(), 25);

        assert!(uapi.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(uapi.contains("allowed_ip=::/0\n"));
        assert!(uapi.contains("persistent_keepalive_interval=25\n"));
        assert!(uapi.contains("endpoint=203.0.113.7:51820\n"));
        assert!(uapi.contains(&format!("public_key={}\n", public.to_hex())));
        assert!(!uapi.contains("preshared_key"));

        let quiet = uapi_config(&private, &public, None, "203.0.113.7:51820".parse().unwrap(), 0);
        assert!(!quiet.contains("persistent_keepalive_interval"));
    }

    #[test]
    fn test_gateway() {
        assert_eq!(gateway_for("10.0.0.2/24".parse().unwrap()), "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(gateway_for("172.16.5.9/16".parse().unwrap()), "172.16.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(gateway_for("10.0.0.130/25".parse().unwrap()), "10.0.0.129".parse::<IpAddr>().unwrap());
        assert_eq!(gateway_for("fd00::2/64".parse().unwrap()), "fd00::1".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let backend = Arc::new(RecordingBackend::new());
        let log = Arc::new(EngineLog::default());
        let tunnel = tunnel(backend.clone(), log.clone());
        let cancel = CancellationToken::new();

        tunnel.start(&cancel).await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Connected);
        assert_eq!(tunnel.local_ip(), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(tunnel.gateway_ip(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(tunnel.server_ip(), Some("203.0.113.7".parse().unwrap()));
        assert!(log.configured.lock()[0].contains("endpoint=203.0.113.7:51820"));

        tunnel.stop().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Disconnected);
        assert_eq!(*log.closed.lock(), 1);
        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::CreateTun("veil0".to_string()),
                BackendCall::AssignAddress("veil0".to_string(), "10.0.0.2/24".to_string()),
                BackendCall::LinkState("veil0".to_string(), true),
                BackendCall::LinkState("veil0".to_string(), false),
            ]
        );

        tunnel.stop().await.unwrap();
        assert_eq!(backend.calls().len(), 4);
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let backend = Arc::new(RecordingBackend::new());
        let tunnel = tunnel(backend.clone(), Arc::new(EngineLog::default()));
        let cancel = CancellationToken::new();

        tunnel.start(&cancel).await.unwrap();
        let calls = backend.calls().len();

        let err = tunnel.start(&cancel).await.unwrap_err();
        assert!(matches!(err, TunnelError::AlreadyConnected));
        assert_eq!(backend.calls().len(), calls);
        assert_eq!(tunnel.state(), TunnelState::Connected);
    }

    #[tokio::test]
    async fn test_engine_failure_tears_down_adapter() {
        let backend = Arc::new(RecordingBackend::new());
        let log = Arc::new(EngineLog {
            fail_up: true,
            ..Default::default()
        });
        let tunnel = tunnel(backend.clone(), log.clone());

        let err = tunnel.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Device(_)));
        assert_eq!(tunnel.state(), TunnelState::Error);
        assert_eq!(*log.closed.lock(), 1);
        assert!(!backend.calls().contains(&BackendCall::LinkState("veil0".to_string(), true)));
    }

    #[tokio::test]
    async fn test_unresolvable_endpoint() {
        let backend = Arc::new(RecordingBackend::new());
        let mut cfg = config();
        cfg.peer.endpoint = "nowhere.example:51820".to_string();
        let tunnel = WireGuardTunnel::with_engine(
            cfg,
            InterfaceConfig::default(),
            backend.clone(),
            Arc::new(StaticResolver::new()),
            fake_engines(Arc::new(EngineLog::default())),
        );

        let err = tunnel.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Resolve { .. }));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_reopens_events() {
        let backend = Arc::new(RecordingBackend::new());
        let tunnel = tunnel(backend, Arc::new(EngineLog::default()));
        let cancel = CancellationToken::new();
        tunnel.start(&cancel).await.unwrap();

        let mut before = tunnel.state_changes().unwrap();
        tunnel.reconnect().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Connected);

        let mut seen = Vec::new();
        while let Some(change) = before.recv().await {
            seen.push(change.state);
        }
        assert_eq!(
            seen,
            vec![
                TunnelState::Reconnecting,
                TunnelState::Disconnecting,
                TunnelState::Disconnected,
            ]
        );

        assert!(tunnel.state_changes().is_some());
    }
}
