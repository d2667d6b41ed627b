//! SSH tunnel
//!
//! A VPN without a VPN protocol: the client and the server each get a TUN
//! device and packets are bridged between them over an SSH session.
//!
//! ```text
//!   veil0 ──► uplink pump ──► [len][pkt] ──► ssh stdin  ──► forwarder ──► tun0
//!   veil0 ◄── downlink pump ◄─ [len][pkt] ◄── ssh stdout ◄── forwarder ◄── tun0
//! ```

mod bridge;
pub mod framing;
pub mod keepalive;
pub mod remote;
mod transport;

pub use transport::{RemoteLink, Ssh2Transport, SshLogin, SshTransport};

use crate::backend::NetworkBackend;
use crate::config::{InterfaceConfig, Protocol, SshConfig, local_tun_net};
use crate::tun::TunAdapter;
use crate::tunnel::{Tunnel, TunnelAddresses, TunnelCore, TunnelError, TunnelState};
use async_trait::async_trait;
use bridge::Bridge;
use keepalive::KeepaliveOutcome;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use veil_net::HostResolver;

/// How long a stop waits for the pumps
const PUMP_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

struct Session {
    adapter: TunAdapter,
    bridge: Bridge,
    cancel: CancellationToken,
}

struct Inner {
    core: TunnelCore,
    config: SshConfig,
    interface: InterfaceConfig,
    backend: Arc<dyn NetworkBackend>,
    resolver: Arc<dyn HostResolver>,
    transport: Arc<dyn SshTransport>,
    session: Mutex<Option<Session>>,
    parent: parking_lot::Mutex<Option<CancellationToken>>,
}

/// SSH tunnel. Clones are handles to the same tunnel.
#[derive(Clone)]
pub struct SshTunnel {
    inner: Arc<Inner>,
}

impl SshTunnel {
    pub fn new(
        config: SshConfig,
        interface: InterfaceConfig,
        backend: Arc<dyn NetworkBackend>,
        resolver: Arc<dyn HostResolver>,
    ) -> Self {
        Self::with_transport(config, interface, backend, resolver, Arc::new(Ssh2Transport))
    }

    pub fn with_transport(
        config: SshConfig,
        interface: InterfaceConfig,
        backend: Arc<dyn NetworkBackend>,
        resolver: Arc<dyn HostResolver>,
        transport: Arc<dyn SshTransport>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: TunnelCore::new(Protocol::Ssh, interface.name.clone()),
                config,
                interface,
                backend,
                resolver,
                transport,
                session: Mutex::new(None),
                parent: parking_lot::Mutex::new(None),
            }),
        }
    }

    async fn bring_up(&self, parent: &CancellationToken) -> Result<Session, TunnelError> {
        let inner = &self.inner;
        let config = &inner.config;

        let local = local_tun_net(&config.local_tun_addr)
            .ok_or_else(|| TunnelError::Config(format!("invalid local address '{}'", config.local_tun_addr)))?;
        let remote: IpAddr = config
            .remote_tun_addr
            .split('/')
            .next()
            .unwrap_or_default()
            .trim()
            .parse()
            .map_err(|_| TunnelError::Config(format!("invalid remote address '{}'", config.remote_tun_addr)))?;

        let server = inner
            .resolver
            .resolve_one(&config.host)
            .await
            .map_err(|e| TunnelError::resolve(&config.host, e))?;
        info!("Resolved SSH server {} to {}", config.host, server);
        inner.core.set_addresses(TunnelAddresses {
            local: Some(local.addr()),
            gateway: Some(remote),
            server: Some(server),
        });

        let login = inner
            .transport
            .connect(SocketAddr::new(server, config.port), config)
            .await?;

        let adapter = TunAdapter::create(inner.backend.clone(), &inner.interface.name, inner.interface.mtu).await?;
        let cancel = parent.child_token();

        let started: Result<Bridge, TunnelError> = async {
            adapter.configure(local, None).await?;
            let link = login
                .start_forwarder(remote::setup_command(&config.user, local, remote), cancel.clone())
                .await?;
            adapter.up().await?;
            let probe = link.probe.clone();
            let bridge = Bridge::start(
                adapter.device(),
                link.outbound,
                link.inbound,
                inner.core.counters().clone(),
                &cancel,
            );
            self.spawn_keepalive(probe, cancel.clone());
            Ok(bridge)
        }
        .await;

        match started {
            Ok(bridge) => Ok(Session {
                adapter,
                bridge,
                cancel,
            }),
            Err(e) => {
                cancel.cancel();
                adapter.close().await;
                Err(e)
            }
        }
    }

    fn spawn_keepalive(&self, probe: Arc<dyn keepalive::KeepaliveProbe>, cancel: CancellationToken) {
        let tunnel = self.clone();
        let interval = self.inner.config.keepalive_interval();
        let retries = self.inner.config.keepalive_retries();

        tokio::spawn(async move {
            let outcome = keepalive::run(&*probe, interval, retries, &cancel).await;
            if let KeepaliveOutcome::Dead { failures } = outcome {
                if cancel.is_cancelled() {
                    return;
                }
                warn!("SSH keepalive: {} consecutive failures, reconnecting", failures);
                tokio::spawn(async move {
                    if let Err(e) = tunnel.reconnect().await {
                        warn!("SSH reconnect failed: {}", e);
                    }
                });
            }
        });
    }
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let mut session = self.inner.session.lock().await;
        self.inner.core.begin_start()?;
        *self.inner.parent.lock() = Some(cancel.clone());

        match self.bring_up(cancel).await {
            Ok(up) => {
                *session = Some(up);
                self.inner.core.transition(TunnelState::Connected, "SSH tunnel established");
                info!("SSH tunnel fully established");
                Ok(())
            }
            Err(e) => {
                self.inner.core.fail("Failed to start SSH tunnel", &e);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        let mut session = self.inner.session.lock().await;
        if !self.inner.core.begin_stop() {
            return Ok(());
        }

        if let Some(up) = session.take() {
            up.cancel.cancel();
            up.adapter.close().await;
            up.bridge.join(PUMP_JOIN_TIMEOUT).await;
        }

        self.inner.core.finish_stop();
        info!("SSH tunnel stopped");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TunnelError> {
        self.inner.core.transition(TunnelState::Reconnecting, "Reconnecting");
        self.stop().await?;
        self.inner.core.events().reopen();

        let parent = self
            .inner
            .parent
            .lock()
            .clone()
            .filter(|token| !token.is_cancelled())
            .unwrap_or_default();
        self.start(&parent).await
    }

    fn core(&self) -> &TunnelCore {
        &self.inner.core
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{BackendCall, RecordingBackend};
    use bytes::{BufMut, Bytes, BytesMut};
    use keepalive::KeepaliveProbe;
    use parking_lot::Mutex as SyncMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;
    use veil_net::StaticResolver;

    /// Remote ends of a fake forwarder
    struct FakeRemote {
        stdin: mpsc::Receiver<Bytes>,
        stdout: mpsc::Sender<Bytes>,
        command: String,
    }

    #[derive(Default)]
    struct FakeTransport {
        connects: AtomicUsize,
        reject_forwarder: AtomicBool,
        dead: Arc<AtomicBool>,
        remotes: SyncMutex<Vec<FakeRemote>>,
    }

    struct FakeProbe(Arc<AtomicBool>);

    #[async_trait]
    impl KeepaliveProbe for FakeProbe {
        async fn ping(&self) -> Result<(), String> {
            if self.0.load(Ordering::SeqCst) {
                Err("no reply".to_string())
            } else {
                Ok(())
            }
        }
    }

    struct FakeLogin(Arc<FakeTransport>);

    #[async_trait]
    impl SshTransport for Arc<FakeTransport> {
        async fn connect(&self, _server: SocketAddr, _config: &SshConfig) -> Result<Box<dyn SshLogin>, TunnelError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeLogin(self.clone())))
        }
    }

    #[async_trait]
    impl SshLogin for FakeLogin {
        async fn start_forwarder(
            self: Box<Self>,
            command: String,
            _cancel: CancellationToken,
        ) -> Result<RemoteLink, TunnelError> {
            if self.0.reject_forwarder.load(Ordering::SeqCst) {
                return Err(TunnelError::Protocol("unexpected signal from remote".into()));
            }
            let (outbound, stdin) = mpsc::channel(16);
            let (stdout, inbound) = mpsc::channel(16);
            self.0.remotes.lock().push(FakeRemote { stdin, stdout, command });
            Ok(RemoteLink {
                outbound,
                inbound,
                probe: Arc::new(FakeProbe(self.0.dead.clone())),
            })
        }
    }

    fn config() -> SshConfig {
        SshConfig {
            host: "bastion.example.com".to_string(),
            user: "deploy".to_string(),
            password: Some("hunter2".to_string()),
            ..SshConfig::default()
        }
    }

    fn tunnel(backend: Arc<RecordingBackend>, transport: Arc<FakeTransport>) -> SshTunnel {
        let resolver = StaticResolver::new().with_host("bastion.example.com", &["198.51.100.4".parse().unwrap()]);
        SshTunnel::with_transport(
            config(),
            InterfaceConfig::default(),
            backend,
            Arc::new(resolver),
            Arc::new(transport),
        )
    }

    #[tokio::test]
    async fn test_start_bridges_packets() {
        let backend = Arc::new(RecordingBackend::new());
        let transport = Arc::new(FakeTransport::default());
        let tunnel = tunnel(backend.clone(), transport.clone());

        tunnel.start(&CancellationToken::new()).await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Connected);
        assert_eq!(tunnel.local_ip(), Some("10.0.0.2".parse().unwrap()));
        assert_eq!(tunnel.gateway_ip(), Some("10.0.0.1".parse().unwrap()));
        assert_eq!(tunnel.server_ip(), Some("198.51.100.4".parse().unwrap()));

        let mut remote = transport.remotes.lock().remove(0);
        assert!(remote.command.contains("VEIL_LOCAL=10.0.0.1 VEIL_PEER=10.0.0.2"));

        let mut tun = backend.take_tun_handle().unwrap();
        tun.inject.send(vec![0x45, 0, 0, 20]).await.unwrap();
        let frame = remote.stdin.recv().await.unwrap();
        assert_eq!(&frame[..], &[0, 4, 0x45, 0, 0, 20]);

        let mut reply = BytesMut::new();
        reply.put_u16(2);
        reply.extend_from_slice(&[0x60, 0]);
        remote.stdout.send(reply.freeze()).await.unwrap();
        assert_eq!(tun.written.recv().await.unwrap(), vec![0x60, 0]);

        tunnel.stop().await.unwrap();
        assert_eq!(tunnel.state(), TunnelState::Disconnected);
        assert!(backend.calls().contains(&BackendCall::LinkState("veil0".to_string(), false)));
    }

    #[tokio::test]
    async fn test_double_start_rejected() {
        let backend = Arc::new(RecordingBackend::new());
        let transport = Arc::new(FakeTransport::default());
        let tunnel = tunnel(backend.clone(), transport.clone());
        let cancel = CancellationToken::new();

        tunnel.start(&cancel).await.unwrap();
        let calls = backend.calls().len();
        assert!(matches!(tunnel.start(&cancel).await, Err(TunnelError::AlreadyConnected)));
        assert_eq!(backend.calls().len(), calls);
        assert_eq!(transport.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_forwarder_failure_releases_adapter() {
        let backend = Arc::new(RecordingBackend::new());
        let transport = Arc::new(FakeTransport::default());
        transport.reject_forwarder.store(true, Ordering::SeqCst);
        let tunnel = tunnel(backend.clone(), transport);

        let err = tunnel.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Protocol(_)));
        assert_eq!(tunnel.state(), TunnelState::Error);
        assert!(!backend.calls().contains(&BackendCall::LinkState("veil0".to_string(), true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keepalive_failures_trigger_reconnect() {
        let backend = Arc::new(RecordingBackend::new());
        let transport = Arc::new(FakeTransport::default());
        let tunnel = tunnel(backend, transport.clone());
        tunnel.start(&CancellationToken::new()).await.unwrap();

        transport.dead.store(true, Ordering::SeqCst);
        // three missed pings at the default ten-second interval
        tokio::time::sleep(Duration::from_secs(31)).await;
        transport.dead.store(false, Ordering::SeqCst);

        for _ in 0..50 {
            if transport.connects.load(Ordering::SeqCst) == 2 && tunnel.state() == TunnelState::Connected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(transport.connects.load(Ordering::SeqCst), 2);
        assert_eq!(tunnel.state(), TunnelState::Connected);

        tunnel.stop().await.unwrap();
    }
}
