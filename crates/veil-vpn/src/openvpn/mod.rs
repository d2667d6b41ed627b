//! OpenVPN tunnel
//!
//! Drives an external `openvpn` process through its management interface.
//! The daemon is started on hold, released once the management socket is
//! attached, and considered up when it reports `CONNECTED`.

pub mod management;

use crate::config::{InterfaceConfig, OpenVpnConfig, Protocol};
use crate::tunnel::{Tunnel, TunnelCore, TunnelError, TunnelState};
use async_trait::async_trait;
use management::{ManagementEvent, ManagementLines, ManagementWriter, RemoteState};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use veil_net::HostResolver;

/// Local port the management interface listens on
pub const MANAGEMENT_PORT: u16 = 17166;

const BINARY: &str = if cfg!(windows) { "openvpn.exe" } else { "openvpn" };
const STARTUP_DELAY: Duration = Duration::from_millis(500);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const EXIT_GRACE: Duration = Duration::from_secs(3);

/// First `remote` directive of a profile: host and optional port.
pub fn parse_remote(profile: &str) -> Option<(String, Option<u16>)> {
    profile.lines().find_map(|line| {
        let mut tokens = line.split_whitespace();
        if tokens.next()? != "remote" {
            return None;
        }
        let host = tokens.next()?.to_string();
        let port = tokens.next().and_then(|p| p.parse().ok());
        Some((host, port))
    })
}

/// Server host named by the profile at `path`.
pub async fn read_remote(path: &Path) -> Option<String> {
    let profile = tokio::fs::read_to_string(path).await.ok()?;
    parse_remote(&profile).map(|(host, _)| host)
}

/// Locate the daemon: next to our executable first, then on `PATH`.
pub fn find_binary() -> Result<PathBuf, TunnelError> {
    if let Some(dir) = std::env::current_exe().ok().and_then(|exe| exe.parent().map(Path::to_path_buf)) {
        let bundled = dir.join(BINARY);
        if bundled.is_file() {
            return Ok(bundled);
        }
    }
    which::which("openvpn").map_err(|_| TunnelError::Process("openvpn binary not found".into()))
}

fn daemon_args(config_path: &Path, interface: &str, port: u16) -> Vec<String> {
    vec![
        "--config".to_string(),
        config_path.display().to_string(),
        "--management".to_string(),
        "127.0.0.1".to_string(),
        port.to_string(),
        "--management-query-passwords".to_string(),
        "--management-hold".to_string(),
        "--dev".to_string(),
        interface.to_string(),
        "--dev-type".to_string(),
        "tun".to_string(),
    ]
}

struct Inner {
    core: TunnelCore,
    config: OpenVpnConfig,
    interface: InterfaceConfig,
    resolver: Arc<dyn HostResolver>,
    port: u16,
}

impl Inner {
    async fn handle(&self, event: ManagementEvent, writer: &ManagementWriter, connected: &watch::Sender<bool>) {
        match event {
            ManagementEvent::State { state, local_ip } => {
                if let Some(ip) = local_ip {
                    self.core.set_local(ip);
                }
                match (&state, state.tunnel_state()) {
                    (RemoteState::Connected, _) => {
                        connected.send_replace(true);
                        if self.core.state() != TunnelState::Connected {
                            self.core.transition(TunnelState::Connected, "Connected");
                        }
                    }
                    (RemoteState::Connecting(token), Some(next)) => self.core.transition(next, token.clone()),
                    (RemoteState::Reconnecting, Some(next)) => self.core.transition(next, "Reconnecting"),
                    (RemoteState::Exiting, Some(next)) => self.core.transition(next, "Exiting"),
                    (RemoteState::Other(token), _) => debug!("OpenVPN state {}", token),
                    _ => {}
                }
            }
            ManagementEvent::ByteCount { received, sent } => {
                self.core.counters().set_bytes(sent, received);
            }
            ManagementEvent::PasswordRequest { auth } => {
                let (Some(user), true) = (self.config.auth_user.as_deref(), auth) else {
                    warn!("OpenVPN asked for credentials that are not configured");
                    return;
                };
                let pass = self.config.auth_pass.as_deref().unwrap_or_default();
                if let Err(e) = writer.send(&management::username_command(user)).await {
                    warn!("Failed to send username: {}", e);
                    return;
                }
                if let Err(e) = writer.send(&management::password_command(pass)).await {
                    warn!("Failed to send password: {}", e);
                }
            }
            ManagementEvent::Info(info) => debug!("OpenVPN: {}", info),
            ManagementEvent::Other(line) => debug!("management -> {}", line),
        }
    }
}

/// Reads management lines until cancelled or the connection drops.
async fn read_management(
    inner: Arc<Inner>,
    mut lines: ManagementLines,
    writer: Arc<ManagementWriter>,
    connected: watch::Sender<bool>,
    cancel: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                inner
                    .handle(management::parse_line(&line), &writer, &connected)
                    .await
            }
            Ok(None) => break,
            Err(e) => {
                warn!("Management read failed: {}", e);
                break;
            }
        }
    }

    if !cancel.is_cancelled() {
        inner.core.fail("OpenVPN management connection lost", &"connection closed");
    }
}

async fn forward_output<R: AsyncRead + Unpin>(output: R) {
    let mut lines = BufReader::new(output).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!("openvpn: {}", line);
    }
}

/// Management session attached to a running daemon
struct Management {
    writer: Arc<ManagementWriter>,
    reader: JoinHandle<()>,
    connected: watch::Receiver<bool>,
}

async fn attach(inner: &Arc<Inner>, cancel: &CancellationToken) -> Result<Management, TunnelError> {
    let (lines, writer) = management::connect(inner.port).await?;
    let writer = Arc::new(writer);
    let (connected_tx, connected) = watch::channel(false);
    let reader = tokio::spawn(read_management(
        inner.clone(),
        lines,
        writer.clone(),
        connected_tx,
        cancel.clone(),
    ));
    Ok(Management {
        writer,
        reader,
        connected,
    })
}

async fn wait_connected(connected: &mut watch::Receiver<bool>) -> Result<(), TunnelError> {
    connected
        .wait_for(|up| *up)
        .await
        .map(|_| ())
        .map_err(|_| TunnelError::Protocol("management connection closed".into()))
}

struct Session {
    child: Child,
    management: Management,
    cancel: CancellationToken,
}

impl Session {
    async fn shutdown(mut self) {
        if let Err(e) = self.management.writer.send("signal SIGTERM").await {
            debug!("SIGTERM over management failed: {}", e);
        }
        self.management.writer.close().await;
        self.cancel.cancel();
        terminate(&mut self.child).await;
        let _ = self.management.reader.await;
    }
}

async fn terminate(child: &mut Child) {
    match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!("openvpn exited with {}", status),
        _ => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill openvpn: {}", e);
            }
        }
    }
}

/// OpenVPN tunnel
pub struct OpenVpnTunnel {
    inner: Arc<Inner>,
    session: Mutex<Option<Session>>,
    parent: parking_lot::Mutex<Option<CancellationToken>>,
}

impl OpenVpnTunnel {
    pub fn new(config: OpenVpnConfig, interface: InterfaceConfig, resolver: Arc<dyn HostResolver>) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: TunnelCore::new(Protocol::OpenVpn, interface.name.clone()),
                config,
                interface,
                resolver,
                port: MANAGEMENT_PORT,
            }),
            session: Mutex::new(None),
            parent: parking_lot::Mutex::new(None),
        }
    }

    async fn resolve_server(&self, config_path: &Path) {
        let Some(host) = read_remote(config_path).await else {
            return;
        };
        match self.inner.resolver.resolve_one(&host).await {
            Ok(ip) => {
                let mut addresses = self.inner.core.addresses();
                addresses.server = Some(ip);
                self.inner.core.set_addresses(addresses);
            }
            Err(e) => debug!("Could not resolve OpenVPN remote {}: {}", host, e),
        }
    }

    async fn bring_up(&self, parent: &CancellationToken) -> Result<Session, TunnelError> {
        let config_path = self
            .inner
            .config
            .config_path
            .clone()
            .ok_or_else(|| TunnelError::Config("openvpn config path is required".into()))?;
        let binary = find_binary()?;
        self.resolve_server(&config_path).await;

        let args = daemon_args(&config_path, &self.inner.interface.name, self.inner.port);
        info!("Starting {} {}", binary.display(), args.join(" "));

        let mut child = Command::new(&binary)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| TunnelError::Process(format!("failed to start openvpn: {e}")))?;
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(stderr));
        }

        tokio::time::sleep(STARTUP_DELAY).await;

        let cancel = parent.child_token();
        let mut management = match attach(&self.inner, &cancel).await {
            Ok(management) => management,
            Err(e) => {
                terminate(&mut child).await;
                return Err(e);
            }
        };

        let released = management.writer.send("hold release").await;
        let outcome = match released {
            Err(e) => Err(e),
            Ok(()) => tokio::select! {
                up = wait_connected(&mut management.connected) => up,
                status = child.wait() => Err(TunnelError::Process(match status {
                    Ok(status) => format!("openvpn exited with {status}"),
                    Err(e) => format!("openvpn exited: {e}"),
                })),
                _ = tokio::time::sleep(CONNECT_TIMEOUT) => {
                    Err(TunnelError::Timeout("OpenVPN did not connect".into()))
                }
                _ = cancel.cancelled() => Err(TunnelError::Process("start cancelled".into())),
            },
        };

        let session = Session {
            child,
            management,
            cancel,
        };
        match outcome {
            Ok(()) => Ok(session),
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Tunnel for OpenVpnTunnel {
    async fn start(&self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let mut session = self.session.lock().await;
        self.inner.core.begin_start()?;
        *self.parent.lock() = Some(cancel.clone());

        match self.bring_up(cancel).await {
            Ok(up) => {
                *session = Some(up);
                if self.inner.core.state() != TunnelState::Connected {
                    self.inner.core.transition(TunnelState::Connected, "OpenVPN tunnel established");
                }
                info!("OpenVPN connected, local address {:?}", self.local_ip());
                Ok(())
            }
            Err(e) => {
                self.inner.core.fail("Failed to start OpenVPN tunnel", &e);
                Err(e)
            }
        }
    }

    async fn stop(&self) -> Result<(), TunnelError> {
        let mut session = self.session.lock().await;
        if !self.inner.core.begin_stop() {
            return Ok(());
        }

        if let Some(up) = session.take() {
            up.shutdown().await;
        }

        self.inner.core.finish_stop();
        info!("OpenVPN tunnel stopped");
        Ok(())
    }

    async fn reconnect(&self) -> Result<(), TunnelError> {
        self.inner.core.transition(TunnelState::Reconnecting, "Reconnecting");

        let soft = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(up) => up.management.writer.send("signal SIGHUP").await.is_ok(),
                None => false,
            }
        };
        if soft {
            debug!("OpenVPN restarting in place");
            return Ok(());
        }

        self.stop().await?;
        self.inner.core.events().reopen();
        let parent = self
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
