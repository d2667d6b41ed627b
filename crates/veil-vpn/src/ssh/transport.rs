//! SSH transport
//!
//! [`SshTransport`] logs in; the resulting [`SshLogin`] runs the remote
//! forwarder and hands back a [`RemoteLink`]: byte channels to the
//! forwarder's stdin and from its stdout, plus a keepalive probe.
//!
//! The libssh2 implementation is blocking, so after the forwarder reports
//! ready a dedicated thread owns the session in non-blocking mode and
//! shuttles bytes between the channel and the async side.

use super::keepalive::KeepaliveProbe;
use super::remote::READY_TOKEN;
use crate::config::SshConfig;
use crate::tunnel::TunnelError;
use async_trait::async_trait;
use bytes::{Buf, Bytes};
use socket2::{Domain, Protocol, Socket, TcpKeepalive, Type};
use ssh2::{Channel, ErrorCode, Session};
use std::io::{ErrorKind, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DIAL_TIMEOUT: Duration = Duration::from_secs(30);
const TCP_KEEPALIVE: Duration = Duration::from_secs(10);
const CLOSE_TIMEOUT_MS: u32 = 2_000;
const READ_CHUNK: usize = 32 * 1024;
const IDLE_WAIT: Duration = Duration::from_millis(2);
const CHANNEL_DEPTH: usize = 256;

/// libssh2's "would block"
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

type PingReply = oneshot::Sender<Result<(), String>>;

/// Byte streams to and from the remote forwarder
pub struct RemoteLink {
    /// Framed packets for the forwarder's stdin
    pub outbound: mpsc::Sender<Bytes>,
    /// Raw bytes from the forwarder's stdout
    pub inbound: mpsc::Receiver<Bytes>,
    pub probe: Arc<dyn KeepaliveProbe>,
}

/// Opens authenticated SSH sessions
#[async_trait]
pub trait SshTransport: Send + Sync {
    async fn connect(&self, server: SocketAddr, config: &SshConfig) -> Result<Box<dyn SshLogin>, TunnelError>;
}

/// An authenticated session, not yet running anything
#[async_trait]
pub trait SshLogin: Send {
    /// Run `command` without a PTY and wait for the ready token. Closing
    /// `cancel` tears the session down.
    async fn start_forwarder(
        self: Box<Self>,
        command: String,
        cancel: CancellationToken,
    ) -> Result<RemoteLink, TunnelError>;
}

/// libssh2 transport
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Transport;

#[async_trait]
impl SshTransport for Ssh2Transport {
    async fn connect(&self, server: SocketAddr, config: &SshConfig) -> Result<Box<dyn SshLogin>, TunnelError> {
        let config = config.clone();
        let session = tokio::task::spawn_blocking(move || login(server, &config))
            .await
            .map_err(|e| TunnelError::Handshake(format!("login task failed: {e}")))??;
        info!("Connected to SSH server at {}", server);
        Ok(Box::new(Ssh2Login { session }))
    }
}

fn dial(server: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(server), Type::STREAM, Some(Protocol::TCP))?;
    let keepalive = TcpKeepalive::new()
        .with_time(TCP_KEEPALIVE)
        .with_interval(TCP_KEEPALIVE);
    socket.set_tcp_keepalive(&keepalive)?;
    socket.set_nodelay(true)?;
    socket.connect_timeout(&server.into(), DIAL_TIMEOUT)?;
    Ok(socket.into())
}

fn login(server: SocketAddr, config: &SshConfig) -> Result<Session, TunnelError> {
    let tcp = dial(server)
        .map_err(|e| TunnelError::Handshake(format!("failed to connect to SSH server {server}: {e}")))?;

    let mut session = Session::new().map_err(|e| TunnelError::Handshake(e.to_string()))?;
    session.set_timeout(DIAL_TIMEOUT.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session
        .handshake()
        .map_err(|e| TunnelError::Handshake(format!("SSH handshake failed: {e}")))?;

    authenticate(&session, config)?;
    if !session.authenticated() {
        return Err(TunnelError::Handshake("SSH authentication rejected".into()));
    }

    session.set_keepalive(true, config.keepalive_interval().as_secs() as u32);
    Ok(session)
}

/// Key file paths are sometimes pasted with surrounding quotes.
fn key_path(path: &std::path::Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim();
    match trimmed.strip_prefix('"').and_then(|p| p.strip_suffix('"')) {
        Some(inner) => PathBuf::from(inner),
        None => PathBuf::from(trimmed),
    }
}

fn authenticate(session: &Session, config: &SshConfig) -> Result<(), TunnelError> {
    if let Some(path) = &config.key_path {
        let path = key_path(path);
        return session
            .userauth_pubkey_file(&config.user, None, &path, None)
            .map_err(|e| TunnelError::Handshake(format!("key authentication with {} failed: {e}", path.display())));
    }

    match config.password.as_deref() {
        Some(password) if !password.is_empty() => session
            .userauth_password(&config.user, password)
            .map_err(|e| TunnelError::Handshake(format!("password authentication failed: {e}"))),
        _ => Err(TunnelError::Config(
            "no authentication method specified (key_path or password required)".into(),
        )),
    }
}

struct Ssh2Login {
    session: Session,
}

#[async_trait]
impl SshLogin for Ssh2Login {
    async fn start_forwarder(
        self: Box<Self>,
        command: String,
        cancel: CancellationToken,
    ) -> Result<RemoteLink, TunnelError> {
        let session = self.session;
        let (session, channel) = tokio::task::spawn_blocking(move || exec_forwarder(session, &command))
            .await
            .map_err(|e| TunnelError::Protocol(format!("forwarder task failed: {e}")))??;
        info!("Remote TUN device ready");

        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_DEPTH);
        let (inbound_tx, inbound) = mpsc::channel(CHANNEL_DEPTH);
        let (pings, pings_rx) = mpsc::channel(1);

        std::thread::Builder::new()
            .name("veil-ssh-io".to_string())
            .spawn(move || pump_session(session, channel, outbound_rx, inbound_tx, pings_rx, cancel))?;

        Ok(RemoteLink {
            outbound,
            inbound,
            probe: Arc::new(SessionProbe { requests: pings }),
        })
    }
}

fn exec_forwarder(session: Session, command: &str) -> Result<(Session, Channel), TunnelError> {
    let mut channel = session
        .channel_session()
        .map_err(|e| TunnelError::Protocol(format!("failed to open SSH session: {e}")))?;

    // No PTY: it would rewrite bytes in the packet stream.
    channel
        .exec(command)
        .map_err(|e| TunnelError::Protocol(format!("failed to start tunnel command: {e}")))?;

    let mut token = [0u8; 6];
    if let Err(e) = channel.read_exact(&mut token) {
        return Err(TunnelError::Protocol(format!(
            "failed to read ready signal: {e}{}",
            remote_stderr(&mut channel)
        )));
    }
    if &token != READY_TOKEN {
        return Err(TunnelError::Protocol(format!(
            "unexpected signal from remote: {:?}{}",
            String::from_utf8_lossy(&token),
            remote_stderr(&mut channel)
        )));
    }

    session.set_blocking(false);
    Ok((session, channel))
}

fn remote_stderr(channel: &mut Channel) -> String {
    let mut stderr = String::new();
    let _ = channel.stderr().read_to_string(&mut stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        String::new()
    } else {
        format!(" (remote: {})", stderr.chars().take(512).collect::<String>())
    }
}

/// Session I/O loop. Owns the session until cancelled or the remote side
/// closes, then closes the channel so the forwarder sees EOF.
fn pump_session(
    session: Session,
    mut channel: Channel,
    mut outbound: mpsc::Receiver<Bytes>,
    inbound: mpsc::Sender<Bytes>,
    mut pings: mpsc::Receiver<PingReply>,
    cancel: CancellationToken,
) {
    let mut pending: Option<Bytes> = None;
    let mut buf = vec![0u8; READ_CHUNK];
    let mut err_buf = [0u8; 1024];

    'io: while !cancel.is_cancelled() {
        let mut busy = false;

        loop {
            if pending.is_none() {
                match outbound.try_recv() {
                    Ok(frame) => pending = Some(frame),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'io,
                }
            }
            let Some(data) = pending.as_mut() else {
                break;
            };
            match channel.write(&data[..]) {
                Ok(n) => {
                    busy = true;
                    data.advance(n);
                    if data.is_empty() {
                        pending = None;
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    debug!("SSH channel write failed: {}", e);
                    break 'io;
                }
            }
        }

        match channel.read(&mut buf) {
            Ok(0) => {
                debug!("Remote forwarder closed its output");
                break 'io;
            }
            Ok(n) => {
                busy = true;
                if inbound.blocking_send(Bytes::copy_from_slice(&buf[..n])).is_err() {
                    break 'io;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!("SSH channel read failed: {}", e);
                break 'io;
            }
        }

        if let Ok(n) = channel.stderr().read(&mut err_buf) {
            if n > 0 {
                busy = true;
                warn!("Remote: {}", String::from_utf8_lossy(&err_buf[..n]).trim_end());
            }
        }

        while let Ok(reply) = pings.try_recv() {
            let _ = reply.send(keepalive_outcome(session.keepalive_send()));
        }

        if !busy {
            std::thread::sleep(IDLE_WAIT);
        }
    }

    session.set_blocking(true);
    session.set_timeout(CLOSE_TIMEOUT_MS);
    let _ = channel.send_eof();
    let _ = channel.close();
    let _ = session.disconnect(None, "tunnel closed", None);
    debug!("SSH session closed");
}

/// A keepalive that cannot even be queued means the peer stopped reading.
fn keepalive_outcome(sent: Result<u32, ssh2::Error>) -> Result<(), String> {
    match sent {
        Ok(_) => Ok(()),
        Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => {
            Err("keepalive would block, peer not reading".to_string())
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Keepalive through the I/O thread
struct SessionProbe {
    requests: mpsc::Sender<PingReply>,
}

#[async_trait]
impl KeepaliveProbe for SessionProbe {
    async fn ping(&self) -> Result<(), String> {
        let (reply, result) = oneshot::channel();
        self.requests
            .send(reply)
            .await
            .map_err(|_| "SSH session closed".to_string())?;
        result.await.map_err(|_| "SSH session closed".to_string())?
    }
}
