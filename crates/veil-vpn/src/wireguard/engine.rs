//! WireGuard device engine
//!
//! The tunnel hands the engine a UAPI-style configuration block and a TUN
//! device; the engine owns the crypto state and the UDP socket and moves
//! packets between the two until it is closed.

use crate::keys::decode_hex_32;
use crate::tun::TunDevice;
use crate::tunnel::{TrafficCounters, TunnelError};
use async_trait::async_trait;
use boringtun::noise::{Tunn, TunnResult, errors::WireGuardError};
use boringtun::x25519;
use ipnet::IpNet;
use parking_lot::Mutex;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest IP packet the engine moves
const MAX_PACKET_SIZE: usize = 65_535;

/// Room for the WireGuard header and tag on top of a packet
const BUFFER_SIZE: usize = MAX_PACKET_SIZE + 64;

/// How often boringtun's timers are driven
const TIMER_TICK: Duration = Duration::from_millis(250);

/// Builds an engine for a freshly created device
pub type EngineFactory =
    Arc<dyn Fn(Arc<dyn TunDevice>, Arc<TrafficCounters>) -> Box<dyn DeviceEngine> + Send + Sync>;

/// The in-process WireGuard implementation behind a tunnel
#[async_trait]
pub trait DeviceEngine: Send {
    /// Apply a configuration block (`key=value` lines).
    async fn configure(&mut self, uapi: &str) -> Result<(), TunnelError>;

    /// Start moving packets. Work stops when `cancel` fires or on [`close`](Self::close).
    async fn up(&mut self, cancel: &CancellationToken) -> Result<(), TunnelError>;

    async fn close(&mut self);
}

/// Factory for the boringtun engine
pub fn boringtun_engines() -> EngineFactory {
    Arc::new(|device, counters| Box::new(BoringtunEngine::new(device, counters)))
}

/// Settings parsed from a configuration block
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DeviceSettings {
    pub private_key: [u8; 32],
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNet>,
    pub keepalive: Option<u16>,
}

/// Parse a configuration block produced by [`super::uapi_config`].
pub(crate) fn parse_uapi(text: &str) -> Result<DeviceSettings, TunnelError> {
    let invalid = |what: &str, value: &str| TunnelError::Config(format!("invalid {what} '{value}'"));

    let mut private_key = None;
    let mut public_key = None;
    let mut preshared_key = None;
    let mut endpoint = None;
    let mut allowed_ips = Vec::new();
    let mut keepalive = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(TunnelError::Config(format!("malformed line '{line}'")));
        };

        match key {
            "private_key" => {
                private_key = Some(decode_hex_32(value).map_err(|_| invalid(key, "<redacted>"))?)
            }
            "public_key" => public_key = Some(decode_hex_32(value).map_err(|_| invalid(key, value))?),
            "preshared_key" => {
                preshared_key = Some(decode_hex_32(value).map_err(|_| invalid(key, "<redacted>"))?)
            }
            "endpoint" => endpoint = Some(value.parse().map_err(|_| invalid(key, value))?),
            "allowed_ip" => allowed_ips.push(value.parse().map_err(|_| invalid(key, value))?),
            "persistent_keepalive_interval" => {
                let secs: u16 = value.parse().map_err(|_| invalid(key, value))?;
                keepalive = (secs > 0).then_some(secs);
            }
            other => debug!("Ignoring device setting {}", other),
        }
    }

    Ok(DeviceSettings {
        private_key: private_key.ok_or_else(|| TunnelError::Config("private_key missing".into()))?,
        public_key: public_key.ok_or_else(|| TunnelError::Config("public_key missing".into()))?,
        preshared_key,
        endpoint: endpoint.ok_or_else(|| TunnelError::Config("endpoint missing".into()))?,
        allowed_ips,
        keepalive,
    })
}

/// Userspace WireGuard on boringtun
pub struct BoringtunEngine {
    device: Arc<dyn TunDevice>,
    counters: Arc<TrafficCounters>,
    settings: Option<DeviceSettings>,
    cancel: Option<CancellationToken>,
    tasks: Vec<JoinHandle<()>>,
}

impl BoringtunEngine {
    pub fn new(device: Arc<dyn TunDevice>, counters: Arc<TrafficCounters>) -> Self {
        Self {
            device,
            counters,
            settings: None,
            cancel: None,
            tasks: Vec::new(),
        }
    }
}

#[async_trait]
impl DeviceEngine for BoringtunEngine {
    async fn configure(&mut self, uapi: &str) -> Result<(), TunnelError> {
        let settings = parse_uapi(uapi)?;
        debug!(
            "Device configured: endpoint {} allowed {:?} keepalive {:?}",
            settings.endpoint, settings.allowed_ips, settings.keepalive
        );
        self.settings = Some(settings);
        Ok(())
    }

    async fn up(&mut self, cancel: &CancellationToken) -> Result<(), TunnelError> {
        let settings = self
            .settings
            .clone()
            .ok_or_else(|| TunnelError::Device("device is not configured".into()))?;

        let tunn = Tunn::new(
            x25519::StaticSecret::from(settings.private_key),
            x25519::PublicKey::from(settings.public_key),
            settings.preshared_key,
            settings.keepalive,
            0,
            None,
        )
        .map_err(|e| TunnelError::Device(format!("failed to create tunnel: {}", e)))?;
        let tunn = Arc::new(Mutex::new(tunn));

        let bind_addr: SocketAddr = if settings.endpoint.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(settings.endpoint).await?;
        let socket = Arc::new(socket);

        send_handshake(&tunn, &socket).await?;

        let cancel = cancel.child_token();
        self.tasks.push(tokio::spawn(uplink(
            self.device.clone(),
            tunn.clone(),
            socket.clone(),
            self.counters.clone(),
            cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(downlink(
            self.device.clone(),
            tunn.clone(),
            socket.clone(),
            self.counters.clone(),
            settings.allowed_ips.clone(),
            cancel.clone(),
        )));
        self.tasks.push(tokio::spawn(timers(tunn, socket, cancel.clone())));
        self.cancel = Some(cancel);

        info!("WireGuard device up, peer {}", settings.endpoint);
        Ok(())
    }

    async fn close(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

async fn send_handshake(tunn: &Mutex<Tunn>, socket: &UdpSocket) -> Result<(), TunnelError> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let result = {
        let mut tunn = tunn.lock();
        tunn.format_handshake_initiation(&mut buf, false)
    };

    match result {
        TunnResult::WriteToNetwork(data) => {
            socket.send(data).await?;
            debug!("Handshake initiation sent ({} bytes)", data.len());
            Ok(())
        }
        TunnResult::Err(e) => Err(TunnelError::Handshake(format!("{:?}", e))),
        _ => Err(TunnelError::Handshake("no handshake initiation produced".into())),
    }
}

/// TUN -> encrypt -> UDP
async fn uplink(
    device: Arc<dyn TunDevice>,
    tunn: Arc<Mutex<Tunn>>,
    socket: Arc<UdpSocket>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) {
    let mut packet = vec![0u8; MAX_PACKET_SIZE];
    let mut buf = vec![0u8; BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.recv(&mut packet) => match read {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    warn!("TUN read failed: {}", e);
                    break;
                }
            },
        };

        let result = {
            let mut tunn = tunn.lock();
            tunn.encapsulate(&packet[..n], &mut buf)
        };

        match result {
            TunnResult::WriteToNetwork(data) => match socket.send(data).await {
                Ok(_) => counters.record_sent(n),
                Err(e) => debug!("UDP send failed: {}", e),
            },
            TunnResult::Err(e) => debug!("Encapsulate error: {:?}", e),
            _ => {}
        }
    }

    trace!("Uplink stopped");
}

/// UDP -> decrypt -> TUN
async fn downlink(
    device: Arc<dyn TunDevice>,
    tunn: Arc<Mutex<Tunn>>,
    socket: Arc<UdpSocket>,
    counters: Arc<TrafficCounters>,
    allowed_ips: Vec<IpNet>,
    cancel: CancellationToken,
) {
    let mut datagram = vec![0u8; BUFFER_SIZE];
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut queued = vec![0u8; BUFFER_SIZE];

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = socket.recv(&mut datagram) => match read {
                Ok(n) => n,
                Err(e) => {
                    // ICMP unreachable surfaces here while the peer is down
                    debug!("UDP receive failed: {}", e);
                    continue;
                }
            },
        };

        let result = {
            let mut tunn = tunn.lock();
            tunn.decapsulate(None, &datagram[..n], &mut buf)
        };

        match result {
            TunnResult::WriteToNetwork(data) => {
                if let Err(e) = socket.send(data).await {
                    debug!("UDP send failed: {}", e);
                }
                // Packets queued behind the handshake
                loop {
                    let flushed = {
                        let mut tunn = tunn.lock();
                        tunn.decapsulate(None, &[], &mut queued)
                    };
                    match flushed {
                        TunnResult::WriteToNetwork(data) => {
                            if let Err(e) = socket.send(data).await {
                                debug!("UDP send failed: {}", e);
                            }
                        }
                        _ => break,
                    }
                }
            }
            TunnResult::WriteToTunnelV4(packet, source) => {
                deliver(&*device, &counters, &allowed_ips, packet, IpAddr::V4(source)).await
            }
            TunnResult::WriteToTunnelV6(packet, source) => {
                deliver(&*device, &counters, &allowed_ips, packet, IpAddr::V6(source)).await
            }
            TunnResult::Err(e) => debug!("Decapsulate error: {:?}", e),
            TunnResult::Done => {}
        }
    }

    trace!("Downlink stopped");
}

async fn deliver(
    device: &dyn TunDevice,
    counters: &TrafficCounters,
    allowed_ips: &[IpNet],
    packet: &[u8],
    source: IpAddr,
) {
    if !allowed_ips.iter().any(|net| net.contains(&source)) {
        debug!("Dropping packet from {} outside allowed IPs", source);
        return;
    }
    match device.send(packet).await {
        Ok(_) => counters.record_received(packet.len()),
        Err(e) => warn!("TUN write failed: {}", e),
    }
}

/// Handshake retries, rekeys and keepalives
async fn timers(tunn: Arc<Mutex<Tunn>>, socket: Arc<UdpSocket>, cancel: CancellationToken) {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut tick = tokio::time::interval(TIMER_TICK);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }

        let result = {
            let mut tunn = tunn.lock();
            tunn.update_timers(&mut buf)
        };

        match result {
            TunnResult::WriteToNetwork(data) => {
                if let Err(e) = socket.send(data).await {
                    debug!("Timer packet send failed: {}", e);
                }
            }
            TunnResult::Err(WireGuardError::ConnectionExpired) => {
                debug!("Session expired, waiting for a new handshake");
            }
            TunnResult::Err(e) => warn!("Timer error: {:?}", e),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOCK: &str = "private_key=0101010101010101010101010101010101010101010101010101010101010101\n\
public_key=0202020202020202020202020202020202020202020202020202020202020202\n\
endpoint=203.0.113.7:51820\n\
allowed_ip=0.0.0.0/0\n\
allowed_ip=::/0\n\
persistent_keepalive_interval=25\n";

    #[test]
    fn test_parse_block() {
        let settings = parse_uapi(BLOCK).unwrap();
        assert_eq!(settings.private_key, [1u8; 32]);
        assert_eq!(settings.public_key, [2u8; 32]);
        assert_eq!(settings.preshared_key, None);
        assert_eq!(settings.endpoint, "203.0.113.7:51820".parse().unwrap());
        assert_eq!(settings.allowed_ips.len(), 2);
        assert_eq!(settings.keepalive, Some(25));
    }

    #[test]
    fn test_parse_rejects_missing_endpoint() {
        let block: String = BLOCK
            .lines()
            .filter(|l| !l.starts_with("endpoint"))
            .map(|l| format!("{l}\n"))
            .collect();
        assert!(matches!(parse_uapi(&block), Err(TunnelError::Config(_))));
    }

    #[test]
    fn test_parse_rejects_bad_key() {
        let block = BLOCK.replace("public_key=02", "public_key=zz");
        assert!(parse_uapi(&block).is_err());
    }

    #[test]
    fn test_zero_keepalive_disables() {
        let block = BLOCK.replace("interval=25", "interval=0");
        assert_eq!(parse_uapi(&block).unwrap().keepalive, None);
    }

    #[tokio::test]
    async fn test_up_requires_configuration() {
        let (tun, _handle) = crate::tun::memory::MemoryTun::pair("veil0");
        let mut engine = BoringtunEngine::new(tun, Arc::new(TrafficCounters::default()));
        let cancel = CancellationToken::new();
        assert!(matches!(engine.up(&cancel).await, Err(TunnelError::Device(_))));
        engine.close().await;
    }
}
