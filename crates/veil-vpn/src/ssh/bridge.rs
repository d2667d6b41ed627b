//! Packet bridge between the local TUN device and the SSH stream
//!
//! Two independent pumps: TUN -> frames -> remote stdin, and remote
//! stdout -> frames -> TUN. Both stop on cancellation or on I/O error.

use super::framing::{MAX_FRAME, PacketCodec};
use crate::tun::TunDevice;
use crate::tunnel::TrafficCounters;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Running pumps
pub(crate) struct Bridge {
    pumps: Vec<JoinHandle<()>>,
}

impl Bridge {
    pub fn start(
        device: Arc<dyn TunDevice>,
        outbound: mpsc::Sender<Bytes>,
        inbound: mpsc::Receiver<Bytes>,
        counters: Arc<TrafficCounters>,
        cancel: &CancellationToken,
    ) -> Self {
        let pumps = vec![
            tokio::spawn(uplink(device.clone(), outbound, counters.clone(), cancel.clone())),
            tokio::spawn(downlink(device, inbound, counters, cancel.clone())),
        ];
        Self { pumps }
    }

    /// Wait for both pumps, giving up after `timeout`. A pump still
    /// running at the deadline is aborted and `false` is returned.
    pub async fn join(self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut clean = true;
        for pump in self.pumps {
            let abort = pump.abort_handle();
            if tokio::time::timeout_at(deadline, pump).await.is_err() {
                abort.abort();
                clean = false;
            }
        }
        if !clean {
            warn!("SSH bridge pumps did not exit within {:?}", timeout);
        }
        clean
    }
}

async fn uplink(
    device: Arc<dyn TunDevice>,
    outbound: mpsc::Sender<Bytes>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) {
    let mut codec = PacketCodec::default();
    let mut packet = vec![0u8; MAX_FRAME];
    let mut frame = BytesMut::with_capacity(MAX_FRAME + 2);

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => break,
            read = device.recv(&mut packet) => match read {
                Ok(0) => continue,
                Ok(n) => n,
                Err(e) => {
                    debug!("TUN read failed: {}", e);
                    break;
                }
            },
        };

        if let Err(e) = codec.encode(&packet[..n], &mut frame) {
            debug!("Dropping packet: {}", e);
            continue;
        }

        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = outbound.send(frame.split().freeze()) => sent,
        };
        if sent.is_err() {
            debug!("SSH stream closed");
            break;
        }
        counters.record_sent(n);
    }

    debug!("SSH uplink stopped");
}

async fn downlink(
    device: Arc<dyn TunDevice>,
    mut inbound: mpsc::Receiver<Bytes>,
    counters: Arc<TrafficCounters>,
    cancel: CancellationToken,
) {
    let mut codec = PacketCodec::default();
    let mut buf = BytesMut::with_capacity(MAX_FRAME + 2);

    'outer: loop {
        let chunk = tokio::select! {
            _ = cancel.cancelled() => break,
            chunk = inbound.recv() => match chunk {
                Some(chunk) => chunk,
                None => {
                    debug!("SSH stream closed");
                    break;
                }
            },
        };
        buf.extend_from_slice(&chunk);

        loop {
            let packet = match codec.decode(&mut buf) {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    warn!("Frame decode failed: {}", e);
                    break 'outer;
                }
            };
            match device.send(&packet).await {
                Ok(_) => counters.record_received(packet.len()),
                Err(e) => {
                    debug!("TUN write failed: {}", e);
                    break 'outer;
                }
            }
        }
    }

    debug!("SSH downlink stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tun::memory::MemoryTun;
    use bytes::BufMut;

    #[tokio::test]
    async fn test_packets_cross_in_both_directions() {
        let (tun, mut handle) = MemoryTun::pair("veil0");
        let (outbound, mut remote_stdin) = mpsc::channel(16);
        let (remote_stdout, inbound) = mpsc::channel(16);
        let counters = Arc::new(TrafficCounters::default());
        let cancel = CancellationToken::new();
        let bridge = Bridge::start(tun, outbound, inbound, counters.clone(), &cancel);

        handle.inject.send(vec![0x45; 60]).await.unwrap();
        let frame = remote_stdin.recv().await.unwrap();
        assert_eq!(&frame[..2], &[0, 60]);
        assert_eq!(frame.len(), 62);

        // two frames split mid-header across three chunks
        let mut wire = BytesMut::new();
        wire.put_u16(3);
        wire.extend_from_slice(&[1, 2, 3]);
        wire.put_u16(2);
        wire.extend_from_slice(&[4, 5]);
        let wire = wire.freeze();
        remote_stdout.send(wire.slice(..1)).await.unwrap();
        remote_stdout.send(wire.slice(1..6)).await.unwrap();
        remote_stdout.send(wire.slice(6..)).await.unwrap();

        assert_eq!(handle.written.recv().await.unwrap(), vec![1, 2, 3]);
        assert_eq!(handle.written.recv().await.unwrap(), vec![4, 5]);

        let stats = counters.snapshot();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 60);
        assert_eq!(stats.packets_received, 2);
        assert_eq!(stats.bytes_received, 5);

        cancel.cancel();
        assert!(bridge.join(Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn test_closed_stream_ends_downlink() {
        let (tun, _handle) = MemoryTun::pair("veil0");
        let (outbound, _remote_stdin) = mpsc::channel(1);
        let (remote_stdout, inbound) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        let bridge = Bridge::start(tun, outbound, inbound, Arc::new(TrafficCounters::default()), &cancel);

        drop(remote_stdout);
        // the uplink is parked on the TUN read until cancelled
        cancel.cancel();
        assert!(bridge.join(Duration::from_secs(5)).await);
    }
}
