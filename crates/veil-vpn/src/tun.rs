//! TUN adapter
//!
//! [`TunDevice`] is the packet I/O contract: one whole IP packet per call,
//! no framing. [`TunAdapter`] wraps a device with its interface lifecycle
//! (address assignment, link up and down) through the network backend.

use crate::backend::{BackendError, NetworkBackend, best_effort};
use async_trait::async_trait;
use ipnet::IpNet;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

/// Packet-level access to a virtual interface
#[async_trait]
pub trait TunDevice: Send + Sync {
    fn name(&self) -> &str;

    /// Read one packet into `buf`.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet.
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;
}

/// A TUN device plus the interface configuration around it
pub struct TunAdapter {
    device: Arc<dyn TunDevice>,
    backend: Arc<dyn NetworkBackend>,
    mtu: u16,
    up: AtomicBool,
}

impl TunAdapter {
    /// Create the device.
    pub async fn create(
        backend: Arc<dyn NetworkBackend>,
        name: &str,
        mtu: u16,
    ) -> Result<Self, BackendError> {
        let device = backend.create_tun(name, mtu).await?;
        info!("Created TUN device {} (mtu {})", device.name(), mtu);
        Ok(Self {
            device,
            backend,
            mtu,
            up: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        self.device.name()
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn device(&self) -> Arc<dyn TunDevice> {
        self.device.clone()
    }

    /// Assign the local address, optionally as a point-to-point link.
    pub async fn configure(&self, address: IpNet, peer: Option<IpAddr>) -> Result<(), BackendError> {
        debug!("Configuring {} with {} peer {:?}", self.name(), address, peer);
        self.backend.assign_address(self.name(), address, peer).await
    }

    pub async fn up(&self) -> Result<(), BackendError> {
        self.backend.set_link_state(self.name(), true).await?;
        self.up.store(true, Ordering::Relaxed);
        Ok(())
    }

    /// Bring the link down. Safe to call on a link that is already down.
    pub async fn down(&self) {
        if self.up.swap(false, Ordering::Relaxed) {
            best_effort(
                "Bringing TUN link down",
                self.backend.set_link_state(self.name(), false).await,
            );
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Relaxed)
    }

    /// Bring the link down and release the device.
    pub async fn close(self) {
        self.down().await;
        info!("Closed TUN device {}", self.name());
    }
}
