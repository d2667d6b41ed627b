//! Veil network helpers
//!
//! Host name resolution shared by the VPN core: a hickory-backed
//! resolver with its own TTL cache, and a static table for fixed hosts.

mod dns;

pub use dns::{DnsConfig, DnsError, DnsResolver, HostResolver, StaticResolver};
