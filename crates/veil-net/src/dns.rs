//! Async host resolution with caching
//!
//! Used by the VPN core for endpoint lookups and for the domain resolver
//! that keeps split-tunnel host routes fresh. Every resolver owns its
//! cache; nothing here is process-global.

use async_trait::async_trait;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info};

/// DNS resolution errors
#[derive(Debug, Clone, Error)]
pub enum DnsError {
    #[error("Resolution failed for {host}: {reason}")]
    ResolutionFailed { host: String, reason: String },

    #[error("No addresses found for {0}")]
    NoAddresses(String),

    #[error("Resolver error: {0}")]
    ResolverError(String),
}

/// Anything that can turn a host name into addresses.
///
/// IP literals must be returned as-is without a lookup.
#[async_trait]
pub trait HostResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;

    /// First address, preferring IPv4.
    async fn resolve_one(&self, host: &str) -> Result<IpAddr, DnsError> {
        let addresses = self.resolve(host).await?;
        addresses
            .iter()
            .find(|a| a.is_ipv4())
            .or_else(|| addresses.first())
            .copied()
            .ok_or_else(|| DnsError::NoAddresses(host.to_string()))
    }
}

/// DNS resolver configuration
#[derive(Debug, Clone)]
pub struct DnsConfig {
    /// Cache TTL for successful lookups
    pub cache_ttl: Duration,
    /// Maximum cache size
    pub max_cache_entries: usize,
    /// Whether to use system DNS or Cloudflare
    pub use_system_dns: bool,
    /// Timeout for DNS queries
    pub timeout: Duration,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            max_cache_entries: 1024,
            use_system_dns: true,
            timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone)]
struct CacheEntry {
    addresses: Vec<IpAddr>,
    expires_at: Instant,
}

/// Async DNS resolver with a per-instance cache
pub struct DnsResolver {
    resolver: TokioAsyncResolver,
    cache: Arc<RwLock<HashMap<String, CacheEntry>>>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Create a new DNS resolver
    pub async fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let resolver = if config.use_system_dns {
            let (system, mut opts) = hickory_resolver::system_conf::read_system_conf()
                .map_err(|e| DnsError::ResolverError(e.to_string()))?;
            opts.timeout = config.timeout;
            TokioAsyncResolver::tokio(system, opts)
        } else {
            let mut opts = ResolverOpts::default();
            opts.timeout = config.timeout;
            TokioAsyncResolver::tokio(ResolverConfig::cloudflare(), opts)
        };

        info!("DNS resolver initialized");

        Ok(Self {
            resolver,
            cache: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    /// Create with default configuration
    pub async fn with_defaults() -> Result<Self, DnsError> {
        Self::new(DnsConfig::default()).await
    }

    /// Clear all cached entries
    pub fn clear_cache(&self) {
        self.cache.write().clear();
        info!("DNS cache cleared");
    }

    /// Get cache statistics as (total, still valid)
    pub fn cache_stats(&self) -> (usize, usize) {
        let cache = self.cache.read();
        let now = Instant::now();
        let total = cache.len();
        let valid = cache.values().filter(|e| e.expires_at > now).count();
        (total, valid)
    }

    fn get_cached(&self, host: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.read();
        cache
            .get(host)
            .filter(|entry| entry.expires_at > Instant::now())
            .map(|entry| entry.addresses.clone())
    }

    fn cache_addresses(&self, host: &str, addresses: &[IpAddr]) {
        let mut cache = self.cache.write();

        if cache.len() >= self.config.max_cache_entries {
            let now = Instant::now();
            cache.retain(|_, v| v.expires_at > now);

            if cache.len() >= self.config.max_cache_entries {
                let keys_to_remove: Vec<_> = cache.keys().take(cache.len() / 4).cloned().collect();
                for key in keys_to_remove {
                    cache.remove(&key);
                }
            }
        }

        cache.insert(
            host.to_string(),
            CacheEntry {
                addresses: addresses.to_vec(),
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }
}

#[async_trait]
impl HostResolver for DnsResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        let normalized = host.trim_end_matches('.').to_lowercase();

        if let Some(cached) = self.get_cached(&normalized) {
            debug!("DNS cache hit for: {}", host);
            return Ok(cached);
        }

        debug!("DNS lookup for: {}", host);
        let lookup = self
            .resolver
            .lookup_ip(normalized.as_str())
            .await
            .map_err(|e| DnsError::ResolutionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        let addresses: Vec<IpAddr> = lookup.iter().collect();
        if addresses.is_empty() {
            return Err(DnsError::NoAddresses(host.to_string()));
        }

        self.cache_addresses(&normalized, &addresses);
        Ok(addresses)
    }
}

/// Fixed hosts table; never touches the network.
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_host(mut self, host: &str, addresses: &[IpAddr]) -> Self {
        self.hosts.insert(host.to_lowercase(), addresses.to_vec());
        self
    }
}

#[async_trait]
impl HostResolver for StaticResolver {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }
        match self.hosts.get(&host.to_lowercase()) {
            Some(addresses) if !addresses.is_empty() => Ok(addresses.clone()),
            _ => Err(DnsError::NoAddresses(host.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_config() -> DnsConfig {
        DnsConfig {
            use_system_dns: false,
            ..DnsConfig::default()
        }
    }

    #[tokio::test]
    async fn test_ip_literal_skips_lookup() {
        let resolver = DnsResolver::new(offline_config()).await.unwrap();

        let addrs = resolver.resolve("192.0.2.7").await.unwrap();
        assert_eq!(addrs, vec!["192.0.2.7".parse::<IpAddr>().unwrap()]);

        let addrs = resolver.resolve("2001:db8::1").await.unwrap();
        assert_eq!(addrs.len(), 1);
        assert_eq!(resolver.cache_stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_cache_hit() {
        let resolver = DnsResolver::new(offline_config()).await.unwrap();
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        resolver.cache_addresses("vpn.example.com", &[ip]);

        let addrs = resolver.resolve("VPN.example.com.").await.unwrap();
        assert_eq!(addrs, vec![ip]);
        assert_eq!(resolver.cache_stats(), (1, 1));

        resolver.clear_cache();
        assert_eq!(resolver.cache_stats(), (0, 0));
    }

    #[tokio::test]
    async fn test_cache_eviction_bound() {
        let resolver = DnsResolver::new(DnsConfig {
            max_cache_entries: 4,
            ..offline_config()
        })
        .await
        .unwrap();
        let ip: IpAddr = "198.51.100.4".parse().unwrap();
        for i in 0..10 {
            resolver.cache_addresses(&format!("host{i}.example.com"), &[ip]);
        }
        assert!(resolver.cache_stats().0 <= 4);
    }

    #[tokio::test]
    async fn test_resolve_one_prefers_ipv4() {
        let v6: IpAddr = "2001:db8::5".parse().unwrap();
        let v4: IpAddr = "203.0.113.5".parse().unwrap();
        let resolver = StaticResolver::new().with_host("dual.example.com", &[v6, v4]);

        assert_eq!(resolver.resolve_one("dual.example.com").await.unwrap(), v4);
        assert!(matches!(
            resolver.resolve_one("missing.example.com").await,
            Err(DnsError::NoAddresses(_))
        ));
    }
}
