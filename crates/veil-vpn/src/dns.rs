//! DNS policy engine
//!
//! Points the tunnel interface at the configured resolvers, either for
//! every query or only for a set of split domains, and undoes it on reset.

use crate::backend::{BackendError, DnsAssignment, NetworkBackend};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// DNS settings for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsConfig {
    pub interface: String,
    pub servers: Vec<String>,
    pub split_dns: bool,
    pub domains: Vec<String>,
}

impl DnsConfig {
    fn assignment(&self) -> Result<DnsAssignment, DnsEngineError> {
        let servers = self
            .servers
            .iter()
            .map(|s| {
                s.trim()
                    .parse::<IpAddr>()
                    .map_err(|_| DnsEngineError::InvalidServer(s.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let routing_domains = if self.split_dns {
            self.domains
                .iter()
                .map(|d| d.trim().trim_start_matches("*.").trim_matches('.').to_string())
                .filter(|d| !d.is_empty())
                .collect()
        } else {
            Vec::new()
        };

        Ok(DnsAssignment {
            interface: self.interface.clone(),
            servers,
            routing_domains,
        })
    }
}

/// DNS policy engine
pub struct DnsEngine {
    backend: Arc<dyn NetworkBackend>,
    configured: Mutex<Option<DnsAssignment>>,
}

impl DnsEngine {
    pub fn new(backend: Arc<dyn NetworkBackend>) -> Self {
        Self {
            backend,
            configured: Mutex::new(None),
        }
    }

    /// Apply `config`, first undoing any earlier configuration.
    pub async fn configure(&self, config: &DnsConfig) -> Result<(), DnsEngineError> {
        let assignment = config.assignment()?;
        if assignment.servers.is_empty() {
            debug!("No DNS servers configured, leaving system DNS alone");
            return Ok(());
        }

        let mut configured = self.configured.lock().await;
        if let Some(previous) = configured.take() {
            if previous.interface != assignment.interface {
                self.backend.restore_dns(&previous.interface).await?;
            }
        }

        self.backend.set_dns(&assignment).await?;
        info!(
            "DNS servers {:?} on {}{}",
            assignment.servers,
            assignment.interface,
            if assignment.routing_domains.is_empty() {
                String::new()
            } else {
                format!(" for {:?}", assignment.routing_domains)
            }
        );
        *configured = Some(assignment);
        Ok(())
    }

    /// Restore the original configuration. Nothing happens if none was changed.
    pub async fn reset(&self) -> Result<(), DnsEngineError> {
        let mut configured = self.configured.lock().await;
        let Some(assignment) = configured.as_ref() else {
            return Ok(());
        };

        self.backend.restore_dns(&assignment.interface).await?;
        info!("DNS restored on {}", assignment.interface);
        *configured = None;
        Ok(())
    }

    pub async fn flush_cache(&self) -> Result<(), DnsEngineError> {
        self.backend.flush_dns_cache().await?;
        debug!("DNS cache flushed");
        Ok(())
    }

    pub async fn is_configured(&self) -> bool {
        self.configured.lock().await.is_some()
    }
}

/// DNS engine errors
#[derive(Debug, thiserror::Error)]
pub enum DnsEngineError {
    #[error("Invalid DNS server '{0}'")]
    InvalidServer(String),

    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::{BackendCall, RecordingBackend};

    fn config(split: bool) -> DnsConfig {
        DnsConfig {
            interface: "veil0".to_string(),
            servers: vec!["10.0.0.1".to_string(), "1.1.1.1".to_string()],
            split_dns: split,
            domains: vec!["*.corp.example".to_string(), "lab.example.".to_string()],
        }
    }

    #[test]
    fn test_split_assignment() {
        let assignment = config(true).assignment().unwrap();
        assert_eq!(assignment.routing_domains, vec!["corp.example", "lab.example"]);
        assert_eq!(assignment.servers.len(), 2);

        let full = config(false).assignment().unwrap();
        assert!(full.routing_domains.is_empty());
    }

    #[test]
    fn test_invalid_server() {
        let mut cfg = config(false);
        cfg.servers.push("dns.google".to_string());
        assert!(matches!(cfg.assignment(), Err(DnsEngineError::InvalidServer(_))));
    }

    #[tokio::test]
    async fn test_configure_and_reset() {
        let backend = Arc::new(RecordingBackend::new());
        let engine = DnsEngine::new(backend.clone());

        engine.reset().await.unwrap();
        assert!(backend.calls().is_empty());

        engine.configure(&config(true)).await.unwrap();
        engine.flush_cache().await.unwrap();
        assert!(engine.is_configured().await);
        engine.reset().await.unwrap();
        engine.reset().await.unwrap();

        assert_eq!(
            backend.calls(),
            vec![
                BackendCall::SetDns("veil0".to_string()),
                BackendCall::FlushDns,
                BackendCall::RestoreDns("veil0".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_servers_is_noop() {
        let backend = Arc::new(RecordingBackend::new());
        let engine = DnsEngine::new(backend.clone());
        let mut cfg = config(false);
        cfg.servers.clear();

        engine.configure(&cfg).await.unwrap();
        assert!(!engine.is_configured().await);
        assert!(backend.calls().is_empty());
    }
}
