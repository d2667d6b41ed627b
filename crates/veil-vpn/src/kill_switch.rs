//! Kill Switch
//!
//! Blocks all outbound traffic except what the tunnel needs, so nothing
//! leaks in clear text if the tunnel drops.
//!
//! # Rule order
//!
//! Slot 0 is the default deny. Allow rules follow in this order:
//!
//! 1. loopback
//! 2. DHCP
//! 3. VPN server address
//! 4. VPN interface
//! 5. LAN ranges (optional)
//! 6. allowed processes (optional, where the backend supports them)
//!
//! All rules carry this engine's tag, so disarming removes exactly what
//! was installed and nothing else.

use crate::backend::{BackendError, FirewallRule, NetworkBackend};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Tag of the rule group owned by the kill switch
pub const DEFAULT_TAG: &str = "VEIL_KILLSWITCH";

/// Private and link-local ranges allowed when LAN access is on
pub const LAN_RANGES: [(Ipv4Addr, u8); 4] = [
    (Ipv4Addr::new(10, 0, 0, 0), 8),
    (Ipv4Addr::new(172, 16, 0, 0), 12),
    (Ipv4Addr::new(192, 168, 0, 0), 16),
    (Ipv4Addr::new(169, 254, 0, 0), 16),
];

/// What the kill switch lets through
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KillSwitchConfig {
    pub allow_lan: bool,
    pub vpn_server: Option<IpAddr>,
    pub vpn_interface: Option<String>,
    pub allowed_processes: Vec<String>,
}

impl KillSwitchConfig {
    /// Rules in installation order
    pub fn rules(&self) -> Vec<FirewallRule> {
        let mut rules = vec![
            FirewallRule::DefaultDeny,
            FirewallRule::AllowLoopback,
            FirewallRule::AllowDhcp,
        ];
        if let Some(server) = self.vpn_server {
            rules.push(FirewallRule::AllowAddress(server));
        }
        if let Some(interface) = &self.vpn_interface {
            rules.push(FirewallRule::AllowInterface(interface.clone()));
        }
        if self.allow_lan {
            for (addr, prefix) in LAN_RANGES {
                if let Ok(net) = IpNet::new(IpAddr::V4(addr), prefix) {
                    rules.push(FirewallRule::AllowNetwork(net));
                }
            }
        }
        for process in &self.allowed_processes {
            rules.push(FirewallRule::AllowProcess(process.clone()));
        }
        rules
    }
}

/// Kill switch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSwitchState {
    /// No rules installed
    Disarmed,
    /// Rules installed; only allowed traffic passes
    Armed,
}

/// One installed generation
struct Generation {
    config: KillSwitchConfig,
    /// Installed rules by slot
    rules: Vec<FirewallRule>,
}

/// Kill switch policy engine
pub struct KillSwitch {
    backend: Arc<dyn NetworkBackend>,
    tag: String,
    active: Mutex<Option<Generation>>,
}

impl KillSwitch {
    pub fn new(backend: Arc<dyn NetworkBackend>) -> Self {
        Self::with_tag(backend, DEFAULT_TAG)
    }

    pub fn with_tag(backend: Arc<dyn NetworkBackend>, tag: &str) -> Self {
        Self {
            backend,
            tag: tag.to_string(),
            active: Mutex::new(None),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub async fn state(&self) -> KillSwitchState {
        if self.active.lock().await.is_some() {
            KillSwitchState::Armed
        } else {
            KillSwitchState::Disarmed
        }
    }

    pub async fn is_armed(&self) -> bool {
        self.state().await == KillSwitchState::Armed
    }

    /// Installed rules, in slot order
    pub async fn rules(&self) -> Vec<FirewallRule> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|generation| generation.rules.clone())
            .unwrap_or_default()
    }

    /// Arm with `config`, replacing any previous generation.
    ///
    /// If a required rule fails, everything installed so far is removed.
    pub async fn enable(&self, config: KillSwitchConfig) -> Result<(), KillSwitchError> {
        let mut active = self.active.lock().await;

        if active.is_some() {
            debug!("Kill switch re-armed, removing previous rules");
            // Stays armed if removal fails so a later disable can retry
            self.backend.remove_firewall_rules(&self.tag).await?;
            *active = None;
        }

        let mut installed = Vec::new();
        for rule in config.rules() {
            let slot = installed.len();
            match self.backend.add_firewall_rule(&self.tag, slot, &rule).await {
                Ok(()) => installed.push(rule),
                Err(e) if matches!(rule, FirewallRule::AllowProcess(_)) => {
                    warn!("Kill switch: skipping '{}': {}", rule, e);
                }
                Err(e) => {
                    warn!("Kill switch: '{}' failed, rolling back", rule);
                    if let Err(cleanup) = self.backend.remove_firewall_rules(&self.tag).await {
                        warn!("Kill switch rollback failed: {}", cleanup);
                        *active = Some(Generation {
                            config,
                            rules: installed,
                        });
                    }
                    return Err(KillSwitchError::Rule { rule, source: e });
                }
            }
        }

        info!(
            "Kill switch armed with {} rules (server {:?}, interface {:?}, lan {})",
            installed.len(),
            config.vpn_server,
            config.vpn_interface,
            config.allow_lan
        );
        *active = Some(Generation {
            config,
            rules: installed,
        });
        Ok(())
    }

    /// Remove all rules. Does nothing when already disarmed.
    pub async fn disable(&self) -> Result<(), KillSwitchError> {
        let mut active = self.active.lock().await;
        if active.is_none() {
            return Ok(());
        }

        self.backend.remove_firewall_rules(&self.tag).await?;
        *active = None;
        info!("Kill switch disarmed");
        Ok(())
    }

    /// Point the interface allow rule at `interface`, leaving every other
    /// rule in place.
    pub async fn update_vpn_interface(&self, interface: &str) -> Result<(), KillSwitchError> {
        let mut active = self.active.lock().await;
        let Some(generation) = active.as_mut() else {
            return Ok(());
        };

        let rule = FirewallRule::AllowInterface(interface.to_string());
        let existing = generation
            .rules
            .iter()
            .position(|r| matches!(r, FirewallRule::AllowInterface(_)));

        match existing {
            Some(slot) if generation.rules[slot] == rule => {}
            Some(slot) => {
                self.backend.replace_firewall_rule(&self.tag, slot, &rule).await?;
                generation.rules[slot] = rule;
            }
            None => {
                // Right after the server rule, ahead of LAN and process rules
                let slot = generation
                    .rules
                    .iter()
                    .position(|r| {
                        matches!(r, FirewallRule::AllowNetwork(_) | FirewallRule::AllowProcess(_))
                    })
                    .unwrap_or(generation.rules.len());
                self.backend.add_firewall_rule(&self.tag, slot, &rule).await?;
                generation.rules.insert(slot, rule);
            }
        }

        generation.config.vpn_interface = Some(interface.to_string());
        debug!("Kill switch now allows interface {}", interface);
        Ok(())
    }

    /// Remove rules left behind by an earlier process, armed or not.
    pub async fn purge(&self) -> Result<(), KillSwitchError> {
        let mut active = self.active.lock().await;
        self.backend.remove_firewall_rules(&self.tag).await?;
        *active = None;
        Ok(())
    }
}

/// Kill switch errors
#[derive(Debug, thiserror::Error)]
pub enum KillSwitchError {
    #[error("Failed to install kill switch rule '{rule}': {source}")]
    Rule {
        rule: FirewallRule,
        #[source]
        source: BackendError,
    },

    #[error("Network backend error: {0}")]
    Backend(#[from] BackendError),
}
