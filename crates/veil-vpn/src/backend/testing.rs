//! Recording backend for tests.

use super::*;
use crate::tun::memory::{MemoryTun, MemoryTunHandle};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    CreateTun(String),
    AssignAddress(String, String),
    LinkState(String, bool),
    AddRoute(String),
    RemoveRoute(String),
    AddFirewallRule(usize, FirewallRule),
    ReplaceFirewallRule(usize, FirewallRule),
    RemoveFirewallRules(String),
    SetDns(String),
    RestoreDns(String),
    FlushDns,
    /// Marker written by fakes outside the backend
    Note(String),
}

pub struct RecordingBackend {
    calls: Mutex<Vec<BackendCall>>,
    routes: Mutex<BTreeSet<String>>,
    rules: Mutex<HashMap<String, Vec<FirewallRule>>>,
    failing: Mutex<HashSet<&'static str>>,
    tun_handles: Mutex<Vec<MemoryTunHandle>>,
    gateway: Gateway,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            routes: Mutex::new(BTreeSet::new()),
            rules: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            tun_handles: Mutex::new(Vec::new()),
            gateway: Gateway {
                address: "192.168.1.1".parse().unwrap(),
                interface: InterfaceHandle {
                    name: "eth0".to_string(),
                    index: 2,
                },
            },
        }
    }

    /// Make every call of `op` fail from now on.
    pub fn fail_on(&self, op: &'static str) {
        self.failing.lock().insert(op);
    }

    pub fn recover(&self, op: &'static str) {
        self.failing.lock().remove(op);
    }

    pub fn note(&self, what: &str) {
        self.calls.lock().push(BackendCall::Note(what.to_string()));
    }

    pub fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().clear();
    }

    /// Installed route destinations
    pub fn routes(&self) -> Vec<String> {
        self.routes.lock().iter().cloned().collect()
    }

    pub fn rules(&self, tag: &str) -> Vec<FirewallRule> {
        self.rules.lock().get(tag).cloned().unwrap_or_default()
    }

    pub fn take_tun_handle(&self) -> Option<MemoryTunHandle> {
        let mut handles = self.tun_handles.lock();
        if handles.is_empty() {
            None
        } else {
            Some(handles.remove(0))
        }
    }

    /// Index of the first call matching `pred`
    pub fn position(&self, pred: impl Fn(&BackendCall) -> bool) -> Option<usize> {
        self.calls.lock().iter().position(pred)
    }

    fn record(&self, op: &'static str, call: BackendCall) -> Result<(), BackendError> {
        self.calls.lock().push(call);
        if self.failing.lock().contains(op) {
            return Err(BackendError::Command {
                command: op.to_string(),
                message: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkBackend for RecordingBackend {
    async fn create_tun(&self, name: &str, _mtu: u16) -> Result<Arc<dyn TunDevice>, BackendError> {
        self.record("create_tun", BackendCall::CreateTun(name.to_string()))?;
        let (tun, handle) = MemoryTun::pair(name);
        self.tun_handles.lock().push(handle);
        Ok(tun)
    }

    async fn assign_address(
        &self,
        interface: &str,
        address: IpNet,
        _peer: Option<IpAddr>,
    ) -> Result<(), BackendError> {
        self.record(
            "assign_address",
            BackendCall::AssignAddress(interface.to_string(), address.to_string()),
        )
    }

    async fn set_link_state(&self, interface: &str, up: bool) -> Result<(), BackendError> {
        self.record("link", BackendCall::LinkState(interface.to_string(), up))
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<(), BackendError> {
        let key = route.destination.to_string();
        self.record("add_route", BackendCall::AddRoute(key.clone()))?;
        self.routes.lock().insert(key);
        Ok(())
    }

    async fn remove_route(&self, route: &RouteSpec) -> Result<(), BackendError> {
        let key = route.destination.to_string();
        self.record("remove_route", BackendCall::RemoveRoute(key.clone()))?;
        self.routes.lock().remove(&key);
        Ok(())
    }

    async fn default_gateway(&self) -> Result<Gateway, BackendError> {
        if self.failing.lock().contains("default_gateway") {
            return Err(BackendError::NotFound("default route".to_string()));
        }
        Ok(self.gateway.clone())
    }

    async fn interface_by_name(&self, name: &str) -> Result<InterfaceHandle, BackendError> {
        Ok(InterfaceHandle {
            name: name.to_string(),
            index: 7,
        })
    }

    async fn interface_by_address(&self, address: IpAddr) -> Result<InterfaceHandle, BackendError> {
        if self.failing.lock().contains("interface_by_address") {
            return Err(BackendError::NotFound(address.to_string()));
        }
        Ok(InterfaceHandle {
            name: "veil0".to_string(),
            index: 7,
        })
    }

    async fn add_firewall_rule(
        &self,
        tag: &str,
        slot: usize,
        rule: &FirewallRule,
    ) -> Result<(), BackendError> {
        self.record("add_firewall_rule", BackendCall::AddFirewallRule(slot, rule.clone()))?;
        if matches!(rule, FirewallRule::AllowProcess(_)) {
            return Err(BackendError::Unsupported("per-process rules".to_string()));
        }
        let mut rules = self.rules.lock();
        let group = rules.entry(tag.to_string()).or_default();
        let at = slot.min(group.len());
        group.insert(at, rule.clone());
        Ok(())
    }

    async fn replace_firewall_rule(
        &self,
        tag: &str,
        slot: usize,
        rule: &FirewallRule,
    ) -> Result<(), BackendError> {
        self.record(
            "replace_firewall_rule",
            BackendCall::ReplaceFirewallRule(slot, rule.clone()),
        )?;
        let mut rules = self.rules.lock();
        match rules.get_mut(tag).and_then(|group| group.get_mut(slot)) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(())
            }
            None => Err(BackendError::NotFound(format!("{tag} slot {slot}"))),
        }
    }

    async fn remove_firewall_rules(&self, tag: &str) -> Result<(), BackendError> {
        self.record(
            "remove_firewall_rules",
            BackendCall::RemoveFirewallRules(tag.to_string()),
        )?;
        self.rules.lock().remove(tag);
        Ok(())
    }

    async fn set_dns(&self, assignment: &DnsAssignment) -> Result<(), BackendError> {
        self.record("set_dns", BackendCall::SetDns(assignment.interface.clone()))
    }

    async fn restore_dns(&self, interface: &str) -> Result<(), BackendError> {
        self.record("restore_dns", BackendCall::RestoreDns(interface.to_string()))
    }

    async fn flush_dns_cache(&self) -> Result<(), BackendError> {
        self.record("flush_dns", BackendCall::FlushDns)
    }
}
