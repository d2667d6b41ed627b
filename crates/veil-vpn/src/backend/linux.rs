//! Linux backend: iproute2, iptables and systemd-resolved.

use super::*;
use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

/// Packet I/O through a tun-rs device
struct TunRsDevice {
    device: tun_rs::AsyncDevice,
    name: String,
}

#[async_trait]
impl TunDevice for TunRsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    async fn recv(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.device.recv(buf).await
    }

    async fn send(&self, packet: &[u8]) -> std::io::Result<usize> {
        self.device.send(packet).await
    }
}

/// Shells out to the standard Linux networking tools
#[derive(Debug, Default)]
pub struct LinuxBackend;

impl LinuxBackend {
    pub fn new() -> Self {
        Self
    }
}

async fn run(program: &str, args: &[String]) -> Result<String, BackendError> {
    let command = format!("{} {}", program, args.join(" "));
    debug!("exec: {}", command);

    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackendError::Command {
            command: command.clone(),
            message: e.to_string(),
        })?;

    if !output.status.success() {
        return Err(BackendError::Command {
            command,
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn args<const N: usize>(parts: [&str; N]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

fn route_args(action: &str, route: &RouteSpec) -> Vec<String> {
    let mut out = vec![
        if route.destination.addr().is_ipv6() { "-6" } else { "-4" }.to_string(),
        "route".to_string(),
        action.to_string(),
        route.destination.to_string(),
    ];
    if let Some(gateway) = route.gateway {
        out.push("via".to_string());
        out.push(gateway.to_string());
    }
    if let Some(interface) = &route.interface {
        out.push("dev".to_string());
        out.push(interface.name.clone());
    }
    if action == "add" {
        out.push("metric".to_string());
        out.push(route.metric.to_string());
    }
    out
}

/// Match and target for an allow rule; `None` for rules iptables cannot express.
fn rule_match(rule: &FirewallRule) -> Option<Vec<String>> {
    let mut out = match rule {
        FirewallRule::DefaultDeny => return Some(args(["-j", "DROP"])),
        FirewallRule::AllowLoopback => args(["-o", "lo"]),
        FirewallRule::AllowDhcp => args(["-p", "udp", "--sport", "68", "--dport", "67"]),
        FirewallRule::AllowAddress(ip) => vec!["-d".to_string(), ip.to_string()],
        FirewallRule::AllowInterface(name) => vec!["-o".to_string(), name.clone()],
        FirewallRule::AllowNetwork(net) => vec!["-d".to_string(), net.to_string()],
        FirewallRule::AllowProcess(_) => return None,
    };
    out.extend(args(["-j", "ACCEPT"]));
    Some(out)
}

/// `ip -j route show default`
#[derive(Debug, Deserialize)]
struct RouteEntry {
    gateway: Option<String>,
    dev: Option<String>,
}

/// `ip -j addr show`
#[derive(Debug, Deserialize)]
struct LinkEntry {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    addr_info: Vec<AddrEntry>,
}

#[derive(Debug, Deserialize)]
struct AddrEntry {
    local: Option<String>,
}

fn parse_default_route(json: &str) -> Result<(IpAddr, String), BackendError> {
    let entries: Vec<RouteEntry> =
        serde_json::from_str(json).map_err(|e| BackendError::Parse(e.to_string()))?;
    entries
        .into_iter()
        .find_map(|entry| {
            let gateway = entry.gateway?.parse().ok()?;
            Some((gateway, entry.dev?))
        })
        .ok_or_else(|| BackendError::NotFound("default route".to_string()))
}

fn parse_links(json: &str) -> Result<Vec<LinkEntry>, BackendError> {
    serde_json::from_str(json).map_err(|e| BackendError::Parse(e.to_string()))
}

fn find_link_by_address(links: &[LinkEntry], address: IpAddr) -> Option<InterfaceHandle> {
    links
        .iter()
        .find(|link| {
            link.addr_info
                .iter()
                .any(|a| a.local.as_deref().and_then(|l| l.parse::<IpAddr>().ok()) == Some(address))
        })
        .map(|link| InterfaceHandle {
            name: link.ifname.clone(),
            index: link.ifindex,
        })
}

#[async_trait]
impl NetworkBackend for LinuxBackend {
    async fn create_tun(&self, name: &str, mtu: u16) -> Result<Arc<dyn TunDevice>, BackendError> {
        let device = tun_rs::DeviceBuilder::new()
            .name(name)
            .mtu(mtu)
            .build_async()?;
        let name = device.name().unwrap_or_else(|_| name.to_string());
        Ok(Arc::new(TunRsDevice { device, name }))
    }

    async fn assign_address(
        &self,
        interface: &str,
        address: IpNet,
        peer: Option<IpAddr>,
    ) -> Result<(), BackendError> {
        let mut cmd = args(["addr", "replace"]);
        match peer {
            Some(peer) => {
                cmd.extend(["local".to_string(), address.addr().to_string()]);
                cmd.extend(["peer".to_string(), format!("{}/{}", peer, address.prefix_len())]);
            }
            None => cmd.push(address.to_string()),
        }
        cmd.extend(["dev".to_string(), interface.to_string()]);
        run("ip", &cmd).await.map(|_| ())
    }

    async fn set_link_state(&self, interface: &str, up: bool) -> Result<(), BackendError> {
        let state = if up { "up" } else { "down" };
        run("ip", &args(["link", "set", "dev", interface, state])).await.map(|_| ())
    }

    async fn add_route(&self, route: &RouteSpec) -> Result<(), BackendError> {
        run("ip", &route_args("add", route)).await.map(|_| ())
    }

    async fn remove_route(&self, route: &RouteSpec) -> Result<(), BackendError> {
        run("ip", &route_args("del", route)).await.map(|_| ())
    }

    async fn default_gateway(&self) -> Result<Gateway, BackendError> {
        let out = run("ip", &args(["-j", "-4", "route", "show", "default"])).await?;
        let (address, dev) = parse_default_route(&out)?;
        let interface = self.interface_by_name(&dev).await?;
        Ok(Gateway { address, interface })
    }

    async fn interface_by_name(&self, name: &str) -> Result<InterfaceHandle, BackendError> {
        let path = format!("/sys/class/net/{}/ifindex", name);
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| BackendError::NotFound(format!("interface {}", name)))?;
        let index = raw
            .trim()
            .parse()
            .map_err(|_| BackendError::Parse(format!("{}: {:?}", path, raw)))?;
        Ok(InterfaceHandle {
            name: name.to_string(),
            index,
        })
    }

    async fn interface_by_address(&self, address: IpAddr) -> Result<InterfaceHandle, BackendError> {
        let out = run("ip", &args(["-j", "addr", "show"])).await?;
        let links = parse_links(&out)?;
        find_link_by_address(&links, address)
            .ok_or_else(|| BackendError::NotFound(format!("interface with {}", address)))
    }

    async fn add_firewall_rule(
        &self,
        tag: &str,
        slot: usize,
        rule: &FirewallRule,
    ) -> Result<(), BackendError> {
        let matcher = rule_match(rule)
            .ok_or_else(|| BackendError::Unsupported(format!("iptables: {}", rule)))?;

        if *rule == FirewallRule::DefaultDeny {
            run("iptables", &args(["-N", tag])).await?;
            let mut append = args(["-A", tag]);
            append.extend(matcher);
            run("iptables", &append).await?;
            run("iptables", &args(["-I", "OUTPUT", "1", "-j", tag])).await?;
            return Ok(());
        }

        // Slot 0 is the trailing DROP, so allow rule `n` sits at position `n`
        let mut insert = vec!["-I".to_string(), tag.to_string(), slot.max(1).to_string()];
        insert.extend(matcher);
        run("iptables", &insert).await.map(|_| ())
    }

    async fn replace_firewall_rule(
        &self,
        tag: &str,
        slot: usize,
        rule: &FirewallRule,
    ) -> Result<(), BackendError> {
        let matcher = rule_match(rule)
            .ok_or_else(|| BackendError::Unsupported(format!("iptables: {}", rule)))?;
        let mut replace = vec!["-R".to_string(), tag.to_string(), slot.max(1).to_string()];
        replace.extend(matcher);
        run("iptables", &replace).await.map(|_| ())
    }

    async fn remove_firewall_rules(&self, tag: &str) -> Result<(), BackendError> {
        // The jump may have been inserted more than once by an earlier crash
        while run("iptables", &args(["-D", "OUTPUT", "-j", tag])).await.is_ok() {}

        if run("iptables", &args(["-F", tag])).await.is_err() {
            debug!("Chain {} not present", tag);
            return Ok(());
        }
        run("iptables", &args(["-X", tag])).await.map(|_| ())
    }

    async fn set_dns(&self, assignment: &DnsAssignment) -> Result<(), BackendError> {
        let mut servers = vec!["dns".to_string(), assignment.interface.clone()];
        servers.extend(assignment.servers.iter().map(|s| s.to_string()));
        run("resolvectl", &servers).await?;

        let mut domains = vec!["domain".to_string(), assignment.interface.clone()];
        if assignment.routing_domains.is_empty() {
            domains.push("~.".to_string());
        } else {
            domains.extend(assignment.routing_domains.iter().map(|d| format!("~{}", d)));
        }
        run("resolvectl", &domains).await?;

        let default_route = if assignment.routing_domains.is_empty() { "yes" } else { "no" };
        run(
            "resolvectl",
            &args(["default-route", assignment.interface.as_str(), default_route]),
        )
        .await
        .map(|_| ())
    }

    async fn restore_dns(&self, interface: &str) -> Result<(), BackendError> {
        run("resolvectl", &args(["revert", interface])).await.map(|_| ())
    }

    async fn flush_dns_cache(&self) -> Result<(), BackendError> {
        run("resolvectl", &args(["flush-caches"])).await.map(|_| ())
    }
}
