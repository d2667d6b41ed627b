//! Remote side of the SSH bridge
//!
//! The server gets a TUN device of its own, created by a small forwarder
//! script that we ship inline with the exec request. The script writes
//! [`READY_TOKEN`] once its device is up and then relays packets between
//! the device and its stdin/stdout using the same framing as the client.
//!
//! The forwarder exits as soon as its stdin reaches EOF, which is what
//! closing the SSH channel produces, and its device goes away with it.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ipnet::IpNet;
use std::net::IpAddr;

/// Written by the forwarder once the remote device is configured
pub const READY_TOKEN: &[u8; 6] = b"READY\n";

/// First device name the forwarder tries
const REMOTE_TUN: &str = "tun0";

const FORWARDER: &str = r#"
import errno, fcntl, os, select, signal, struct, subprocess, sys

TUNSETIFF = 0x400454CA
IFF_TUN = 0x0001
IFF_NO_PI = 0x1000

base = os.environ.get('VEIL_TUN', 'tun0')
address = os.environ['VEIL_LOCAL']
peer = os.environ['VEIL_PEER']
prefix = base.rstrip('0123456789') or 'tun'
first = int(base[len(prefix):] or 0)

signal.signal(signal.SIGTERM, lambda *_: sys.exit(0))
signal.signal(signal.SIGHUP, lambda *_: sys.exit(0))

def ip(*args):
    subprocess.run(('ip',) + args, check=True)

def open_tun():
    for n in range(first, first + 10):
        name = '%s%d' % (prefix, n)
        fd = os.open('/dev/net/tun', os.O_RDWR)
        try:
            fcntl.ioctl(fd, TUNSETIFF, struct.pack('16sH', name.encode(), IFF_TUN | IFF_NO_PI))
            return fd, name
        except OSError as e:
            os.close(fd)
            if e.errno != errno.EBUSY:
                raise
    raise OSError(errno.EBUSY, 'no free tun device')

def read_exact(fd, n):
    data = b''
    while len(data) < n:
        chunk = os.read(fd, n - len(data))
        if not chunk:
            sys.exit(0)
        data += chunk
    return data

def write_all(fd, data):
    while data:
        data = data[os.write(fd, data):]

tun, name = open_tun()
sys.stderr.write('forwarding on %s\n' % name)
ip('addr', 'add', address, 'peer', peer, 'dev', name)
ip('link', 'set', name, 'up')

stdin = sys.stdin.fileno()
stdout = sys.stdout.fileno()
write_all(stdout, b'READY\n')

while True:
    ready, _, _ = select.select([tun, stdin], [], [])
    if tun in ready:
        pkt = os.read(tun, 65535)
        if pkt:
            write_all(stdout, struct.pack('>H', len(pkt)) + pkt)
    if stdin in ready:
        size = struct.unpack('>H', read_exact(stdin, 2))[0]
        if size:
            os.write(tun, read_exact(stdin, size))
"#;

/// Shell command that prepares forwarding and NAT on the server and then
/// replaces itself with the forwarder.
///
/// `local` is our end of the point-to-point link; its network is
/// masqueraded on the server. `remote` is the server's end.
pub fn setup_command(user: &str, local: IpNet, remote: IpAddr) -> String {
    let sudo = if user == "root" { "" } else { "sudo " };
    let subnet = local.trunc();
    let script = BASE64.encode(FORWARDER);

    format!(
        "set -e\n\
         {sudo}sysctl -q -w net.ipv4.ip_forward=1\n\
         {sudo}iptables -t nat -C POSTROUTING -s {subnet} -j MASQUERADE 2>/dev/null || \
         {sudo}iptables -t nat -A POSTROUTING -s {subnet} -j MASQUERADE\n\
         exec {sudo}env VEIL_TUN={REMOTE_TUN} VEIL_LOCAL={remote} VEIL_PEER={local} \
         python3 -u -c \"$(echo '{script}' | base64 -d)\"\n",
        local = local.addr(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_command_for_unprivileged_user() {
        let cmd = setup_command("deploy", "10.0.0.2/24".parse().unwrap(), "10.0.0.1".parse().unwrap());
        assert!(cmd.starts_with("set -e\n"));
        assert!(cmd.contains("sudo sysctl -q -w net.ipv4.ip_forward=1"));
        assert!(cmd.contains("-s 10.0.0.0/24 -j MASQUERADE"));
        assert!(cmd.contains("exec sudo env VEIL_TUN=tun0 VEIL_LOCAL=10.0.0.1 VEIL_PEER=10.0.0.2 python3"));
    }

    #[test]
    fn test_root_skips_sudo() {
        let cmd = setup_command("root", "10.9.0.2/24".parse().unwrap(), "10.9.0.1".parse().unwrap());
        assert!(!cmd.contains("sudo"));
    }

    #[test]
    fn test_script_round_trips_through_base64() {
        let cmd = setup_command("root", "10.0.0.2/24".parse().unwrap(), "10.0.0.1".parse().unwrap());
        let start = cmd.find("echo '").unwrap() + "echo '".len();
        let end = start + cmd[start..].find('\'').unwrap();
        let script = BASE64.decode(&cmd[start..end]).unwrap();
        assert_eq!(String::from_utf8(script).unwrap(), FORWARDER);
        assert!(FORWARDER.contains("b'READY\\n'"));
        assert_eq!(READY_TOKEN.len(), 6);
    }
}
