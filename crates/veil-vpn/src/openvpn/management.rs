//! OpenVPN management interface
//!
//! Line-oriented: asynchronous notifications start with `>` and commands
//! are single lines terminated by `\n`.

use crate::tunnel::{TunnelError, TunnelState};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, trace};

const CONNECT_ATTEMPTS: usize = 10;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_DELAY: Duration = Duration::from_millis(500);
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Connection state reported by the daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteState {
    Connected,
    Reconnecting,
    Exiting,
    /// CONNECTING, WAIT, AUTH or GET_CONFIG
    Connecting(String),
    Other(String),
}

impl RemoteState {
    fn parse(token: &str) -> Self {
        match token {
            "CONNECTED" => RemoteState::Connected,
            "RECONNECTING" => RemoteState::Reconnecting,
            "EXITING" => RemoteState::Exiting,
            "CONNECTING" | "WAIT" | "AUTH" | "GET_CONFIG" => RemoteState::Connecting(token.to_string()),
            other => RemoteState::Other(other.to_string()),
        }
    }

    /// Local state this maps to, if any
    pub fn tunnel_state(&self) -> Option<TunnelState> {
        match self {
            RemoteState::Connected => Some(TunnelState::Connected),
            RemoteState::Reconnecting => Some(TunnelState::Reconnecting),
            RemoteState::Exiting => Some(TunnelState::Disconnecting),
            RemoteState::Connecting(_) => Some(TunnelState::Connecting),
            RemoteState::Other(_) => None,
        }
    }
}

/// A parsed management line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagementEvent {
    /// `>STATE:<ts>,<state>,<desc>,<local_ip>,<remote_ip>`
    State {
        state: RemoteState,
        local_ip: Option<IpAddr>,
    },
    /// `>BYTECOUNT:<in>,<out>`
    ByteCount { received: u64, sent: u64 },
    /// `>PASSWORD:...`
    PasswordRequest { auth: bool },
    Info(String),
    /// Command replies and anything unrecognized
    Other(String),
}

/// Parse one management line.
pub fn parse_line(line: &str) -> ManagementEvent {
    let line = line.trim_end_matches(['\r', '\n']);

    if let Some(rest) = line.strip_prefix(">STATE:") {
        let parts: Vec<&str> = rest.split(',').collect();
        if parts.len() < 2 {
            return ManagementEvent::Other(line.to_string());
        }
        let state = RemoteState::parse(parts[1]);
        let local_ip = match state {
            RemoteState::Connected => parts.get(3).and_then(|ip| ip.parse().ok()),
            _ => None,
        };
        return ManagementEvent::State { state, local_ip };
    }

    if let Some(rest) = line.strip_prefix(">BYTECOUNT:") {
        let mut parts = rest.split(',');
        let received = parts.next().and_then(|v| v.trim().parse().ok());
        let sent = parts.next().and_then(|v| v.trim().parse().ok());
        return match (received, sent) {
            (Some(received), Some(sent)) => ManagementEvent::ByteCount { received, sent },
            _ => ManagementEvent::Other(line.to_string()),
        };
    }

    if let Some(rest) = line.strip_prefix(">PASSWORD:") {
        return ManagementEvent::PasswordRequest {
            auth: rest.contains("Auth"),
        };
    }

    if let Some(rest) = line.strip_prefix(">INFO:") {
        return ManagementEvent::Info(rest.to_string());
    }

    ManagementEvent::Other(line.to_string())
}

/// Quote a value for a management command argument.
fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

pub fn username_command(user: &str) -> String {
    format!("username 'Auth' {}", quote(user))
}

pub fn password_command(pass: &str) -> String {
    format!("password 'Auth' {}", quote(pass))
}

/// Write side of the management connection
pub struct ManagementWriter {
    stream: Mutex<OwnedWriteHalf>,
}

impl ManagementWriter {
    pub async fn send(&self, command: &str) -> Result<(), TunnelError> {
        let mut stream = self.stream.lock().await;
        let line = format!("{command}\n");
        tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(line.as_bytes()))
            .await
            .map_err(|_| TunnelError::Timeout("management write".into()))??;
        trace!("management <- {}", command.split(' ').next().unwrap_or_default());
        Ok(())
    }

    /// Half-close the connection. Later sends fail.
    pub async fn close(&self) {
        if let Err(e) = self.stream.lock().await.shutdown().await {
            debug!("Management shutdown failed: {}", e);
        }
    }
}

/// Read side of the management connection
pub type ManagementLines = Lines<BufReader<OwnedReadHalf>>;

/// Connect to the management port, retrying while the daemon starts.
pub async fn connect(port: u16) -> Result<(ManagementLines, ManagementWriter), TunnelError> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                debug!("Management interface connected on attempt {}", attempt);
                let (read, write) = stream.into_split();
                return Ok((
                    BufReader::new(read).lines(),
                    ManagementWriter {
                        stream: Mutex::new(write),
                    },
                ));
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = "timed out".to_string(),
        }
        tokio::time::sleep(RETRY_DELAY).await;
    }

    Err(TunnelError::Process(format!(
        "failed to connect to management interface: {last_error}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_state_captures_local_ip() {
        let event = parse_line(">STATE:1700000000,CONNECTED,SUCCESS,10.8.0.5,203.0.113.9");
        assert_eq!(
            event,
            ManagementEvent::State {
                state: RemoteState::Connected,
                local_ip: Some("10.8.0.5".parse().unwrap()),
            }
        );

        let empty_desc = parse_line(">STATE:1700000000,CONNECTED,,10.8.0.5,203.0.113.9\r\n");
        assert!(matches!(
            empty_desc,
            ManagementEvent::State { local_ip: Some(_), .. }
        ));
    }

    #[test]
    fn test_state_mapping() {
        for (token, expected) in [
            ("WAIT", Some(TunnelState::Connecting)),
            ("AUTH", Some(TunnelState::Connecting)),
            ("GET_CONFIG", Some(TunnelState::Connecting)),
            ("RECONNECTING", Some(TunnelState::Reconnecting)),
            ("EXITING", Some(TunnelState::Disconnecting)),
            ("ASSIGN_IP", None),
        ] {
            let ManagementEvent::State { state, local_ip } = parse_line(&format!(">STATE:1,{token},x")) else {
                panic!("{token} did not parse as a state");
            };
            assert_eq!(state.tunnel_state(), expected, "{token}");
            assert_eq!(local_ip, None);
        }
    }

    #[test]
    fn test_bytecount() {
        assert_eq!(
            parse_line(">BYTECOUNT:1024,2048"),
            ManagementEvent::ByteCount {
                received: 1024,
                sent: 2048,
            }
        );
        assert!(matches!(parse_line(">BYTECOUNT:x,2"), ManagementEvent::Other(_)));
    }

    #[test]
    fn test_password_and_info() {
        assert_eq!(
            parse_line(">PASSWORD:Need 'Auth' username/password"),
            ManagementEvent::PasswordRequest { auth: true }
        );
        assert_eq!(
            parse_line(">PASSWORD:Need 'Private Key' password"),
            ManagementEvent::PasswordRequest { auth: false }
        );
        assert_eq!(
            parse_line(">INFO:OpenVPN Management Interface Version 5"),
            ManagementEvent::Info("OpenVPN Management Interface Version 5".to_string())
        );
        assert!(matches!(parse_line("SUCCESS: hold release succeeded"), ManagementEvent::Other(_)));
    }

    #[test]
    fn test_auth_commands_quote_values() {
        assert_eq!(username_command("alice"), "username 'Auth' \"alice\"");
        assert_eq!(password_command("p\"w d"), "password 'Auth' \"p\\\"w d\"");
    }
}
