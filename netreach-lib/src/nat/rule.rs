//! NAT rule descriptors.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use thiserror::Error;

/// Desired presence of a rule in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Presence {
    Present,
    Absent,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

#[derive(Debug, Error)]
#[error("Unknown protocol: {0}")]
pub struct ProtocolParseError(String);

impl FromStr for Protocol {
    type Err = ProtocolParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ProtocolParseError(other.to_string())),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One DNAT port-forward: public host address/port to container address/port.
///
/// Immutable value descriptor; a new desired state is a new descriptor. The
/// comment doubles as the stable identity tag (e.g. `"web.api"`) since the
/// rule store has no native rule ids.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortForward {
    pub chain: String,
    pub protocol: Protocol,
    pub host_ip: Ipv4Addr,
    pub host_port: u16,
    pub container_ip: Ipv4Addr,
    pub container_port: u16,
    /// Restrict the rule to one output device (`-o`).
    pub device: Option<String>,
    pub comment: String,
}

impl PortForward {
    /// The iptables rule specification, without table, action or chain.
    pub(crate) fn spec_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.protocol.to_string(),
            "-d".to_string(),
            self.host_ip.to_string(),
            "--dport".to_string(),
            self.host_port.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            format!("{}:{}", self.container_ip, self.container_port),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            self.comment.clone(),
        ];
        if let Some(device) = &self.device {
            args.push("-o".to_string());
            args.push(device.clone());
        }
        args
    }
}
