use clap::{Args, Parser, Subcommand};

use std::fmt;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::str::FromStr;

use netreach_lib::config;
use netreach_lib::nat::Protocol;

/// Netreach control-plane helper - reconciles container reachability on this host
#[derive(Clone, Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// General configuration file
    #[arg(
        short,
        long,
        env = config::ENV_VAR,
        default_value = config::DEFAULT_PATH,
        )]
    pub config_path: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Create the managed NAT chains and hook them into PREROUTING/OUTPUT
    Init,
    /// Ensure a DNAT port-forward for a container exists
    Expose(ForwardArgs),
    /// Ensure a DNAT port-forward is removed
    Withdraw(ForwardArgs),
    /// Delete every managed rule referencing an address
    Sweep {
        /// Address whose rules are torn down
        ip: Ipv4Addr,
    },
    /// Bind a host address and announce it via gratuitous ARP
    Bind(BindArgs),
    /// Release a previously bound host address
    Unbind(BindArgs),
    /// Ensure an overlay profile and its inbound allow-rules
    Profile(ProfileArgs),
}

#[derive(Clone, Debug, Args)]
pub struct ForwardArgs {
    /// Public address traffic arrives on
    #[arg(long)]
    pub host_ip: Ipv4Addr,

    /// Public port traffic arrives on
    #[arg(long)]
    pub host_port: u16,

    /// Container address traffic is forwarded to
    #[arg(long)]
    pub container_ip: Ipv4Addr,

    /// Container port traffic is forwarded to
    #[arg(long)]
    pub container_port: u16,

    /// Protocol (tcp or udp)
    #[arg(long, default_value = "tcp")]
    pub protocol: Protocol,

    /// Stable identity tag of the rule, e.g. "app.proc"
    #[arg(long)]
    pub comment: String,

    /// Restrict the rule to one output device
    #[arg(long)]
    pub device: Option<String>,

    /// Attach to the OUTPUT-hooked chain instead of the PREROUTING one
    #[arg(long)]
    pub via_output: bool,
}

#[derive(Clone, Debug, Args)]
pub struct BindArgs {
    /// Host address to bind
    #[arg(long)]
    pub ip: Ipv4Addr,

    /// Interface to bind to (defaults to the configured device)
    #[arg(long)]
    pub device: Option<String>,
}

#[derive(Clone, Debug, Args)]
pub struct ProfileArgs {
    /// Profile name, one per workload identity
    pub name: String,

    /// Inbound allow-rule as <protocol>:<port>, repeatable
    #[arg(long = "allow")]
    pub allow: Vec<AllowRule>,

    /// Also allow all inbound traffic from the default tag
    #[arg(long)]
    pub default_allow: bool,
}

/// An inbound allow predicate, written `tcp:80` or `udp:53`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllowRule {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct AllowRuleParseError(String);

impl fmt::Display for AllowRuleParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Expected <protocol>:<port>, got: {}", self.0)
    }
}

impl std::error::Error for AllowRuleParseError {}

impl FromStr for AllowRule {
    type Err = AllowRuleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (protocol, port) = s.split_once(':').ok_or_else(|| AllowRuleParseError(s.to_string()))?;
        let protocol = protocol
            .parse::<Protocol>()
            .map_err(|_| AllowRuleParseError(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AllowRuleParseError(s.to_string()))?;
        Ok(AllowRule { protocol, port })
    }
}

pub fn parse() -> Cli {
    Cli::parse()
}
