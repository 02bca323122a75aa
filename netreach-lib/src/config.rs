//! Helper configuration.
//!
//! Everything here is policy with documented defaults; a missing file is not
//! an error for callers that are happy with the defaults.

use serde::Deserialize;
use thiserror::Error;

use std::path::Path;
use std::time::Duration;

use tokio::fs;

use crate::nat::RetryPolicy;

pub const DEFAULT_PATH: &str = "/etc/netreach/config.toml";
pub const ENV_VAR: &str = "NETREACH_CONFIG_PATH";

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration file not found")]
    NoFile,
    #[error("IO error: {0}")]
    IO(#[from] std::io::Error),
    #[error("Deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct Config {
    /// Prefix of the two managed NAT chains (`<prefix>-PREROUTING`,
    /// `<prefix>-OUTPUT`).
    pub chain_prefix: String,
    /// Interface host addresses are bound to unless overridden per call.
    pub device: String,
    pub retry: Retry,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            chain_prefix: "netreach".to_string(),
            device: "eth0".to_string(),
            retry: Retry::default(),
        }
    }
}

/// xtables lock retry policy, see [`RetryPolicy`].
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Retry {
    pub attempts: u32,
    #[serde(with = "humantime_serde")]
    pub pause: Duration,
}

impl Default for Retry {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Retry {
            attempts: policy.attempts,
            pause: policy.pause,
        }
    }
}

impl From<Retry> for RetryPolicy {
    fn from(retry: Retry) -> Self {
        RetryPolicy {
            attempts: retry.attempts,
            pause: retry.pause,
        }
    }
}

pub async fn read(path: &Path) -> Result<Config, Error> {
    let content = fs::read_to_string(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NoFile
        } else {
            Error::IO(e)
        }
    })?;
    Ok(toml::from_str(&content)?)
}
