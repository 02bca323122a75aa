//! Idempotent NAT rule reconciliation for the two managed chains.

use thiserror::Error;

use crate::{diagnostics, exec};

mod engine;
mod rule;

pub use engine::{Nat, RetryPolicy};
pub use rule::{PortForward, Presence, Protocol};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] exec::Error),
    #[error(transparent)]
    Unclassified(#[from] diagnostics::Unclassified),
    #[error("Gave up waiting for the xtables lock after {attempts} attempts")]
    LockTimeout { attempts: u32 },
    #[error("Unable to list chain {chain}: {diagnostic}")]
    ChainListing { chain: String, diagnostic: String },
}

impl Error {
    /// Fatal kinds must reach the top of the call stack and halt the helper;
    /// the rest are soft and the caller may retry the whole operation.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Unclassified(_) | Error::LockTimeout { .. } | Error::Exec(_)
        )
    }
}
