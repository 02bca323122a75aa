//! Host-side network reachability reconciliation for containers.
//!
//! Everything here is a thin, idempotent layer over externally owned state:
//! the kernel NAT table (via `iptables`), host interface addresses (via
//! `ip`/`arping`/`ping`) and the overlay policy service (via `calicoctl`).
//! No state is held between calls; every operation queries the store fresh
//! and mutates only when the desired state disagrees with what is there.

pub mod addr;
pub mod config;
pub mod diagnostics;
pub mod exec;
pub mod logging;
pub mod nat;
pub mod profile;

#[cfg(test)]
mod mocks;
