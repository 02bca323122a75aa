//! Host interface address binding and liveness probes.
//!
//! Thin wrappers over `ip`, `arping` and `ping`. Binding follows the same
//! check-then-act discipline as the NAT engine: the address is only added or
//! removed when the interface state disagrees with the desired one.

use std::net::Ipv4Addr;

use thiserror::Error;

use crate::diagnostics::Unclassified;
use crate::exec::CommandRunner;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] crate::exec::Error),
    #[error(transparent)]
    Unclassified(#[from] Unclassified),
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|p| p.to_string()).collect()
}

/// Whether `ip` is bound to `device` as a /32 host address.
pub async fn is_bound<R: CommandRunner>(
    runner: &R,
    ip: Ipv4Addr,
    device: &str,
) -> Result<bool, Error> {
    let out = runner
        .run("ip", &args(&["-o", "-4", "addr", "show", "dev", device]))
        .await?;
    if !out.success {
        return Err(Unclassified::from_captured("ip", &out).into());
    }
    Ok(out.stdout.contains(&format!("{ip}/32")))
}

/// Binds `ip` to `device` when not already bound; returns whether it mutated.
pub async fn ensure_bound<R: CommandRunner>(
    runner: &R,
    ip: Ipv4Addr,
    device: &str,
) -> Result<bool, Error> {
    if is_bound(runner, ip, device).await? {
        tracing::debug!(%ip, device, "address already bound");
        return Ok(false);
    }
    let cidr = format!("{ip}/32");
    let out = runner
        .run("ip", &args(&["-o", "addr", "add", &cidr, "dev", device]))
        .await?;
    if !out.success {
        return Err(Unclassified::from_captured("ip", &out).into());
    }
    tracing::info!(%ip, device, "address bound");
    Ok(true)
}

/// Releases `ip` from `device` when bound; returns whether it mutated.
pub async fn ensure_unbound<R: CommandRunner>(
    runner: &R,
    ip: Ipv4Addr,
    device: &str,
) -> Result<bool, Error> {
    if !is_bound(runner, ip, device).await? {
        tracing::debug!(%ip, device, "address already unbound");
        return Ok(false);
    }
    let cidr = format!("{ip}/32");
    let out = runner
        .run("ip", &args(&["-o", "addr", "delete", &cidr, "dev", device]))
        .await?;
    if !out.success {
        return Err(Unclassified::from_captured("ip", &out).into());
    }
    tracing::info!(%ip, device, "address released");
    Ok(true)
}

/// Announces `ip` on `device` via gratuitous ARP so neighbors update their
/// caches after a bind.
pub async fn announce<R: CommandRunner>(
    runner: &R,
    ip: Ipv4Addr,
    device: &str,
) -> Result<(), Error> {
    let ip = ip.to_string();
    let out = runner
        .run(
            "arping",
            &args(&["-c", "4", "-w", "3", "-U", "-I", device, &ip]),
        )
        .await?;
    if !out.success {
        return Err(Unclassified::from_captured("arping", &out).into());
    }
    Ok(())
}

/// Whether `ip` answers ICMP echo; a failed probe is a result, not an error.
pub async fn is_alive<R: CommandRunner>(runner: &R, ip: Ipv4Addr) -> Result<bool, Error> {
    let ip = ip.to_string();
    let out = runner
        .run("ping", &args(&["-n", "-q", "-c", "3", &ip]))
        .await?;
    Ok(out.success)
}
