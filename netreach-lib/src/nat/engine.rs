//! The reconciliation engine: check-then-act against the shared NAT table.
//!
//! The kernel rule store is host-wide mutable state with no ownership
//! partitioning; any process may be a concurrent mutator. Every operation
//! here therefore queries fresh and mutates only on disagreement, and treats
//! "already there" / "already gone" as success. Lock contention on the
//! xtables advisory lock is retried with a bounded, configurable pause.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::time;

use crate::diagnostics::{self, Markers, RuleState, Unclassified};
use crate::exec::{Captured, CommandRunner};

use super::Error;
use super::rule::{PortForward, Presence};

const IPTABLES: &str = "iptables";
const TABLE: &str = "nat";

/// Bounded retry for xtables lock contention during rule queries.
///
/// The defaults (3 attempts, 15s pause) match what reconciliation loops on a
/// busy container host tolerate; they are policy, so deployments may tune
/// them through the configuration file.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 3,
            pause: Duration::from_secs(15),
        }
    }
}

/// Idempotent client for the two managed NAT chains.
///
/// Generic over `R: CommandRunner` so tests can inject a mock rule store.
#[derive(Clone)]
pub struct Nat<R: CommandRunner> {
    runner: R,
    markers: Markers,
    retry: RetryPolicy,
    prerouting_chain: String,
    output_chain: String,
}

impl<R: CommandRunner> Nat<R> {
    /// Creates a client managing `<prefix>-PREROUTING` and `<prefix>-OUTPUT`.
    pub fn new(runner: R, prefix: &str, retry: RetryPolicy) -> Self {
        Nat {
            runner,
            markers: Markers::default(),
            retry,
            prerouting_chain: format!("{prefix}-PREROUTING"),
            output_chain: format!("{prefix}-OUTPUT"),
        }
    }

    /// Replaces the diagnostic markers, for stores with different wording.
    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }

    pub fn prerouting_chain(&self) -> &str {
        &self.prerouting_chain
    }

    pub fn output_chain(&self) -> &str {
        &self.output_chain
    }

    async fn iptables(&self, args: Vec<String>) -> Result<Captured, Error> {
        Ok(self.runner.run(IPTABLES, &args).await?)
    }

    /// Probes the store once for the exact rule (`-C`), classified.
    pub async fn check(&self, rule: &PortForward) -> Result<RuleState, Error> {
        let mut args = vec![
            "-t".to_string(),
            TABLE.to_string(),
            "-C".to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.spec_args());
        let out = self.iptables(args).await?;
        Ok(diagnostics::classify(&self.markers, IPTABLES, &out)?)
    }

    /// Queries presence, riding out bounded lock contention.
    async fn query(&self, rule: &PortForward) -> Result<bool, Error> {
        for attempt in 1..=self.retry.attempts {
            match self.check(rule).await? {
                RuleState::Present => return Ok(true),
                RuleState::Absent => return Ok(false),
                RuleState::Contended => {
                    tracing::warn!(
                        attempt,
                        chain = %rule.chain,
                        comment = %rule.comment,
                        "xtables lock held, pausing before retry"
                    );
                    time::sleep(self.retry.pause).await;
                }
            }
        }
        Err(Error::LockTimeout {
            attempts: self.retry.attempts,
        })
    }

    /// Brings the store in line with `want` for one rule.
    ///
    /// Returns whether a mutating command was issued. Repeated calls with the
    /// same descriptor and desired state never mutate twice: the second call
    /// observes the store already agreeing and is a pure query.
    pub async fn ensure(&self, rule: &PortForward, want: Presence) -> Result<bool, Error> {
        let present = self.query(rule).await?;
        let desired = want == Presence::Present;
        if present == desired {
            tracing::debug!(
                chain = %rule.chain,
                comment = %rule.comment,
                ?want,
                "rule already in desired state"
            );
            return Ok(false);
        }

        let action = match want {
            Presence::Present => "-A",
            Presence::Absent => "-D",
        };
        let mut args = vec![
            "-t".to_string(),
            TABLE.to_string(),
            action.to_string(),
            rule.chain.clone(),
        ];
        args.extend(rule.spec_args());
        let out = self.iptables(args).await?;
        if !out.success {
            // A concurrent remover may win the race between query and delete.
            if want == Presence::Absent && out.diagnostic().contains(&self.markers.not_found) {
                return Ok(false);
            }
            return Err(Unclassified::from_captured(IPTABLES, &out).into());
        }
        tracing::info!(
            chain = %rule.chain,
            comment = %rule.comment,
            action,
            "rule mutated"
        );
        Ok(true)
    }

    /// Creates both managed chains and hooks them into their parents.
    pub async fn bootstrap(&self) -> Result<(), Error> {
        self.ensure_chain(&self.prerouting_chain).await?;
        self.ensure_chain(&self.output_chain).await
    }

    /// Ensures `chain` exists and is hooked into its parent built-in chain.
    ///
    /// The parent is the suffix after the last `-` of the chain name
    /// (`lain-PREROUTING` hooks into `PREROUTING`). Both the create and the
    /// hook tolerate a concurrent process having got there first.
    pub async fn ensure_chain(&self, chain: &str) -> Result<(), Error> {
        let parent = parent_chain(chain);

        let listed = self
            .iptables(vec![
                "-n".to_string(),
                "-t".to_string(),
                TABLE.to_string(),
                "-L".to_string(),
                chain.to_string(),
            ])
            .await?;
        if !listed.success {
            if !listed.diagnostic().contains(&self.markers.not_found) {
                return Err(Unclassified::from_captured(IPTABLES, &listed).into());
            }
            let created = self
                .iptables(vec![
                    "-t".to_string(),
                    TABLE.to_string(),
                    "-N".to_string(),
                    chain.to_string(),
                ])
                .await?;
            if !created.success {
                // Lost the create race; the chain is there either way.
                if !created.diagnostic().contains(&self.markers.chain_exists) {
                    return Err(Unclassified::from_captured(IPTABLES, &created).into());
                }
            } else {
                tracing::info!(chain, "created NAT chain");
            }
        }

        let probe = self
            .iptables(vec![
                "-t".to_string(),
                TABLE.to_string(),
                "-C".to_string(),
                parent.to_string(),
                "-j".to_string(),
                chain.to_string(),
            ])
            .await?;
        if probe.success {
            return Ok(());
        }
        if !probe.diagnostic().contains(&self.markers.not_found) {
            return Err(Unclassified::from_captured(IPTABLES, &probe).into());
        }
        let hooked = self
            .iptables(vec![
                "-t".to_string(),
                TABLE.to_string(),
                "-A".to_string(),
                parent.to_string(),
                "-j".to_string(),
                chain.to_string(),
            ])
            .await?;
        if !hooked.success {
            return Err(Unclassified::from_captured(IPTABLES, &hooked).into());
        }
        tracing::info!(chain, parent, "hooked NAT chain into parent");
        Ok(())
    }

    /// Lists the chain's rules as canonical specification lines (`-S`).
    pub async fn list(&self, chain: &str) -> Result<Vec<String>, Error> {
        let out = self
            .iptables(vec![
                "-t".to_string(),
                TABLE.to_string(),
                "-S".to_string(),
                chain.to_string(),
            ])
            .await?;
        if !out.success {
            return Err(Error::ChainListing {
                chain: chain.to_string(),
                diagnostic: out.diagnostic().trim().to_string(),
            });
        }
        Ok(out.stdout.lines().map(str::to_string).collect())
    }

    /// Deletes every rule in `chain` referencing `ip` (as `<ip>/32`).
    ///
    /// Deletion is driven by the store's own canonical listing text, not by a
    /// reconstructed descriptor, so formatting differences cannot cause a
    /// mismatch. Returns the number of deletes issued.
    pub async fn sweep(&self, chain: &str, ip: Ipv4Addr) -> Result<usize, Error> {
        let needle = format!("{ip}/32");
        let mut deleted = 0;
        for line in self.list(chain).await? {
            if !line.contains(&needle) {
                continue;
            }
            let Some(args) = delete_args_from_listing(&line) else {
                continue;
            };
            let out = self.iptables(args).await?;
            if !out.success {
                // A concurrent sweeper may have removed it between list and delete.
                if !out.diagnostic().contains(&self.markers.not_found) {
                    return Err(Unclassified::from_captured(IPTABLES, &out).into());
                }
                continue;
            }
            deleted += 1;
        }
        if deleted > 0 {
            tracing::info!(chain, %ip, deleted, "swept NAT rules");
        }
        Ok(deleted)
    }

    /// Sweeps both managed chains; used on container teardown.
    pub async fn sweep_all(&self, ip: Ipv4Addr) -> Result<usize, Error> {
        let mut deleted = self.sweep(&self.prerouting_chain, ip).await?;
        deleted += self.sweep(&self.output_chain, ip).await?;
        Ok(deleted)
    }

    /// Whether any managed rule still references `ip`.
    pub async fn contains(&self, ip: Ipv4Addr) -> Result<bool, Error> {
        let needle = format!("{ip}/32");
        for chain in [&self.prerouting_chain, &self.output_chain] {
            if self.list(chain).await?.iter().any(|l| l.contains(&needle)) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Parent built-in chain for a managed chain: the suffix after the last `-`.
fn parent_chain(chain: &str) -> &str {
    chain.rsplit('-').next().unwrap_or(chain)
}

/// Rebuilds a delete command from one `-S` listing line.
///
/// Only `-A` lines are eligible; `-N`/`-P` lines carry no rule spec and must
/// never be fed through the drop-first-token transform.
fn delete_args_from_listing(line: &str) -> Option<Vec<String>> {
    let line = line.trim_end().replace('"', "");
    if !line.starts_with("-A ") {
        return None;
    }
    let mut args = vec!["-t".to_string(), TABLE.to_string(), "-D".to_string()];
    args.extend(line.split_whitespace().skip(1).map(str::to_string));
    Some(args)
}
