//! Translation of collaborator diagnostic text into typed outcomes.
//!
//! Neither `iptables` nor `calicoctl` offers a structured query API; presence
//! has to be reverse-engineered from the human-readable error text of a
//! failed command. All marker substrings live in [`Markers`] and the rest of
//! the engine only ever sees the typed [`RuleState`] produced by
//! [`classify`]. Any diagnostic text that matches no marker becomes
//! [`Unclassified`], which callers must treat as a hard stop rather than
//! guess their way past.

use thiserror::Error;

use crate::exec::Captured;

/// Observed state of a rule in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuleState {
    Present,
    Absent,
    /// The store's advisory lock is held by another process; retryable.
    Contended,
}

/// Exact diagnostic substrings the collaborators emit.
///
/// These are matched verbatim against captured stderr, so they must track
/// the deployed tool versions. They are plain data precisely so a deployment
/// can override them without touching the engine.
#[derive(Clone, Debug)]
pub struct Markers {
    /// iptables: chain, target or matching rule does not exist.
    pub not_found: String,
    /// iptables: another process holds the xtables lock.
    pub lock_held: String,
    /// iptables: `-N` raced with another creator.
    pub chain_exists: String,
    /// calicoctl: allow-rule is already in the profile.
    pub rule_present: String,
    /// calicoctl: profile the rule should attach to does not exist.
    pub profile_missing: String,
}

impl Default for Markers {
    fn default() -> Self {
        Markers {
            not_found: "No chain/target/match by that name".to_string(),
            lock_held: "holding the xtables lock".to_string(),
            chain_exists: "Chain already exists.".to_string(),
            rule_present: "Rule already present, skipping.".to_string(),
            profile_missing: "not found.".to_string(),
        }
    }
}

/// A collaborator failed with diagnostic text matching no known marker.
///
/// This is the engine's fatal error kind: it propagates untouched to the top
/// of the call stack, where the helper logs it and terminates. Continuing
/// past it would leave host networking in a state nobody can reason about.
#[derive(Debug, Error)]
#[error("Unrecognized {program} failure (exit {code:?}): {diagnostic}")]
pub struct Unclassified {
    pub program: String,
    pub code: Option<i32>,
    pub diagnostic: String,
}

impl Unclassified {
    pub fn from_captured(program: &str, out: &Captured) -> Self {
        Unclassified {
            program: program.to_string(),
            code: out.code,
            diagnostic: out.diagnostic().trim().to_string(),
        }
    }
}

/// Classify the outcome of a rule existence probe (`iptables -C`).
pub fn classify(markers: &Markers, program: &str, out: &Captured) -> Result<RuleState, Unclassified> {
    if out.success {
        return Ok(RuleState::Present);
    }
    let text = out.diagnostic();
    if text.contains(&markers.not_found) {
        return Ok(RuleState::Absent);
    }
    if text.contains(&markers.lock_held) {
        return Ok(RuleState::Contended);
    }
    Err(Unclassified::from_captured(program, out))
}
