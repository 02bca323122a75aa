//! Overlay-network policy bridge.
//!
//! Thin idempotent wrapper over the `calicoctl` profile surface. The policy
//! service owns all state; every call here is a single create command whose
//! "already exists" outcome counts as success. A missing profile during
//! rule-add is a *soft* failure (`Ok(false)`): a concurrent caller may not
//! have created the profile yet, so the caller sequences a retry after
//! ensuring the profile itself.

use thiserror::Error;

use crate::diagnostics::{Markers, Unclassified};
use crate::exec::{Captured, CommandRunner};

const CALICOCTL: &str = "calicoctl";

/// Inbound allow-rules are prepended at the top of the profile.
const AT_TOP: &str = "--at=1";

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Exec(#[from] crate::exec::Error),
    #[error(transparent)]
    Unclassified(#[from] Unclassified),
}

/// Idempotent client for overlay profiles and their inbound allow-rules.
///
/// Generic over `R: CommandRunner` so tests can inject a mock policy service.
#[derive(Clone)]
pub struct ProfileBridge<R: CommandRunner> {
    runner: R,
    markers: Markers,
}

impl<R: CommandRunner> ProfileBridge<R> {
    pub fn new(runner: R) -> Self {
        ProfileBridge {
            runner,
            markers: Markers::default(),
        }
    }

    pub fn with_markers(mut self, markers: Markers) -> Self {
        self.markers = markers;
        self
    }

    async fn calicoctl(&self, args: Vec<String>) -> Result<Captured, Error> {
        Ok(self.runner.run(CALICOCTL, &args).await?)
    }

    /// Ensures the profile exists; creation is idempotent on the service side.
    pub async fn ensure_profile(&self, name: &str) -> Result<(), Error> {
        let out = self
            .calicoctl(vec![
                "profile".to_string(),
                "add".to_string(),
                name.to_string(),
            ])
            .await?;
        if !out.success {
            return Err(Unclassified::from_captured(CALICOCTL, &out).into());
        }
        tracing::debug!(profile = name, "profile ensured");
        Ok(())
    }

    /// Ensures an inbound allow-rule for `protocol` to `port` exists.
    ///
    /// Returns `Ok(false)` when the profile does not exist yet.
    pub async fn ensure_rule(&self, name: &str, protocol: &str, port: u16) -> Result<bool, Error> {
        let args = vec![
            "profile".to_string(),
            name.to_string(),
            "rule".to_string(),
            "add".to_string(),
            "inbound".to_string(),
            AT_TOP.to_string(),
            "allow".to_string(),
            protocol.to_string(),
            "to".to_string(),
            "ports".to_string(),
            port.to_string(),
        ];
        self.apply_rule(name, args).await
    }

    /// Ensures the inbound allow-from-default-tag rule exists.
    ///
    /// Returns `Ok(false)` when the profile does not exist yet.
    pub async fn ensure_default_allow(&self, name: &str) -> Result<bool, Error> {
        let args = vec![
            "profile".to_string(),
            name.to_string(),
            "rule".to_string(),
            "add".to_string(),
            "inbound".to_string(),
            AT_TOP.to_string(),
            "allow".to_string(),
            "from".to_string(),
            "tag".to_string(),
            "default".to_string(),
        ];
        self.apply_rule(name, args).await
    }

    async fn apply_rule(&self, name: &str, args: Vec<String>) -> Result<bool, Error> {
        let out = self.calicoctl(args).await?;
        if out.success {
            return Ok(true);
        }
        let text = out.diagnostic();
        // added-or-already-present both count as success
        if text.contains(&self.markers.rule_present) {
            return Ok(true);
        }
        if text.contains(&self.markers.profile_missing) {
            tracing::warn!(profile = name, "profile not created yet, rule deferred");
            return Ok(false);
        }
        Err(Unclassified::from_captured(CALICOCTL, &out).into())
    }
}
