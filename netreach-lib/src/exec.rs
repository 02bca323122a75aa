//! Shell command execution seam.
//!
//! Defines the [`CommandRunner`] trait the whole engine is generic over.
//! Production code uses [`SystemRunner`].
//! Tests use a stateful mock (see `mocks` module).
//!
//! A nonzero exit is a *normal* return value here, not an error: the rule
//! store reports "rule not present" through its exit status, so callers
//! inspect [`Captured`] instead of matching on `Err`. Only spawn failures
//! surface as [`Error`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unable to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Captured result of one finished command.
#[derive(Clone, Debug)]
pub struct Captured {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Captured {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(stderr: impl Into<String>) -> Self {
        Captured {
            success: false,
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Text the diagnostics classifier inspects: stderr on failure,
    /// stdout otherwise.
    pub fn diagnostic(&self) -> &str {
        if self.success { &self.stdout } else { &self.stderr }
    }
}

/// Abstraction over external command execution.
///
/// Implementors must be cheaply cloneable (the same runner is shared
/// between the NAT engine, the profile bridge and the address helpers).
#[async_trait]
pub trait CommandRunner: Send + Sync + Clone {
    /// Run `program` to completion, capturing stdout and stderr separately.
    async fn run(&self, program: &str, args: &[String]) -> Result<Captured, Error>;
}

/// Production [`CommandRunner`] that executes real commands.
#[derive(Clone)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<Captured, Error> {
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| Error::Spawn {
                program: program.to_string(),
                source,
            })?;

        let captured = Captured {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if captured.success {
            tracing::debug!(program, ?args, "command succeeded");
        } else {
            tracing::debug!(
                program,
                ?args,
                code = ?captured.code,
                stderr = %captured.stderr.trim(),
                "command exited nonzero"
            );
        }
        Ok(captured)
    }
}
