//! Error types for patch validation sessions.

use std::time::Duration;

use thiserror::Error;

use crate::patch::PatchKind;

/// Top-level error type for sandbox, patch and test-suite operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Failed to build the sandbox (copy, history init, environment creation).
    #[error("failed to provision sandbox: {0}")]
    Provisioning(String),

    /// A package install or the install command failed while provisioning.
    #[error("dependency install failed ({command}): {reason}")]
    DependencyInstall { command: String, reason: String },

    /// The patch does not apply cleanly against the working tree.
    #[error("{patch} patch does not apply: {detail}")]
    PatchConflict { patch: PatchKind, detail: String },

    /// The sandbox backing storage or container cannot be reached.
    #[error("sandbox {sandbox} is unreachable: {reason}")]
    SandboxUnreachable { sandbox: String, reason: String },

    /// Another live session already holds this sandbox identity.
    #[error("sandbox identity {0} is already in use")]
    SandboxBusy(String),

    /// The suite could not be enumerated.
    #[error("test discovery failed: {0}")]
    TestDiscovery(String),

    /// The test harness itself failed (not an individual test).
    #[error("test execution failed: {0}")]
    TestExecution(String),

    /// A bounded operation ran past its deadline.
    #[error("{operation} timed out after {} seconds", .after.as_secs())]
    Timeout { operation: String, after: Duration },

    /// Two baseline runs on the same unpatched sandbox disagreed.
    #[error("baseline is nondeterministic: {} test(s) changed between runs", .0.len())]
    NondeterministicBaseline(Vec<String>),

    /// Failed to release a sandbox.
    #[error("failed to tear down sandbox {sandbox}: {reason}")]
    Teardown { sandbox: String, reason: String },

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error during sandbox operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if this error must abort a session.
    ///
    /// Only teardown failures are non-fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::Teardown { .. })
    }

    /// Returns true for provisioning failures, including dependency installs.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Error::Provisioning(_) | Error::DependencyInstall { .. }
        )
    }

    pub(crate) fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            after,
        }
    }
}

/// Result type alias for validation operations.
pub type Result<T> = std::result::Result<T, Error>;
