//! Sandbox provider trait and types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::EnvironmentSetup;
use crate::error::Result;
use crate::outcome::{Snapshot, TestId};
use crate::patch::{self, Patch};
use crate::runner;

/// A command to execute inside a sandbox's working tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl SandboxCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// Runs `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Human-readable form for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured output of a finished sandbox command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Last lines of stderr (or stdout when stderr is empty), for error messages.
    pub fn tail(&self, lines: usize) -> String {
        let text = if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        };
        let all: Vec<&str> = text.trim_end().lines().collect();
        all[all.len().saturating_sub(lines)..].join("\n")
    }
}

/// Represents a provisioned sandbox.
pub trait Sandbox: Send + Sync {
    /// Unique identity of this sandbox.
    fn id(&self) -> &str;

    /// Working tree holding the codebase, as seen by sandbox commands.
    fn workdir(&self) -> &Path;

    /// Directory outside the working tree for patches and reports.
    fn scratch_dir(&self) -> &Path;

    /// The setup the sandbox was provisioned with.
    fn setup(&self) -> &EnvironmentSetup;
}

/// Capability for creating, driving and releasing sandboxes.
///
/// Backends implement the low-level operations; patch application and test
/// execution are provided on top of them so every backend behaves the same.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// The type of sandbox this provider creates.
    type Sandbox: Sandbox + 'static;

    /// Returns the name of this backend.
    fn name(&self) -> &str;

    /// Builds a sandbox from `source` and installs its dependencies.
    ///
    /// On failure nothing usable is left behind.
    async fn provision(
        &self,
        source: &Path,
        setup: &EnvironmentSetup,
        timeout: Duration,
    ) -> Result<Self::Sandbox>;

    /// Releases every resource held by the sandbox. Safe to call twice.
    async fn teardown(&self, sandbox: &mut Self::Sandbox) -> Result<()>;

    /// Fails with `SandboxUnreachable` if the sandbox can no longer be used.
    async fn probe(&self, sandbox: &Self::Sandbox) -> Result<()>;

    /// Runs a command in the sandbox working tree.
    ///
    /// A non-zero exit is not an error; exceeding `timeout` is.
    async fn exec(
        &self,
        sandbox: &Self::Sandbox,
        command: &SandboxCommand,
        timeout: Duration,
    ) -> Result<CommandOutput>;

    /// Writes `contents` to `name` inside the scratch directory and returns
    /// the path commands in the sandbox can use to reach it.
    async fn write_file(
        &self,
        sandbox: &Self::Sandbox,
        name: &str,
        contents: &[u8],
    ) -> Result<PathBuf>;

    /// Reads `name` from the scratch directory, `None` if it does not exist.
    async fn read_file(&self, sandbox: &Self::Sandbox, name: &str) -> Result<Option<Vec<u8>>>;

    /// Applies a patch to the working tree.
    async fn apply(&self, sandbox: &Self::Sandbox, patch: &Patch, timeout: Duration) -> Result<()> {
        patch::apply(self, sandbox, patch, timeout).await
    }

    /// Enumerates the suite without running it.
    async fn discover(
        &self,
        sandbox: &Self::Sandbox,
        timeout: Duration,
    ) -> Result<std::collections::BTreeSet<TestId>> {
        runner::discover(self, sandbox, timeout).await
    }

    /// Runs the whole suite once.
    async fn run(&self, sandbox: &Self::Sandbox, timeout: Duration) -> Result<Snapshot> {
        runner::run(self, sandbox, timeout).await
    }
}
