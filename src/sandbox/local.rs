//! Local sandbox backed by a private directory and Python virtual environment.
//!
//! Layout under the sandbox root:
//! - `repo/` working tree with a fresh git history
//! - `venv/` virtual environment whose `bin/` is first on `PATH`
//! - `scratch/` patches and test reports

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::config::EnvironmentSetup;
use crate::error::{Error, Result};

use super::exec::{bounded, check_install, run_command};
use super::provider::{CommandOutput, Sandbox, SandboxCommand, SandboxProvider};
use super::registry::{generate_identity, SandboxLease};
use super::worktree;

/// A sandbox living in a local directory.
#[derive(Debug)]
pub struct LocalSandbox {
    lease: SandboxLease,
    root: PathBuf,
    workdir: PathBuf,
    scratch: PathBuf,
    venv: PathBuf,
    setup: EnvironmentSetup,
    torn_down: bool,
}

impl LocalSandbox {
    fn new(lease: SandboxLease, root: PathBuf, setup: EnvironmentSetup) -> Self {
        Self {
            lease,
            workdir: root.join("repo"),
            scratch: root.join("scratch"),
            venv: root.join("venv"),
            root,
            setup,
            torn_down: false,
        }
    }

    /// Root directory holding the working tree, venv and scratch area.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn venv_bin(&self) -> PathBuf {
        self.venv.join("bin")
    }

    fn remove(&mut self) -> std::io::Result<()> {
        if self.torn_down {
            return Ok(());
        }
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        self.torn_down = true;
        Ok(())
    }
}

impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        self.lease.id()
    }

    fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn scratch_dir(&self) -> &Path {
        &self.scratch
    }

    fn setup(&self) -> &EnvironmentSetup {
        &self.setup
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        if !self.torn_down {
            if let Err(e) = self.remove() {
                tracing::error!(error = %e, path = ?self.root, "failed to remove sandbox on drop");
            }
        }
    }
}

/// Provider that creates sandboxes as local directories with a virtualenv.
#[derive(Debug, Clone)]
pub struct LocalVenvProvider {
    /// Base directory for sandboxes. If None, uses a temp directory.
    base_dir: Option<PathBuf>,
    /// Fixed identity; when None each sandbox gets a generated one.
    fixed_identity: Option<String>,
}

impl LocalVenvProvider {
    pub fn new(base_dir: Option<PathBuf>) -> Self {
        Self {
            base_dir,
            fixed_identity: None,
        }
    }

    /// Uses `identity` for every sandbox. Only one can be live at a time.
    pub fn with_fixed_identity(mut self, identity: impl Into<String>) -> Self {
        self.fixed_identity = Some(identity.into());
        self
    }

    fn base_dir(&self) -> PathBuf {
        match &self.base_dir {
            Some(dir) => dir.clone(),
            None => std::env::temp_dir().join("patch-validator-sandboxes"),
        }
    }

    /// Creates the sandbox directory layout with a copied codebase.
    ///
    /// The returned sandbox has no history or environment yet.
    fn prepare(&self, source: &Path, setup: &EnvironmentSetup) -> Result<LocalSandbox> {
        let id = self
            .fixed_identity
            .clone()
            .unwrap_or_else(|| generate_identity("pv-local"));
        let lease = SandboxLease::acquire(id)?;

        let base = self.base_dir();
        std::fs::create_dir_all(&base)?;
        // Commands run from the working tree, so scratch paths must be absolute.
        let base = std::fs::canonicalize(&base)?;
        let root = base.join(lease.id());
        if root.exists() {
            return Err(Error::Provisioning(format!(
                "sandbox directory {} already exists",
                root.display()
            )));
        }

        let sandbox = LocalSandbox::new(lease, root, setup.clone());
        // From here on, dropping the sandbox removes the directory.
        std::fs::create_dir_all(&sandbox.scratch)?;
        let copied = worktree::copy_codebase(source, &sandbox.workdir)?;

        tracing::debug!(sandbox = %sandbox.id(), files = copied, "copied codebase");
        Ok(sandbox)
    }

    async fn install(&self, sandbox: &LocalSandbox, timeout: Duration) -> Result<()> {
        let interpreter = sandbox.setup.interpreter();
        let venv = sandbox.venv.to_string_lossy().into_owned();

        let create = SandboxCommand::new(&interpreter).args(["-m", "venv", venv.as_str()]);
        let output = self
            .exec(sandbox, &create, timeout)
            .await
            .map_err(|e| match e {
                Error::Io(io) => {
                    Error::Provisioning(format!("failed to run {}: {}", interpreter, io))
                }
                other => other,
            })?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to create virtualenv with {}: {}",
                interpreter,
                output.tail(10)
            )));
        }

        let packages = sandbox.setup.all_packages();
        let pip = SandboxCommand::new("python")
            .args(["-m", "pip", "install", "--quiet"])
            .args(packages);
        check_install(self.exec(sandbox, &pip, timeout).await?, &pip)?;

        if let Some(install) = &sandbox.setup.install {
            let cmd = SandboxCommand::shell(install);
            check_install(self.exec(sandbox, &cmd, timeout).await?, &cmd)?;
        }

        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for LocalVenvProvider {
    type Sandbox = LocalSandbox;

    fn name(&self) -> &str {
        "local"
    }

    async fn provision(
        &self,
        source: &Path,
        setup: &EnvironmentSetup,
        timeout: Duration,
    ) -> Result<LocalSandbox> {
        let mut sandbox = self.prepare(source, setup)?;

        let built = bounded("provision", timeout, async {
            worktree::init_history(self, &sandbox, timeout).await?;
            self.install(&sandbox, timeout).await
        })
        .await;

        if let Err(e) = built {
            tracing::warn!(sandbox = %sandbox.id(), error = %e, "provisioning failed, removing sandbox");
            if let Err(cleanup) = self.teardown(&mut sandbox).await {
                tracing::warn!(error = %cleanup, "failed to remove partial sandbox");
            }
            return Err(e);
        }

        tracing::info!(sandbox = %sandbox.id(), path = ?sandbox.root, "provisioned local sandbox");
        Ok(sandbox)
    }

    async fn teardown(&self, sandbox: &mut LocalSandbox) -> Result<()> {
        sandbox.remove().map_err(|e| Error::Teardown {
            sandbox: sandbox.id().to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(sandbox = %sandbox.id(), "removed local sandbox");
        Ok(())
    }

    async fn probe(&self, sandbox: &LocalSandbox) -> Result<()> {
        if sandbox.torn_down || !sandbox.workdir.join(".git").is_dir() {
            return Err(Error::SandboxUnreachable {
                sandbox: sandbox.id().to_string(),
                reason: format!("{} is not a git working tree", sandbox.workdir.display()),
            });
        }
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &LocalSandbox,
        command: &SandboxCommand,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let path = match std::env::var_os("PATH") {
            Some(existing) => {
                let mut paths = vec![sandbox.venv_bin()];
                paths.extend(std::env::split_paths(&existing));
                std::env::join_paths(paths)
                    .map_err(|e| Error::Config(format!("invalid PATH: {}", e)))?
            }
            None => sandbox.venv_bin().into_os_string(),
        };

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(&sandbox.workdir)
            .env("PATH", path)
            .env("VIRTUAL_ENV", &sandbox.venv)
            .env_remove("PYTHONHOME")
            .env("GIT_TERMINAL_PROMPT", "0");
        for (key, value) in &command.env {
            cmd.env(key, value);
        }

        tracing::debug!(sandbox = %sandbox.id(), command = %command.display(), "exec");
        run_command(cmd, None, timeout, &command.display()).await
    }

    async fn write_file(&self, sandbox: &LocalSandbox, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = sandbox.scratch.join(name);
        tokio::fs::write(&path, contents)
            .await
            .map_err(|e| Error::SandboxUnreachable {
                sandbox: sandbox.id().to_string(),
                reason: format!("cannot write {}: {}", path.display(), e),
            })?;
        Ok(path)
    }

    async fn read_file(&self, sandbox: &LocalSandbox, name: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(sandbox.scratch.join(name)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
