//! Container sandbox driven through a docker-compatible CLI.

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

/// Working tree location inside the container.
pub const CONTAINER_WORKDIR: &str = "/app";

/// Scratch location inside the container, outside the working tree.
pub const CONTAINER_SCRATCH: &str = "/tmp/patch-validator";

/// A running container holding one working copy.
#[derive(Debug)]
pub struct ContainerSandbox {
    /// Held until the container is gone; only vacated by `drop`.
    lease: Option<SandboxLease>,
    cli: String,
    workdir: PathBuf,
    scratch: PathBuf,
    setup: EnvironmentSetup,
    torn_down: bool,
}

impl ContainerSandbox {
    /// Name of the backing container.
    pub fn container_name(&self) -> &str {
        self.lease.as_ref().map_or("", SandboxLease::id)
    }
}

impl Sandbox for ContainerSandbox {
    fn id(&self) -> &str {
        self.container_name()
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

impl Drop for ContainerSandbox {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }
        let Some(lease) = self.lease.take() else {
            return;
        };
        let cli = self.cli.clone();

        // Last resort when the owner never tore the sandbox down. The lease
        // moves along so the name stays reserved until removal finishes.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(container = %lease.id(), "container dropped; scheduling removal");
                handle.spawn(async move {
                    let result = Command::new(&cli)
                        .args(["rm", "--force", lease.id()])
                        .kill_on_drop(true)
                        .output()
                        .await;
                    report_drop_removal(lease.id(), result);
                });
            }
            Err(_) => {
                let result = std::process::Command::new(&cli)
                    .args(["rm", "--force", lease.id()])
                    .output();
                report_drop_removal(lease.id(), result);
            }
        }
    }
}

fn report_drop_removal(container: &str, result: std::io::Result<std::process::Output>) {
    match result {
        Ok(output) if output.status.success() => {}
        Ok(output) => tracing::error!(
            container = %container,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "failed to remove container on drop"
        ),
        Err(e) => tracing::error!(
            container = %container,
            error = %e,
            "failed to remove container on drop"
        ),
    }
}

/// Provider that runs each sandbox in its own container.
#[derive(Debug, Clone)]
pub struct ContainerProvider {
    /// Container CLI binary.
    cli: String,
    /// Image every sandbox starts from.
    image: String,
    /// Fixed container name; when None each sandbox gets a generated one.
    fixed_identity: Option<String>,
}

impl ContainerProvider {
    /// Creates a provider using the `docker` CLI.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            cli: "docker".to_string(),
            image: image.into(),
            fixed_identity: None,
        }
    }

    /// Uses a different docker-compatible CLI, such as `podman`.
    pub fn with_cli(mut self, cli: impl Into<String>) -> Self {
        self.cli = cli.into();
        self
    }

    /// Uses `identity` as the container name. Only one can be live at a time.
    pub fn with_fixed_identity(mut self, identity: impl Into<String>) -> Self {
        self.fixed_identity = Some(identity.into());
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Runs the container CLI on the host.
    async fn cli(&self, args: &[&str], stdin: Option<&[u8]>, timeout: Duration) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(args);
        let operation = format!("{} {}", self.cli, args.first().copied().unwrap_or_default());
        run_command(cmd, stdin, timeout, &operation).await
    }

    async fn start(&self, sandbox: &ContainerSandbox, source: &Path, timeout: Duration) -> Result<()> {
        let name = sandbox.container_name();

        let run = self
            .cli(
                &[
                    "run",
                    "--detach",
                    "--name",
                    name,
                    "--workdir",
                    CONTAINER_WORKDIR,
                    self.image.as_str(),
                    "tail",
                    "-f",
                    "/dev/null",
                ],
                None,
                timeout,
            )
            .await
            .map_err(|e| match e {
                Error::Io(io) => Error::Provisioning(format!("failed to run {}: {}", self.cli, io)),
                other => other,
            })?;
        if !run.success() {
            return Err(Error::Provisioning(format!(
                "failed to start container from {}: {}",
                self.image,
                run.tail(10)
            )));
        }

        let mkdir = SandboxCommand::new("mkdir").args(["-p", CONTAINER_WORKDIR, CONTAINER_SCRATCH]);
        let output = self.exec(sandbox, &mkdir, timeout).await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to create sandbox directories: {}",
                output.tail(10)
            )));
        }

        let from = format!("{}/.", source.display());
        let to = format!("{}:{}", name, CONTAINER_WORKDIR);
        let copy = self.cli(&["cp", from.as_str(), to.as_str()], None, timeout).await?;
        if !copy.success() {
            return Err(Error::Provisioning(format!(
                "failed to copy codebase into container: {}",
                copy.tail(10)
            )));
        }

        // Pre-existing history must not leak into the baseline.
        let strip = SandboxCommand::new("rm").args(["-rf", ".git"]);
        let output = self.exec(sandbox, &strip, timeout).await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "failed to remove copied git history: {}",
                output.tail(10)
            )));
        }

        Ok(())
    }

    async fn install(&self, sandbox: &ContainerSandbox, timeout: Duration) -> Result<()> {
        let pip = SandboxCommand::new("python")
            .args(["-m", "pip", "install", "--quiet"])
            .args(sandbox.setup.all_packages());
        check_install(self.exec(sandbox, &pip, timeout).await?, &pip)?;

        if let Some(install) = &sandbox.setup.install {
            let cmd = SandboxCommand::shell(install);
            check_install(self.exec(sandbox, &cmd, timeout).await?, &cmd)?;
        }

        Ok(())
    }

    fn scratch_path(&self, name: &str) -> String {
        format!("{}/{}", CONTAINER_SCRATCH, name)
    }
}

#[async_trait]
impl SandboxProvider for ContainerProvider {
    type Sandbox = ContainerSandbox;

    fn name(&self) -> &str {
        "container"
    }

    async fn provision(
        &self,
        source: &Path,
        setup: &EnvironmentSetup,
        timeout: Duration,
    ) -> Result<ContainerSandbox> {
        if !source.is_dir() {
            return Err(Error::Provisioning(format!(
                "codebase {} is not a directory",
                source.display()
            )));
        }

        let id = self
            .fixed_identity
            .clone()
            .unwrap_or_else(|| generate_identity("pv-container"));
        let mut sandbox = ContainerSandbox {
            lease: Some(SandboxLease::acquire(id)?),
            cli: self.cli.clone(),
            workdir: PathBuf::from(CONTAINER_WORKDIR),
            scratch: PathBuf::from(CONTAINER_SCRATCH),
            setup: setup.clone(),
            torn_down: false,
        };

        let built = bounded("provision", timeout, async {
            self.start(&sandbox, source, timeout).await?;
            worktree::init_history(self, &sandbox, timeout).await?;
            self.install(&sandbox, timeout).await
        })
        .await;

        if let Err(e) = built {
            tracing::warn!(container = %sandbox.container_name(), error = %e, "provisioning failed, removing container");
            if let Err(cleanup) = self.teardown(&mut sandbox).await {
                tracing::warn!(error = %cleanup, "failed to remove partial container");
            }
            return Err(e);
        }

        tracing::info!(
            container = %sandbox.container_name(),
            image = %self.image,
            "provisioned container sandbox"
        );
        Ok(sandbox)
    }

    async fn teardown(&self, sandbox: &mut ContainerSandbox) -> Result<()> {
        if sandbox.torn_down {
            return Ok(());
        }

        let output = self
            .cli(&["rm", "--force", sandbox.container_name()], None, Duration::from_secs(120))
            .await
            .map_err(|e| Error::Teardown {
                sandbox: sandbox.id().to_string(),
                reason: e.to_string(),
            })?;

        if !output.success() && !output.stderr.contains("No such container") {
            return Err(Error::Teardown {
                sandbox: sandbox.id().to_string(),
                reason: output.tail(5),
            });
        }

        sandbox.torn_down = true;
        tracing::info!(container = %sandbox.container_name(), "removed container sandbox");
        Ok(())
    }

    async fn probe(&self, sandbox: &ContainerSandbox) -> Result<()> {
        let unreachable = |reason: String| Error::SandboxUnreachable {
            sandbox: sandbox.id().to_string(),
            reason,
        };

        if sandbox.torn_down {
            return Err(unreachable("container was removed".to_string()));
        }

        let output = self
            .cli(
                &["inspect", "--format", "{{.State.Running}}", sandbox.container_name()],
                None,
                Duration::from_secs(30),
            )
            .await
            .map_err(|e| unreachable(e.to_string()))?;

        if !output.success() {
            return Err(unreachable(output.tail(5)));
        }
        if output.stdout.trim() != "true" {
            return Err(unreachable("container is not running".to_string()));
        }
        Ok(())
    }

    async fn exec(
        &self,
        sandbox: &ContainerSandbox,
        command: &SandboxCommand,
        timeout: Duration,
    ) -> Result<CommandOutput> {
        let mut cmd = Command::new(&self.cli);
        cmd.args(["exec", "--workdir", CONTAINER_WORKDIR]);
        cmd.args(["--env", "GIT_TERMINAL_PROMPT=0"]);
        for (key, value) in &command.env {
            cmd.arg("--env").arg(format!("{}={}", key, value));
        }
        cmd.arg(sandbox.container_name())
            .arg(&command.program)
            .args(&command.args);

        tracing::debug!(container = %sandbox.container_name(), command = %command.display(), "exec");
        run_command(cmd, None, timeout, &command.display()).await
    }

    async fn write_file(&self, sandbox: &ContainerSandbox, name: &str, contents: &[u8]) -> Result<PathBuf> {
        let path = self.scratch_path(name);
        let output = self
            .cli(
                &["exec", "--interactive", sandbox.container_name(), "sh", "-c", "cat > \"$1\"", "sh", path.as_str()],
                Some(contents),
                Duration::from_secs(60),
            )
            .await?;

        if !output.success() {
            return Err(Error::SandboxUnreachable {
                sandbox: sandbox.id().to_string(),
                reason: format!("cannot write {}: {}", path, output.tail(5)),
            });
        }
        Ok(PathBuf::from(path))
    }

    async fn read_file(&self, sandbox: &ContainerSandbox, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.scratch_path(name);
        let script = "if [ -f \"$1\" ]; then cat \"$1\"; else exit 44; fi";
        let output = self
            .cli(
                &["exec", sandbox.container_name(), "sh", "-c", script, "sh", path.as_str()],
                None,
                Duration::from_secs(60),
            )
            .await?;

        match output.code {
            Some(0) => Ok(Some(output.stdout.into_bytes())),
            Some(44) => Ok(None),
            _ => Err(Error::SandboxUnreachable {
                sandbox: sandbox.id().to_string(),
                reason: format!("cannot read {}: {}", path, output.tail(5)),
            }),
        }
    }
}
