//! Bounded child-process execution shared by the backends.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::{Error, Result};

use super::provider::{CommandOutput, SandboxCommand};

/// Runs `future` under a deadline, mapping expiry to [`Error::Timeout`].
pub async fn bounded<T, F>(operation: &str, timeout: Duration, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!(operation, timeout_secs = timeout.as_secs(), "operation timed out");
            Err(Error::timeout(operation, timeout))
        }
    }
}

/// Spawns `cmd`, optionally feeds `stdin`, and waits for it under `timeout`.
///
/// The child is killed when the deadline passes or the future is dropped.
pub async fn run_command(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    operation: &str,
) -> Result<CommandOutput> {
    cmd.stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(input) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }
    }

    let output = bounded(operation, timeout, async {
        child.wait_with_output().await.map_err(Error::from)
    })
    .await?;

    let output = CommandOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    tracing::debug!(operation, code = ?output.code, "command finished");
    Ok(output)
}

/// Maps a failed install step to [`Error::DependencyInstall`].
pub(crate) fn check_install(output: CommandOutput, command: &SandboxCommand) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    Err(Error::DependencyInstall {
        command: command.display(),
        reason: output.tail(20),
    })
}
