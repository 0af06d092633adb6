//! Working-copy preparation: copying the codebase and seeding a fresh git
//! history that later patches apply against.

use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

use super::provider::{SandboxCommand, SandboxProvider};

/// Author used for the baseline commit.
const BASELINE_AUTHOR: &str = "patch-validator";
const BASELINE_EMAIL: &str = "patch-validator@localhost";

/// Recursively copies `source` into `dest`, skipping any `.git` directory.
///
/// Returns the number of files copied.
pub fn copy_codebase(source: &Path, dest: &Path) -> Result<u64> {
    if !source.is_dir() {
        return Err(Error::Provisioning(format!(
            "codebase {} is not a directory",
            source.display()
        )));
    }

    std::fs::create_dir_all(dest)?;
    let mut copied = 0;

    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let name = entry.file_name();
        if name == ".git" {
            continue;
        }

        let from = entry.path();
        let to = dest.join(&name);
        let file_type = entry.file_type()?;

        if file_type.is_dir() {
            copied += copy_codebase(&from, &to)?;
        } else if file_type.is_symlink() {
            copy_symlink(&from, &to)?;
            copied += 1;
        } else {
            std::fs::copy(&from, &to)?;
            copied += 1;
        }
    }

    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    let target = std::fs::read_link(from)?;
    std::os::unix::fs::symlink(target, to)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> Result<()> {
    std::fs::copy(from, to)?;
    Ok(())
}

/// Commands that turn the working tree into a one-commit repository.
pub fn history_commands() -> Vec<SandboxCommand> {
    let name = format!("user.name={}", BASELINE_AUTHOR);
    let email = format!("user.email={}", BASELINE_EMAIL);

    vec![
        SandboxCommand::new("git").args(["init", "--quiet"]),
        SandboxCommand::new("git").args(["add", "--all", "."]),
        SandboxCommand::new("git")
            .args(["-c", name.as_str(), "-c", email.as_str()])
            .args(["-c", "commit.gpgsign=false", "commit", "--quiet", "--no-verify"])
            .args(["--allow-empty", "-m", "baseline"]),
    ]
}

/// Seeds a fresh git history in the sandbox working tree.
pub async fn init_history<P>(provider: &P, sandbox: &P::Sandbox, timeout: Duration) -> Result<()>
where
    P: SandboxProvider + ?Sized,
{
    for command in history_commands() {
        let output = provider.exec(sandbox, &command, timeout).await?;
        if !output.success() {
            return Err(Error::Provisioning(format!(
                "`{}` failed: {}",
                command.display(),
                output.tail(10)
            )));
        }
    }
    Ok(())
}
