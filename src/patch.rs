//! Patch application against a sandbox working tree.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sandbox::{Sandbox, SandboxCommand, SandboxProvider};

/// Which of the session's patches this is. Code patches apply first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    Code,
    Test,
}

impl fmt::Display for PatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchKind::Code => write!(f, "code"),
            PatchKind::Test => write!(f, "test"),
        }
    }
}

/// Unified diff text to apply to a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Patch {
    pub kind: PatchKind,
    pub text: String,
}

impl Patch {
    pub fn new(kind: PatchKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }

    /// Patch bytes as written into the sandbox; `git apply` rejects a final
    /// hunk line without its newline.
    fn contents(&self) -> String {
        if self.text.ends_with('\n') {
            self.text.clone()
        } else {
            format!("{}\n", self.text)
        }
    }
}

/// Applies `patch` to the sandbox working tree with `git apply`.
///
/// `git apply` is all-or-nothing, so a conflicting patch leaves the tree
/// untouched.
pub async fn apply<P>(provider: &P, sandbox: &P::Sandbox, patch: &Patch, timeout: Duration) -> Result<()>
where
    P: SandboxProvider + ?Sized,
{
    provider.probe(sandbox).await?;

    if patch.is_empty() {
        return Err(Error::PatchConflict {
            patch: patch.kind,
            detail: "patch is empty".to_string(),
        });
    }

    let name = format!("{}-{}.diff", patch.kind, uuid::Uuid::new_v4().simple());
    let path = provider
        .write_file(sandbox, &name, patch.contents().as_bytes())
        .await?;

    let command = SandboxCommand::new("git")
        .args(["apply", "--verbose", "--whitespace=nowarn"])
        .arg(path.to_string_lossy());
    let output = provider.exec(sandbox, &command, timeout).await?;

    if !output.success() {
        // A backend that lost its sandbox mid-apply also exits non-zero.
        provider.probe(sandbox).await?;
        tracing::warn!(
            sandbox = %sandbox.id(),
            patch = %patch.kind,
            "patch does not apply"
        );
        return Err(Error::PatchConflict {
            patch: patch.kind,
            detail: output.tail(20),
        });
    }

    tracing::info!(sandbox = %sandbox.id(), patch = %patch.kind, "applied patch");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentSetup;
    use crate::sandbox::{CommandOutput, Sandbox};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Tree {
        setup: EnvironmentSetup,
    }

    impl Sandbox for Tree {
        fn id(&self) -> &str {
            "tree"
        }
        fn workdir(&self) -> &Path {
            Path::new("/app")
        }
        fn scratch_dir(&self) -> &Path {
            Path::new("/scratch")
        }
        fn setup(&self) -> &EnvironmentSetup {
            &self.setup
        }
    }

    /// Provider whose `git apply` always fails and whose reachability check passes only
    /// `reachable_checks` times.
    struct FailingApply {
        reachable_checks: usize,
        checks: AtomicUsize,
    }

    impl FailingApply {
        fn new(reachable_checks: usize) -> Self {
            Self {
                reachable_checks,
                checks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl SandboxProvider for FailingApply {
        type Sandbox = Tree;

        fn name(&self) -> &str {
            "failing-apply"
        }

        async fn provision(&self, _source: &Path, setup: &EnvironmentSetup, _timeout: Duration) -> Result<Tree> {
            Ok(Tree { setup: setup.clone() })
        }

        async fn teardown(&self, _sandbox: &mut Tree) -> Result<()> {
            Ok(())
        }

        async fn probe(&self, sandbox: &Tree) -> Result<()> {
            let seen = self.checks.fetch_add(1, Ordering::SeqCst);
            if seen < self.reachable_checks {
                return Ok(());
            }
            Err(Error::SandboxUnreachable {
                sandbox: sandbox.id().to_string(),
                reason: "container is not running".to_string(),
            })
        }

        async fn exec(&self, _sandbox: &Tree, _command: &SandboxCommand, _timeout: Duration) -> Result<CommandOutput> {
            Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "error: patch failed: calc.py:1\nerror: calc.py: patch does not apply".to_string(),
            })
        }

        async fn write_file(&self, _sandbox: &Tree, name: &str, _contents: &[u8]) -> Result<PathBuf> {
            Ok(Path::new("/scratch").join(name))
        }

        async fn read_file(&self, _sandbox: &Tree, _name: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
    }

    fn tree() -> Tree {
        Tree {
            setup: EnvironmentSetup::default(),
        }
    }

    #[tokio::test]
    async fn sandbox_lost_during_apply_is_unreachable_not_conflict() {
        let provider = FailingApply::new(1);
        let patch = Patch::new(PatchKind::Code, "--- a/calc.py\n+++ b/calc.py\n");

        let err = apply(&provider, &tree(), &patch, Duration::from_secs(10))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::SandboxUnreachable { .. }));
        assert_eq!(provider.checks.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_apply_on_live_sandbox_is_conflict() {
        let provider = FailingApply::new(usize::MAX);
        let patch = Patch::new(PatchKind::Test, "--- a/calc.py\n+++ b/calc.py\n");

        let err = apply(&provider, &tree(), &patch, Duration::from_secs(10))
            .await
            .unwrap_err();

        match err {
            Error::PatchConflict { patch, detail } => {
                assert_eq!(patch, PatchKind::Test);
                assert!(detail.contains("patch does not apply"));
            }
            other => panic!("expected conflict, got {other}"),
        }
    }

    #[test]
    fn contents_gain_trailing_newline() {
        let patch = Patch::new(PatchKind::Code, "--- a/x\n+++ b/x\n@@ -1 +1 @@\n-a\n+b");
        assert!(patch.contents().ends_with("+b\n"));

        let already = Patch::new(PatchKind::Code, "+b\n");
        assert_eq!(already.contents(), "+b\n");
    }

    #[test]
    fn whitespace_only_patch_is_empty() {
        assert!(Patch::new(PatchKind::Test, "  \n").is_empty());
        assert!(!Patch::new(PatchKind::Test, "diff").is_empty());
    }

    #[test]
    fn patch_kind_displays_lowercase() {
        assert_eq!(PatchKind::Code.to_string(), "code");
        assert_eq!(serde_json::to_string(&PatchKind::Test).unwrap(), "\"test\"");
    }
}
