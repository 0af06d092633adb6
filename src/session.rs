//! Validation session orchestration.
//!
//! A session provisions one sandbox, records a baseline, applies the patches,
//! records the post-patch state and classifies the difference. Teardown runs
//! exactly once per provisioned sandbox, whether the session succeeds, fails
//! or is cancelled.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::classify::{compare, Transition, TransitionReport};
use crate::config::{EnvironmentSetup, SessionConfig, TimeoutConfig};
use crate::error::{Error, Result};
use crate::outcome::{Outcome, Snapshot, TestId};
use crate::patch::{Patch, PatchKind};
use crate::sandbox::exec::bounded;
use crate::sandbox::{Sandbox, SandboxProvider};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Created,
    Provisioned,
    BaselineRun,
    Patched,
    PostPatchRun,
    Classified,
    TornDown,
    Aborted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Provisioned => "provisioned",
            SessionState::BaselineRun => "baseline_run",
            SessionState::Patched => "patched",
            SessionState::PostPatchRun => "post_patch_run",
            SessionState::Classified => "classified",
            SessionState::TornDown => "torn_down",
            SessionState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Inputs for one validation session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Directory holding the codebase. Never modified.
    pub codebase: PathBuf,
    pub code_patch: String,
    /// Applied after the code patch when present.
    pub test_patch: Option<String>,
    pub setup: EnvironmentSetup,
}

impl SessionRequest {
    pub fn new(codebase: impl Into<PathBuf>, code_patch: impl Into<String>) -> Self {
        Self {
            codebase: codebase.into(),
            code_patch: code_patch.into(),
            test_patch: None,
            setup: EnvironmentSetup::default(),
        }
    }

    pub fn with_test_patch(mut self, test_patch: impl Into<String>) -> Self {
        self.test_patch = Some(test_patch.into());
        self
    }

    pub fn with_setup(mut self, setup: EnvironmentSetup) -> Self {
        self.setup = setup;
        self
    }

    /// Checks the request before any sandbox is built.
    pub fn validate(&self) -> Result<()> {
        if self.code_patch.trim().is_empty() {
            return Err(Error::Config("code patch is empty".to_string()));
        }
        if !self.codebase.is_dir() {
            return Err(Error::Config(format!(
                "codebase {} is not a directory",
                self.codebase.display()
            )));
        }
        Ok(())
    }

    /// Patches in application order. A blank test patch is treated as absent.
    fn patches(&self) -> Vec<Patch> {
        let mut patches = vec![Patch::new(PatchKind::Code, self.code_patch.as_str())];
        if let Some(test_patch) = self.test_patch.as_deref().filter(|t| !t.trim().is_empty()) {
            patches.push(Patch::new(PatchKind::Test, test_patch));
        }
        patches
    }
}

/// Per-test entry of the combined report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub id: TestId,
    /// Post-patch outcome; `None` if the test was discovered but never reported.
    pub outcome: Option<Outcome>,
    pub diagnostic: String,
    /// Category, when the post-patch outcome is comparable.
    pub transition: Option<Transition>,
    /// The test was not discovered before the patches were applied.
    pub introduced_in_patch: bool,
}

/// Result of a successful session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionReport {
    pub sandbox_id: String,
    pub baseline: Snapshot,
    pub post_patch: Snapshot,
    pub transitions: TransitionReport,
    /// One entry per test discovered after patching, ordered by id.
    pub tests: Vec<TestReport>,
}

impl SessionReport {
    pub fn test(&self, id: &str) -> Option<&TestReport> {
        self.tests.iter().find(|t| t.id == id)
    }

    /// Ids of tests that exist only because of the patches.
    pub fn introduced(&self) -> impl Iterator<Item = &TestId> {
        self.tests
            .iter()
            .filter(|t| t.introduced_in_patch)
            .map(|t| &t.id)
    }
}

/// The terminal error of a failed session and the last state it reached.
#[derive(Debug, thiserror::Error)]
#[error("session aborted after reaching {state}: {error}")]
pub struct SessionFailure {
    pub state: SessionState,
    #[source]
    pub error: Error,
}

/// Owns the sandbox until it is explicitly released.
///
/// Dropping an unreleased guard (a cancelled session) schedules teardown on
/// the current runtime.
struct SandboxGuard<P: SandboxProvider + 'static> {
    provider: Arc<P>,
    sandbox: Option<P::Sandbox>,
    timeout: Duration,
}

impl<P: SandboxProvider + 'static> SandboxGuard<P> {
    fn new(provider: Arc<P>, sandbox: P::Sandbox, timeout: Duration) -> Self {
        Self {
            provider,
            sandbox: Some(sandbox),
            timeout,
        }
    }

    fn sandbox(&self) -> Option<&P::Sandbox> {
        self.sandbox.as_ref()
    }

    async fn release(&mut self) -> Result<()> {
        let Some(mut sandbox) = self.sandbox.take() else {
            return Ok(());
        };
        bounded("teardown", self.timeout, self.provider.teardown(&mut sandbox)).await
    }
}

impl<P: SandboxProvider + 'static> Drop for SandboxGuard<P> {
    fn drop(&mut self) {
        let Some(mut sandbox) = self.sandbox.take() else {
            return;
        };
        let provider = Arc::clone(&self.provider);
        let timeout = self.timeout;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::warn!(sandbox = %sandbox.id(), "session dropped; scheduling teardown");
                handle.spawn(async move {
                    if let Err(err) = bounded("teardown", timeout, provider.teardown(&mut sandbox)).await {
                        tracing::error!(sandbox = %sandbox.id(), error = %err, "teardown after cancellation failed");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    sandbox = %sandbox.id(),
                    "no runtime available; releasing sandbox on drop"
                );
            }
        }
    }
}

/// Drives one sandbox through baseline, patch and post-patch runs.
pub struct Session<P: SandboxProvider + 'static> {
    provider: Arc<P>,
    timeouts: TimeoutConfig,
    verify_baseline: bool,
    history: Vec<SessionState>,
}

impl<P: SandboxProvider + 'static> Session<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider: Arc::new(provider),
            timeouts: TimeoutConfig::default(),
            verify_baseline: false,
            history: vec![SessionState::Created],
        }
    }

    /// Builds a session with the timeouts and baseline check from `config`.
    pub fn from_config(provider: P, config: &SessionConfig) -> Self {
        Self::new(provider)
            .with_timeouts(config.timeouts)
            .with_verify_baseline(config.verify_baseline)
    }

    pub fn with_timeouts(mut self, timeouts: TimeoutConfig) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Runs the baseline twice and aborts when the two runs disagree.
    pub fn with_verify_baseline(mut self, verify: bool) -> Self {
        self.verify_baseline = verify;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.history
            .last()
            .copied()
            .unwrap_or(SessionState::Created)
    }

    /// Every state entered by the last run, in order.
    pub fn history(&self) -> &[SessionState] {
        &self.history
    }

    fn advance(&mut self, state: SessionState) {
        tracing::info!(from = %self.state(), to = %state, "session state changed");
        self.history.push(state);
    }

    /// Runs the session to completion.
    ///
    /// On failure no transition report is produced; the error carries the
    /// state reached before aborting. `TornDown` is always the final state.
    pub async fn run(&mut self, request: &SessionRequest) -> std::result::Result<SessionReport, SessionFailure> {
        self.history = vec![SessionState::Created];

        if let Err(error) = request.validate() {
            return Err(self.abort_without_sandbox(error));
        }

        let provisioned = bounded(
            "provision",
            self.timeouts.provision(),
            self.provider
                .provision(&request.codebase, &request.setup, self.timeouts.provision()),
        )
        .await;
        let sandbox = match provisioned {
            Ok(sandbox) => sandbox,
            Err(error) => return Err(self.abort_without_sandbox(error)),
        };

        tracing::info!(
            sandbox = %sandbox.id(),
            backend = %self.provider.name(),
            "sandbox provisioned"
        );
        self.advance(SessionState::Provisioned);

        let mut guard = SandboxGuard::new(Arc::clone(&self.provider), sandbox, self.timeouts.teardown());
        let result = match guard.sandbox() {
            Some(sandbox) => self.drive(sandbox, request).await,
            None => Err(Error::Provisioning("sandbox released before use".to_string())),
        };

        let reached = self.state();
        if let Err(error) = &result {
            tracing::error!(state = %reached, error = %error, "session aborted");
            self.advance(SessionState::Aborted);
        }

        if let Err(err) = guard.release().await {
            tracing::warn!(error = %err, "sandbox teardown failed");
        }
        self.advance(SessionState::TornDown);

        result.map_err(|error| SessionFailure {
            state: reached,
            error,
        })
    }

    fn abort_without_sandbox(&mut self, error: Error) -> SessionFailure {
        let reached = self.state();
        tracing::error!(state = %reached, error = %error, "session aborted before a sandbox existed");
        self.advance(SessionState::Aborted);
        self.advance(SessionState::TornDown);
        SessionFailure {
            state: reached,
            error,
        }
    }

    async fn drive(&mut self, sandbox: &P::Sandbox, request: &SessionRequest) -> Result<SessionReport> {
        let timeouts = self.timeouts;

        let baseline_ids = self.discover(sandbox, &timeouts).await?;
        let baseline = self.run_suite(sandbox, &timeouts).await?;
        if self.verify_baseline {
            let again = self.run_suite(sandbox, &timeouts).await?;
            let flaky = baseline.differing_ids(&again);
            if !flaky.is_empty() {
                return Err(Error::NondeterministicBaseline(flaky));
            }
        }
        self.advance(SessionState::BaselineRun);

        for patch in request.patches() {
            bounded(
                "patch apply",
                timeouts.apply(),
                self.provider.apply(sandbox, &patch, timeouts.apply()),
            )
            .await?;
        }
        self.advance(SessionState::Patched);

        let post_ids = self.discover(sandbox, &timeouts).await?;
        let post_patch = self.run_suite(sandbox, &timeouts).await?;
        self.advance(SessionState::PostPatchRun);

        let transitions = compare(&baseline, &post_patch);
        let tests = combine(&baseline_ids, &post_ids, &post_patch, &transitions);
        tracing::info!(
            sandbox = %sandbox.id(),
            tests = tests.len(),
            regressions = transitions.pass_to_fail.len(),
            "classified outcomes"
        );
        self.advance(SessionState::Classified);

        Ok(SessionReport {
            sandbox_id: sandbox.id().to_string(),
            baseline,
            post_patch,
            transitions,
            tests,
        })
    }

    async fn discover(&self, sandbox: &P::Sandbox, timeouts: &TimeoutConfig) -> Result<BTreeSet<TestId>> {
        bounded(
            "discovery",
            timeouts.discover(),
            self.provider.discover(sandbox, timeouts.discover()),
        )
        .await
    }

    async fn run_suite(&self, sandbox: &P::Sandbox, timeouts: &TimeoutConfig) -> Result<Snapshot> {
        bounded(
            "test run",
            timeouts.run(),
            self.provider.run(sandbox, timeouts.run()),
        )
        .await
    }
}

/// Builds the per-test report over the post-patch discovery set.
fn combine(
    baseline_ids: &BTreeSet<TestId>,
    post_ids: &BTreeSet<TestId>,
    post_patch: &Snapshot,
    transitions: &TransitionReport,
) -> Vec<TestReport> {
    post_ids
        .iter()
        .map(|id| {
            let record = post_patch.get(id);
            TestReport {
                id: id.clone(),
                outcome: record.map(|r| r.outcome),
                diagnostic: record.map(|r| r.diagnostic.clone()).unwrap_or_default(),
                transition: transitions.category_of(id),
                introduced_in_patch: !baseline_ids.contains(id),
            }
        })
        .collect()
}
