//! Session scenarios driven by a scripted in-memory provider.
//!
//! The scripted provider never spawns processes, so these run anywhere.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use patch_validator::{
    CommandOutput, EnvironmentSetup, Error, Outcome, Patch, PatchKind, Result, Sandbox,
    SandboxCommand, SandboxProvider, Session, SessionRequest, SessionState, Snapshot, TestId,
    TestRecord, TimeoutConfig, Transition,
};

#[derive(Debug, Default)]
struct Calls {
    provisions: AtomicUsize,
    discovers: AtomicUsize,
    baseline_runs: AtomicUsize,
    post_runs: AtomicUsize,
    teardowns: AtomicUsize,
    applied: Mutex<Vec<PatchKind>>,
}

impl Calls {
    fn teardowns(&self) -> usize {
        self.teardowns.load(Ordering::SeqCst)
    }

    fn post_runs(&self) -> usize {
        self.post_runs.load(Ordering::SeqCst)
    }

    fn baseline_runs(&self) -> usize {
        self.baseline_runs.load(Ordering::SeqCst)
    }
}

/// What the scripted provider reports at each step.
#[derive(Debug, Clone, Default)]
struct Script {
    baseline: Vec<(&'static str, Outcome)>,
    post: Vec<(&'static str, Outcome)>,
    /// Discovered but never reported after patching.
    post_only_discovered: Vec<&'static str>,
    fail_provision: bool,
    conflict: Option<PatchKind>,
    fail_post_discovery: bool,
    hang_run: bool,
    fail_teardown: bool,
    /// Flips between passed and failed on every baseline run.
    flaky: Option<&'static str>,
}

struct ScriptedSandbox {
    id: String,
    workdir: PathBuf,
    scratch: PathBuf,
    setup: EnvironmentSetup,
    patched: AtomicBool,
}

impl Sandbox for ScriptedSandbox {
    fn id(&self) -> &str {
        &self.id
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

struct ScriptedProvider {
    script: Script,
    calls: Arc<Calls>,
}

impl ScriptedProvider {
    fn new(script: Script) -> (Self, Arc<Calls>) {
        let calls = Arc::new(Calls::default());
        (
            Self {
                script,
                calls: Arc::clone(&calls),
            },
            calls,
        )
    }

    fn records(entries: &[(&'static str, Outcome)]) -> Snapshot {
        entries
            .iter()
            .map(|(id, outcome)| TestRecord::new(*id, *outcome))
            .collect()
    }
}

#[async_trait]
impl SandboxProvider for ScriptedProvider {
    type Sandbox = ScriptedSandbox;

    fn name(&self) -> &str {
        "scripted"
    }

    async fn provision(
        &self,
        source: &Path,
        setup: &EnvironmentSetup,
        _timeout: Duration,
    ) -> Result<ScriptedSandbox> {
        self.calls.provisions.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_provision {
            return Err(Error::DependencyInstall {
                command: "pip install -e .".to_string(),
                reason: "no matching distribution".to_string(),
            });
        }
        Ok(ScriptedSandbox {
            id: "scripted-1".to_string(),
            workdir: source.to_path_buf(),
            scratch: PathBuf::from("/scratch"),
            setup: setup.clone(),
            patched: AtomicBool::new(false),
        })
    }

    async fn teardown(&self, sandbox: &mut ScriptedSandbox) -> Result<()> {
        self.calls.teardowns.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_teardown {
            return Err(Error::Teardown {
                sandbox: sandbox.id.clone(),
                reason: "device busy".to_string(),
            });
        }
        Ok(())
    }

    async fn probe(&self, _sandbox: &ScriptedSandbox) -> Result<()> {
        Ok(())
    }

    async fn exec(
        &self,
        _sandbox: &ScriptedSandbox,
        _command: &SandboxCommand,
        _timeout: Duration,
    ) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    async fn write_file(&self, sandbox: &ScriptedSandbox, name: &str, _contents: &[u8]) -> Result<PathBuf> {
        Ok(sandbox.scratch.join(name))
    }

    async fn read_file(&self, _sandbox: &ScriptedSandbox, _name: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    async fn apply(&self, sandbox: &ScriptedSandbox, patch: &Patch, _timeout: Duration) -> Result<()> {
        self.calls.applied.lock().unwrap().push(patch.kind);
        if self.script.conflict == Some(patch.kind) {
            return Err(Error::PatchConflict {
                patch: patch.kind,
                detail: "error: patch failed: calc.py:1".to_string(),
            });
        }
        sandbox.patched.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn discover(&self, sandbox: &ScriptedSandbox, _timeout: Duration) -> Result<BTreeSet<TestId>> {
        self.calls.discovers.fetch_add(1, Ordering::SeqCst);
        if !sandbox.patched.load(Ordering::SeqCst) {
            return Ok(self.script.baseline.iter().map(|(id, _)| id.to_string()).collect());
        }
        if self.script.fail_post_discovery {
            return Err(Error::TestDiscovery(
                "collection failed: tests/test_calc.py: SyntaxError".to_string(),
            ));
        }
        Ok(self
            .script
            .post
            .iter()
            .map(|(id, _)| id.to_string())
            .chain(self.script.post_only_discovered.iter().map(|id| id.to_string()))
            .collect())
    }

    async fn run(&self, sandbox: &ScriptedSandbox, _timeout: Duration) -> Result<Snapshot> {
        if self.script.hang_run {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if sandbox.patched.load(Ordering::SeqCst) {
            self.calls.post_runs.fetch_add(1, Ordering::SeqCst);
            return Ok(Self::records(&self.script.post));
        }

        let run = self.calls.baseline_runs.fetch_add(1, Ordering::SeqCst);
        let mut snapshot = Self::records(&self.script.baseline);
        if let Some(flaky) = self.script.flaky {
            let outcome = if run % 2 == 0 {
                Outcome::Passed
            } else {
                Outcome::Failed
            };
            snapshot.insert(TestRecord::new(flaky, outcome));
        }
        Ok(snapshot)
    }
}

fn codebase() -> TempDir {
    let dir = TempDir::new().expect("failed to create codebase dir");
    std::fs::write(dir.path().join("calc.py"), "def add(a, b):\n    return a - b\n")
        .expect("failed to write calc.py");
    dir
}

fn request(dir: &TempDir) -> SessionRequest {
    SessionRequest::new(dir.path(), "diff --git a/calc.py b/calc.py\n")
}

const FULL_HISTORY: [SessionState; 7] = [
    SessionState::Created,
    SessionState::Provisioned,
    SessionState::BaselineRun,
    SessionState::Patched,
    SessionState::PostPatchRun,
    SessionState::Classified,
    SessionState::TornDown,
];

#[tokio::test]
async fn fixing_patch_is_classified_per_test() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed), ("t::b", Outcome::Failed)],
        post: vec![
            ("t::a", Outcome::Passed),
            ("t::b", Outcome::Passed),
            ("t::c", Outcome::Passed),
        ],
        ..Default::default()
    });
    let dir = codebase();
    let mut session = Session::new(provider);

    let report = session.run(&request(&dir)).await.expect("session failed");

    let t = &report.transitions;
    assert_eq!(t.pass_to_pass, BTreeSet::from(["t::a".to_string()]));
    assert_eq!(t.fail_to_pass, BTreeSet::from(["t::b".to_string()]));
    assert_eq!(t.new_pass, BTreeSet::from(["t::c".to_string()]));
    assert!(t.pass_to_fail.is_empty() && t.fail_to_fail.is_empty() && t.new_fail.is_empty());

    assert_eq!(report.tests.len(), 3);
    assert!(report.test("t::c").unwrap().introduced_in_patch);
    assert!(!report.test("t::b").unwrap().introduced_in_patch);
    assert_eq!(report.sandbox_id, "scripted-1");

    assert_eq!(session.history(), FULL_HISTORY);
    assert_eq!(calls.teardowns(), 1);
    assert_eq!(*calls.applied.lock().unwrap(), vec![PatchKind::Code]);
}

#[tokio::test]
async fn regression_is_pass_to_fail() {
    let (provider, _calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        post: vec![("t::a", Outcome::Failed)],
        ..Default::default()
    });
    let dir = codebase();

    let report = Session::new(provider).run(&request(&dir)).await.unwrap();

    assert_eq!(report.transitions.category_of("t::a"), Some(Transition::PassToFail));
    assert!(!report.transitions.is_regression_free());
}

#[tokio::test]
async fn conflicting_code_patch_aborts_before_post_run() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        post: vec![("t::a", Outcome::Passed)],
        conflict: Some(PatchKind::Code),
        ..Default::default()
    });
    let dir = codebase();
    let mut session = Session::new(provider);

    let failure = session
        .run(&request(&dir).with_test_patch("diff --git a/t.py b/t.py\n"))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        Error::PatchConflict {
            patch: PatchKind::Code,
            ..
        }
    ));
    assert_eq!(failure.state, SessionState::BaselineRun);
    assert_eq!(calls.post_runs(), 0);
    assert_eq!(calls.teardowns(), 1);
    assert_eq!(*calls.applied.lock().unwrap(), vec![PatchKind::Code]);
    assert_eq!(
        &session.history()[session.history().len() - 2..],
        [SessionState::Aborted, SessionState::TornDown]
    );
}

#[tokio::test]
async fn conflicting_test_patch_is_reported_as_test_patch() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        conflict: Some(PatchKind::Test),
        ..Default::default()
    });
    let dir = codebase();

    let failure = Session::new(provider)
        .run(&request(&dir).with_test_patch("diff --git a/t.py b/t.py\n"))
        .await
        .unwrap_err();

    assert!(matches!(
        failure.error,
        Error::PatchConflict {
            patch: PatchKind::Test,
            ..
        }
    ));
    assert_eq!(
        *calls.applied.lock().unwrap(),
        vec![PatchKind::Code, PatchKind::Test]
    );
    assert_eq!(calls.teardowns(), 1);
}

#[tokio::test]
async fn tests_added_by_patch_are_introduced_regardless_of_outcome() {
    let (provider, _calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        post: vec![
            ("t::a", Outcome::Passed),
            ("t::new_ok", Outcome::Passed),
            ("t::new_bad", Outcome::Error),
            ("t::new_skip", Outcome::Skipped),
        ],
        post_only_discovered: vec!["t::never_ran"],
        ..Default::default()
    });
    let dir = codebase();

    let report = Session::new(provider)
        .run(&request(&dir).with_test_patch("diff --git a/t.py b/t.py\n"))
        .await
        .unwrap();

    let introduced: Vec<_> = report.introduced().cloned().collect();
    assert_eq!(
        introduced,
        vec!["t::never_ran", "t::new_bad", "t::new_ok", "t::new_skip"]
    );

    let bad = report.test("t::new_bad").unwrap();
    assert_eq!(bad.transition, Some(Transition::NewFail));
    assert_eq!(bad.outcome, Some(Outcome::Error));

    let skipped = report.test("t::new_skip").unwrap();
    assert_eq!(skipped.transition, None);

    let never_ran = report.test("t::never_ran").unwrap();
    assert_eq!(never_ran.outcome, None);
    assert_eq!(never_ran.transition, None);
}

#[tokio::test]
async fn provisioning_failure_skips_teardown_but_ends_torn_down() {
    let (provider, calls) = ScriptedProvider::new(Script {
        fail_provision: true,
        ..Default::default()
    });
    let dir = codebase();
    let mut session = Session::new(provider);

    let failure = session.run(&request(&dir)).await.unwrap_err();

    assert!(failure.error.is_provisioning());
    assert_eq!(failure.state, SessionState::Created);
    assert_eq!(calls.teardowns(), 0);
    assert_eq!(
        session.history(),
        [
            SessionState::Created,
            SessionState::Aborted,
            SessionState::TornDown
        ]
    );
}

#[tokio::test]
async fn invalid_request_never_provisions() {
    let (provider, calls) = ScriptedProvider::new(Script::default());
    let dir = codebase();

    let failure = Session::new(provider)
        .run(&SessionRequest::new(dir.path(), ""))
        .await
        .unwrap_err();

    assert!(matches!(failure.error, Error::Config(_)));
    assert_eq!(calls.provisions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn post_patch_discovery_error_aborts_after_patching() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        fail_post_discovery: true,
        ..Default::default()
    });
    let dir = codebase();

    let failure = Session::new(provider).run(&request(&dir)).await.unwrap_err();

    assert!(matches!(failure.error, Error::TestDiscovery(_)));
    assert_eq!(failure.state, SessionState::Patched);
    assert_eq!(calls.post_runs(), 0);
    assert_eq!(calls.teardowns(), 1);
}

#[tokio::test]
async fn hung_test_run_times_out() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        hang_run: true,
        ..Default::default()
    });
    let dir = codebase();
    let timeouts = TimeoutConfig {
        run_secs: 1,
        ..Default::default()
    };

    let failure = Session::new(provider)
        .with_timeouts(timeouts)
        .run(&request(&dir))
        .await
        .unwrap_err();

    match failure.error {
        Error::Timeout { operation, after } => {
            assert_eq!(operation, "test run");
            assert_eq!(after, Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {other}"),
    }
    assert_eq!(failure.state, SessionState::Provisioned);
    assert_eq!(calls.teardowns(), 1);
}

#[tokio::test]
async fn teardown_failure_does_not_fail_session() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        post: vec![("t::a", Outcome::Passed)],
        fail_teardown: true,
        ..Default::default()
    });
    let dir = codebase();
    let mut session = Session::new(provider);

    let result = session.run(&request(&dir)).await;

    tokio_test::assert_ok!(&result);
    assert_eq!(calls.teardowns(), 1);
    assert_eq!(session.state(), SessionState::TornDown);
}

#[tokio::test]
async fn flaky_baseline_is_rejected_when_verified() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        post: vec![("t::a", Outcome::Passed)],
        flaky: Some("t::flaky"),
        ..Default::default()
    });
    let dir = codebase();

    let failure = Session::new(provider)
        .with_verify_baseline(true)
        .run(&request(&dir))
        .await
        .unwrap_err();

    match failure.error {
        Error::NondeterministicBaseline(ids) => assert_eq!(ids, vec!["t::flaky".to_string()]),
        other => panic!("expected nondeterministic baseline, got {other}"),
    }
    assert_eq!(calls.baseline_runs(), 2);
    assert_eq!(calls.teardowns(), 1);
}

#[tokio::test]
async fn stable_baseline_passes_verification() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed), ("t::b", Outcome::Failed)],
        post: vec![("t::a", Outcome::Passed), ("t::b", Outcome::Failed)],
        ..Default::default()
    });
    let dir = codebase();

    let report = Session::new(provider)
        .with_verify_baseline(true)
        .run(&request(&dir))
        .await
        .unwrap();

    assert_eq!(calls.baseline_runs(), 2);
    assert_eq!(calls.post_runs(), 1);
    assert_eq!(report.transitions.fail_to_fail.len(), 1);
}

#[tokio::test]
async fn cancelled_session_still_tears_down_once() {
    let (provider, calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        hang_run: true,
        ..Default::default()
    });
    let dir = codebase();
    let mut session = Session::new(provider);
    let request = request(&dir);

    let outcome = tokio::time::timeout(Duration::from_millis(100), session.run(&request)).await;
    tokio_test::assert_err!(outcome);

    // Teardown is scheduled on the runtime when the session future drops
    for _ in 0..50 {
        if calls.teardowns() > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(calls.teardowns(), 1);
    assert_eq!(calls.post_runs(), 0);
}

#[tokio::test]
async fn report_serializes_with_category_names() {
    let (provider, _calls) = ScriptedProvider::new(Script {
        baseline: vec![("t::a", Outcome::Passed)],
        post: vec![("t::a", Outcome::Passed), ("t::b", Outcome::Failed)],
        ..Default::default()
    });
    let dir = codebase();

    let report = Session::new(provider).run(&request(&dir)).await.unwrap();
    let json: serde_json::Value = serde_json::to_value(&report).unwrap();

    assert_eq!(json["transitions"]["PASS_TO_PASS"][0], "t::a");
    assert_eq!(json["transitions"]["NEW_FAIL"][0], "t::b");
    assert_eq!(json["tests"][1]["introduced_in_patch"], true);
    assert_eq!(json["tests"][1]["transition"], "NEW_FAIL");
    assert_eq!(json["post_patch"]["t::b"]["outcome"], "failed");
}
