//! pytest discovery and execution inside a sandbox.
//!
//! Both operations go through pytest-json-report. Each invocation writes a
//! fresh, uniquely named report into the sandbox scratch directory so a stale
//! report from an earlier run can never be read back.

mod report;

pub use report::JsonReport;

use std::collections::BTreeSet;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::outcome::{Snapshot, TestId};
use crate::sandbox::{CommandOutput, Sandbox, SandboxCommand, SandboxProvider};

/// pytest exit codes that still produce a usable report:
/// all passed, some failed, nothing collected.
const RUN_OK_CODES: [i32; 3] = [0, 1, 5];

/// pytest exit code for "no tests collected".
const NO_TESTS_COLLECTED: i32 = 5;

/// Builds a pytest invocation writing its JSON report to `report_path`.
fn pytest_command(sandbox: &impl Sandbox, extra: &[&str], report_path: &str) -> SandboxCommand {
    SandboxCommand::new("python")
        .args(["-m", "pytest", "-p", "no:cacheprovider"])
        .args(extra.iter().copied())
        .arg("--json-report")
        .arg(format!("--json-report-file={}", report_path))
        .args(["--json-report-omit", "keywords", "log", "streams", "warnings"])
        .args(sandbox.setup().test_args.iter().cloned())
        .env("PYTHONDONTWRITEBYTECODE", "1")
}

fn report_name(stage: &str) -> String {
    format!("{}-{}.json", stage, uuid::Uuid::new_v4().simple())
}

/// Executes pytest and reads back its report, if one was written.
async fn invoke<P>(
    provider: &P,
    sandbox: &P::Sandbox,
    stage: &str,
    extra: &[&str],
    timeout: Duration,
) -> Result<(CommandOutput, Option<Vec<u8>>)>
where
    P: SandboxProvider + ?Sized,
{
    provider.probe(sandbox).await?;

    let name = report_name(stage);
    let report_path = sandbox.scratch_dir().join(&name);
    let command = pytest_command(sandbox, extra, &report_path.to_string_lossy());

    tracing::debug!(sandbox = %sandbox.id(), command = %command.display(), "invoking pytest");
    let output = provider
        .exec(sandbox, &command, timeout)
        .await
        .map_err(|err| match err {
            Error::Timeout { after, .. } => Error::timeout(stage, after),
            other => other,
        })?;
    let report = provider.read_file(sandbox, &name).await?;
    Ok((output, report))
}

/// Enumerates the test ids the sandbox's suite would run.
///
/// A suite with no tests is an empty set, not an error. Any collection
/// error (import failure, syntax error in a test module) fails discovery.
pub async fn discover<P>(provider: &P, sandbox: &P::Sandbox, timeout: Duration) -> Result<BTreeSet<TestId>>
where
    P: SandboxProvider + ?Sized,
{
    let (output, bytes) = invoke(provider, sandbox, "discovery", &["--collect-only", "-q"], timeout).await?;
    let report = bytes.as_deref().map(JsonReport::parse).transpose();

    let report = match (output.code, report) {
        (Some(code), Ok(Some(report))) if code == 0 || code == NO_TESTS_COLLECTED => report,
        (Some(NO_TESTS_COLLECTED), Ok(None)) => return Ok(BTreeSet::new()),
        (_, Ok(Some(report))) if !report.collection_errors().is_empty() => {
            return Err(collection_failure(&report));
        }
        (code, Ok(_)) => {
            return Err(Error::TestDiscovery(format!(
                "pytest --collect-only exited with {:?}: {}",
                code,
                output.tail(20)
            )));
        }
        (_, Err(err)) => {
            return Err(Error::TestDiscovery(format!("unreadable collection report: {}", err)));
        }
    };

    if !report.collection_errors().is_empty() {
        return Err(collection_failure(&report));
    }

    let ids = report.collected_ids();
    tracing::info!(sandbox = %sandbox.id(), tests = ids.len(), "discovered tests");
    Ok(ids)
}

fn collection_failure(report: &JsonReport) -> Error {
    let detail = report
        .collection_errors()
        .into_iter()
        .map(|(node, text)| {
            let last = text.trim_end().lines().last().unwrap_or_default();
            format!("{}: {}", if node.is_empty() { "<root>" } else { node }, last)
        })
        .collect::<Vec<_>>()
        .join("; ");
    Error::TestDiscovery(format!("collection failed: {}", detail))
}

/// Runs the whole suite once and returns one record per executed test.
///
/// Test failures are data, not errors. The run fails only when pytest itself
/// could not produce a report (usage error, internal error, interrupted).
pub async fn run<P>(provider: &P, sandbox: &P::Sandbox, timeout: Duration) -> Result<Snapshot>
where
    P: SandboxProvider + ?Sized,
{
    let (output, bytes) = invoke(provider, sandbox, "test run", &["-rN"], timeout).await?;

    match output.code {
        Some(code) if RUN_OK_CODES.contains(&code) => {}
        code => {
            return Err(Error::TestExecution(format!(
                "pytest exited with {:?}: {}",
                code,
                output.tail(20)
            )));
        }
    }

    let bytes = bytes.ok_or_else(|| {
        Error::TestExecution(format!("pytest wrote no report: {}", output.tail(20)))
    })?;
    let report = JsonReport::parse(&bytes)
        .map_err(|err| Error::TestExecution(format!("unreadable test report: {}", err)))?;
    let snapshot = report.snapshot().map_err(Error::TestExecution)?;

    tracing::info!(
        sandbox = %sandbox.id(),
        tests = snapshot.len(),
        exit_code = ?output.code,
        "test run finished"
    );
    Ok(snapshot)
}
