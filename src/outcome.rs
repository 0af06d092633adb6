//! Per-test outcomes and suite snapshots.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Stable identifier of one test case (a pytest node id).
pub type TestId = String;

/// Outcome of a single test in one suite execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Passed,
    Failed,
    Error,
    Skipped,
}

/// Outcome normalized for transition comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Pass,
    Fail,
}

impl Outcome {
    /// Maps a pytest report outcome onto the closed outcome set.
    ///
    /// `xpassed` counts as passed and `xfailed` as skipped. Anything else
    /// unrecognized returns `None`.
    pub fn from_report(outcome: &str) -> Option<Self> {
        match outcome {
            "passed" | "xpassed" => Some(Outcome::Passed),
            "failed" => Some(Outcome::Failed),
            "error" => Some(Outcome::Error),
            "skipped" | "xfailed" => Some(Outcome::Skipped),
            _ => None,
        }
    }

    /// Returns the comparable status, or `None` for skipped tests.
    pub fn status(self) -> Option<Status> {
        match self {
            Outcome::Passed => Some(Status::Pass),
            Outcome::Failed | Outcome::Error => Some(Status::Fail),
            Outcome::Skipped => None,
        }
    }

    fn severity(self) -> u8 {
        match self {
            Outcome::Skipped => 0,
            Outcome::Passed => 1,
            Outcome::Failed => 2,
            Outcome::Error => 3,
        }
    }
}

/// Result of one test case.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestRecord {
    pub id: TestId,
    pub outcome: Outcome,
    /// Failure output or skip reason; empty when there is nothing to report.
    #[serde(default)]
    pub diagnostic: String,
}

impl TestRecord {
    pub fn new(id: impl Into<TestId>, outcome: Outcome) -> Self {
        Self {
            id: id.into(),
            outcome,
            diagnostic: String::new(),
        }
    }

    pub fn with_diagnostic(mut self, diagnostic: impl Into<String>) -> Self {
        self.diagnostic = diagnostic.into();
        self
    }
}

/// Outcomes of exactly one full suite execution against one sandbox state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    records: BTreeMap<TestId, TestRecord>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a result. When the same id is reported twice, the more severe
    /// outcome wins so that an errored teardown is not masked by a pass.
    pub fn insert(&mut self, record: TestRecord) {
        match self.records.get(&record.id) {
            Some(existing) if existing.outcome.severity() >= record.outcome.severity() => {}
            _ => {
                self.records.insert(record.id.clone(), record);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<&TestRecord> {
        self.records.get(id)
    }

    pub fn outcome(&self, id: &str) -> Option<Outcome> {
        self.records.get(id).map(|r| r.outcome)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &TestId> {
        self.records.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &TestRecord> {
        self.records.values()
    }

    /// Iterates over ids with a comparable status, skipping skipped tests.
    pub fn comparable(&self) -> impl Iterator<Item = (&TestId, Status)> {
        self.records
            .iter()
            .filter_map(|(id, r)| r.outcome.status().map(|s| (id, s)))
    }

    /// Returns ids whose outcome differs between the two snapshots, including
    /// ids present in only one of them.
    pub fn differing_ids(&self, other: &Snapshot) -> Vec<TestId> {
        let mut ids: Vec<TestId> = self
            .records
            .iter()
            .filter(|(id, r)| other.outcome(id) != Some(r.outcome))
            .map(|(id, _)| id.clone())
            .collect();
        ids.extend(
            other
                .ids()
                .filter(|id| !self.contains(id))
                .cloned(),
        );
        ids.sort();
        ids
    }
}

impl FromIterator<TestRecord> for Snapshot {
    fn from_iter<I: IntoIterator<Item = TestRecord>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}
