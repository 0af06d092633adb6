//! Parsing of pytest-json-report output.
//!
//! Only the fields needed for discovery and outcome extraction are modeled;
//! everything else in the report is ignored.

use std::collections::{BTreeSet, HashSet};

use serde::Deserialize;

use crate::outcome::{Outcome, Snapshot, TestId, TestRecord};

/// Top-level pytest JSON report.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonReport {
    #[serde(default)]
    pub exitcode: Option<i32>,
    #[serde(default)]
    pub collectors: Vec<Collector>,
    #[serde(default)]
    pub tests: Vec<TestEntry>,
}

/// One collector node and the nodes it yielded.
#[derive(Debug, Clone, Deserialize)]
pub struct Collector {
    pub nodeid: String,
    pub outcome: String,
    #[serde(default)]
    pub result: Vec<CollectedNode>,
    #[serde(default)]
    pub longrepr: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectedNode {
    pub nodeid: String,
    #[serde(rename = "type", default)]
    pub kind: String,
}

/// One executed test.
#[derive(Debug, Clone, Deserialize)]
pub struct TestEntry {
    pub nodeid: String,
    pub outcome: String,
    #[serde(default)]
    pub setup: Option<Stage>,
    #[serde(default)]
    pub call: Option<Stage>,
    #[serde(default)]
    pub teardown: Option<Stage>,
}

/// Setup, call or teardown phase of a test.
#[derive(Debug, Clone, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub outcome: Option<String>,
    #[serde(default)]
    pub longrepr: Option<String>,
}

impl TestEntry {
    /// First non-empty failure or skip text, looking at call, setup, then teardown.
    fn diagnostic(&self) -> String {
        [&self.call, &self.setup, &self.teardown]
            .into_iter()
            .flatten()
            .filter_map(|stage| stage.longrepr.as_deref())
            .find(|text| !text.trim().is_empty())
            .unwrap_or_default()
            .to_string()
    }
}

impl JsonReport {
    pub fn parse(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }

    /// Ids of collected test items.
    ///
    /// Items are the collected nodes that are not collectors themselves
    /// (modules, classes and packages all appear as collectors).
    pub fn collected_ids(&self) -> BTreeSet<TestId> {
        let collectors: HashSet<&str> = self.collectors.iter().map(|c| c.nodeid.as_str()).collect();
        self.collectors
            .iter()
            .flat_map(|c| c.result.iter())
            .filter(|node| !collectors.contains(node.nodeid.as_str()))
            .map(|node| node.nodeid.clone())
            .collect()
    }

    /// Collectors that failed, with their error text.
    ///
    /// A skipped collector (module-level `pytest.skip`, `importorskip`) is
    /// not an error; it simply yields no items.
    pub fn collection_errors(&self) -> Vec<(&str, &str)> {
        self.collectors
            .iter()
            .filter(|c| c.outcome == "failed")
            .map(|c| (c.nodeid.as_str(), c.longrepr.as_deref().unwrap_or_default()))
            .collect()
    }

    /// Converts executed tests into a snapshot.
    ///
    /// Fails on an outcome outside the known set rather than guessing.
    pub fn snapshot(&self) -> std::result::Result<Snapshot, String> {
        let mut snapshot = Snapshot::new();
        for test in &self.tests {
            let outcome = Outcome::from_report(&test.outcome).ok_or_else(|| {
                format!("unknown outcome '{}' for {}", test.outcome, test.nodeid)
            })?;
            let diagnostic = match outcome {
                Outcome::Passed => String::new(),
                _ => test.diagnostic(),
            };
            snapshot.insert(TestRecord::new(test.nodeid.clone(), outcome).with_diagnostic(diagnostic));
        }
        Ok(snapshot)
    }
}
