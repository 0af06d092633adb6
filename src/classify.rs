//! Outcome transition classification between two snapshots.
//!
//! [`compare`] is pure: it performs no I/O and its result depends only on the
//! two snapshots, so identical inputs always produce identical reports.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::outcome::{Snapshot, Status, TestId};

/// How a test's outcome changed across the patch boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Transition {
    PassToPass,
    PassToFail,
    FailToPass,
    FailToFail,
    NewPass,
    NewFail,
}

impl Transition {
    pub const ALL: [Transition; 6] = [
        Transition::PassToPass,
        Transition::PassToFail,
        Transition::FailToPass,
        Transition::FailToFail,
        Transition::NewPass,
        Transition::NewFail,
    ];

    /// Categorizes a (before, after) status pair. `before` is `None` when the
    /// baseline has no comparable outcome for the test.
    pub fn from_statuses(before: Option<Status>, after: Status) -> Self {
        match (before, after) {
            (Some(Status::Pass), Status::Pass) => Transition::PassToPass,
            (Some(Status::Pass), Status::Fail) => Transition::PassToFail,
            (Some(Status::Fail), Status::Pass) => Transition::FailToPass,
            (Some(Status::Fail), Status::Fail) => Transition::FailToFail,
            (None, Status::Pass) => Transition::NewPass,
            (None, Status::Fail) => Transition::NewFail,
        }
    }
}

/// Six disjoint sets of test ids, one per [`Transition`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionReport {
    #[serde(rename = "PASS_TO_PASS")]
    pub pass_to_pass: BTreeSet<TestId>,
    #[serde(rename = "PASS_TO_FAIL")]
    pub pass_to_fail: BTreeSet<TestId>,
    #[serde(rename = "FAIL_TO_PASS")]
    pub fail_to_pass: BTreeSet<TestId>,
    #[serde(rename = "FAIL_TO_FAIL")]
    pub fail_to_fail: BTreeSet<TestId>,
    #[serde(rename = "NEW_PASS")]
    pub new_pass: BTreeSet<TestId>,
    #[serde(rename = "NEW_FAIL")]
    pub new_fail: BTreeSet<TestId>,
    /// Ids present only in the baseline. Not part of the partition.
    #[serde(default)]
    pub removed: BTreeSet<TestId>,
}

impl TransitionReport {
    pub fn category(&self, transition: Transition) -> &BTreeSet<TestId> {
        match transition {
            Transition::PassToPass => &self.pass_to_pass,
            Transition::PassToFail => &self.pass_to_fail,
            Transition::FailToPass => &self.fail_to_pass,
            Transition::FailToFail => &self.fail_to_fail,
            Transition::NewPass => &self.new_pass,
            Transition::NewFail => &self.new_fail,
        }
    }

    fn category_mut(&mut self, transition: Transition) -> &mut BTreeSet<TestId> {
        match transition {
            Transition::PassToPass => &mut self.pass_to_pass,
            Transition::PassToFail => &mut self.pass_to_fail,
            Transition::FailToPass => &mut self.fail_to_pass,
            Transition::FailToFail => &mut self.fail_to_fail,
            Transition::NewPass => &mut self.new_pass,
            Transition::NewFail => &mut self.new_fail,
        }
    }

    /// Returns the category holding `id`, if any.
    pub fn category_of(&self, id: &str) -> Option<Transition> {
        Transition::ALL
            .into_iter()
            .find(|t| self.category(*t).contains(id))
    }

    /// Total number of categorized ids.
    pub fn len(&self) -> usize {
        Transition::ALL.iter().map(|t| self.category(*t).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True when the patch broke nothing that used to pass.
    pub fn is_regression_free(&self) -> bool {
        self.pass_to_fail.is_empty()
    }
}

/// Compares a baseline snapshot against a post-patch snapshot.
///
/// Every comparable id of `after` lands in exactly one category. Skipped
/// outcomes on either side contribute no status, so a test skipped in the
/// baseline is categorized by its post-patch status alone.
pub fn compare(before: &Snapshot, after: &Snapshot) -> TransitionReport {
    let mut report = TransitionReport::default();

    for (id, status) in after.comparable() {
        let previous = before.outcome(id).and_then(|o| o.status());
        report
            .category_mut(Transition::from_statuses(previous, status))
            .insert(id.clone());
    }

    report.removed = before
        .ids()
        .filter(|id| !after.contains(id))
        .cloned()
        .collect();

    report
}
