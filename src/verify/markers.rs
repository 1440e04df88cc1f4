//! Delete-marker count invariant
//!
//! In a versioned bucket every logical delete leaves exactly one delete
//! marker. Lifecycle expiration of a key whose current version is already
//! a marker must not add another one, no matter how many lifecycle passes
//! run.

use crate::error::InvariantViolation;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Kind of a bucket listing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Version,
    DeleteMarker,
}

/// One entry of a versioned bucket listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingEntry {
    pub key: String,
    pub version_id: Option<String>,
    pub kind: EntryKind,
}

impl ListingEntry {
    pub fn marker(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            version_id: None,
            kind: EntryKind::DeleteMarker,
        }
    }

    pub fn version(key: impl Into<String>, version_id: Option<String>) -> Self {
        Self {
            key: key.into(),
            version_id,
            kind: EntryKind::Version,
        }
    }
}

/// Per-key marker counts and any violations found
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MarkerReport {
    pub counts: BTreeMap<String, usize>,
    #[serde(serialize_with = "serialize_violations")]
    pub violations: Vec<InvariantViolation>,
}

impl MarkerReport {
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }

    /// The first violation, if any
    pub fn into_result(self) -> Result<Self, InvariantViolation> {
        match self.violations.first() {
            Some(violation) => Err(violation.clone()),
            None => Ok(self),
        }
    }
}

fn serialize_violations<S>(violations: &[InvariantViolation], s: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    s.collect_seq(violations.iter().map(|v| v.to_string()))
}

/// Count delete markers per key
pub fn count_markers<'a, I>(entries: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a ListingEntry>,
{
    let mut counts = BTreeMap::new();
    for entry in entries {
        if entry.kind == EntryKind::DeleteMarker {
            *counts.entry(entry.key.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Flag every key with more than one delete marker
pub fn check_at_most_one<'a, I>(entries: I) -> MarkerReport
where
    I: IntoIterator<Item = &'a ListingEntry>,
{
    let counts = count_markers(entries);
    let violations = counts
        .iter()
        .filter(|(_, &count)| count > 1)
        .map(|(key, &count)| InvariantViolation::DeleteMarkers {
            key: key.clone(),
            observed: count,
            expected: 1,
        })
        .collect::<Vec<_>>();

    crate::metrics::record_marker_violations(violations.len());
    MarkerReport { counts, violations }
}

/// Expected marker counts built from the deletes the harness caused
#[derive(Debug, Clone, Default)]
pub struct DeleteMarkerLedger {
    expected: BTreeMap<String, usize>,
    /// Keys whose current version is already a marker
    hidden: BTreeSet<String>,
}

impl DeleteMarkerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new current version was written
    pub fn record_put(&mut self, key: &str) {
        self.hidden.remove(key);
    }

    /// An explicit DELETE without version id
    pub fn record_delete(&mut self, key: &str) {
        *self.expected.entry(key.to_string()).or_insert(0) += 1;
        self.hidden.insert(key.to_string());
    }

    /// Lifecycle expired the current version. Idempotent until the next put.
    pub fn record_lifecycle_expiration(&mut self, key: &str) {
        if self.hidden.insert(key.to_string()) {
            *self.expected.entry(key.to_string()).or_insert(0) += 1;
        }
    }

    pub fn expected(&self, key: &str) -> usize {
        self.expected.get(key).copied().unwrap_or(0)
    }

    /// Compare a listing against the ledger, key by key
    pub fn check<'a, I>(&self, entries: I) -> MarkerReport
    where
        I: IntoIterator<Item = &'a ListingEntry>,
    {
        let counts = count_markers(entries);
        let keys: BTreeSet<&String> = counts.keys().chain(self.expected.keys()).collect();

        let violations = keys
            .into_iter()
            .filter_map(|key| {
                let observed = counts.get(key).copied().unwrap_or(0);
                let expected = self.expected(key);
                (observed != expected).then(|| InvariantViolation::DeleteMarkers {
                    key: key.clone(),
                    observed,
                    expected,
                })
            })
            .collect::<Vec<_>>();

        crate::metrics::record_marker_violations(violations.len());
        MarkerReport { counts, violations }
    }
}
