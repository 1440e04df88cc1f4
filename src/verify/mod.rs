//! Eventually-consistent verification
//!
//! - [`clock`] - wall clock and blocking sleep, swappable in tests
//! - [`poller`] - waits until an expectation is eligible, then polls
//! - [`markers`] - delete-marker count invariant
//!
//! Observations are compared with exact-match semantics: tier name
//! equality (an absent storage class reads as `STANDARD`), existence, and
//! exactly one delete marker for marker expectations.

pub mod clock;
pub mod markers;
pub mod poller;

pub use clock::{Clock, ManualClock, SystemClock};
pub use markers::{
    check_at_most_one, DeleteMarkerLedger, EntryKind, ListingEntry, MarkerReport,
};
pub use poller::{BoundedPoller, PollOutcome, PollSettings, PollTimeout, Polled, Verified};

use crate::lifecycle::STANDARD_STORAGE_CLASS;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Terminal or intermediate state the cluster is expected to reach
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "storage_class", rename_all = "snake_case")]
pub enum PredictedState {
    /// Object (or version) no longer exists
    Deleted,
    /// Current version replaced by a single delete marker
    DeleteMarkerCreated,
    /// Object exists in the given storage class
    Tier(String),
}

impl PredictedState {
    pub fn matches(&self, observation: &Observation) -> bool {
        match self {
            PredictedState::Deleted => !observation.exists,
            PredictedState::DeleteMarkerCreated => {
                !observation.exists && observation.delete_markers == 1
            }
            PredictedState::Tier(class) => {
                observation.exists && observation.effective_storage_class() == class
            }
        }
    }
}

impl fmt::Display for PredictedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PredictedState::Deleted => write!(f, "deleted"),
            PredictedState::DeleteMarkerCreated => write!(f, "delete-marker-created"),
            PredictedState::Tier(class) => write!(f, "tier={}", class),
        }
    }
}

/// Snapshot of an object's state as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Observation {
    pub exists: bool,
    pub storage_class: Option<String>,
    /// Delete markers recorded for the key
    pub delete_markers: usize,
    /// Raw `x-amz-expiration` header, when the gateway sent one
    pub expiration: Option<String>,
    pub observed_at: DateTime<Utc>,
}

impl Observation {
    pub fn present(storage_class: Option<String>, observed_at: DateTime<Utc>) -> Self {
        Self {
            exists: true,
            storage_class,
            delete_markers: 0,
            expiration: None,
            observed_at,
        }
    }

    pub fn absent(delete_markers: usize, observed_at: DateTime<Utc>) -> Self {
        Self {
            exists: false,
            storage_class: None,
            delete_markers,
            expiration: None,
            observed_at,
        }
    }

    pub fn effective_storage_class(&self) -> &str {
        self.storage_class
            .as_deref()
            .unwrap_or(STANDARD_STORAGE_CLASS)
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exists {
            write!(
                f,
                "present in {} at {}",
                self.effective_storage_class(),
                self.observed_at.to_rfc3339()
            )
        } else {
            write!(
                f,
                "absent with {} delete marker(s) at {}",
                self.delete_markers,
                self.observed_at.to_rfc3339()
            )
        }
    }
}
