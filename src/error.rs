//! Harness error taxonomy
//!
//! Four failure classes are kept apart so a scenario report can tell a
//! broken setup from a slow cluster from an incorrect one:
//!
//! - [`ConfigError`] - malformed scenario or rule, fatal before any wait
//! - [`TimeoutFailure`] - predicted state never observed within the wait
//! - [`CollaboratorError`] - the CLI or S3 client itself failed
//! - [`InvariantViolation`] - the cluster did something it must not do

use crate::verify::{Observation, PredictedState};
use std::time::Duration;
use thiserror::Error;

pub use crate::config::ConfigError;

/// Top-level harness error
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{0}")]
    Timeout(Box<TimeoutFailure>),

    #[error("collaborator failed: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

impl From<TimeoutFailure> for HarnessError {
    fn from(failure: TimeoutFailure) -> Self {
        HarnessError::Timeout(Box::new(failure))
    }
}

/// Errors raised by external collaborators (admin CLI, S3 client, service control)
#[derive(Error, Debug)]
pub enum CollaboratorError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("unparseable output from `{command}`: {reason}")]
    Output { command: String, reason: String },

    #[error("S3 {operation} failed: {message}")]
    S3 { operation: String, message: String },

    #[error("service restart failed: {0}")]
    RestartFailed(String),

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl CollaboratorError {
    pub(crate) fn s3(operation: &str, err: impl std::fmt::Display) -> Self {
        CollaboratorError::S3 {
            operation: operation.to_string(),
            message: err.to_string(),
        }
    }
}

/// Predicted state not observed before the maximum wait elapsed
#[derive(Error, Debug, Clone)]
#[error(
    "timed out after {elapsed:?} ({attempts} polls) waiting for {expected} from rule '{rule_id}'; last observation: {last}"
)]
pub struct TimeoutFailure {
    pub rule_id: String,
    pub expected: PredictedState,
    pub last: Observation,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Behaviour the cluster must never exhibit, regardless of timing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InvariantViolation {
    #[error("key '{key}' has {observed} delete markers, expected {expected}")]
    DeleteMarkers {
        key: String,
        observed: usize,
        expected: usize,
    },

    #[error("object '{key}' is exempt from every rule but was modified: {observation}")]
    ExemptModified { key: String, observation: String },

    #[error("x-amz-expiration for '{key}' is {found}, expected {expected}")]
    ExpirationHeader {
        key: String,
        expected: String,
        found: String,
    },

    #[error("lifecycle status for bucket '{bucket}' is {status}")]
    LifecycleStatus { bucket: String, status: String },

    #[error("cluster reported {0} new crash(es)")]
    Crash(usize),
}
