//! RGW Lifecycle Harness Library
//!
//! Eventually-consistent assertions for Ceph RGW bucket lifecycle tests.
//!
//! # Features
//!
//! - **Rule Translation**: Predicts when each lifecycle rule becomes
//!   observable on an object, under an accelerated lifecycle day
//! - **Bounded Polling**: Never checks early, never waits past a ceiling,
//!   reports the last observation on timeout
//! - **Delete-Marker Invariant**: Exactly one marker per logical delete,
//!   no matter how many lifecycle passes run
//! - **Cluster Control**: Scoped `ceph config` overrides with automatic
//!   restore, `radosgw-admin` lifecycle, rate-limit and topology commands
//!
//! # Example
//!
//! ```no_run
//! use rgw_lc_harness::{config::Config, s3::BlockingS3Client, scenario::ScenarioRunner};
//! use rgw_lc_harness::verify::SystemClock;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = Config::load("scenario.yaml")?;
//!     let s3 = BlockingS3Client::new(config.s3.as_ref().expect("s3 section"))?;
//!     let report = ScenarioRunner::new(&config, &s3, SystemClock)?.run()?;
//!     println!("{} stages verified", report.stages.len());
//!     Ok(())
//! }
//! ```

pub mod admin;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod metrics;
pub mod s3;
pub mod scenario;
pub mod verify;

// Re-export commonly used types
pub use config::Config;
pub use error::{CollaboratorError, HarnessError, InvariantViolation, TimeoutFailure};
pub use scenario::{ScenarioReport, ScenarioRunner};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
