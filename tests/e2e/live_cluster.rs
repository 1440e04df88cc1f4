//! Live Cluster E2E Tests
//!
//! Runs a scenario file against a real gateway. Ignored by default; the
//! scenario file and credentials come from the environment.

use rgw_lc_harness::s3::BlockingS3Client;
use rgw_lc_harness::verify::SystemClock;
use rgw_lc_harness::{Config, ScenarioRunner};

/// Test: Scenario from RGW_LC_SCENARIO passes on the configured cluster
#[test]
#[ignore]
fn test_e2e_live_scenario() {
    let path = crate::skip_if_no_cluster!();

    let config = Config::load(&path).expect("scenario should load");
    let Some(s3_config) = config.s3.as_ref() else {
        eprintln!("Skipping test: scenario has no s3 section");
        return;
    };
    let s3 = BlockingS3Client::new(s3_config).expect("S3 client");

    let report = ScenarioRunner::new(&config, &s3, SystemClock)
        .expect("runner")
        .run()
        .expect("scenario should pass");

    println!(
        "{}: {} stages verified in {:?}",
        report.scenario,
        report.stages.len(),
        report.duration
    );
}
