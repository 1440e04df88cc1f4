//! Failure Scenario E2E Tests
//!
//! Each test reproduces a gateway misbehavior and checks the harness
//! reports it with enough context to diagnose:
//! - Lifecycle that never runs (timeout with last observation)
//! - Duplicate delete markers on repeated lifecycle passes
//! - Disabled rules that still act
//! - Wrong `x-amz-expiration` dates
//! - Buckets left in UNINITIAL lifecycle status
//! - Buckets processed while lifecycle threads are disabled
//! - Extra markers after explicit delete cycles
//! - Unparseable `x-amz-expiration` values

use super::common::*;
use rgw_lc_harness::config::VersioningMode;
use rgw_lc_harness::verify::{ManualClock, PredictedState};
use rgw_lc_harness::{CollaboratorError, HarnessError, InvariantViolation, ScenarioRunner};
use std::time::Duration;

/// Test: Stalled lifecycle times out after the maximum wait
#[test]
fn test_e2e_stalled_lifecycle_times_out() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            stalled: true,
            ..Default::default()
        },
    );

    let mut config = scenario("stalled");
    config.scenario.objects_count = 1;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .unwrap_err();

    match err {
        HarnessError::Timeout(failure) => {
            assert_eq!(failure.rule_id, "rule1");
            assert_eq!(failure.expected, PredictedState::Deleted);
            assert!(failure.last.exists);
            assert_eq!(failure.elapsed, Duration::from_secs(30));
            // 10, 12, ..., 30
            assert_eq!(failure.attempts, 11);
        }
        other => panic!("expected timeout, got {:?}", other),
    }
}

/// Test: A second lifecycle pass adding markers is caught by the marker check
#[test]
fn test_e2e_duplicate_delete_markers() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            duplicate_markers: true,
            ..Default::default()
        },
    );
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("duplicate_markers");
    config.scenario.objects_count = 1;
    config.scenario.versioning = VersioningMode::Enabled;
    config.scenario.delete_marker_check = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .unwrap_err();

    match err {
        HarnessError::Invariant(InvariantViolation::DeleteMarkers {
            key,
            observed,
            expected,
        }) => {
            assert!(key.starts_with("key1."));
            assert_eq!(expected, 1);
            assert!(observed > 1, "observed {} markers", observed);
        }
        other => panic!("expected delete marker violation, got {:?}", other),
    }
}

/// Test: A disabled rule that still expires objects is reported
#[test]
fn test_e2e_disabled_rule_applied() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            apply_disabled_rules: true,
            ..Default::default()
        },
    );

    let mut config = scenario("disabled_rule_applied");
    config.lifecycle = vec![
        expire_after(prefix_rule("rule1", "key1"), 1),
        disabled(expire_after(prefix_rule("rule2", "key2"), 1)),
    ];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .unwrap_err();

    match err {
        HarnessError::Invariant(InvariantViolation::ExemptModified { key, observation }) => {
            assert!(key.starts_with("key2."));
            assert!(observation.starts_with("absent"));
        }
        other => panic!("expected exempt object violation, got {:?}", other),
    }
}

/// Test: An expiry date one day off is reported before any waiting
#[test]
fn test_e2e_expiration_header_mismatch() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            header_day_offset: 1,
            ..Default::default()
        },
    );

    let mut config = scenario("expiration_header_mismatch");
    config.scenario.check_expiration_header = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .unwrap_err();

    match err {
        HarnessError::Invariant(InvariantViolation::ExpirationHeader {
            expected, found, ..
        }) => {
            assert_eq!(expected, "2024-04-03");
            assert_eq!(found, "2024-04-04");
        }
        other => panic!("expected expiration header violation, got {:?}", other),
    }
    assert_eq!(clock.total_slept(), Duration::ZERO);
}

/// Test: A bucket the lifecycle thread never picked up fails the run
#[test]
fn test_e2e_uninitial_lifecycle_status() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: Some("UNINITIAL"),
    };

    let mut config = scenario("uninitial_status");
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::Invariant(InvariantViolation::LifecycleStatus { ref status, .. })
            if status == "UNINITIAL"
    ));
}

/// Test: A bucket processed although lifecycle threads are off fails before any wait
#[test]
fn test_e2e_processed_with_lc_threads_disabled() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: Some("COMPLETE"),
    };

    let mut config = scenario("lc_threads_ignored");
    config.scenario.rgw_enable_lc_threads = false;
    config.scenario.manual_lc_process = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::Invariant(InvariantViolation::LifecycleStatus { ref status, .. })
            if status == "COMPLETE"
    ));
    assert_eq!(clock.total_slept(), Duration::ZERO);
}

/// Test: Lifecycle passes after explicit deletes must not add markers
#[test]
fn test_e2e_delete_cycles_catch_extra_markers() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            duplicate_markers: true,
            ..Default::default()
        },
    );
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("delete_cycles_duplicates");
    config.scenario.objects_count = 1;
    config.scenario.versioning = VersioningMode::Enabled;
    config.scenario.delete_marker_check = true;
    config.scenario.delete_cycles = 1;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .unwrap_err();

    match err {
        HarnessError::Invariant(InvariantViolation::DeleteMarkers {
            observed, expected, ..
        }) => {
            // one lifecycle expiration plus one explicit delete
            assert_eq!(expected, 2);
            assert!(observed > 2, "observed {} markers", observed);
        }
        other => panic!("expected delete marker violation, got {:?}", other),
    }
}

/// Test: An unparseable expiry header is a gateway fault, not a config error
#[test]
fn test_e2e_garbled_expiration_header() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            garbled_expiration_header: true,
            ..Default::default()
        },
    );

    let mut config = scenario("garbled_header");
    config.scenario.check_expiration_header = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let err = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .unwrap_err();

    assert!(matches!(
        err,
        HarnessError::Collaborator(CollaboratorError::Output { .. })
    ));
}
