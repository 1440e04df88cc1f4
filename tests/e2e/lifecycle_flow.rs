//! Lifecycle Flow E2E Tests
//!
//! Happy path scenarios against the simulated gateway:
//! - Expiration in unversioned buckets
//! - Transition followed by expiration
//! - Versioned expiration with the delete-marker check
//! - Noncurrent version expiration
//! - Manually triggered lifecycle processing
//! - Lifecycle threads disabled, several buckets, delete cycles

use super::common::*;
use rgw_lc_harness::config::VersioningMode;
use rgw_lc_harness::verify::{Clock, ManualClock, PredictedState};
use rgw_lc_harness::ScenarioRunner;
use std::sync::atomic::Ordering;
use std::time::Duration;

/// Test: Unversioned objects expire shortly after one lifecycle day
#[test]
fn test_e2e_expiration_unversioned() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("expire_unversioned");
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .expect("scenario should pass");

    assert_eq!(report.objects, 2);
    assert_eq!(report.exempt, 0);
    assert_eq!(report.stages.len(), 2);
    for stage in &report.stages {
        assert_eq!(stage.rule_id, "rule1");
        assert_eq!(stage.matched, PredictedState::Deleted);
    }

    // Never checked before the day was over, never waited past the ceiling
    let waited = clock.now() - t0();
    assert!(waited >= chrono::Duration::seconds(DAY_SECS as i64));
    assert!(waited <= chrono::Duration::seconds(DAY_SECS as i64 + 30));
    println!("Scenario finished after {:?}", report.duration);
}

/// Test: An object moves to a colder tier, then expires
#[test]
fn test_e2e_transition_then_expiration() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());

    let mut config = scenario("transition_then_expire");
    config.scenario.objects_count = 1;
    let rule = transition_after(prefix_rule("tiering", "logs"), 1, "COLD");
    config.lifecycle = vec![expire_after(rule, 3)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .expect("scenario should pass");

    let matched: Vec<&PredictedState> = report.stages.iter().map(|s| &s.matched).collect();
    assert_eq!(
        matched,
        vec![&PredictedState::Tier("COLD".into()), &PredictedState::Deleted]
    );
    // Expiration is not checked before day three
    assert!(clock.now() - t0() >= chrono::Duration::seconds(3 * DAY_SECS as i64));
}

/// Test: Versioned expiration leaves exactly one delete marker per key
#[test]
fn test_e2e_versioned_expiration_single_marker() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("versioned_expiration");
    config.scenario.versioning = VersioningMode::Enabled;
    config.scenario.delete_marker_check = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .expect("scenario should pass");

    assert!(report
        .stages
        .iter()
        .all(|s| s.matched == PredictedState::DeleteMarkerCreated));

    let markers = report.markers.expect("marker check ran");
    assert!(markers.is_clean());
    assert_eq!(markers.counts.len(), 2);
    assert!(markers.counts.values().all(|&n| n == 1));
    for key in markers.counts.keys() {
        assert_eq!(gateway.marker_count(&report.buckets[0], key), 1);
    }
}

/// Test: Superseded versions expire, current versions are left alone
#[test]
fn test_e2e_noncurrent_expiration() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());

    let mut config = scenario("noncurrent_expiration");
    config.scenario.versioning = VersioningMode::Enabled;
    config.scenario.version_count = 2;
    config.lifecycle = vec![expire_noncurrent_after(prefix_rule("old", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .expect("scenario should pass");

    // Two keys with two versions each: the older one expires, the current one stays
    assert_eq!(report.objects, 4);
    assert_eq!(report.exempt, 2);
    assert_eq!(report.stages.len(), 2);
    assert!(report.stages.iter().all(|s| s.version_id.is_some()));
}

/// Test: Objects outside every rule stay untouched in STANDARD
#[test]
fn test_e2e_disabled_rule_leaves_objects() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());

    let mut config = scenario("disabled_rule");
    config.lifecycle = vec![
        expire_after(prefix_rule("rule1", "key1"), 1),
        disabled(expire_after(prefix_rule("rule2", "key2"), 1)),
    ];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .expect("scenario should pass");

    assert_eq!(report.exempt, 1);
    assert_eq!(report.stages.len(), 1);
    assert!(report.stages[0].key.starts_with("key1."));
}

/// Test: Advertised expiry dates match the configured rules
#[test]
fn test_e2e_expiration_header_matches() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());

    let mut config = scenario("expiration_header");
    config.scenario.check_expiration_header = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 2)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .expect("scenario should pass");

    assert_eq!(report.expiration_hints_checked, 2);
}

/// Test: Lifecycle that only runs on demand is driven through the admin
#[test]
fn test_e2e_manual_lifecycle_processing() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            manual_only: true,
            ..Default::default()
        },
    );
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("manual_processing");
    config.scenario.manual_lc_process = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .expect("scenario should pass");

    assert_eq!(report.stages.len(), 2);
    assert!(gateway.process_calls.load(Ordering::SeqCst) > 0);
}

/// Test: The harness waits in polling intervals, not fixed sleeps
#[test]
fn test_e2e_waits_are_bounded_by_polling() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());

    let mut config = scenario("bounded_waits");
    config.scenario.objects_count = 1;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .unwrap();

    let stage = &report.stages[0];
    // Eligible at 10s, processed at 13s, seen on the 14s poll
    assert_eq!(stage.attempts, 3);
    assert_eq!(stage.lag, Duration::from_secs(4));
    assert_eq!(clock.total_slept(), Duration::from_secs(14));
}

/// Test: Repeated put-then-delete cycles leave one marker per delete
#[test]
fn test_e2e_delete_cycles_keep_marker_ledger() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("delete_cycles");
    config.scenario.versioning = VersioningMode::Enabled;
    config.scenario.delete_marker_check = true;
    config.scenario.delete_cycles = 2;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .expect("scenario should pass");

    assert_eq!(report.delete_cycles, 2);
    let markers = report.markers.expect("marker check ran");
    assert_eq!(markers.counts.len(), 2);
    // one from lifecycle expiration, one per explicit delete
    assert!(markers.counts.values().all(|&n| n == 3));
    for key in markers.counts.keys() {
        assert_eq!(gateway.marker_count(&report.buckets[0], key), 3);
    }
}

/// Test: Every bucket of a run is validated
#[test]
fn test_e2e_several_buckets() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());

    let mut config = scenario("several_buckets");
    config.scenario.buckets_count = 3;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .run()
        .expect("scenario should pass");

    assert_eq!(report.buckets.len(), 3);
    assert_eq!(report.objects, 6);
    assert_eq!(report.stages.len(), 6);
    for bucket in &report.buckets {
        assert_eq!(report.stages.iter().filter(|s| &s.bucket == bucket).count(), 2);
    }
    // validated together, not one bucket after another
    assert!(clock.now() - t0() <= chrono::Duration::seconds(DAY_SECS as i64 + 30));
}

/// Test: With lifecycle threads off, buckets wait for manual processing
#[test]
fn test_e2e_lc_threads_disabled() {
    let clock = ManualClock::starting_at(t0());
    let gateway = SimulatedGateway::new(
        clock.clone(),
        GatewayBehavior {
            manual_only: true,
            ..Default::default()
        },
    );
    let admin = SimulatedAdmin {
        gateway: &gateway,
        status: None,
    };

    let mut config = scenario("lc_threads_disabled");
    config.scenario.rgw_enable_lc_threads = false;
    config.scenario.manual_lc_process = true;
    config.lifecycle = vec![expire_after(prefix_rule("rule1", "key1"), 1)];
    assert_eq!(config.cluster_overrides()["rgw_enable_lc_threads"], "false");

    let report = ScenarioRunner::new(&config, &gateway, clock.clone())
        .unwrap()
        .with_admin(&admin)
        .run()
        .expect("scenario should pass");

    assert_eq!(report.stages.len(), 2);
    assert!(gateway.process_calls.load(Ordering::SeqCst) > 0);
}
