//! Common E2E Test Infrastructure
//!
//! Provides a simulated gateway for scenario tests:
//! - In-memory object store with versioning and delete markers
//! - Lifecycle processing driven by a shared manual clock, with a
//!   configurable processing lag
//! - Switches that reproduce known gateway bugs
//! - Scenario config builders

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rgw_lc_harness::admin::LifecycleAdmin;
use rgw_lc_harness::config::{
    ClusterConfig, Config, ExpirationConf, LifecycleRuleConf, NoncurrentExpirationConf,
    PollingConfig, RuleFilterConf, RuleStatus, ScenarioConfig, TransitionConf, VersioningMode,
};
use rgw_lc_harness::lifecycle::TargetObject;
use rgw_lc_harness::s3::ObjectStore;
use rgw_lc_harness::verify::{Clock, EntryKind, ListingEntry, ManualClock, Observation};
use rgw_lc_harness::CollaboratorError;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Seconds per lifecycle day in every simulated scenario
pub const DAY_SECS: u64 = 10;

/// Delay between a rule becoming due and the simulated gateway acting on it
pub const PROCESSING_LAG_SECS: i64 = 3;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 0, 0, 0).unwrap()
}

/// Behaviour switches for the simulated gateway
#[derive(Debug, Clone, Copy, Default)]
pub struct GatewayBehavior {
    /// Lifecycle only runs when triggered through the admin interface
    pub manual_only: bool,
    /// Lifecycle never runs
    pub stalled: bool,
    /// Disabled rules are applied anyway
    pub apply_disabled_rules: bool,
    /// Every pass adds another marker to keys whose current version is a marker
    pub duplicate_markers: bool,
    /// Added to the advertised expiry date
    pub header_day_offset: i64,
    /// Advertise an expiry date that is not a date
    pub garbled_expiration_header: bool,
}

#[derive(Debug, Clone)]
struct SimVersion {
    version_id: Option<String>,
    created: DateTime<Utc>,
    delete_marker: bool,
    storage_class: Option<String>,
    noncurrent_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct SimBucket {
    versioning: VersioningMode,
    rules: Vec<LifecycleRuleConf>,
    objects: BTreeMap<String, Vec<SimVersion>>,
    tags: HashMap<String, BTreeMap<String, String>>,
    processed: bool,
}

/// In-memory gateway whose lifecycle follows the shared clock
pub struct SimulatedGateway {
    clock: ManualClock,
    behavior: GatewayBehavior,
    buckets: Mutex<HashMap<String, SimBucket>>,
    next_version: AtomicUsize,
    pub process_calls: AtomicUsize,
}

impl SimulatedGateway {
    pub fn new(clock: ManualClock, behavior: GatewayBehavior) -> Self {
        Self {
            clock,
            behavior,
            buckets: Mutex::new(HashMap::new()),
            next_version: AtomicUsize::new(1),
            process_calls: AtomicUsize::new(0),
        }
    }

    fn day() -> chrono::Duration {
        chrono::Duration::seconds(DAY_SECS as i64)
    }

    fn due(base: DateTime<Utc>, days: Option<u32>, now: DateTime<Utc>) -> bool {
        match days {
            Some(days) => {
                now >= base
                    + Self::day() * days as i32
                    + chrono::Duration::seconds(PROCESSING_LAG_SECS)
            }
            None => false,
        }
    }

    fn background(&self, bucket: &str) {
        if !self.behavior.manual_only {
            self.process(bucket);
        }
    }

    /// One lifecycle pass over a bucket
    pub fn process(&self, bucket: &str) {
        if self.behavior.stalled {
            return;
        }
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();
        let Some(state) = buckets.get_mut(bucket) else {
            return;
        };
        state.processed = true;
        let versioned = state.versioning != VersioningMode::Off;

        for rule in state.rules.clone() {
            if rule.status == RuleStatus::Disabled && !self.behavior.apply_disabled_rules {
                continue;
            }
            let keys: Vec<String> = state.objects.keys().cloned().collect();
            for key in keys {
                let tags = state.tags.get(&key).cloned().unwrap_or_default();
                let prefix_ok = rule
                    .filter
                    .effective_prefix()
                    .map_or(true, |p| key.starts_with(p));
                let tags_ok = rule
                    .filter
                    .required_tags()
                    .iter()
                    .all(|(k, v)| tags.get(k) == Some(v));
                if !prefix_ok || !tags_ok {
                    continue;
                }

                let versions = state.objects.get_mut(&key).unwrap();
                Self::apply_rule(&rule, versions, versioned, now, self.behavior.duplicate_markers);
                if versions.is_empty() {
                    state.objects.remove(&key);
                }
            }
        }
    }

    fn apply_rule(
        rule: &LifecycleRuleConf,
        versions: &mut Vec<SimVersion>,
        versioned: bool,
        now: DateTime<Utc>,
        duplicate_markers: bool,
    ) {
        let current_is_marker = versions.last().map_or(false, |v| v.delete_marker);

        if current_is_marker {
            if duplicate_markers && rule.expiration.is_some() {
                versions.push(SimVersion {
                    version_id: Some(format!("dm-{}", versions.len())),
                    created: now,
                    delete_marker: true,
                    storage_class: None,
                    noncurrent_since: None,
                });
            }
        } else if let Some(current) = versions.last_mut() {
            for transition in &rule.transitions {
                if Self::due(current.created, transition.days, now) {
                    current.storage_class = Some(transition.storage_class.clone());
                }
            }
            let created = current.created;
            if let Some(expiration) = &rule.expiration {
                if Self::due(created, expiration.days, now) {
                    if versioned {
                        if let Some(current) = versions.last_mut() {
                            current.noncurrent_since = Some(now);
                        }
                        versions.push(SimVersion {
                            version_id: Some(format!("dm-{}", versions.len())),
                            created: now,
                            delete_marker: true,
                            storage_class: None,
                            noncurrent_since: None,
                        });
                    } else {
                        versions.clear();
                    }
                }
            }
        }

        if let Some(noncurrent) = &rule.noncurrent_version_expiration {
            versions.retain(|v| {
                v.delete_marker
                    || !v
                        .noncurrent_since
                        .map_or(false, |since| Self::due(since, Some(noncurrent.noncurrent_days), now))
            });
        }
    }

    fn expiration_header(&self, state: &SimBucket, key: &str, created: DateTime<Utc>) -> Option<String> {
        if state.versioning != VersioningMode::Off {
            return None;
        }
        state
            .rules
            .iter()
            .filter(|r| r.status == RuleStatus::Enabled)
            .filter(|r| r.filter.effective_prefix().map_or(true, |p| key.starts_with(p)))
            .filter_map(|r| {
                let days = r.expiration.as_ref()?.days?;
                let date = created.date_naive()
                    + chrono::Duration::days(i64::from(days) + 1 + self.behavior.header_day_offset);
                Some((date, r.id.clone()))
            })
            .min()
            .map(|(date, id)| {
                if self.behavior.garbled_expiration_header {
                    return format!(r#"expiry-date="soon", rule-id="{}""#, id);
                }
                format!(
                    r#"expiry-date="{}", rule-id="{}""#,
                    date.format("%a, %d %b %Y 00:00:00 GMT"),
                    id
                )
            })
    }

    /// Delete markers currently stored for a key
    pub fn marker_count(&self, bucket: &str, key: &str) -> usize {
        self.buckets
            .lock()
            .get(bucket)
            .and_then(|b| b.objects.get(key))
            .map_or(0, |versions| versions.iter().filter(|v| v.delete_marker).count())
    }
}

impl ObjectStore for SimulatedGateway {
    fn create_bucket(&self, bucket: &str) -> Result<(), CollaboratorError> {
        self.buckets.lock().insert(bucket.to_string(), SimBucket::default());
        Ok(())
    }

    fn set_versioning(&self, bucket: &str, mode: VersioningMode) -> Result<(), CollaboratorError> {
        let mut buckets = self.buckets.lock();
        let state = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        state.versioning = mode;
        Ok(())
    }

    fn put_object(
        &self,
        bucket: &str,
        key: &str,
        _body: Bytes,
        tags: &BTreeMap<String, String>,
    ) -> Result<Option<String>, CollaboratorError> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();
        let state = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;

        let version_id = match state.versioning {
            VersioningMode::Enabled => Some(format!(
                "v{}",
                self.next_version.fetch_add(1, Ordering::SeqCst)
            )),
            VersioningMode::Suspended => Some("null".to_string()),
            VersioningMode::Off => None,
        };

        let versions = state.objects.entry(key.to_string()).or_default();
        if state.versioning == VersioningMode::Enabled {
            if let Some(previous) = versions.last_mut() {
                previous.noncurrent_since.get_or_insert(now);
            }
        } else {
            versions.clear();
        }
        versions.push(SimVersion {
            version_id: version_id.clone(),
            created: now,
            delete_marker: false,
            storage_class: None,
            noncurrent_since: None,
        });
        state.tags.insert(key.to_string(), tags.clone());

        Ok(match state.versioning {
            VersioningMode::Enabled => version_id,
            _ => None,
        })
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CollaboratorError> {
        let now = self.clock.now();
        let mut buckets = self.buckets.lock();
        let state = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        if state.versioning == VersioningMode::Off {
            state.objects.remove(key);
        } else {
            let versions = state.objects.entry(key.to_string()).or_default();
            if let Some(previous) = versions.last_mut() {
                previous.noncurrent_since.get_or_insert(now);
            }
            versions.push(SimVersion {
                version_id: Some(format!("dm-{}", versions.len())),
                created: now,
                delete_marker: true,
                storage_class: None,
                noncurrent_since: None,
            });
        }
        Ok(())
    }

    fn put_lifecycle(
        &self,
        bucket: &str,
        rules: &[LifecycleRuleConf],
    ) -> Result<(), CollaboratorError> {
        let mut buckets = self.buckets.lock();
        let state = buckets.get_mut(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        state.rules = rules.to_vec();
        Ok(())
    }

    fn lifecycle_rule_ids(&self, bucket: &str) -> Result<Vec<String>, CollaboratorError> {
        let buckets = self.buckets.lock();
        let state = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(state.rules.iter().map(|r| r.id.clone()).collect())
    }

    fn observe(
        &self,
        bucket: &str,
        target: &TargetObject,
        at: DateTime<Utc>,
    ) -> Result<Observation, CollaboratorError> {
        self.background(bucket);
        let buckets = self.buckets.lock();
        let state = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        let versions = state.objects.get(&target.key);

        if target.is_noncurrent() {
            let found = versions.and_then(|vs| {
                vs.iter()
                    .find(|v| !v.delete_marker && v.version_id == target.version_id)
            });
            return Ok(match found {
                Some(v) => Observation::present(v.storage_class.clone(), at),
                None => Observation::absent(0, at),
            });
        }

        match versions.and_then(|vs| vs.last()) {
            Some(current) if !current.delete_marker => {
                let mut observation = Observation::present(current.storage_class.clone(), at);
                observation.expiration = self.expiration_header(state, &target.key, current.created);
                Ok(observation)
            }
            _ => {
                let markers = versions.map_or(0, |vs| vs.iter().filter(|v| v.delete_marker).count());
                Ok(Observation::absent(markers, at))
            }
        }
    }

    fn list_entries(&self, bucket: &str) -> Result<Vec<ListingEntry>, CollaboratorError> {
        self.background(bucket);
        let buckets = self.buckets.lock();
        let state = buckets.get(bucket).ok_or_else(|| no_such_bucket(bucket))?;
        Ok(state
            .objects
            .iter()
            .flat_map(|(key, versions)| {
                versions.iter().map(move |v| ListingEntry {
                    key: key.clone(),
                    version_id: v.version_id.clone(),
                    kind: if v.delete_marker {
                        EntryKind::DeleteMarker
                    } else {
                        EntryKind::Version
                    },
                })
            })
            .collect())
    }
}

fn no_such_bucket(bucket: &str) -> CollaboratorError {
    CollaboratorError::S3 {
        operation: "HeadBucket".into(),
        message: format!("NoSuchBucket: {}", bucket),
    }
}

/// Admin view of the simulated gateway
pub struct SimulatedAdmin<'a> {
    pub gateway: &'a SimulatedGateway,
    pub status: Option<&'static str>,
}

impl LifecycleAdmin for SimulatedAdmin<'_> {
    fn process_bucket(&self, bucket: &str) -> Result<(), CollaboratorError> {
        self.gateway.process_calls.fetch_add(1, Ordering::SeqCst);
        self.gateway.process(bucket);
        Ok(())
    }

    fn bucket_status(&self, bucket: &str) -> Result<Option<String>, CollaboratorError> {
        if let Some(status) = self.status {
            return Ok(Some(status.to_string()));
        }
        let processed = self
            .gateway
            .buckets
            .lock()
            .get(bucket)
            .map_or(false, |b| b.processed);
        Ok(Some(if processed { "COMPLETE" } else { "UNINITIAL" }.to_string()))
    }
}

// ============================================================================
// Scenario builders
// ============================================================================

pub fn scenario(name: &str) -> Config {
    Config {
        scenario: ScenarioConfig {
            name: name.into(),
            rgw_lc_debug_interval: DAY_SECS,
            objects_count: 2,
            object_size: 32,
            versioning: VersioningMode::Off,
            version_count: 0,
            object_tags: BTreeMap::new(),
            delete_marker_check: false,
            check_expiration_header: false,
            manual_lc_process: false,
            rgw_enable_lc_threads: true,
            buckets_count: 1,
            delete_cycles: 0,
            bucket_prefix: "e2e".into(),
        },
        lifecycle: vec![],
        polling: PollingConfig {
            interval_secs: 2,
            max_wait_secs: 30,
        },
        cluster: ClusterConfig::default(),
        s3: None,
    }
}

pub fn prefix_rule(id: &str, prefix: &str) -> LifecycleRuleConf {
    LifecycleRuleConf {
        id: id.into(),
        status: RuleStatus::Enabled,
        filter: RuleFilterConf {
            prefix: Some(prefix.into()),
            ..Default::default()
        },
        expiration: None,
        transitions: vec![],
        noncurrent_version_expiration: None,
        noncurrent_version_transitions: vec![],
    }
}

pub fn expire_after(mut rule: LifecycleRuleConf, days: u32) -> LifecycleRuleConf {
    rule.expiration = Some(ExpirationConf {
        days: Some(days),
        date: None,
    });
    rule
}

pub fn transition_after(
    mut rule: LifecycleRuleConf,
    days: u32,
    storage_class: &str,
) -> LifecycleRuleConf {
    rule.transitions.push(TransitionConf {
        days: Some(days),
        date: None,
        storage_class: storage_class.into(),
    });
    rule
}

pub fn expire_noncurrent_after(mut rule: LifecycleRuleConf, days: u32) -> LifecycleRuleConf {
    rule.noncurrent_version_expiration = Some(NoncurrentExpirationConf {
        noncurrent_days: days,
    });
    rule
}

pub fn disabled(mut rule: LifecycleRuleConf) -> LifecycleRuleConf {
    rule.status = RuleStatus::Disabled;
    rule
}

// ============================================================================
// Live cluster
// ============================================================================

/// Scenario file named by `RGW_LC_SCENARIO`, when it exists
pub fn live_scenario() -> Option<std::path::PathBuf> {
    let path = std::path::PathBuf::from(std::env::var("RGW_LC_SCENARIO").ok()?);
    path.exists().then_some(path)
}

/// Skip test if no live cluster scenario is configured
#[macro_export]
macro_rules! skip_if_no_cluster {
    () => {
        match $crate::e2e::common::live_scenario() {
            Some(path) => path,
            None => {
                eprintln!("Skipping test: RGW_LC_SCENARIO not set");
                return;
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gateway_expires_after_lag() {
        let clock = ManualClock::starting_at(t0());
        let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
        gateway.create_bucket("b").unwrap();
        gateway
            .put_lifecycle("b", &[expire_after(prefix_rule("r", "k"), 1)])
            .unwrap();
        gateway.put_object("b", "k1", Bytes::new(), &BTreeMap::new()).unwrap();
        let target = TargetObject::new("k1", t0());

        clock.advance(std::time::Duration::from_secs(DAY_SECS));
        assert!(gateway.observe("b", &target, clock.now()).unwrap().exists);

        clock.advance(std::time::Duration::from_secs(PROCESSING_LAG_SECS as u64));
        assert!(!gateway.observe("b", &target, clock.now()).unwrap().exists);
    }

    #[test]
    fn test_gateway_versioned_delete_adds_marker() {
        let clock = ManualClock::starting_at(t0());
        let gateway = SimulatedGateway::new(clock.clone(), GatewayBehavior::default());
        gateway.create_bucket("b").unwrap();
        gateway.set_versioning("b", VersioningMode::Enabled).unwrap();
        let version = gateway
            .put_object("b", "k1", Bytes::new(), &BTreeMap::new())
            .unwrap();
        assert_eq!(version.as_deref(), Some("v1"));

        gateway.delete_object("b", "k1").unwrap();
        assert_eq!(gateway.marker_count("b", "k1"), 1);
        assert_eq!(gateway.list_entries("b").unwrap().len(), 2);
    }
}
