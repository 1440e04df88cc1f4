//! Scenario runner
//!
//! Drives one lifecycle scenario end to end:
//!
//! 1. Create the buckets and upload objects whose keys match the rule filters
//! 2. Install the lifecycle configuration on every bucket
//! 3. Predict each object's schedule and validate it with bounded polling
//! 4. Check exempt objects, `x-amz-expiration` hints and lifecycle status
//! 5. Optionally run put-then-delete cycles, then check delete markers
//!
//! Any wait happens inside [`BoundedPoller`]; there are no fixed sleeps.

use crate::admin::{LifecycleAdmin, LC_STATUS_UNINITIAL};
use crate::config::{Config, VersioningMode};
use crate::error::{CollaboratorError, HarnessError, InvariantViolation};
use crate::lifecycle::{
    expected_expiry_date, AccelerationFactor, Action, ExpirationHint, Prediction, Rule,
    TargetObject, Translator, STANDARD_STORAGE_CLASS,
};
use crate::s3::ObjectStore;
use crate::verify::{
    BoundedPoller, Clock, DeleteMarkerLedger, MarkerReport, PollSettings, PredictedState,
    Verified,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// Keys for a scenario: `<prefix>.<bucket>.<n>`, cycling through the rule
/// prefixes so every rule has objects to act on.
pub fn object_keys(config: &Config, bucket: &str) -> Vec<String> {
    let prefixes = config.rule_prefixes();
    (0..config.scenario.objects_count)
        .map(|n| format!("{}.{}.{}", prefixes[n % prefixes.len()], bucket, n))
        .collect()
}

/// Fresh bucket name for a run
pub fn bucket_name(config: &Config) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}", config.scenario.bucket_prefix, &suffix[..12]).to_lowercase()
}

/// Number of versions written per key
fn versions_per_key(config: &Config) -> usize {
    match config.scenario.versioning {
        VersioningMode::Enabled => config.scenario.version_count.max(1),
        VersioningMode::Off | VersioningMode::Suspended => 1,
    }
}

/// Targets a run would create if every upload finished at `start`
pub fn planned_targets(config: &Config, bucket: &str, start: DateTime<Utc>) -> Vec<TargetObject> {
    let versioned = config.scenario.versioning.creates_delete_markers();
    let versions = versions_per_key(config);
    let mut targets = Vec::new();
    for key in object_keys(config, bucket) {
        for v in 0..versions {
            let mut target =
                TargetObject::new(key.clone(), start).with_tags(config.scenario.object_tags.clone());
            if versioned {
                target = target.versioned(Some(format!("v{}", v)));
            }
            if v + 1 < versions {
                target = target.superseded_at(start);
            }
            targets.push(target);
        }
    }
    targets
}

/// One planned object and its predicted schedule
#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub target: TargetObject,
    pub prediction: Prediction,
}

/// Predict every object of a scenario without touching a cluster
pub fn plan(config: &Config, start: DateTime<Utc>) -> Result<Vec<PlanEntry>, HarnessError> {
    let factor = AccelerationFactor::seconds_per_day(config.scenario.rgw_lc_debug_interval)?;
    let translator = Translator::new(factor);
    let rules = Rule::from_confs(&config.lifecycle)?;
    let bucket = format!("{}-plan", config.scenario.bucket_prefix);

    Ok(planned_targets(config, &bucket, start)
        .into_iter()
        .map(|target| PlanEntry {
            prediction: translator.translate(&rules, &target),
            target,
        })
        .collect())
}

/// One validated stage
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub bucket: String,
    pub key: String,
    pub version_id: Option<String>,
    pub rule_id: String,
    pub expected: PredictedState,
    pub matched: PredictedState,
    pub attempts: u32,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
    #[serde(serialize_with = "as_millis")]
    pub lag: Duration,
}

/// Outcome of a successful scenario
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioReport {
    pub scenario: String,
    pub buckets: Vec<String>,
    pub objects: usize,
    pub exempt: usize,
    pub stages: Vec<StageReport>,
    pub expiration_hints_checked: usize,
    pub delete_cycles: usize,
    pub markers: Option<MarkerReport>,
    #[serde(serialize_with = "as_millis")]
    pub duration: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

/// A bucket and the objects uploaded to it
struct PreparedBucket {
    name: String,
    targets: Vec<TargetObject>,
}

/// Runs a scenario against an object store
pub struct ScenarioRunner<'a, S: ObjectStore, C: Clock> {
    config: &'a Config,
    store: S,
    poller: BoundedPoller<C>,
    translator: Translator,
    rules: Vec<Rule>,
    admin: Option<&'a dyn LifecycleAdmin>,
}

impl<'a, S: ObjectStore, C: Clock> ScenarioRunner<'a, S, C> {
    pub fn new(config: &'a Config, store: S, clock: C) -> Result<Self, HarnessError> {
        config.validate()?;
        let factor = AccelerationFactor::seconds_per_day(config.scenario.rgw_lc_debug_interval)?;
        let settings = PollSettings::try_from(&config.polling)?;
        Ok(Self {
            config,
            store,
            poller: BoundedPoller::new(clock, settings),
            translator: Translator::new(factor),
            rules: Rule::from_confs(&config.lifecycle)?,
            admin: None,
        })
    }

    /// Admin access used to trigger lifecycle processing by hand
    pub fn with_admin(mut self, admin: &'a dyn LifecycleAdmin) -> Self {
        self.admin = Some(admin);
        self
    }

    fn clock(&self) -> &C {
        self.poller.clock()
    }

    #[tracing::instrument(name = "scenario.run", skip(self), fields(scenario = %self.config.scenario.name))]
    pub fn run(&self) -> Result<ScenarioReport, HarnessError> {
        let started = self.clock().now();
        let scenario = &self.config.scenario;

        let mut buckets = Vec::with_capacity(scenario.buckets_count);
        let mut ledgers = Vec::with_capacity(scenario.buckets_count);
        for _ in 0..scenario.buckets_count {
            let name = bucket_name(self.config);
            info!(bucket = %name, "Preparing bucket");
            self.store.create_bucket(&name)?;
            self.store.set_versioning(&name, scenario.versioning)?;

            let mut ledger = DeleteMarkerLedger::new();
            let targets = self.upload(&name, &mut ledger)?;
            buckets.push(PreparedBucket { name, targets });
            ledgers.push(ledger);
        }

        // Every bucket gets its rules before any is validated, so lifecycle
        // works through them in the same pass
        for bucket in &buckets {
            self.install_lifecycle(&bucket.name)?;
        }
        for bucket in &buckets {
            self.check_threads_idle(&bucket.name)?;
        }

        let mut expiration_hints_checked = 0;
        if scenario.check_expiration_header {
            for bucket in &buckets {
                expiration_hints_checked +=
                    self.check_expiration_hints(&bucket.name, &bucket.targets)?;
            }
        }

        let mut scheduled: Vec<(usize, &TargetObject, Prediction)> = Vec::new();
        let mut exempt: Vec<(usize, &TargetObject)> = Vec::new();
        for (index, bucket) in buckets.iter().enumerate() {
            for target in &bucket.targets {
                match self.translator.translate(&self.rules, target) {
                    Prediction::Exempt => exempt.push((index, target)),
                    prediction => scheduled.push((index, target, prediction)),
                }
            }
        }
        scheduled.sort_by_key(|(_, _, p)| p.expectations().first().map(|e| e.eligible_after));

        let mut stages = Vec::new();
        for (index, target, prediction) in &scheduled {
            let bucket = &buckets[*index].name;
            let verified = self.validate_target(bucket, target, prediction)?;
            for v in verified {
                if v.matched == PredictedState::DeleteMarkerCreated {
                    ledgers[*index].record_lifecycle_expiration(&target.key);
                }
                stages.push(stage_report(bucket, target, v));
            }
        }

        for bucket in &buckets {
            self.check_lifecycle_status(&bucket.name)?;
        }
        for (index, target) in &exempt {
            self.check_exempt(&buckets[*index].name, target)?;
        }

        if scenario.delete_cycles > 0 {
            for (bucket, ledger) in buckets.iter().zip(ledgers.iter_mut()) {
                self.run_delete_cycles(&bucket.name, ledger)?;
            }
        }

        let markers = if scenario.delete_marker_check {
            let mut merged = MarkerReport::default();
            for (bucket, ledger) in buckets.iter().zip(&ledgers) {
                let report = self.check_markers(&bucket.name, ledger)?;
                merged.counts.extend(report.counts);
            }
            Some(merged)
        } else {
            None
        };

        let objects = buckets.iter().map(|b| b.targets.len()).sum();
        let exempt = exempt.len();
        let report = ScenarioReport {
            scenario: scenario.name.clone(),
            buckets: buckets.into_iter().map(|b| b.name).collect(),
            objects,
            exempt,
            stages,
            expiration_hints_checked,
            delete_cycles: scenario.delete_cycles,
            markers,
            duration: (self.clock().now() - started).to_std().unwrap_or_default(),
        };
        info!(
            buckets = report.buckets.len(),
            stages = report.stages.len(),
            exempt = report.exempt,
            duration = ?report.duration,
            "Scenario passed"
        );
        Ok(report)
    }

    fn upload(
        &self,
        bucket: &str,
        ledger: &mut DeleteMarkerLedger,
    ) -> Result<Vec<TargetObject>, HarnessError> {
        let scenario = &self.config.scenario;
        let versioned = scenario.versioning.creates_delete_markers();
        let versions = versions_per_key(self.config);
        let body = Bytes::from(vec![b'x'; scenario.object_size]);
        let mut targets = Vec::new();

        for key in object_keys(self.config, bucket) {
            let mut written: Vec<TargetObject> = Vec::with_capacity(versions);
            for _ in 0..versions {
                let version_id =
                    self.store
                        .put_object(bucket, &key, body.clone(), &scenario.object_tags)?;
                let created = self.clock().now();
                ledger.record_put(&key);

                if let Some(previous) = written.pop() {
                    written.push(previous.superseded_at(created));
                }
                let mut target =
                    TargetObject::new(key.clone(), created).with_tags(scenario.object_tags.clone());
                if versioned {
                    target = target.versioned(version_id);
                }
                written.push(target);
            }
            targets.extend(written);
        }

        info!(bucket, objects = targets.len(), "Objects uploaded");
        Ok(targets)
    }

    fn install_lifecycle(&self, bucket: &str) -> Result<(), HarnessError> {
        self.store.put_lifecycle(bucket, &self.config.lifecycle)?;
        let installed = self.store.lifecycle_rule_ids(bucket)?;
        let missing: Vec<&str> = self
            .config
            .lifecycle
            .iter()
            .map(|rule| rule.id.as_str())
            .filter(|id| !installed.iter().any(|i| i == id))
            .collect();
        if !missing.is_empty() {
            return Err(CollaboratorError::S3 {
                operation: "GetBucketLifecycleConfiguration".into(),
                message: format!("rules not installed: {}", missing.join(", ")),
            }
            .into());
        }
        info!(bucket, rules = installed.len(), "Lifecycle configuration installed");
        Ok(())
    }

    fn validate_target(
        &self,
        bucket: &str,
        target: &TargetObject,
        prediction: &Prediction,
    ) -> Result<Vec<Verified>, HarnessError> {
        let manual = if self.config.scenario.manual_lc_process {
            self.admin
        } else {
            None
        };
        self.poller.validate_schedule(prediction, || {
            if let Some(admin) = manual {
                admin.process_bucket(bucket)?;
            }
            self.store.observe(bucket, target, self.clock().now())
        })
    }

    fn check_lifecycle_status(&self, bucket: &str) -> Result<(), HarnessError> {
        let Some(admin) = self.admin else {
            return Ok(());
        };
        match admin.bucket_status(bucket)? {
            Some(status) if status == LC_STATUS_UNINITIAL => {
                Err(InvariantViolation::LifecycleStatus {
                    bucket: bucket.to_string(),
                    status,
                }
                .into())
            }
            Some(status) => {
                info!(bucket, status = %status, "Lifecycle status");
                Ok(())
            }
            None => {
                warn!(bucket, "Bucket has no lifecycle entry");
                Ok(())
            }
        }
    }

    fn check_exempt(&self, bucket: &str, target: &TargetObject) -> Result<(), HarnessError> {
        let observation = self.store.observe(bucket, target, self.clock().now())?;
        if !observation.exists || observation.effective_storage_class() != STANDARD_STORAGE_CLASS {
            return Err(InvariantViolation::ExemptModified {
                key: target.key.clone(),
                observation: observation.to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// With lifecycle threads off nothing may process a bucket before the
    /// harness asks for it
    fn check_threads_idle(&self, bucket: &str) -> Result<(), HarnessError> {
        if self.config.scenario.rgw_enable_lc_threads {
            return Ok(());
        }
        let Some(admin) = self.admin else {
            return Ok(());
        };
        match admin.bucket_status(bucket)? {
            Some(status) if status != LC_STATUS_UNINITIAL => {
                Err(InvariantViolation::LifecycleStatus {
                    bucket: bucket.to_string(),
                    status,
                }
                .into())
            }
            _ => Ok(()),
        }
    }

    /// Put-then-delete rounds on every key. Each round ends with the
    /// lifecycle configuration installed again and another lifecycle pass;
    /// keys are then hidden behind an explicit marker, so lifecycle must
    /// not add one.
    fn run_delete_cycles(
        &self,
        bucket: &str,
        ledger: &mut DeleteMarkerLedger,
    ) -> Result<(), HarnessError> {
        let scenario = &self.config.scenario;
        let body = Bytes::from(vec![b'x'; scenario.object_size]);
        let keys = object_keys(self.config, bucket);

        for cycle in 1..=scenario.delete_cycles {
            for key in &keys {
                self.store
                    .put_object(bucket, key, body.clone(), &scenario.object_tags)?;
                ledger.record_put(key);
                self.store.delete_object(bucket, key)?;
                ledger.record_delete(key);
            }
            self.install_lifecycle(bucket)?;
            if let Some(admin) = self.admin {
                admin.process_bucket(bucket)?;
            }
            info!(bucket, cycle, keys = keys.len(), "Delete cycle finished");
        }
        Ok(())
    }

    /// Compare advertised expiry dates with the configured rules; returns the
    /// number of objects checked
    fn check_expiration_hints(
        &self,
        bucket: &str,
        targets: &[TargetObject],
    ) -> Result<usize, HarnessError> {
        let mut checked = 0;
        for target in targets.iter().filter(|t| !t.versioned) {
            let expected = self
                .rules
                .iter()
                .filter(|rule| rule.action == Action::Expire && rule.applies_to(target))
                .map(|rule| expected_expiry_date(rule.threshold, target.created_at))
                .min();
            let Some(expected) = expected else {
                continue;
            };

            let observation = self.store.observe(bucket, target, self.clock().now())?;
            let found = match observation.expiration.as_deref() {
                Some(raw) => ExpirationHint::parse(raw)?.expiry_date().to_string(),
                None => "none".to_string(),
            };
            if found != expected.to_string() {
                return Err(InvariantViolation::ExpirationHeader {
                    key: target.key.clone(),
                    expected: expected.to_string(),
                    found,
                }
                .into());
            }
            checked += 1;
        }
        Ok(checked)
    }

    fn check_markers(
        &self,
        bucket: &str,
        ledger: &DeleteMarkerLedger,
    ) -> Result<MarkerReport, HarnessError> {
        // one more pass must not add markers to already expired keys
        if let Some(admin) = self.admin {
            admin.process_bucket(bucket)?;
        }
        let entries = self.store.list_entries(bucket)?;
        let report = ledger.check(&entries);
        info!(bucket, keys = report.counts.len(), "Delete markers checked");
        Ok(report.into_result()?)
    }
}

fn stage_report(bucket: &str, target: &TargetObject, verified: Verified) -> StageReport {
    StageReport {
        bucket: bucket.to_string(),
        key: target.key.clone(),
        version_id: target.version_id.clone(),
        rule_id: verified.rule_id,
        expected: verified.expected,
        matched: verified.matched,
        attempts: verified.attempts,
        elapsed: verified.elapsed,
        lag: verified.lag,
    }
}
