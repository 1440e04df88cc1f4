//! Lifecycle rule model
//!
//! A configured S3 rule may carry several actions (an expiration, several
//! transitions, noncurrent-version actions). The harness splits each one
//! into atomic [`Rule`]s with a single action and threshold so the
//! [`translator`] can order them.

pub mod expiration_header;
pub mod translator;

pub use expiration_header::{expected_expiry_date, ExpirationHint};
pub use translator::{Expectation, Prediction, Translator};

use crate::config::{ConfigError, LifecycleRuleConf};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Storage class reported when an object has never transitioned
pub const STANDARD_STORAGE_CLASS: &str = "STANDARD";

/// Real-time length of one lifecycle "day".
///
/// RGW's `rgw_lc_debug_interval` compresses a day into N seconds. The value
/// is always supplied by the caller so waits follow the cluster setting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationFactor {
    day: Duration,
}

impl AccelerationFactor {
    /// One lifecycle day lasts `secs` seconds
    pub fn seconds_per_day(secs: u64) -> Result<Self, ConfigError> {
        Self::from_day_length(Duration::from_secs(secs))
    }

    /// One lifecycle day lasts `day`
    pub fn from_day_length(day: Duration) -> Result<Self, ConfigError> {
        if day.is_zero() || day > Duration::from_secs(crate::config::MAX_DEBUG_INTERVAL_SECS) {
            return Err(ConfigError::ValidationError(format!(
                "lifecycle day length {:?} is out of range",
                day
            )));
        }
        Ok(Self { day })
    }

    /// No acceleration: a lifecycle day is a real day
    pub fn real_time() -> Self {
        Self {
            day: Duration::from_secs(crate::config::MAX_DEBUG_INTERVAL_SECS),
        }
    }

    pub fn day_length(&self) -> Duration {
        self.day
    }

    /// Real time spanned by `days` lifecycle days
    pub fn scale(&self, days: u32) -> chrono::Duration {
        let millis = self.day.as_millis().saturating_mul(u128::from(days));
        chrono::Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX / 1_000))
    }
}

/// When a rule fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Threshold {
    /// Lifecycle days after the object's base time
    Days(u32),
    /// Midnight UTC of a calendar date, never scaled
    Date(NaiveDate),
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Threshold::Days(days) => write!(f, "{} day(s)", days),
            Threshold::Date(date) => write!(f, "{}", date),
        }
    }
}

/// What a rule does once it fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    Expire,
    Transition { storage_class: String },
    ExpireNoncurrent,
    TransitionNoncurrent { storage_class: String },
}

impl Action {
    /// Expirations end an object's schedule
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Expire | Action::ExpireNoncurrent)
    }

    /// Noncurrent actions only apply to versions that have been superseded
    pub fn targets_noncurrent(&self) -> bool {
        matches!(
            self,
            Action::ExpireNoncurrent | Action::TransitionNoncurrent { .. }
        )
    }
}

/// Prefix and tag predicate; all present parts must match
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleFilter {
    pub prefix: Option<String>,
    pub tags: BTreeMap<String, String>,
}

impl RuleFilter {
    pub fn matches(&self, object: &TargetObject) -> bool {
        let prefix_ok = self
            .prefix
            .as_deref()
            .map_or(true, |prefix| object.key.starts_with(prefix));
        let tags_ok = self
            .tags
            .iter()
            .all(|(key, value)| object.tags.get(key) == Some(value));
        prefix_ok && tags_ok
    }
}

/// A single-action lifecycle rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub filter: RuleFilter,
    pub action: Action,
    pub threshold: Threshold,
    pub enabled: bool,
}

impl Rule {
    /// Split a configured rule into one [`Rule`] per action
    pub fn from_conf(conf: &LifecycleRuleConf) -> Result<Vec<Rule>, ConfigError> {
        conf.validate()?;

        let filter = RuleFilter {
            prefix: conf.filter.effective_prefix().map(str::to_string),
            tags: conf.filter.required_tags(),
        };
        let enabled = conf.is_enabled();
        let make = |action: Action, threshold: Threshold| Rule {
            id: conf.id.clone(),
            filter: filter.clone(),
            action,
            threshold,
            enabled,
        };

        let mut rules = Vec::new();
        if let Some(ref expiration) = conf.expiration {
            rules.push(make(
                Action::Expire,
                threshold_of(expiration.days, expiration.date)?,
            ));
        }
        for transition in &conf.transitions {
            rules.push(make(
                Action::Transition {
                    storage_class: transition.storage_class.clone(),
                },
                threshold_of(transition.days, transition.date)?,
            ));
        }
        if let Some(ref nc) = conf.noncurrent_version_expiration {
            rules.push(make(
                Action::ExpireNoncurrent,
                Threshold::Days(nc.noncurrent_days),
            ));
        }
        for nc in &conf.noncurrent_version_transitions {
            rules.push(make(
                Action::TransitionNoncurrent {
                    storage_class: nc.storage_class.clone(),
                },
                Threshold::Days(nc.noncurrent_days),
            ));
        }
        Ok(rules)
    }

    /// Flatten a whole lifecycle configuration
    pub fn from_confs(confs: &[LifecycleRuleConf]) -> Result<Vec<Rule>, ConfigError> {
        let mut rules = Vec::new();
        for conf in confs {
            rules.extend(Rule::from_conf(conf)?);
        }
        Ok(rules)
    }

    /// Whether this rule can act on the object at all
    pub fn applies_to(&self, object: &TargetObject) -> bool {
        self.enabled
            && self.action.targets_noncurrent() == object.is_noncurrent()
            && self.filter.matches(object)
    }
}

fn threshold_of(days: Option<u32>, date: Option<NaiveDate>) -> Result<Threshold, ConfigError> {
    match (days, date) {
        (Some(days), None) => Ok(Threshold::Days(days)),
        (None, Some(date)) => Ok(Threshold::Date(date)),
        _ => Err(ConfigError::ValidationError(
            "exactly one of Days or Date is required".into(),
        )),
    }
}

/// An object (or one version of it) whose fate the harness predicts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetObject {
    pub key: String,
    pub version_id: Option<String>,
    pub tags: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    /// Whether the bucket keeps versions (expiration leaves a delete marker)
    pub versioned: bool,
    /// When a newer version superseded this one
    pub noncurrent_since: Option<DateTime<Utc>>,
}

impl TargetObject {
    pub fn new(key: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            version_id: None,
            tags: BTreeMap::new(),
            created_at,
            versioned: false,
            noncurrent_since: None,
        }
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn versioned(mut self, version_id: Option<String>) -> Self {
        self.versioned = true;
        self.version_id = version_id;
        self
    }

    pub fn superseded_at(mut self, at: DateTime<Utc>) -> Self {
        self.noncurrent_since = Some(at);
        self
    }

    pub fn is_noncurrent(&self) -> bool {
        self.noncurrent_since.is_some()
    }

    /// Time from which an action's threshold is counted
    pub fn base_time(&self, action: &Action) -> DateTime<Utc> {
        if action.targets_noncurrent() {
            self.noncurrent_since.unwrap_or(self.created_at)
        } else {
            self.created_at
        }
    }
}
