//! Scenario configuration
//!
//! A scenario is a YAML document describing the lifecycle rules to apply,
//! the objects to create, how long to wait for the cluster, and how to
//! reach the cluster. Strings may reference environment variables with
//! `${VAR}` or `${VAR:-default}`.
//!
//! # Example
//!
//! ```yaml
//! scenario:
//!   name: lc_prefix_expiration
//!   rgw_lc_debug_interval: 10
//!   objects_count: 4
//!   versioning: enabled
//! lifecycle:
//!   - ID: rule1
//!     Status: Enabled
//!     Filter:
//!       Prefix: key1
//!     Expiration:
//!       Days: 1
//! polling:
//!   interval_secs: 2
//!   max_wait_secs: 120
//! s3:
//!   endpoint: "${RGW_ENDPOINT:-http://127.0.0.1:80}"
//!   access_key: "${RGW_ACCESS_KEY}"
//!   secret_key: "${RGW_SECRET_KEY}"
//! ```

use chrono::NaiveDate;
use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

/// Longest lifecycle "day" accepted: a real day.
pub const MAX_DEBUG_INTERVAL_SECS: u64 = 86_400;

/// Largest `Days`/`NoncurrentDays` accepted in a rule.
pub const MAX_LIFECYCLE_DAYS: u32 = 100_000;

// ============================================================================
// Environment Variable Expansion
// ============================================================================

lazy_static! {
    static ref ENV_VAR_RE: regex_lite::Regex =
        regex_lite::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]+))?\}")
            .expect("env var pattern is valid");
}

/// Expand environment variables in a string.
///
/// Supports two syntaxes:
/// - `${VAR_NAME}` - Simple expansion, keeps placeholder if var not found
/// - `${VAR_NAME:-default}` - Expansion with default value
///
/// # Examples
///
/// ```ignore
/// std::env::set_var("MY_VAR", "value");
/// let result = expand_env_vars("prefix-${MY_VAR}-suffix");
/// assert_eq!(result, "prefix-value-suffix");
///
/// let result = expand_env_vars("${MISSING:-default}");
/// assert_eq!(result, "default");
/// ```
pub(crate) fn expand_env_vars(s: &str) -> String {
    let mut last_match = 0;
    let mut result = String::with_capacity(s.len());

    for cap in ENV_VAR_RE.captures_iter(s) {
        let Some(full_match) = cap.get(0) else {
            continue;
        };
        let var_name = &cap[1];

        result.push_str(&s[last_match..full_match.start()]);

        let value = match std::env::var(var_name) {
            Ok(val) => val,
            Err(_) => match cap.get(2) {
                Some(default) => default.as_str().to_string(),
                // No env var and no default. Keep the original placeholder.
                None => full_match.as_str().to_string(),
            },
        };
        result.push_str(&value);

        last_match = full_match.end();
    }

    result.push_str(&s[last_match..]);
    result
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub scenario: ScenarioConfig,
    pub lifecycle: Vec<LifecycleRuleConf>,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub s3: Option<S3Config>,
}

impl Config {
    /// Load configuration from a file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        ConfigLoader::load(path)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let scenario = &self.scenario;
        if scenario.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Scenario name cannot be empty".into(),
            ));
        }

        // The acceleration factor must always be explicit.
        if scenario.rgw_lc_debug_interval == 0
            || scenario.rgw_lc_debug_interval > MAX_DEBUG_INTERVAL_SECS
        {
            return Err(ConfigError::ValidationError(format!(
                "rgw_lc_debug_interval {} must be between 1 and {}",
                scenario.rgw_lc_debug_interval, MAX_DEBUG_INTERVAL_SECS
            )));
        }

        if scenario.objects_count == 0 {
            return Err(ConfigError::ValidationError(
                "objects_count must be at least 1".into(),
            ));
        }

        if scenario.buckets_count == 0 {
            return Err(ConfigError::ValidationError(
                "buckets_count must be at least 1".into(),
            ));
        }

        if scenario.delete_cycles > 0
            && (scenario.versioning != VersioningMode::Enabled || !scenario.delete_marker_check)
        {
            return Err(ConfigError::ValidationError(
                "delete_cycles needs versioning: enabled and delete_marker_check: true".into(),
            ));
        }

        if !scenario.rgw_enable_lc_threads && !scenario.manual_lc_process {
            return Err(ConfigError::ValidationError(
                "rgw_enable_lc_threads: false needs manual_lc_process: true".into(),
            ));
        }

        if self.lifecycle.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one lifecycle rule must be configured".into(),
            ));
        }

        for rule in &self.lifecycle {
            rule.validate()?;
        }

        if self.polling.interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "polling.interval_secs must be greater than zero".into(),
            ));
        }

        if self.polling.max_wait_secs < self.polling.interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "polling.max_wait_secs {} is shorter than interval_secs {}",
                self.polling.max_wait_secs, self.polling.interval_secs
            )));
        }

        if self.cluster.readiness_timeout_secs < self.polling.interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "cluster.readiness_timeout_secs {} is shorter than polling.interval_secs {}",
                self.cluster.readiness_timeout_secs, self.polling.interval_secs
            )));
        }

        if self.cluster.rgw_service.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "cluster.rgw_service cannot be empty".into(),
            ));
        }

        if let Some(ref s3) = self.s3 {
            if !is_valid_http_url(&s3.endpoint) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid S3 endpoint '{}': must start with http:// or https://",
                    s3.endpoint
                )));
            }
        }

        Ok(())
    }

    /// Prefixes named by the lifecycle filters, in rule order.
    ///
    /// Object keys are generated from these so every rule has matching
    /// objects. Falls back to a prefix no rule matches.
    pub fn rule_prefixes(&self) -> Vec<String> {
        let prefixes: Vec<String> = self
            .lifecycle
            .iter()
            .filter_map(|rule| rule.filter.effective_prefix())
            .map(str::to_string)
            .collect();
        if prefixes.is_empty() {
            vec!["dummy1".to_string()]
        } else {
            prefixes
        }
    }

    /// Options to apply to the gateway for the run, the debug interval included
    pub fn cluster_overrides(&self) -> BTreeMap<String, String> {
        let mut overrides = self.cluster.overrides.clone();
        overrides.insert(
            "rgw_lc_debug_interval".to_string(),
            self.scenario.rgw_lc_debug_interval.to_string(),
        );
        if !self.scenario.rgw_enable_lc_threads {
            overrides.insert("rgw_enable_lc_threads".to_string(), "false".to_string());
        }
        overrides
    }
}

/// Validate that a URL starts with http:// or https://
fn is_valid_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn validation(msg: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(msg.into())
}

// ============================================================================
// Scenario
// ============================================================================

/// What the scenario creates and checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioConfig {
    pub name: String,

    /// Seconds of real time that count as one lifecycle day.
    pub rgw_lc_debug_interval: u64,

    #[serde(default = "default_objects_count")]
    pub objects_count: usize,

    /// Object body size in bytes
    #[serde(default = "default_object_size")]
    pub object_size: usize,

    #[serde(default)]
    pub versioning: VersioningMode,

    /// Uploads per key when versioning is enabled. 0 or 1 means a single upload.
    #[serde(default)]
    pub version_count: usize,

    #[serde(default)]
    pub object_tags: BTreeMap<String, String>,

    #[serde(default)]
    pub delete_marker_check: bool,

    #[serde(default)]
    pub check_expiration_header: bool,

    /// Trigger `radosgw-admin lc process` instead of waiting for the worker.
    #[serde(default)]
    pub manual_lc_process: bool,

    /// Value of `rgw_enable_lc_threads` during the run. With the threads
    /// off only manual processing may touch the buckets.
    #[serde(default = "default_true")]
    pub rgw_enable_lc_threads: bool,

    /// Buckets created and validated in the same run
    #[serde(default = "default_buckets_count")]
    pub buckets_count: usize,

    /// Put-then-delete rounds per key after the lifecycle checks, each
    /// followed by another lifecycle pass
    #[serde(default)]
    pub delete_cycles: usize,

    #[serde(default = "default_bucket_prefix")]
    pub bucket_prefix: String,
}

fn default_true() -> bool {
    true
}

fn default_buckets_count() -> usize {
    1
}

fn default_objects_count() -> usize {
    1
}

fn default_object_size() -> usize {
    1024
}

fn default_bucket_prefix() -> String {
    "lc-harness".to_string()
}

/// Bucket versioning state requested by a scenario
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersioningMode {
    #[default]
    Off,
    Enabled,
    Suspended,
}

impl VersioningMode {
    /// Whether expirations leave delete markers behind
    pub fn creates_delete_markers(&self) -> bool {
        matches!(self, VersioningMode::Enabled | VersioningMode::Suspended)
    }
}

// ============================================================================
// Lifecycle Rules (S3 document shape)
// ============================================================================

/// One rule as it appears in a `LifecycleConfiguration` document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LifecycleRuleConf {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(default)]
    pub status: RuleStatus,
    #[serde(default)]
    pub filter: RuleFilterConf,
    #[serde(default)]
    pub expiration: Option<ExpirationConf>,
    #[serde(default)]
    pub transitions: Vec<TransitionConf>,
    #[serde(default)]
    pub noncurrent_version_expiration: Option<NoncurrentExpirationConf>,
    #[serde(default)]
    pub noncurrent_version_transitions: Vec<NoncurrentTransitionConf>,
}

impl LifecycleRuleConf {
    /// Reject rules the gateway would reject or the harness cannot predict
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(validation("Lifecycle rule ID cannot be empty"));
        }

        if self.expiration.is_none()
            && self.transitions.is_empty()
            && self.noncurrent_version_expiration.is_none()
            && self.noncurrent_version_transitions.is_empty()
        {
            return Err(validation(format!(
                "Lifecycle rule '{}' has no action",
                self.id
            )));
        }

        if let Some(ref expiration) = self.expiration {
            check_threshold(&self.id, "Expiration", expiration.days, expiration.date)?;
        }

        for transition in &self.transitions {
            check_threshold(&self.id, "Transition", transition.days, transition.date)?;
            check_storage_class(&self.id, &transition.storage_class)?;
        }

        if let Some(ref nc) = self.noncurrent_version_expiration {
            check_noncurrent_days(&self.id, nc.noncurrent_days)?;
        }

        for nc in &self.noncurrent_version_transitions {
            check_noncurrent_days(&self.id, nc.noncurrent_days)?;
            check_storage_class(&self.id, &nc.storage_class)?;
        }

        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.status == RuleStatus::Enabled
    }
}

fn check_threshold(
    id: &str,
    action: &str,
    days: Option<u32>,
    date: Option<NaiveDate>,
) -> Result<(), ConfigError> {
    match (days, date) {
        (Some(0), None) => Err(validation(format!(
            "Lifecycle rule '{}': {} Days must be positive",
            id, action
        ))),
        (Some(days), None) if days > MAX_LIFECYCLE_DAYS => Err(validation(format!(
            "Lifecycle rule '{}': {} Days {} exceeds {}",
            id, action, days, MAX_LIFECYCLE_DAYS
        ))),
        (Some(_), None) | (None, Some(_)) => Ok(()),
        (Some(_), Some(_)) => Err(validation(format!(
            "Lifecycle rule '{}': {} sets both Days and Date",
            id, action
        ))),
        (None, None) => Err(validation(format!(
            "Lifecycle rule '{}': {} needs Days or Date",
            id, action
        ))),
    }
}

fn check_noncurrent_days(id: &str, days: u32) -> Result<(), ConfigError> {
    if days == 0 || days > MAX_LIFECYCLE_DAYS {
        return Err(validation(format!(
            "Lifecycle rule '{}': NoncurrentDays must be between 1 and {}",
            id, MAX_LIFECYCLE_DAYS
        )));
    }
    Ok(())
}

fn check_storage_class(id: &str, storage_class: &str) -> Result<(), ConfigError> {
    if storage_class.trim().is_empty() {
        return Err(validation(format!(
            "Lifecycle rule '{}': StorageClass cannot be empty",
            id
        )));
    }
    Ok(())
}

/// Rule status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleStatus {
    #[default]
    Enabled,
    Disabled,
}

/// `Filter` element: a prefix, a single tag, or an `And` of both
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RuleFilterConf {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub tag: Option<TagConf>,
    #[serde(default)]
    pub and: Option<AndFilterConf>,
}

impl RuleFilterConf {
    /// `Prefix`, or `And.Prefix` when the prefix is nested
    pub fn effective_prefix(&self) -> Option<&str> {
        self.prefix
            .as_deref()
            .or_else(|| self.and.as_ref().and_then(|and| and.prefix.as_deref()))
    }

    /// All tags the filter requires
    pub fn required_tags(&self) -> BTreeMap<String, String> {
        let mut tags = BTreeMap::new();
        if let Some(ref tag) = self.tag {
            tags.insert(tag.key.clone(), tag.value.clone());
        }
        if let Some(ref and) = self.and {
            for tag in &and.tags {
                tags.insert(tag.key.clone(), tag.value.clone());
            }
        }
        tags
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagConf {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AndFilterConf {
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub tags: Vec<TagConf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ExpirationConf {
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TransitionConf {
    #[serde(default)]
    pub days: Option<u32>,
    #[serde(default)]
    pub date: Option<NaiveDate>,
    pub storage_class: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NoncurrentExpirationConf {
    pub noncurrent_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct NoncurrentTransitionConf {
    pub noncurrent_days: u32,
    pub storage_class: String,
}

// ============================================================================
// Polling
// ============================================================================

/// Cadence and ceiling for eventually-consistent checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_max_wait_secs")]
    pub max_wait_secs: u64,
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_secs(self.max_wait_secs)
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            max_wait_secs: default_max_wait_secs(),
        }
    }
}

fn default_interval_secs() -> u64 {
    5
}

fn default_max_wait_secs() -> u64 {
    600
}

// ============================================================================
// Cluster
// ============================================================================

/// How to reach and reconfigure the gateway
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Run admin commands over SSH on this host instead of locally.
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default = "default_rgw_service")]
    pub rgw_service: String,
    #[serde(default)]
    pub restart: RestartMethod,
    /// `ceph config` section the overrides are written to.
    #[serde(default = "default_config_section")]
    pub config_section: String,
    /// Extra options applied for the duration of the scenario.
    #[serde(default)]
    pub overrides: BTreeMap<String, String>,
    #[serde(default = "default_readiness_timeout_secs")]
    pub readiness_timeout_secs: u64,
}

impl ClusterConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_secs(self.readiness_timeout_secs)
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            ssh_host: None,
            rgw_service: default_rgw_service(),
            restart: RestartMethod::default(),
            config_section: default_config_section(),
            overrides: BTreeMap::new(),
            readiness_timeout_secs: default_readiness_timeout_secs(),
        }
    }
}

fn default_rgw_service() -> String {
    "rgw.rgw".to_string()
}

fn default_config_section() -> String {
    "client.rgw".to_string()
}

fn default_readiness_timeout_secs() -> u64 {
    120
}

/// How the RGW daemons are restarted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartMethod {
    /// `ceph orch restart <service>`
    #[default]
    Orchestrator,
    /// `systemctl restart ceph-radosgw.target`
    Systemd,
}

// ============================================================================
// S3
// ============================================================================

/// S3 endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    #[serde(default = "default_region")]
    pub region: String,
    pub access_key: String,
    pub secret_key: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}
