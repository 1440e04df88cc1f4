//! Rate-limit administration
//!
//! Limits are set per user or per bucket, or globally for a whole scope.
//! The byte limits are passed to `radosgw-admin` as bytes, while the
//! gateway enforces them in KiB, so expected throttling is computed with
//! [`RateLimit::read_kib`] / [`RateLimit::write_kib`].

use super::{CommandRunner, RadosgwAdmin};
use crate::error::CollaboratorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{info, warn};

/// Which entity kind a limit applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitScope {
    Bucket,
    User,
}

impl RateLimitScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Bucket => "bucket",
            RateLimitScope::User => "user",
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity a limit is attached to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitTarget {
    /// Every entity in the scope
    Global,
    User(String),
    Bucket(String),
}

impl RateLimitTarget {
    pub fn scope(&self, global_scope: RateLimitScope) -> RateLimitScope {
        match self {
            RateLimitTarget::Global => global_scope,
            RateLimitTarget::User(_) => RateLimitScope::User,
            RateLimitTarget::Bucket(_) => RateLimitScope::Bucket,
        }
    }

    fn entity_arg(&self) -> Option<String> {
        match self {
            RateLimitTarget::Global => None,
            RateLimitTarget::User(uid) => Some(format!("--uid={}", uid)),
            RateLimitTarget::Bucket(bucket) => Some(format!("--bucket={}", bucket)),
        }
    }
}

/// Per-minute operation and byte limits; zero means unlimited
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(default)]
    pub max_read_ops: u64,
    #[serde(default)]
    pub max_read_bytes: u64,
    #[serde(default)]
    pub max_write_ops: u64,
    #[serde(default)]
    pub max_write_bytes: u64,
}

impl RateLimit {
    pub fn read_kib(&self) -> u64 {
        bytes_to_kib(self.max_read_bytes)
    }

    pub fn write_kib(&self) -> u64 {
        bytes_to_kib(self.max_write_bytes)
    }

    fn args(&self) -> Vec<String> {
        vec![
            format!("--max-read-ops={}", self.max_read_ops),
            format!("--max-read-bytes={}", self.max_read_bytes),
            format!("--max-write-ops={}", self.max_write_ops),
            format!("--max-write-bytes={}", self.max_write_bytes),
        ]
    }
}

/// Bytes rounded up to whole KiB
pub fn bytes_to_kib(bytes: u64) -> u64 {
    bytes.div_ceil(1024)
}

/// Limit as reported by `ratelimit get`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RateLimitInfo {
    #[serde(flatten)]
    pub limit: RateLimit,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitGetOutput {
    bucket_ratelimit: Option<RateLimitInfo>,
    user_ratelimit: Option<RateLimitInfo>,
}

/// Limit actually enforced for a request: an enabled per-user limit takes
/// precedence over the global one.
pub fn effective_limit(
    global: Option<RateLimitInfo>,
    user: Option<RateLimitInfo>,
) -> Option<RateLimit> {
    match (user, global) {
        (Some(user), _) if user.enabled => Some(user.limit),
        (_, Some(global)) if global.enabled => Some(global.limit),
        _ => None,
    }
}

impl<R: CommandRunner> RadosgwAdmin<R> {
    fn ratelimit_exec(
        &self,
        verb: &str,
        scope: RateLimitScope,
        target: &RateLimitTarget,
        extra: Vec<String>,
    ) -> Result<String, CollaboratorError> {
        let mut args: Vec<String> = Vec::new();
        if matches!(target, RateLimitTarget::Global) {
            args.push("global".into());
        }
        args.push("ratelimit".into());
        args.push(verb.into());
        args.push(format!("--ratelimit-scope={}", target.scope(scope)));
        args.extend(target.entity_arg());
        args.extend(extra);

        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.exec(&args)
    }

    pub fn ratelimit_set(
        &self,
        scope: RateLimitScope,
        target: &RateLimitTarget,
        limit: &RateLimit,
    ) -> Result<(), CollaboratorError> {
        self.ratelimit_exec("set", scope, target, limit.args())?;
        Ok(())
    }

    pub fn ratelimit_enable(
        &self,
        scope: RateLimitScope,
        target: &RateLimitTarget,
    ) -> Result<(), CollaboratorError> {
        self.ratelimit_exec("enable", scope, target, Vec::new())?;
        Ok(())
    }

    pub fn ratelimit_disable(
        &self,
        scope: RateLimitScope,
        target: &RateLimitTarget,
    ) -> Result<(), CollaboratorError> {
        self.ratelimit_exec("disable", scope, target, Vec::new())?;
        Ok(())
    }

    /// Current limit for the target, `None` when none is configured
    pub fn ratelimit_get(
        &self,
        scope: RateLimitScope,
        target: &RateLimitTarget,
    ) -> Result<Option<RateLimitInfo>, CollaboratorError> {
        let output = self.ratelimit_exec("get", scope, target, Vec::new())?;
        let parsed: RateLimitGetOutput = super::parse_json("radosgw-admin ratelimit get", &output)?;
        Ok(match target.scope(scope) {
            RateLimitScope::Bucket => parsed.bucket_ratelimit,
            RateLimitScope::User => parsed.user_ratelimit,
        })
    }
}

/// Global limit that stays enabled until the guard is dropped
pub struct GlobalRateLimitGuard<'a, R: CommandRunner> {
    admin: &'a RadosgwAdmin<R>,
    scope: RateLimitScope,
}

impl<'a, R: CommandRunner> GlobalRateLimitGuard<'a, R> {
    pub fn enable(
        admin: &'a RadosgwAdmin<R>,
        scope: RateLimitScope,
        limit: &RateLimit,
    ) -> Result<Self, CollaboratorError> {
        admin.ratelimit_set(scope, &RateLimitTarget::Global, limit)?;
        let guard = Self { admin, scope };
        admin.ratelimit_enable(scope, &RateLimitTarget::Global)?;
        info!(scope = %scope, ?limit, "Global rate limit enabled");
        Ok(guard)
    }
}

impl<R: CommandRunner> Drop for GlobalRateLimitGuard<'_, R> {
    fn drop(&mut self) {
        match self.admin.ratelimit_disable(self.scope, &RateLimitTarget::Global) {
            Ok(()) => info!(scope = %self.scope, "Global rate limit disabled"),
            Err(e) => warn!(scope = %self.scope, error = %e, "Failed to disable global rate limit"),
        }
    }
}
