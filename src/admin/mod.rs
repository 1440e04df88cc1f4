//! Administrative command interface
//!
//! Wraps `radosgw-admin` behind a [`CommandRunner`] so the same calls work
//! on the local node, over SSH, or against a mock in tests. Every command
//! that has structured output is parsed into a typed struct; a command
//! that fails or prints something unparseable is a collaborator error.

pub mod ratelimit;
pub mod topology;

pub use ratelimit::{GlobalRateLimitGuard, RateLimit, RateLimitScope, RateLimitTarget};
pub use topology::{Period, SyncStatus, ZoneGroup};

use crate::error::CollaboratorError;
use crate::verify::{EntryKind, ListingEntry};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Command;
use tracing::debug;

/// Lifecycle status reported for buckets never processed
pub const LC_STATUS_UNINITIAL: &str = "UNINITIAL";

/// Runs an external program and returns its stdout
#[cfg_attr(test, mockall::automock)]
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, CollaboratorError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for Box<R> {
    fn run(&self, program: &str, args: &[String]) -> Result<String, CollaboratorError> {
        (**self).run(program, args)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, program: &str, args: &[String]) -> Result<String, CollaboratorError> {
        (**self).run(program, args)
    }
}

fn describe(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

fn output_to_string(
    command: String,
    output: std::io::Result<std::process::Output>,
) -> Result<String, CollaboratorError> {
    let output = output.map_err(|source| CollaboratorError::Spawn {
        command: command.clone(),
        source,
    })?;
    if !output.status.success() {
        return Err(CollaboratorError::CommandFailed {
            command,
            status: output.status.code().unwrap_or(-1),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs commands on this host
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRunner;

impl CommandRunner for LocalRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, CollaboratorError> {
        let command = describe(program, args);
        debug!(command = %command, "Running local command");
        output_to_string(command, Command::new(program).args(args).output())
    }
}

/// Runs commands on a remote node with `ssh`
#[derive(Debug, Clone)]
pub struct SshRunner {
    host: String,
}

impl SshRunner {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Single remote command line with every argument shell-quoted
    pub fn remote_command(program: &str, args: &[String]) -> String {
        std::iter::once(program.to_string())
            .chain(args.iter().map(|arg| shell_quote(arg)))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl CommandRunner for SshRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String, CollaboratorError> {
        let remote = Self::remote_command(program, args);
        let command = format!("ssh {} {}", self.host, remote);
        debug!(command = %command, "Running remote command");
        output_to_string(
            command,
            Command::new("ssh")
                .arg("-o")
                .arg("BatchMode=yes")
                .arg(&self.host)
                .arg(&remote)
                .output(),
        )
    }
}

fn shell_quote(arg: &str) -> String {
    let plain = arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_=./:,@".contains(c));
    if plain && !arg.is_empty() {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub(crate) fn parse_json<T: DeserializeOwned>(
    command: &str,
    output: &str,
) -> Result<T, CollaboratorError> {
    serde_json::from_str(output).map_err(|e| CollaboratorError::Output {
        command: command.to_string(),
        reason: e.to_string(),
    })
}

// ============================================================================
// radosgw-admin
// ============================================================================

/// Entry of `radosgw-admin lc list`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LcEntry {
    pub bucket: String,
    #[serde(default)]
    pub started: String,
    pub status: String,
}

impl LcEntry {
    /// `bucket` is either the plain name or `:<name>:<marker>`
    pub fn is_for(&self, bucket: &str) -> bool {
        self.bucket == bucket || self.bucket.contains(&format!(":{}:", bucket))
    }
}

/// Entry of `radosgw-admin bucket list --bucket`
#[derive(Debug, Clone, Deserialize)]
struct BucketIndexEntry {
    name: String,
    #[serde(default)]
    instance: String,
    #[serde(default)]
    tag: String,
}

impl From<BucketIndexEntry> for ListingEntry {
    fn from(entry: BucketIndexEntry) -> Self {
        let kind = if entry.tag == "delete-marker" {
            EntryKind::DeleteMarker
        } else {
            EntryKind::Version
        };
        ListingEntry {
            key: entry.name,
            version_id: (!entry.instance.is_empty()).then_some(entry.instance),
            kind,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct BucketStats {
    #[serde(default)]
    usage: HashMap<String, UsageStats>,
}

#[derive(Debug, Clone, Deserialize)]
struct UsageStats {
    #[serde(default)]
    num_objects: u64,
}

/// Output of `user create` / `user info` / `caps add`
#[derive(Debug, Clone, Deserialize)]
pub struct UserInfo {
    pub user_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub keys: Vec<UserKey>,
    #[serde(default)]
    pub caps: Vec<UserCap>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserKey {
    pub user: String,
    pub access_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserCap {
    #[serde(rename = "type")]
    pub kind: String,
    pub perm: String,
}

/// Lifecycle operations the scenario runner needs from the cluster
pub trait LifecycleAdmin {
    /// Run lifecycle processing for one bucket now
    fn process_bucket(&self, bucket: &str) -> Result<(), CollaboratorError>;

    /// Lifecycle status of a bucket, `None` if it has no lifecycle entry
    fn bucket_status(&self, bucket: &str) -> Result<Option<String>, CollaboratorError>;
}

/// `radosgw-admin` client
pub struct RadosgwAdmin<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> RadosgwAdmin<R> {
    pub const PROGRAM: &'static str = "radosgw-admin";

    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Run `radosgw-admin <args>` and return stdout
    #[tracing::instrument(name = "rgw.admin", skip(self), err)]
    pub fn exec(&self, args: &[&str]) -> Result<String, CollaboratorError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run(Self::PROGRAM, &args)
    }

    /// Run `radosgw-admin <args>` and parse stdout as JSON
    pub fn exec_json<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T, CollaboratorError> {
        let output = self.exec(args)?;
        parse_json(&format!("{} {}", Self::PROGRAM, args.join(" ")), &output)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn lc_list(&self) -> Result<Vec<LcEntry>, CollaboratorError> {
        self.exec_json(&["lc", "list"])
    }

    pub fn lc_process(&self, bucket: Option<&str>) -> Result<(), CollaboratorError> {
        match bucket {
            Some(bucket) => self.exec(&["lc", "process", "--bucket", bucket])?,
            None => self.exec(&["lc", "process"])?,
        };
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buckets
    // ------------------------------------------------------------------

    /// Bucket index entries, delete markers included
    pub fn bucket_list(&self, bucket: &str) -> Result<Vec<ListingEntry>, CollaboratorError> {
        let bucket_arg = format!("--bucket={}", bucket);
        let entries: Vec<BucketIndexEntry> = self.exec_json(&["bucket", "list", &bucket_arg])?;
        Ok(entries.into_iter().map(ListingEntry::from).collect())
    }

    /// `usage.rgw.main.num_objects` from `bucket stats`
    pub fn bucket_object_count(&self, bucket: &str) -> Result<u64, CollaboratorError> {
        let bucket_arg = format!("--bucket={}", bucket);
        let stats: BucketStats = self.exec_json(&["bucket", "stats", &bucket_arg])?;
        Ok(stats
            .usage
            .get("rgw.main")
            .map(|usage| usage.num_objects)
            .unwrap_or(0))
    }

    // ------------------------------------------------------------------
    // Users
    // ------------------------------------------------------------------

    pub fn user_create(&self, uid: &str, display_name: &str) -> Result<UserInfo, CollaboratorError> {
        let uid_arg = format!("--uid={}", uid);
        let name_arg = format!("--display-name={}", display_name);
        self.exec_json(&["user", "create", &uid_arg, &name_arg])
    }

    pub fn user_rm(&self, uid: &str) -> Result<(), CollaboratorError> {
        let uid_arg = format!("--uid={}", uid);
        self.exec(&["user", "rm", &uid_arg, "--purge-data"])?;
        Ok(())
    }

    /// Grant caps such as `users=*;buckets=*;ratelimit=*`
    pub fn caps_add(&self, uid: &str, caps: &str) -> Result<UserInfo, CollaboratorError> {
        let uid_arg = format!("--uid={}", uid);
        let caps_arg = format!("--caps={}", caps);
        self.exec_json(&["caps", "add", &uid_arg, &caps_arg])
    }
}

impl<R: CommandRunner> LifecycleAdmin for RadosgwAdmin<R> {
    fn process_bucket(&self, bucket: &str) -> Result<(), CollaboratorError> {
        self.lc_process(Some(bucket))
    }

    fn bucket_status(&self, bucket: &str) -> Result<Option<String>, CollaboratorError> {
        Ok(self
            .lc_list()?
            .into_iter()
            .find(|entry| entry.is_for(bucket))
            .map(|entry| entry.status))
    }
}
