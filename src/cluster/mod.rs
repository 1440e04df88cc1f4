//! Cluster configuration control
//!
//! [`Cluster`] wraps the `ceph` CLI calls the harness needs: reading and
//! writing gateway options, restarting the gateway and checking that it
//! came back. [`ConfigGuard`] applies a set of options for the lifetime of
//! a scenario and puts the previous values back afterwards, even when the
//! scenario fails.

use crate::admin::{parse_json, CommandRunner};
use crate::config::{ClusterConfig, RestartMethod};
use crate::error::{CollaboratorError, HarnessError};
use crate::verify::{BoundedPoller, Clock, PollOutcome};
use lazy_static::lazy_static;
use parking_lot::{Mutex, MutexGuard};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};

const SYSTEMD_TARGET: &str = "ceph-radosgw.target";

lazy_static! {
    /// Only one guard may reconfigure the cluster at a time.
    static ref CLUSTER_LOCK: Mutex<()> = Mutex::new(());
}

/// One explicitly set option from `ceph config dump`
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigEntry {
    pub section: String,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Deserialize)]
struct DaemonStatus {
    #[serde(default)]
    daemon_name: String,
    #[serde(default)]
    service_name: String,
    #[serde(default)]
    status_desc: String,
    #[serde(default)]
    started: Option<String>,
}

/// What the service manager reports for the gateway
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GatewayState {
    pub running: bool,
    /// One entry per daemon instance; changes when a daemon restarts
    pub instances: BTreeSet<String>,
}

impl GatewayState {
    /// Running, and no daemon instance is left over from `before`
    pub fn restarted_since(&self, before: &GatewayState) -> bool {
        self.running
            && !self.instances.is_empty()
            && self.instances.is_disjoint(&before.instances)
    }
}

/// `ceph` CLI access for one gateway service
pub struct Cluster<R: CommandRunner> {
    runner: R,
    section: String,
    service: String,
    restart: RestartMethod,
}

impl<R: CommandRunner> Cluster<R> {
    pub fn new(runner: R, config: &ClusterConfig) -> Self {
        Self {
            runner,
            section: config.config_section.clone(),
            service: config.rgw_service.clone(),
            restart: config.restart,
        }
    }

    pub fn section(&self) -> &str {
        &self.section
    }

    fn ceph(&self, args: &[&str]) -> Result<String, CollaboratorError> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.runner.run("ceph", &args)
    }

    /// Current value of an option for the configured section
    pub fn config_get(&self, key: &str) -> Result<String, CollaboratorError> {
        Ok(self.ceph(&["config", "get", &self.section, key])?.trim().to_string())
    }

    pub fn config_set(&self, key: &str, value: &str) -> Result<(), CollaboratorError> {
        info!(section = %self.section, key, value, "Setting cluster option");
        self.ceph(&["config", "set", &self.section, key, value])?;
        Ok(())
    }

    pub fn config_rm(&self, key: &str) -> Result<(), CollaboratorError> {
        info!(section = %self.section, key, "Removing cluster option");
        self.ceph(&["config", "rm", &self.section, key])?;
        Ok(())
    }

    /// Options explicitly set in the configuration database
    pub fn config_dump(&self) -> Result<Vec<ConfigEntry>, CollaboratorError> {
        let output = self.ceph(&["config", "dump", "--format", "json"])?;
        parse_json("ceph config dump", &output)
    }

    /// Explicit value for `key` in this section, `None` when unset
    pub fn explicit_value(&self, entries: &[ConfigEntry], key: &str) -> Option<String> {
        entries
            .iter()
            .find(|e| e.section == self.section && e.name == key)
            .map(|e| e.value.clone())
    }

    /// Restart the gateway; `false` when the restart command failed
    pub fn restart(&self) -> bool {
        let result = match self.restart {
            RestartMethod::Orchestrator => self.ceph(&["orch", "restart", &self.service]),
            RestartMethod::Systemd => self
                .runner
                .run("systemctl", &["restart".to_string(), SYSTEMD_TARGET.to_string()]),
        };
        match result {
            Ok(_) => {
                info!(service = %self.service, "Gateway restart requested");
                true
            }
            Err(e) => {
                warn!(service = %self.service, error = %e, "Gateway restart failed");
                false
            }
        }
    }

    /// Whether every gateway daemon reports running
    pub fn is_running(&self) -> Result<bool, CollaboratorError> {
        Ok(self.gateway_state()?.running)
    }

    /// Daemon status, refreshed rather than read from the orchestrator cache
    pub fn gateway_state(&self) -> Result<GatewayState, CollaboratorError> {
        match self.restart {
            RestartMethod::Orchestrator => {
                let output = self.ceph(&[
                    "orch",
                    "ps",
                    "--daemon_type",
                    "rgw",
                    "--refresh",
                    "--format",
                    "json",
                ])?;
                let daemons: Vec<DaemonStatus> = parse_json("ceph orch ps", &output)?;
                let ours: Vec<&DaemonStatus> = daemons
                    .iter()
                    .filter(|d| d.service_name.is_empty() || d.service_name == self.service)
                    .collect();
                Ok(GatewayState {
                    running: !ours.is_empty() && ours.iter().all(|d| d.status_desc == "running"),
                    instances: ours
                        .iter()
                        .filter_map(|d| {
                            d.started
                                .as_ref()
                                .map(|started| format!("{}@{}", d.daemon_name, started))
                        })
                        .collect(),
                })
            }
            RestartMethod::Systemd => {
                let args = ["is-active".to_string(), SYSTEMD_TARGET.to_string()];
                let running = match self.runner.run("systemctl", &args) {
                    Ok(output) => output.trim() == "active",
                    Err(CollaboratorError::CommandFailed { .. }) => false,
                    Err(e) => return Err(e),
                };
                if !running {
                    return Ok(GatewayState::default());
                }
                let args = [
                    "show".to_string(),
                    "--property=ActiveEnterTimestampMonotonic".to_string(),
                    "--value".to_string(),
                    SYSTEMD_TARGET.to_string(),
                ];
                let entered = self.runner.run("systemctl", &args)?;
                Ok(GatewayState {
                    running,
                    instances: Some(entered.trim().to_string())
                        .filter(|e| !e.is_empty() && e != "0")
                        .into_iter()
                        .collect(),
                })
            }
        }
    }

    /// Number of crashes not yet acknowledged
    pub fn new_crashes(&self) -> Result<usize, CollaboratorError> {
        let output = self.ceph(&["crash", "ls-new", "--format", "json"])?;
        let crashes: Vec<serde_json::Value> = parse_json("ceph crash ls-new", &output)?;
        Ok(crashes.len())
    }

    /// Restart and wait until restarted daemons report running.
    ///
    /// The restart command only schedules the restart, so daemons still
    /// running from before it do not count.
    pub fn restart_and_wait<C: Clock>(&self, readiness: &BoundedPoller<C>) -> Result<(), HarnessError> {
        let before = self.gateway_state()?;
        if !self.restart() {
            return Err(CollaboratorError::RestartFailed(self.service.clone()).into());
        }
        let now = readiness.clock().now();
        let restarted = |state: &GatewayState| state.restarted_since(&before);
        match readiness.poll_until(now, || self.gateway_state(), restarted)? {
            PollOutcome::Matched(polled) => {
                info!(service = %self.service, elapsed = ?polled.elapsed, "Gateway is running");
                Ok(())
            }
            PollOutcome::TimedOut(timeout) => Err(CollaboratorError::RestartFailed(format!(
                "{} not running after {:?}",
                self.service, timeout.elapsed
            ))
            .into()),
        }
    }
}

#[derive(Debug, Clone)]
struct SavedOption {
    key: String,
    prior: Option<String>,
}

/// Applies gateway options for a scenario and restores them when released
/// or dropped.
pub struct ConfigGuard<'a, R: CommandRunner, C: Clock> {
    cluster: &'a Cluster<R>,
    readiness: &'a BoundedPoller<C>,
    saved: Vec<SavedOption>,
    released: bool,
    _lock: MutexGuard<'static, ()>,
}

impl<'a, R: CommandRunner, C: Clock> ConfigGuard<'a, R, C> {
    /// Save current values, set `overrides`, restart and wait for readiness
    pub fn acquire(
        cluster: &'a Cluster<R>,
        readiness: &'a BoundedPoller<C>,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, HarnessError> {
        let lock = CLUSTER_LOCK.lock();
        let current = cluster.config_dump()?;

        let mut guard = Self {
            cluster,
            readiness,
            saved: Vec::with_capacity(overrides.len()),
            released: false,
            _lock: lock,
        };

        for (key, value) in overrides {
            guard.saved.push(SavedOption {
                key: key.clone(),
                prior: cluster.explicit_value(&current, key),
            });
            cluster.config_set(key, value)?;
        }

        cluster.restart_and_wait(readiness)?;
        Ok(guard)
    }

    pub fn overridden_keys(&self) -> impl Iterator<Item = &str> {
        self.saved.iter().map(|s| s.key.as_str())
    }

    /// Restore prior values now and report the outcome
    pub fn release(mut self) -> Result<(), HarnessError> {
        self.released = true;
        self.restore()
    }

    /// Restore every option and restart even when some restores fail; the
    /// first failure is returned
    fn restore(&self) -> Result<(), HarnessError> {
        let mut first_error: Option<HarnessError> = None;
        for saved in self.saved.iter().rev() {
            let result = match &saved.prior {
                Some(value) => self.cluster.config_set(&saved.key, value),
                None => self.cluster.config_rm(&saved.key),
            };
            if let Err(e) = result {
                warn!(key = %saved.key, error = %e, "Failed to restore cluster option");
                first_error.get_or_insert(e.into());
            }
        }

        let restarted = self.cluster.restart_and_wait(self.readiness);
        match first_error {
            Some(e) => {
                if let Err(restart) = restarted {
                    warn!(error = %restart, "Gateway restart after restore failed");
                }
                Err(e)
            }
            None => restarted,
        }
    }
}

impl<R: CommandRunner, C: Clock> Drop for ConfigGuard<'_, R, C> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.restore() {
            warn!(error = %e, "Failed to restore cluster configuration");
        }
    }
}
