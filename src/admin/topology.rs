//! Multisite topology administration
//!
//! Zone, zonegroup and realm management plus the period and sync-status
//! queries used to locate the peer zone of a multisite deployment.

use super::{parse_json, CommandRunner, RadosgwAdmin};
use crate::error::CollaboratorError;
use serde::Deserialize;

/// Output of `zonegroup get`
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub enabled_features: Vec<String>,
    #[serde(default)]
    pub zones: Vec<PeriodZone>,
}

impl ZoneGroup {
    pub fn has_feature(&self, feature: &str) -> bool {
        self.enabled_features.iter().any(|f| f == feature)
    }
}

/// Output of `period update --commit` / `period get`
#[derive(Debug, Clone, Deserialize)]
pub struct Period {
    #[serde(default)]
    pub id: String,
    pub period_map: PeriodMap,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeriodMap {
    #[serde(default)]
    pub zonegroups: Vec<PeriodZoneGroup>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodZoneGroup {
    pub name: String,
    #[serde(default)]
    pub zones: Vec<PeriodZone>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PeriodZone {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZoneList {
    #[serde(default)]
    zones: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct ZoneGroupList {
    #[serde(default)]
    zonegroups: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct RealmList {
    #[serde(default)]
    realms: Vec<String>,
}

/// Output of `realm create`
#[derive(Debug, Clone, Deserialize)]
pub struct Realm {
    pub id: String,
    pub name: String,
}

/// Names reported by `radosgw-admin sync status`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncStatus {
    pub realm: Option<String>,
    pub zonegroup: Option<String>,
    pub zone: Option<String>,
}

impl SyncStatus {
    /// Parse lines such as `      zonegroup 4f1c... (shared)`
    pub fn parse(output: &str) -> Self {
        let mut status = SyncStatus::default();
        for line in output.lines() {
            let line = line.trim_start();
            let Some((label, rest)) = line.split_once(' ') else {
                continue;
            };
            let slot = match label {
                "realm" => &mut status.realm,
                "zonegroup" => &mut status.zonegroup,
                "zone" => &mut status.zone,
                _ => continue,
            };
            if slot.is_none() {
                *slot = parenthesized(rest);
            }
        }
        status
    }
}

fn parenthesized(text: &str) -> Option<String> {
    let start = text.find('(')? + 1;
    let end = start + text[start..].find(')')?;
    Some(text[start..end].to_string())
}

/// Host part of an endpoint such as `http://rgw2.example:8080`
pub fn endpoint_host(endpoint: &str) -> Option<&str> {
    let without_scheme = endpoint
        .split_once("//")
        .map(|(_, rest)| rest)
        .unwrap_or(endpoint);
    let host = without_scheme
        .split(|c: char| c == ':' || c == '/')
        .next()
        .unwrap_or_default();
    (!host.is_empty()).then_some(host)
}

impl Period {
    /// Host of the first zone in the first zonegroup that is not local
    pub fn peer_host(&self, local_zones: &[String]) -> Option<String> {
        self.period_map
            .zonegroups
            .first()?
            .zones
            .iter()
            .filter(|zone| !local_zones.contains(&zone.name))
            .find_map(|zone| zone.endpoints.first())
            .and_then(|endpoint| endpoint_host(endpoint))
            .map(str::to_string)
    }
}

impl<R: CommandRunner> RadosgwAdmin<R> {
    pub fn zonegroup_get(&self) -> Result<ZoneGroup, CollaboratorError> {
        self.exec_json(&["zonegroup", "get"])
    }

    pub fn zonegroup_enable_feature(
        &self,
        zonegroup: &str,
        feature: &str,
    ) -> Result<(), CollaboratorError> {
        let zg_arg = format!("--rgw-zonegroup={}", zonegroup);
        let feature_arg = format!("--enable-feature={}", feature);
        self.exec(&["zonegroup", "modify", &zg_arg, &feature_arg])?;
        Ok(())
    }

    /// Enable dynamic resharding in the zonegroup unless already on
    pub fn ensure_resharding(&self) -> Result<Option<Period>, CollaboratorError> {
        let zonegroup = self.zonegroup_get()?;
        if zonegroup.has_feature("resharding") {
            return Ok(None);
        }
        self.zonegroup_enable_feature(&zonegroup.name, "resharding")?;
        self.period_update_commit().map(Some)
    }

    pub fn period_update_commit(&self) -> Result<Period, CollaboratorError> {
        self.exec_json(&["period", "update", "--commit"])
    }

    pub fn zone_list(&self) -> Result<Vec<String>, CollaboratorError> {
        let list: ZoneList = self.exec_json(&["zone", "list"])?;
        Ok(list.zones)
    }

    pub fn zonegroup_list(&self) -> Result<Vec<String>, CollaboratorError> {
        let list: ZoneGroupList = self.exec_json(&["zonegroup", "list"])?;
        Ok(list.zonegroups)
    }

    pub fn realm_list(&self) -> Result<Vec<String>, CollaboratorError> {
        let list: RealmList = self.exec_json(&["realm", "list"])?;
        Ok(list.realms)
    }

    pub fn zone_create(&self, zone: &str, zonegroup: &str) -> Result<(), CollaboratorError> {
        let zone_arg = format!("--rgw-zone={}", zone);
        let zg_arg = format!("--rgw-zonegroup={}", zonegroup);
        self.exec(&["zone", "create", &zone_arg, &zg_arg])?;
        Ok(())
    }

    pub fn zone_delete(&self, zone: &str) -> Result<(), CollaboratorError> {
        let zone_arg = format!("--rgw-zone={}", zone);
        self.exec(&["zone", "delete", &zone_arg])?;
        Ok(())
    }

    pub fn zone_rename(&self, zone: &str, new_name: &str) -> Result<(), CollaboratorError> {
        let zone_arg = format!("--rgw-zone={}", zone);
        let new_arg = format!("--zone-new-name={}", new_name);
        self.exec(&["zone", "rename", &zone_arg, &new_arg])?;
        Ok(())
    }

    pub fn zonegroup_create(&self, zonegroup: &str, realm: &str) -> Result<(), CollaboratorError> {
        let zg_arg = format!("--rgw-zonegroup={}", zonegroup);
        let realm_arg = format!("--rgw-realm={}", realm);
        self.exec(&["zonegroup", "create", &zg_arg, &realm_arg])?;
        Ok(())
    }

    pub fn zonegroup_delete(&self, zonegroup: &str) -> Result<(), CollaboratorError> {
        let zg_arg = format!("--rgw-zonegroup={}", zonegroup);
        self.exec(&["zonegroup", "delete", &zg_arg])?;
        Ok(())
    }

    pub fn zonegroup_rename(&self, zonegroup: &str, new_name: &str) -> Result<(), CollaboratorError> {
        let zg_arg = format!("--rgw-zonegroup={}", zonegroup);
        let new_arg = format!("--zonegroup-new-name={}", new_name);
        self.exec(&["zonegroup", "rename", &zg_arg, &new_arg])?;
        Ok(())
    }

    /// Detach a zone from a zonegroup
    pub fn zonegroup_remove(&self, zonegroup: &str, zone: &str) -> Result<(), CollaboratorError> {
        let zg_arg = format!("--rgw-zonegroup={}", zonegroup);
        let zone_arg = format!("--rgw-zone={}", zone);
        self.exec(&["zonegroup", "remove", &zg_arg, &zone_arg])?;
        Ok(())
    }

    pub fn realm_create(&self, realm: &str) -> Result<Realm, CollaboratorError> {
        let realm_arg = format!("--rgw-realm={}", realm);
        self.exec_json(&["realm", "create", &realm_arg])
    }

    pub fn realm_delete(&self, realm: &str) -> Result<(), CollaboratorError> {
        let realm_arg = format!("--rgw-realm={}", realm);
        self.exec(&["realm", "rm", &realm_arg])?;
        Ok(())
    }

    pub fn realm_rename(&self, realm: &str, new_name: &str) -> Result<(), CollaboratorError> {
        let realm_arg = format!("--rgw-realm={}", realm);
        let new_arg = format!("--realm-new-name={}", new_name);
        self.exec(&["realm", "rename", &realm_arg, &new_arg])?;
        Ok(())
    }

    pub fn sync_status(&self) -> Result<SyncStatus, CollaboratorError> {
        Ok(SyncStatus::parse(&self.exec(&["sync", "status"])?))
    }

    /// Host of the remote zone's first endpoint, if the deployment is multisite
    pub fn peer_host(&self) -> Result<Option<String>, CollaboratorError> {
        let local_zones = self.zone_list()?;
        let output = self.exec(&["period", "get"])?;
        let period: Period = parse_json("radosgw-admin period get", &output)?;
        Ok(period.peer_host(&local_zones))
    }
}
