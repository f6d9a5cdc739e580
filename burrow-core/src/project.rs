//! Project records and project-level policy checks.
//!
//! Projects can restrict what their members may do with storage; the
//! lifecycle and snapshot services consult these checks before touching the
//! drivers. Projects without `features.storage.volumes` share the default
//! project's volumes.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Name of the default project.
pub const DEFAULT_PROJECT: &str = "default";

/// A project catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub config: HashMap<String, String>,
}

impl Project {
    fn feature_enabled(&self, feature: &str) -> bool {
        // Features default to enabled on the default project and to the
        // stored value elsewhere.
        match self.config.get(feature) {
            Some(v) => v == "true",
            None => self.name == DEFAULT_PROJECT,
        }
    }
}

/// A profile catalog record, devices included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub id: i64,
    pub project: String,
    pub name: String,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
}

impl Profile {
    /// Find the root disk device of this profile, if any.
    #[must_use]
    pub fn root_disk_device(&self) -> Option<(&String, &HashMap<String, String>)> {
        root_disk_device(&self.devices)
    }
}

/// Find the root disk device in a device map: a disk mounted at `/` without
/// a source.
#[must_use]
pub fn root_disk_device(
    devices: &HashMap<String, HashMap<String, String>>,
) -> Option<(&String, &HashMap<String, String>)> {
    devices.iter().find(|(_, cfg)| {
        cfg.get("type").map(String::as_str) == Some("disk")
            && cfg.get("path").map(String::as_str) == Some("/")
            && cfg.get("source").map_or(true, |s| s.is_empty())
    })
}

/// Resolve the project that owns storage volumes for `project`.
///
/// Projects without the storage-volumes feature store their custom volumes
/// in the default project.
#[must_use]
pub fn storage_volume_project(project: &Project) -> String {
    if project.feature_enabled("features.storage.volumes") {
        project.name.clone()
    } else {
        DEFAULT_PROJECT.to_string()
    }
}

/// Resolve the project that owns profiles for `project`.
#[must_use]
pub fn profile_project(project: &Project) -> String {
    if project.feature_enabled("features.profiles") {
        project.name.clone()
    } else {
        DEFAULT_PROJECT.to_string()
    }
}

/// Resolve the project that owns networks for `project`.
#[must_use]
pub fn network_project(project: &Project) -> String {
    if project.feature_enabled("features.networks") {
        project.name.clone()
    } else {
        DEFAULT_PROJECT.to_string()
    }
}

/// Check whether the project allows creating custom volumes.
pub fn allow_volume_creation(project: &Project) -> Result<()> {
    if project.config.get("restricted").map(String::as_str) == Some("true")
        && project.config.get("restricted.storage.volumes").map(String::as_str) == Some("block")
    {
        return Err(Error::Forbidden(format!(
            "Project {} does not allow creating storage volumes",
            project.name
        )));
    }

    Ok(())
}

/// Check whether the project allows creating snapshots.
pub fn allow_snapshot_creation(project: &Project) -> Result<()> {
    if project.config.get("restricted").map(String::as_str) == Some("true")
        && project.config.get("restricted.snapshots").map(String::as_str) == Some("block")
    {
        return Err(Error::Forbidden(format!(
            "Project {} does not allow creating snapshots",
            project.name
        )));
    }

    Ok(())
}

/// Compute an expiry timestamp from a duration expression.
///
/// The expression is a space-separated list of `<count><unit>` tokens with
/// units `M` (minutes), `H` (hours), `d` (days), `w` (weeks), `m` (months)
/// and `y` (years). An empty expression means no expiry.
pub fn expiry_from(now: DateTime<Utc>, expr: &str) -> Result<Option<DateTime<Utc>>> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Ok(None);
    }

    let mut expiry = now;
    for token in expr.split_whitespace() {
        if !token.is_ascii() || token.len() < 2 {
            return Err(Error::BadRequest(format!("Invalid expiry expression {:?}", token)));
        }

        let (count, unit) = token.split_at(token.len() - 1);
        let count: u32 = count
            .parse()
            .map_err(|_| Error::BadRequest(format!("Invalid expiry expression {:?}", token)))?;

        expiry = match unit {
            "M" => expiry + Duration::minutes(i64::from(count)),
            "H" => expiry + Duration::hours(i64::from(count)),
            "d" => expiry + Duration::days(i64::from(count)),
            "w" => expiry + Duration::weeks(i64::from(count)),
            "m" => expiry
                .checked_add_months(Months::new(count))
                .ok_or_else(|| Error::BadRequest(format!("Expiry {:?} out of range", expr)))?,
            "y" => expiry
                .checked_add_months(Months::new(count * 12))
                .ok_or_else(|| Error::BadRequest(format!("Expiry {:?} out of range", expr)))?,
            _ => return Err(Error::BadRequest(format!("Invalid expiry expression {:?}", token))),
        };
    }

    Ok(Some(expiry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(name: &str, pairs: &[(&str, &str)]) -> Project {
        Project {
            id: 1,
            name: name.to_string(),
            config: pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        }
    }

    #[test]
    fn test_storage_volume_project() {
        let p = project("default", &[]);
        assert_eq!(storage_volume_project(&p), "default");

        let p = project("dev", &[("features.storage.volumes", "true")]);
        assert_eq!(storage_volume_project(&p), "dev");

        let p = project("dev", &[]);
        assert_eq!(storage_volume_project(&p), "default");
    }

    #[test]
    fn test_allow_volume_creation() {
        let p = project("dev", &[("restricted", "true"), ("restricted.storage.volumes", "block")]);
        assert!(allow_volume_creation(&p).is_err());

        let p = project("dev", &[("restricted", "true")]);
        assert!(allow_volume_creation(&p).is_ok());
    }

    #[test]
    fn test_expiry_from() {
        let now = Utc::now();
        assert_eq!(expiry_from(now, "").unwrap(), None);
        assert_eq!(expiry_from(now, "30M").unwrap(), Some(now + Duration::minutes(30)));
        assert_eq!(expiry_from(now, "1d 2H").unwrap(), Some(now + Duration::days(1) + Duration::hours(2)));
        assert!(expiry_from(now, "7q").is_err());
        assert!(expiry_from(now, "x1d").is_err());
    }

    #[test]
    fn test_root_disk_device() {
        let mut devices = HashMap::new();
        let mut root = HashMap::new();
        root.insert("type".to_string(), "disk".to_string());
        root.insert("path".to_string(), "/".to_string());
        root.insert("pool".to_string(), "default".to_string());
        devices.insert("root".to_string(), root);

        let (name, cfg) = root_disk_device(&devices).unwrap();
        assert_eq!(name, "root");
        assert_eq!(cfg.get("pool").unwrap(), "default");
    }
}
