//! Backup manifest parsing.
//!
//! Every backup tarball embeds a `backup.yaml` manifest describing the
//! volume, instance or bucket it contains, together with the pool it was
//! taken from. The recovery engine also reads these manifests straight off
//! the pool to re-derive catalog rows.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Magic bytes of a squashfs image ("hsqs" little-endian).
pub const SQUASHFS_MAGIC: [u8; 4] = [0x68, 0x73, 0x71, 0x73];

/// Name of the manifest entry inside a backup tarball.
const MANIFEST_NAME: &str = "backup/backup.yaml";

/// Pool block of a backup manifest. Its presence is the recovery hint used
/// to restore a pool record without user-supplied config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSpec {
    pub name: String,
    pub driver: String,
    pub description: String,
    pub config: HashMap<String, String>,
}

/// Instance block of a backup manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub instance_type: String,
    pub architecture: String,
    pub profiles: Vec<String>,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub expanded_devices: HashMap<String, HashMap<String, String>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Instance snapshot block of a backup manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceSnapshotSpec {
    pub name: String,
    pub profiles: Vec<String>,
    pub config: HashMap<String, String>,
    pub devices: HashMap<String, HashMap<String, String>>,
    pub expanded_devices: HashMap<String, HashMap<String, String>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Volume block of a backup manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSpec {
    pub name: String,
    pub description: String,
    pub content_type: String,
    pub config: HashMap<String, String>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Volume snapshot block of a backup manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSnapshotSpec {
    /// Snapshot-only name, without the parent prefix.
    pub name: String,
    pub description: String,
    pub config: HashMap<String, String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// The embedded `backup.yaml` manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub pool: Option<PoolSpec>,
    pub container: Option<InstanceSpec>,
    pub snapshots: Vec<InstanceSnapshotSpec>,
    pub volume: Option<VolumeSpec>,
    pub volume_snapshots: Vec<VolumeSnapshotSpec>,
    pub bucket: Option<BucketSpec>,
}

/// Bucket block of a backup manifest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketSpec {
    pub name: String,
    pub description: String,
    pub config: HashMap<String, String>,
}

impl BackupConfig {
    /// Parse a manifest from YAML bytes.
    pub fn from_yaml(data: &[u8]) -> Result<Self> {
        serde_yaml::from_slice(data)
            .map_err(|e| Error::BadRequest(format!("Invalid backup manifest: {}", e)))
    }

    /// Serialize the manifest to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(Error::internal)
    }
}

/// Parsed summary of an uploaded backup tarball.
#[derive(Debug, Clone)]
pub struct BackupInfo {
    /// Project the artifact will be restored into.
    pub project: String,
    /// Destination volume name.
    pub name: String,
    /// Destination pool name.
    pub pool: String,
    /// Driver the backup was taken from.
    pub backend: String,
    /// Whether the payload is in the driver's optimized binary format.
    pub optimized_storage: bool,
    /// Snapshot-only names contained in the backup, chronological.
    pub snapshots: Vec<String>,
    /// The embedded manifest.
    pub config: BackupConfig,
    /// Path of the (decompressed) tarball on disk.
    pub tarball: PathBuf,
}

/// Whether the buffer starts with the squashfs magic.
#[must_use]
pub fn is_squashfs(header: &[u8]) -> bool {
    header.len() >= SQUASHFS_MAGIC.len() && header[..SQUASHFS_MAGIC.len()] == SQUASHFS_MAGIC
}

/// Read the backup manifest out of a tarball and build a [`BackupInfo`].
///
/// Tarball scanning is synchronous, so this offloads to the blocking pool.
pub async fn read_info(tarball: &Path, project: &str) -> Result<BackupInfo> {
    let path = tarball.to_path_buf();
    let manifest = tokio::task::spawn_blocking(move || read_manifest_blocking(&path))
        .await
        .map_err(|e| Error::Internal(format!("Backup manifest read task failed: {}", e)))??;

    let config = BackupConfig::from_yaml(&manifest)?;

    let (name, backend, pool_name) = match (&config.volume, &config.pool) {
        (Some(volume), Some(pool)) => (volume.name.clone(), pool.driver.clone(), pool.name.clone()),
        (Some(volume), None) => (volume.name.clone(), String::new(), String::new()),
        _ => return Err(Error::BadRequest("Backup manifest has no volume block".to_string())),
    };

    let snapshots = config.volume_snapshots.iter().map(|s| s.name.clone()).collect();

    debug!(name = %name, pool = %pool_name, backend = %backend, "Backup manifest loaded");

    Ok(BackupInfo {
        project: project.to_string(),
        name,
        pool: pool_name,
        backend,
        // The upload API only carries plain tarballs; the optimized flag is
        // recorded by drivers that export their own binary format.
        optimized_storage: false,
        snapshots,
        config,
        tarball: tarball.to_path_buf(),
    })
}

fn read_manifest_blocking(path: &Path) -> Result<Vec<u8>> {
    let file = std::fs::File::open(path)
        .map_err(|e| Error::Io { path: path.to_path_buf(), source: e })?;

    let mut archive = tar::Archive::new(file);
    let entries = archive
        .entries()
        .map_err(|e| Error::BadRequest(format!("Invalid backup tarball: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::BadRequest(format!("Invalid backup tarball: {}", e)))?;

        let entry_path = entry
            .path()
            .map_err(|e| Error::BadRequest(format!("Invalid backup tarball: {}", e)))?
            .to_string_lossy()
            .into_owned();

        if entry_path == MANIFEST_NAME || entry_path == "backup.yaml" {
            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::Io { path: path.to_path_buf(), source: e })?;
            return Ok(data);
        }
    }

    Err(Error::BadRequest("Backup tarball contains no manifest".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_squashfs_magic() {
        assert!(is_squashfs(b"hsqs\x01\x02"));
        assert!(!is_squashfs(b"ustar"));
        assert!(!is_squashfs(b"hs"));
    }

    #[test]
    fn test_manifest_roundtrip() {
        let yaml = r#"
pool:
  name: local
  driver: dir
  config:
    source: /srv/pool
volume:
  name: vol1
  content_type: filesystem
  config:
    size: 1GiB
volume_snapshots:
  - name: snap0
  - name: snap1
"#;

        let config = BackupConfig::from_yaml(yaml.as_bytes()).unwrap();
        assert_eq!(config.pool.as_ref().unwrap().driver, "dir");
        assert_eq!(config.volume.as_ref().unwrap().name, "vol1");
        assert_eq!(config.volume_snapshots.len(), 2);

        let rendered = config.to_yaml().unwrap();
        let reparsed = BackupConfig::from_yaml(rendered.as_bytes()).unwrap();
        assert_eq!(reparsed.volume_snapshots[1].name, "snap1");
    }

    #[test]
    fn test_manifest_missing_volume() {
        let config = BackupConfig::from_yaml(b"{}").unwrap();
        assert!(config.volume.is_none());
        assert!(config.container.is_none());
    }
}
