//! Storage backend driver abstraction.
//!
//! Every pool backend implements the [`PoolDriver`] trait. The lifecycle,
//! snapshot, migration and recovery services only ever talk to this trait;
//! driver-specific behavior stays behind it. The reference `dir` driver in
//! this crate backs pools with plain directories and is also the test
//! backend.

use crate::backup::{BackupConfig, BackupInfo};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{info, instrument};

pub mod dir;

pub use dir::DirDriver;

/// Boxed byte stream a driver writes a volume export into.
pub type VolumeWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Boxed byte stream a driver reads a volume import from.
pub type VolumeReader = Pin<Box<dyn AsyncRead + Send>>;

/// Static driver description.
#[derive(Debug, Clone)]
pub struct DriverInfo {
    /// Driver name.
    pub name: &'static str,
    /// Whether volumes live on shared storage reachable from every member.
    pub remote: bool,
    /// Whether the driver can enumerate volumes with no catalog record.
    pub supports_unknown_scan: bool,
}

/// Capability set every pool backend must satisfy.
///
/// Capabilities are total in their inputs; drivers hold no hidden state
/// beyond their own configuration and the disk itself. Cancellation happens
/// between capability calls, driven by the owning operation.
#[async_trait]
pub trait PoolDriver: Send + Sync {
    /// Static driver description.
    fn info(&self) -> DriverInfo;

    /// Current driver configuration.
    fn config(&self) -> HashMap<String, String>;

    /// Populate configuration defaults. Called once before the driver is
    /// shared.
    fn fill_config(&mut self) -> Result<()>;

    /// Validate a configuration, failing when the pool would be unusable.
    fn validate(&self, config: &HashMap<String, String>) -> Result<()>;

    /// Validate a volume or snapshot name.
    fn validate_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::BadRequest("Volume names may not be empty".to_string()));
        }

        if name.contains('/') {
            return Err(Error::BadRequest(
                "Volume names may not contain slashes".to_string(),
            ));
        }

        if name.starts_with('.') || name.starts_with('-') {
            return Err(Error::BadRequest(format!("Invalid volume name {:?}", name)));
        }

        Ok(())
    }

    /// Mount the pool. Returns whether this call performed the mount; only
    /// the caller that receives `true` may later unmount.
    async fn mount(&self) -> Result<bool>;

    /// Unmount the pool. Returns whether the pool was mounted.
    async fn unmount(&self) -> Result<bool>;

    /// Enumerate every volume present on disk, keyed by project, each with
    /// its embedded backup manifest. The recovery engine filters out volumes
    /// the catalog already tracks. Drivers that cannot enumerate return
    /// `Unsupported`.
    async fn list_unknown_volumes(&self) -> Result<HashMap<String, Vec<BackupConfig>>>;

    /// Create an empty custom volume.
    async fn create_custom_volume(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &HashMap<String, String>,
        content_type: crate::types::ContentType,
    ) -> Result<()>;

    /// Create a custom volume as a copy of another, optionally with its
    /// snapshots. The source may live on a different pool of the same
    /// driver.
    #[allow(clippy::too_many_arguments)]
    async fn create_custom_volume_from_copy(
        &self,
        project: &str,
        src_project: &str,
        name: &str,
        src_name: &str,
        src_pool: &dyn PoolDriver,
        with_snapshots: bool,
    ) -> Result<()>;

    /// Create a custom ISO volume from a scratch file.
    async fn create_custom_volume_from_iso(
        &self,
        project: &str,
        name: &str,
        iso_path: &Path,
        size: u64,
    ) -> Result<()>;

    /// Create a custom volume (and snapshots) from a backup tarball.
    async fn create_custom_volume_from_backup(&self, info: &BackupInfo) -> Result<()>;

    /// Make an on-disk custom volume consistent again after recovery
    /// recreated its catalog rows.
    async fn import_custom_volume(&self, project: &str, config: &BackupConfig) -> Result<()>;

    /// Same as [`Self::import_custom_volume`], for buckets.
    async fn import_bucket(&self, project: &str, config: &BackupConfig) -> Result<()>;

    /// Rebuild the mount path and symlinks of a recovered instance.
    async fn import_instance(&self, project: &str, config: &BackupConfig) -> Result<()>;

    /// Rename a custom volume, snapshots included.
    async fn rename_custom_volume(&self, project: &str, name: &str, new_name: &str) -> Result<()>;

    /// Delete a custom volume, snapshots included.
    async fn delete_custom_volume(&self, project: &str, name: &str) -> Result<()>;

    /// Apply a configuration change to a custom volume.
    async fn update_custom_volume(
        &self,
        project: &str,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<()>;

    /// Refresh an existing custom volume from a source volume.
    #[allow(clippy::too_many_arguments)]
    async fn refresh_custom_volume(
        &self,
        project: &str,
        src_project: &str,
        name: &str,
        src_name: &str,
        src_pool: &dyn PoolDriver,
        with_snapshots: bool,
        exclude_older: bool,
    ) -> Result<()>;

    /// Roll a custom volume back to one of its snapshots.
    async fn restore_custom_volume(&self, project: &str, name: &str, snapshot: &str) -> Result<()>;

    /// Snapshot a custom volume.
    async fn create_volume_snapshot(
        &self,
        project: &str,
        volume: &str,
        snapshot: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Rename a snapshot.
    async fn rename_volume_snapshot(
        &self,
        project: &str,
        volume: &str,
        snapshot: &str,
        new_name: &str,
    ) -> Result<()>;

    /// Delete a snapshot.
    async fn delete_volume_snapshot(&self, project: &str, volume: &str, snapshot: &str)
        -> Result<()>;

    /// Reapply the root-disk quota of an instance.
    async fn set_instance_quota(
        &self,
        project: &str,
        instance: &str,
        size: &str,
        size_state: &str,
    ) -> Result<()>;

    /// Stream a custom volume (optionally with snapshots) as a tarball.
    async fn export_custom_volume(
        &self,
        project: &str,
        name: &str,
        with_snapshots: bool,
        writer: VolumeWriter,
    ) -> Result<()>;

    /// Materialize a custom volume from a tarball stream produced by
    /// [`Self::export_custom_volume`].
    async fn import_custom_volume_stream(
        &self,
        project: &str,
        name: &str,
        config: &HashMap<String, String>,
        content_type: crate::types::ContentType,
        reader: VolumeReader,
    ) -> Result<()>;

    /// Downcast to the concrete driver (for same-driver fast paths).
    fn as_any(&self) -> &dyn Any;
}

/// Factory for creating pool drivers by name.
pub struct DriverFactory;

impl DriverFactory {
    /// Instantiate a driver for a pool.
    #[instrument(skip(config))]
    pub fn create(
        driver: &str,
        pool_name: &str,
        config: HashMap<String, String>,
    ) -> Result<Box<dyn PoolDriver>> {
        match driver {
            "dir" => {
                info!(pool = %pool_name, "Creating dir driver");
                Ok(Box::new(DirDriver::new(pool_name, config)))
            }
            _ => Err(Error::BadRequest(format!("Unknown storage driver {:?}", driver))),
        }
    }

    /// Names of all available drivers.
    #[must_use]
    pub fn driver_names() -> &'static [&'static str] {
        &["dir"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_unknown_driver() {
        let result = DriverFactory::create("zfs", "p1", HashMap::new());
        assert!(matches!(result, Err(Error::BadRequest(_))));
    }

    #[test]
    fn test_factory_dir_driver() {
        let driver = DriverFactory::create("dir", "p1", HashMap::new()).unwrap();
        assert_eq!(driver.info().name, "dir");
        assert!(!driver.info().remote);
        assert!(driver.info().supports_unknown_scan);
    }
}
