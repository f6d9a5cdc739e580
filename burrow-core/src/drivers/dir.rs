//! Directory-backed storage driver.
//!
//! Each volume is a plain directory under the pool source with its content
//! under `data/`, snapshot copies under `snapshots/<name>/` and an embedded
//! `backup.yaml` manifest. The manifest is what the recovery scan reads, so
//! the driver keeps it current on every mutation.
//!
//! Layout:
//!
//! ```text
//! <source>/custom/<project>_<name>/{backup.yaml, data/, snapshots/<snap>/}
//! <source>/containers/<project>_<name>/{backup.yaml, rootfs/}
//! <source>/virtual-machines/<project>_<name>/{backup.yaml, rootfs/}
//! <source>/buckets/<project>_<name>/{backup.yaml, objects/}
//! ```

use crate::backup::{BackupConfig, BackupInfo, PoolSpec, VolumeSnapshotSpec, VolumeSpec};
use crate::drivers::{DriverInfo, PoolDriver, VolumeReader, VolumeWriter};
use crate::error::{Error, Result};
use crate::paths;
use crate::types::ContentType;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

const MANIFEST_FILE: &str = "backup.yaml";

/// Subdirectories per volume type.
const TYPE_DIRS: [&str; 4] = ["custom", "containers", "virtual-machines", "buckets"];

/// Directory-backed pool driver.
pub struct DirDriver {
    pool_name: String,
    config: Mutex<HashMap<String, String>>,
    mounted: AtomicBool,
}

impl DirDriver {
    /// Create a driver handle for a pool.
    pub fn new(pool_name: &str, config: HashMap<String, String>) -> Self {
        Self { pool_name: pool_name.to_string(), config: Mutex::new(config), mounted: AtomicBool::new(false) }
    }

    fn source(&self) -> Result<PathBuf> {
        let config = self.config.lock().expect("driver config lock poisoned");
        let source = config.get("source").cloned().unwrap_or_default();
        if source.is_empty() {
            return Err(Error::Internal(format!(
                "Pool {:?} has no source configured",
                self.pool_name
            )));
        }

        Ok(PathBuf::from(source))
    }

    fn volume_dir(&self, project: &str, name: &str) -> Result<PathBuf> {
        Ok(self.source()?.join("custom").join(format!("{}_{}", project, name)))
    }

    fn instance_dir(&self, type_dir: &str, project: &str, name: &str) -> Result<PathBuf> {
        Ok(self.source()?.join(type_dir).join(format!("{}_{}", project, name)))
    }

    fn pool_spec(&self) -> PoolSpec {
        PoolSpec {
            name: self.pool_name.clone(),
            driver: "dir".to_string(),
            description: String::new(),
            config: self.config(),
        }
    }

    async fn read_manifest(dir: &Path) -> Result<BackupConfig> {
        let path = dir.join(MANIFEST_FILE);
        let data =
            fs::read(&path).await.map_err(|e| Error::Io { path: path.clone(), source: e })?;
        BackupConfig::from_yaml(&data)
    }

    async fn write_manifest(dir: &Path, manifest: &BackupConfig) -> Result<()> {
        let path = dir.join(MANIFEST_FILE);
        fs::write(&path, manifest.to_yaml()?)
            .await
            .map_err(|e| Error::Io { path, source: e })
    }

    async fn require_volume_dir(&self, project: &str, name: &str) -> Result<PathBuf> {
        let dir = self.volume_dir(project, name)?;
        if !dir.exists() {
            return Err(Error::NotFound(format!(
                "Volume {:?} not found on pool {:?}",
                name, self.pool_name
            )));
        }

        Ok(dir)
    }

    /// Copy the data of `src` into a fresh volume directory, manifest
    /// rewritten for the new identity.
    async fn copy_volume_dir(
        &self,
        project: &str,
        name: &str,
        src_dir: &Path,
        with_snapshots: bool,
    ) -> Result<()> {
        let dst_dir = self.volume_dir(project, name)?;
        if dst_dir.exists() {
            return Err(Error::Conflict(format!("Volume {:?} already exists on disk", name)));
        }

        copy_dir(&src_dir.join("data"), &dst_dir.join("data")).await?;

        let mut manifest = Self::read_manifest(src_dir).await?;
        if with_snapshots {
            let src_snaps = src_dir.join("snapshots");
            if src_snaps.exists() {
                copy_dir(&src_snaps, &dst_dir.join("snapshots")).await?;
            }
        } else {
            manifest.volume_snapshots.clear();
        }

        if let Some(volume) = manifest.volume.as_mut() {
            volume.name = name.to_string();
        }
        manifest.pool = Some(self.pool_spec());

        Self::write_manifest(&dst_dir, &manifest).await
    }
}

#[async_trait]
impl PoolDriver for DirDriver {
    fn info(&self) -> DriverInfo {
        DriverInfo { name: "dir", remote: false, supports_unknown_scan: true }
    }

    fn config(&self) -> HashMap<String, String> {
        self.config.lock().expect("driver config lock poisoned").clone()
    }

    fn fill_config(&mut self) -> Result<()> {
        let config = self.config.get_mut().expect("driver config lock poisoned");
        if config.get("source").map_or(true, String::is_empty) {
            let default = paths::storage_dir().join(&self.pool_name);
            config.insert("source".to_string(), default.to_string_lossy().into_owned());
        }

        Ok(())
    }

    fn validate(&self, config: &HashMap<String, String>) -> Result<()> {
        let source = config.get("source").map(String::as_str).unwrap_or_default();
        if source.is_empty() {
            return Err(Error::BadRequest("The dir driver requires a source".to_string()));
        }

        if !Path::new(source).is_absolute() {
            return Err(Error::BadRequest(format!(
                "Pool source {:?} must be an absolute path",
                source
            )));
        }

        for key in config.keys() {
            if key.as_str() != "source" && !key.starts_with("user.") {
                return Err(Error::BadRequest(format!(
                    "Invalid option {:?} for dir pool",
                    key
                )));
            }
        }

        Ok(())
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn mount(&self) -> Result<bool> {
        if self.mounted.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        let source = self.source()?;
        for sub in TYPE_DIRS {
            let dir = source.join(sub);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::Io { path: dir.clone(), source: e })?;
        }

        debug!(source = %source.display(), "Pool mounted");
        Ok(true)
    }

    async fn unmount(&self) -> Result<bool> {
        Ok(self.mounted.swap(false, Ordering::SeqCst))
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn list_unknown_volumes(&self) -> Result<HashMap<String, Vec<BackupConfig>>> {
        let source = self.source()?;
        let mut out: HashMap<String, Vec<BackupConfig>> = HashMap::new();

        for sub in TYPE_DIRS {
            let dir = source.join(sub);
            if !dir.exists() {
                continue;
            }

            let mut entries = fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Io { path: dir.clone(), source: e })?;

            while let Some(entry) =
                entries.next_entry().await.map_err(|e| Error::Io { path: dir.clone(), source: e })?
            {
                let file_name = entry.file_name().to_string_lossy().into_owned();
                let Some((project, _name)) = file_name.split_once('_') else {
                    warn!(entry = %file_name, "Skipping entry without project prefix");
                    continue;
                };

                match Self::read_manifest(&entry.path()).await {
                    Ok(manifest) => {
                        out.entry(project.to_string()).or_default().push(manifest);
                    }
                    Err(e) => {
                        warn!(entry = %file_name, error = %e, "Skipping entry without readable manifest");
                    }
                }
            }
        }

        Ok(out)
    }

    #[instrument(skip(self, config), fields(pool = %self.pool_name))]
    async fn create_custom_volume(
        &self,
        project: &str,
        name: &str,
        description: &str,
        config: &HashMap<String, String>,
        content_type: ContentType,
    ) -> Result<()> {
        let dir = self.volume_dir(project, name)?;
        if dir.exists() {
            return Err(Error::Conflict(format!("Volume {:?} already exists on disk", name)));
        }

        let data = dir.join("data");
        fs::create_dir_all(&data).await.map_err(|e| Error::Io { path: data, source: e })?;

        let manifest = BackupConfig {
            pool: Some(self.pool_spec()),
            volume: Some(VolumeSpec {
                name: name.to_string(),
                description: description.to_string(),
                content_type: content_type.as_str().to_string(),
                config: config.clone(),
                created_at: Some(Utc::now()),
            }),
            ..Default::default()
        };

        Self::write_manifest(&dir, &manifest).await?;

        info!(volume = %name, project = %project, "Created custom volume");
        Ok(())
    }

    async fn create_custom_volume_from_copy(
        &self,
        project: &str,
        src_project: &str,
        name: &str,
        src_name: &str,
        src_pool: &dyn PoolDriver,
        with_snapshots: bool,
    ) -> Result<()> {
        let Some(src) = src_pool.as_any().downcast_ref::<DirDriver>() else {
            return Err(Error::Unsupported(
                "The dir driver can only copy volumes from dir pools".to_string(),
            ));
        };

        let src_dir = src.require_volume_dir(src_project, src_name).await?;
        self.copy_volume_dir(project, name, &src_dir, with_snapshots).await?;

        info!(volume = %name, source = %src_name, "Copied custom volume");
        Ok(())
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn create_custom_volume_from_iso(
        &self,
        project: &str,
        name: &str,
        iso_path: &Path,
        size: u64,
    ) -> Result<()> {
        let dir = self.volume_dir(project, name)?;
        if dir.exists() {
            return Err(Error::Conflict(format!("Volume {:?} already exists on disk", name)));
        }

        let data = dir.join("data");
        fs::create_dir_all(&data)
            .await
            .map_err(|e| Error::Io { path: data.clone(), source: e })?;

        let dst = data.join("volume.iso");
        fs::copy(iso_path, &dst).await.map_err(|e| Error::Io { path: dst.clone(), source: e })?;

        let mut config = HashMap::new();
        config.insert("size".to_string(), size.to_string());

        let manifest = BackupConfig {
            pool: Some(self.pool_spec()),
            volume: Some(VolumeSpec {
                name: name.to_string(),
                description: String::new(),
                content_type: ContentType::Iso.as_str().to_string(),
                config,
                created_at: Some(Utc::now()),
            }),
            ..Default::default()
        };

        Self::write_manifest(&dir, &manifest).await?;

        info!(volume = %name, size, "Created ISO volume");
        Ok(())
    }

    #[instrument(skip(self, info), fields(pool = %self.pool_name, volume = %info.name))]
    async fn create_custom_volume_from_backup(&self, info: &BackupInfo) -> Result<()> {
        let dir = self.volume_dir(&info.project, &info.name)?;
        if dir.exists() {
            return Err(Error::Conflict(format!(
                "Volume {:?} already exists on disk",
                info.name
            )));
        }

        unpack_volume_tarball(&info.tarball, &dir).await?;

        let mut manifest = info.config.clone();
        if let Some(volume) = manifest.volume.as_mut() {
            volume.name = info.name.clone();
        }
        manifest.pool = Some(self.pool_spec());

        Self::write_manifest(&dir, &manifest).await?;

        info!("Restored custom volume from backup");
        Ok(())
    }

    async fn import_custom_volume(&self, project: &str, config: &BackupConfig) -> Result<()> {
        let volume = config
            .volume
            .as_ref()
            .ok_or_else(|| Error::BadRequest("Manifest has no volume block".to_string()))?;

        // The data survived the catalog loss; just make sure it is intact.
        let dir = self.require_volume_dir(project, &volume.name).await?;
        let data = dir.join("data");
        if !data.exists() {
            return Err(Error::driver(&volume.name, "Volume data directory is missing"));
        }

        Ok(())
    }

    async fn import_bucket(&self, project: &str, config: &BackupConfig) -> Result<()> {
        let bucket = config
            .bucket
            .as_ref()
            .ok_or_else(|| Error::BadRequest("Manifest has no bucket block".to_string()))?;

        let dir = self.instance_dir("buckets", project, &bucket.name)?;
        if !dir.exists() {
            return Err(Error::driver(&bucket.name, "Bucket directory is missing"));
        }

        Ok(())
    }

    async fn import_instance(&self, project: &str, config: &BackupConfig) -> Result<()> {
        let container = config
            .container
            .as_ref()
            .ok_or_else(|| Error::BadRequest("Manifest has no instance block".to_string()))?;

        let type_dir = match container.instance_type.as_str() {
            "virtual-machine" => "virtual-machines",
            _ => "containers",
        };

        let dir = self.instance_dir(type_dir, project, &container.name)?;
        if !dir.exists() {
            return Err(Error::driver(&container.name, "Instance volume directory is missing"));
        }

        // Recreate the device mount path.
        let devices = paths::instance_devices_dir(&container.name);
        fs::create_dir_all(&devices)
            .await
            .map_err(|e| Error::Io { path: devices, source: e })?;

        Ok(())
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn rename_custom_volume(&self, project: &str, name: &str, new_name: &str) -> Result<()> {
        let src = self.require_volume_dir(project, name).await?;
        let dst = self.volume_dir(project, new_name)?;
        if dst.exists() {
            return Err(Error::Conflict(format!("Volume {:?} already exists on disk", new_name)));
        }

        fs::rename(&src, &dst).await.map_err(|e| Error::Io { path: dst.clone(), source: e })?;

        let mut manifest = Self::read_manifest(&dst).await?;
        if let Some(volume) = manifest.volume.as_mut() {
            volume.name = new_name.to_string();
        }
        Self::write_manifest(&dst, &manifest).await?;

        info!(from = %name, to = %new_name, "Renamed custom volume");
        Ok(())
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn delete_custom_volume(&self, project: &str, name: &str) -> Result<()> {
        let dir = self.volume_dir(project, name)?;
        if dir.exists() {
            fs::remove_dir_all(&dir).await.map_err(|e| Error::Io { path: dir, source: e })?;
        }

        info!(volume = %name, "Deleted custom volume");
        Ok(())
    }

    async fn update_custom_volume(
        &self,
        project: &str,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<()> {
        let dir = self.require_volume_dir(project, name).await?;

        let mut manifest = Self::read_manifest(&dir).await?;
        if let Some(volume) = manifest.volume.as_mut() {
            volume.config = config.clone();
        }

        Self::write_manifest(&dir, &manifest).await
    }

    async fn refresh_custom_volume(
        &self,
        project: &str,
        src_project: &str,
        name: &str,
        src_name: &str,
        src_pool: &dyn PoolDriver,
        with_snapshots: bool,
        exclude_older: bool,
    ) -> Result<()> {
        let Some(src) = src_pool.as_any().downcast_ref::<DirDriver>() else {
            return Err(Error::Unsupported(
                "The dir driver can only refresh volumes from dir pools".to_string(),
            ));
        };

        let src_dir = src.require_volume_dir(src_project, src_name).await?;
        let dst_dir = self.require_volume_dir(project, name).await?;

        // Replace the data with the source's current state.
        let dst_data = dst_dir.join("data");
        if dst_data.exists() {
            fs::remove_dir_all(&dst_data)
                .await
                .map_err(|e| Error::Io { path: dst_data.clone(), source: e })?;
        }
        copy_dir(&src_dir.join("data"), &dst_data).await?;

        if !with_snapshots {
            return Ok(());
        }

        let src_manifest = Self::read_manifest(&src_dir).await?;
        let mut dst_manifest = Self::read_manifest(&dst_dir).await?;

        // The newest destination snapshot bounds what an exclude-older
        // refresh will pull over.
        let newest_dst = dst_manifest
            .volume_snapshots
            .iter()
            .filter_map(|s| s.created_at)
            .max();

        for snap in &src_manifest.volume_snapshots {
            if dst_manifest.volume_snapshots.iter().any(|s| s.name == snap.name) {
                continue;
            }

            if exclude_older {
                if let (Some(created), Some(bound)) = (snap.created_at, newest_dst) {
                    if created < bound {
                        continue;
                    }
                }
            }

            let src_snap = src_dir.join("snapshots").join(&snap.name);
            let dst_snap = dst_dir.join("snapshots").join(&snap.name);
            copy_dir(&src_snap, &dst_snap).await?;
            dst_manifest.volume_snapshots.push(snap.clone());
        }

        Self::write_manifest(&dst_dir, &dst_manifest).await
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn restore_custom_volume(&self, project: &str, name: &str, snapshot: &str) -> Result<()> {
        let dir = self.require_volume_dir(project, name).await?;

        let snap_dir = dir.join("snapshots").join(snapshot);
        if !snap_dir.exists() {
            return Err(Error::NotFound(format!("Snapshot {:?}", snapshot)));
        }

        let data = dir.join("data");
        if data.exists() {
            fs::remove_dir_all(&data)
                .await
                .map_err(|e| Error::Io { path: data.clone(), source: e })?;
        }
        copy_dir(&snap_dir, &data).await?;

        info!(volume = %name, snapshot = %snapshot, "Restored volume from snapshot");
        Ok(())
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn create_volume_snapshot(
        &self,
        project: &str,
        volume: &str,
        snapshot: &str,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let dir = self.require_volume_dir(project, volume).await?;

        let snap_dir = dir.join("snapshots").join(snapshot);
        if snap_dir.exists() {
            return Err(Error::Conflict(format!("Snapshot {:?} already exists", snapshot)));
        }

        copy_dir(&dir.join("data"), &snap_dir).await?;

        let mut manifest = Self::read_manifest(&dir).await?;
        manifest.volume_snapshots.push(VolumeSnapshotSpec {
            name: snapshot.to_string(),
            description: String::new(),
            config: HashMap::new(),
            expires_at: expiry,
            created_at: Some(Utc::now()),
        });
        Self::write_manifest(&dir, &manifest).await?;

        info!(volume = %volume, snapshot = %snapshot, "Created volume snapshot");
        Ok(())
    }

    async fn rename_volume_snapshot(
        &self,
        project: &str,
        volume: &str,
        snapshot: &str,
        new_name: &str,
    ) -> Result<()> {
        let dir = self.require_volume_dir(project, volume).await?;

        let src = dir.join("snapshots").join(snapshot);
        let dst = dir.join("snapshots").join(new_name);
        if !src.exists() {
            return Err(Error::NotFound(format!("Snapshot {:?}", snapshot)));
        }
        if dst.exists() {
            return Err(Error::Conflict(format!("Snapshot {:?} already exists", new_name)));
        }

        fs::rename(&src, &dst).await.map_err(|e| Error::Io { path: dst, source: e })?;

        let mut manifest = Self::read_manifest(&dir).await?;
        for snap in manifest.volume_snapshots.iter_mut() {
            if snap.name == snapshot {
                snap.name = new_name.to_string();
            }
        }
        Self::write_manifest(&dir, &manifest).await
    }

    #[instrument(skip(self), fields(pool = %self.pool_name))]
    async fn delete_volume_snapshot(
        &self,
        project: &str,
        volume: &str,
        snapshot: &str,
    ) -> Result<()> {
        let dir = self.require_volume_dir(project, volume).await?;

        let snap_dir = dir.join("snapshots").join(snapshot);
        if snap_dir.exists() {
            fs::remove_dir_all(&snap_dir)
                .await
                .map_err(|e| Error::Io { path: snap_dir, source: e })?;
        }

        let mut manifest = Self::read_manifest(&dir).await?;
        manifest.volume_snapshots.retain(|s| s.name != snapshot);
        Self::write_manifest(&dir, &manifest).await?;

        info!(volume = %volume, snapshot = %snapshot, "Deleted volume snapshot");
        Ok(())
    }

    async fn set_instance_quota(
        &self,
        project: &str,
        instance: &str,
        size: &str,
        size_state: &str,
    ) -> Result<()> {
        // The dir driver cannot enforce quotas; it records them so a later
        // driver change can pick them up.
        for type_dir in ["containers", "virtual-machines"] {
            let dir = self.instance_dir(type_dir, project, instance)?;
            if dir.exists() {
                let quota = dir.join("quota");
                fs::write(&quota, format!("{}\n{}\n", size, size_state))
                    .await
                    .map_err(|e| Error::Io { path: quota, source: e })?;
                return Ok(());
            }
        }

        Err(Error::NotFound(format!("Instance volume {:?}", instance)))
    }

    async fn export_custom_volume(
        &self,
        project: &str,
        name: &str,
        with_snapshots: bool,
        mut writer: VolumeWriter,
    ) -> Result<()> {
        let dir = self.require_volume_dir(project, name).await?;

        let scratch = scratch_path("export");
        pack_volume_tarball(&dir, &scratch, with_snapshots).await?;

        let mut file = fs::File::open(&scratch)
            .await
            .map_err(|e| Error::Io { path: scratch.clone(), source: e })?;
        let copied = tokio::io::copy(&mut file, &mut writer)
            .await
            .map_err(|e| Error::Io { path: scratch.clone(), source: e });
        let _ = fs::remove_file(&scratch).await;
        copied?;

        writer
            .shutdown()
            .await
            .map_err(|e| Error::Io { path: dir, source: e })?;

        Ok(())
    }

    async fn import_custom_volume_stream(
        &self,
        project: &str,
        name: &str,
        config: &HashMap<String, String>,
        content_type: ContentType,
        mut reader: VolumeReader,
    ) -> Result<()> {
        let scratch = scratch_path("import");
        if let Some(parent) = scratch.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Io { path: parent.to_path_buf(), source: e })?;
        }

        let mut file = fs::File::create(&scratch)
            .await
            .map_err(|e| Error::Io { path: scratch.clone(), source: e })?;
        let copied = tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|e| Error::Io { path: scratch.clone(), source: e });
        drop(file);
        if let Err(e) = copied {
            let _ = fs::remove_file(&scratch).await;
            return Err(e);
        }

        let dir = self.volume_dir(project, name)?;
        let result = unpack_volume_tarball(&scratch, &dir).await;
        let _ = fs::remove_file(&scratch).await;
        result?;

        // The stream's manifest describes the source identity; rewrite it
        // for the destination.
        let mut manifest = Self::read_manifest(&dir).await.unwrap_or_default();
        manifest.pool = Some(self.pool_spec());
        manifest.volume = Some(VolumeSpec {
            name: name.to_string(),
            description: String::new(),
            content_type: content_type.as_str().to_string(),
            config: config.clone(),
            created_at: Some(Utc::now()),
        });

        Self::write_manifest(&dir, &manifest).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn scratch_path(kind: &str) -> PathBuf {
    paths::backups_dir().join(format!(
        "{}_{}_{}",
        paths::BACKUP_WORKING_DIR_PREFIX,
        kind,
        uuid::Uuid::new_v4()
    ))
}

/// Recursively copy a directory on the blocking pool.
async fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();

    tokio::task::spawn_blocking(move || copy_dir_blocking(&src, &dst))
        .await
        .map_err(|e| Error::Internal(format!("Copy task failed: {}", e)))?
}

fn copy_dir_blocking(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst).map_err(|e| Error::Io { path: dst.to_path_buf(), source: e })?;

    for entry in
        std::fs::read_dir(src).map_err(|e| Error::Io { path: src.to_path_buf(), source: e })?
    {
        let entry = entry.map_err(|e| Error::Io { path: src.to_path_buf(), source: e })?;
        let target = dst.join(entry.file_name());
        let file_type =
            entry.file_type().map_err(|e| Error::Io { path: entry.path(), source: e })?;

        if file_type.is_dir() {
            copy_dir_blocking(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)
                .map_err(|e| Error::Io { path: target.clone(), source: e })?;
        }
    }

    Ok(())
}

/// Pack a volume directory into a tarball at `dst`.
async fn pack_volume_tarball(dir: &Path, dst: &Path, with_snapshots: bool) -> Result<()> {
    let dir = dir.to_path_buf();
    let dst = dst.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        if let Some(parent) = dst.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Io { path: parent.to_path_buf(), source: e })?;
        }

        let file = std::fs::File::create(&dst)
            .map_err(|e| Error::Io { path: dst.clone(), source: e })?;
        let mut builder = tar::Builder::new(file);

        builder
            .append_path_with_name(dir.join(MANIFEST_FILE), "backup/backup.yaml")
            .map_err(|e| Error::Io { path: dir.clone(), source: e })?;
        builder
            .append_dir_all("backup/volume", dir.join("data"))
            .map_err(|e| Error::Io { path: dir.clone(), source: e })?;

        let snapshots = dir.join("snapshots");
        if with_snapshots && snapshots.exists() {
            builder
                .append_dir_all("backup/volume-snapshots", &snapshots)
                .map_err(|e| Error::Io { path: snapshots.clone(), source: e })?;
        }

        builder.finish().map_err(|e| Error::Io { path: dst.clone(), source: e })?;
        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("Pack task failed: {}", e)))?
}

/// Unpack a volume tarball produced by [`pack_volume_tarball`] (or an
/// uploaded backup) into a volume directory.
async fn unpack_volume_tarball(tarball: &Path, dir: &Path) -> Result<()> {
    let tarball = tarball.to_path_buf();
    let dir = dir.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<()> {
        use std::io::Read;

        let file = std::fs::File::open(&tarball)
            .map_err(|e| Error::Io { path: tarball.clone(), source: e })?;
        let mut archive = tar::Archive::new(file);

        std::fs::create_dir_all(dir.join("data"))
            .map_err(|e| Error::Io { path: dir.clone(), source: e })?;

        for entry in archive
            .entries()
            .map_err(|e| Error::BadRequest(format!("Invalid backup tarball: {}", e)))?
        {
            let mut entry =
                entry.map_err(|e| Error::BadRequest(format!("Invalid backup tarball: {}", e)))?;
            let path = entry
                .path()
                .map_err(|e| Error::BadRequest(format!("Invalid backup tarball: {}", e)))?
                .into_owned();

            let target = if let Ok(rest) = path.strip_prefix("backup/volume-snapshots") {
                dir.join("snapshots").join(rest)
            } else if let Ok(rest) = path.strip_prefix("backup/volume") {
                dir.join("data").join(rest)
            } else if path == Path::new("backup/backup.yaml") {
                dir.join(MANIFEST_FILE)
            } else {
                continue;
            };

            if entry.header().entry_type().is_dir() {
                std::fs::create_dir_all(&target)
                    .map_err(|e| Error::Io { path: target.clone(), source: e })?;
                continue;
            }

            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Io { path: parent.to_path_buf(), source: e })?;
            }

            let mut data = Vec::new();
            entry
                .read_to_end(&mut data)
                .map_err(|e| Error::Io { path: target.clone(), source: e })?;
            std::fs::write(&target, data)
                .map_err(|e| Error::Io { path: target.clone(), source: e })?;
        }

        Ok(())
    })
    .await
    .map_err(|e| Error::Internal(format!("Unpack task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(root: &Path) -> DirDriver {
        let mut config = HashMap::new();
        config.insert("source".to_string(), root.to_string_lossy().into_owned());
        DirDriver::new("test-pool", config)
    }

    #[tokio::test]
    async fn test_mount_is_refcounted() {
        let tmp = tempfile::tempdir().unwrap();
        let drv = driver(tmp.path());

        assert!(drv.mount().await.unwrap());
        assert!(!drv.mount().await.unwrap());
        assert!(drv.unmount().await.unwrap());
        assert!(!drv.unmount().await.unwrap());
    }

    #[tokio::test]
    async fn test_volume_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let drv = driver(tmp.path());
        drv.mount().await.unwrap();

        drv.create_custom_volume("default", "vol1", "", &HashMap::new(), ContentType::Filesystem)
            .await
            .unwrap();

        // Double create fails.
        assert!(drv
            .create_custom_volume("default", "vol1", "", &HashMap::new(), ContentType::Filesystem)
            .await
            .is_err());

        drv.create_volume_snapshot("default", "vol1", "snap0", None).await.unwrap();
        drv.rename_custom_volume("default", "vol1", "vol2").await.unwrap();

        let unknown = drv.list_unknown_volumes().await.unwrap();
        let vols = unknown.get("default").unwrap();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].volume.as_ref().unwrap().name, "vol2");
        assert_eq!(vols[0].volume_snapshots.len(), 1);

        drv.delete_custom_volume("default", "vol2").await.unwrap();
        assert!(drv.list_unknown_volumes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_from_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let drv = driver(tmp.path());
        drv.mount().await.unwrap();

        drv.create_custom_volume("default", "vol1", "", &HashMap::new(), ContentType::Filesystem)
            .await
            .unwrap();

        let data = drv.volume_dir("default", "vol1").unwrap().join("data");
        fs::write(data.join("file"), b"before").await.unwrap();
        drv.create_volume_snapshot("default", "vol1", "snap0", None).await.unwrap();
        fs::write(data.join("file"), b"after").await.unwrap();

        drv.restore_custom_volume("default", "vol1", "snap0").await.unwrap();
        let content = fs::read(data.join("file")).await.unwrap();
        assert_eq!(content, b"before");
    }

    #[tokio::test]
    async fn test_copy_between_pools() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let src = driver(tmp_a.path());
        let dst = driver(tmp_b.path());
        src.mount().await.unwrap();
        dst.mount().await.unwrap();

        src.create_custom_volume("default", "vol1", "", &HashMap::new(), ContentType::Filesystem)
            .await
            .unwrap();
        src.create_volume_snapshot("default", "vol1", "snap0", None).await.unwrap();

        dst.create_custom_volume_from_copy("default", "default", "vol1", "vol1", &src, true)
            .await
            .unwrap();

        let unknown = dst.list_unknown_volumes().await.unwrap();
        let vols = unknown.get("default").unwrap();
        assert_eq!(vols[0].volume_snapshots.len(), 1);

        // Volume-only copy drops the snapshots.
        dst.create_custom_volume_from_copy("default", "default", "vol2", "vol1", &src, false)
            .await
            .unwrap();
        let unknown = dst.list_unknown_volumes().await.unwrap();
        let vol2 = unknown
            .get("default")
            .unwrap()
            .iter()
            .find(|c| c.volume.as_ref().unwrap().name == "vol2")
            .unwrap();
        assert!(vol2.volume_snapshots.is_empty());
    }

    #[tokio::test]
    async fn test_export_import_stream_roundtrip() {
        let tmp_a = tempfile::tempdir().unwrap();
        let tmp_b = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        std::env::set_var("BURROW_DATA_DIR", scratch.path());

        let src = driver(tmp_a.path());
        let dst = driver(tmp_b.path());
        src.mount().await.unwrap();
        dst.mount().await.unwrap();

        src.create_custom_volume("default", "vol1", "", &HashMap::new(), ContentType::Filesystem)
            .await
            .unwrap();
        let data = src.volume_dir("default", "vol1").unwrap().join("data");
        fs::write(data.join("payload"), b"bytes").await.unwrap();
        src.create_volume_snapshot("default", "vol1", "snap0", None).await.unwrap();

        let (rx, tx) = tokio::io::duplex(64 * 1024);
        let export = tokio::spawn({
            let src_dir = tmp_a.path().to_path_buf();
            async move {
                let drv = driver(&src_dir);
                drv.export_custom_volume("default", "vol1", true, Box::pin(tx)).await
            }
        });

        dst.import_custom_volume_stream(
            "default",
            "vol1",
            &HashMap::new(),
            ContentType::Filesystem,
            Box::pin(rx),
        )
        .await
        .unwrap();

        export.await.unwrap().unwrap();

        let imported = dst.volume_dir("default", "vol1").unwrap();
        let content = fs::read(imported.join("data").join("payload")).await.unwrap();
        assert_eq!(content, b"bytes");
        assert!(imported.join("snapshots").join("snap0").exists());
    }
}
