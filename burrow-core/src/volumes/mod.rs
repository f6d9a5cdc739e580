//! Custom volume lifecycle management.
//!
//! All externally triggered volume mutations go through [`VolumeService`]:
//! create (empty, copy, migration, ISO, backup), update, rename, move,
//! delete and restore. Mutations on one volume identity are serialized
//! through a per-identity lock; readers never block.

use crate::catalog::NewVolume;
use crate::cluster::NODE_ID_REMOTE;
use crate::error::{Error, Result};
use crate::ops::{Operation, Reverter};
use crate::pools::Pool;
use crate::server::Server;
use crate::types::api::{VolumeInfo, VolumePut};
use crate::types::volume::{self, etag, is_snapshot};
use crate::types::{ContentType, Volume, VolumeType};
use crate::usedby;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{info, instrument};

mod create;
mod post;

/// Result of a dispatching endpoint: finished synchronously or running as a
/// background operation.
pub enum Outcome {
    /// The mutation completed within the request.
    Done,
    /// The mutation continues in the returned operation.
    Async(Operation),
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::Done => write!(f, "Outcome::Done"),
            Outcome::Async(_) => write!(f, "Outcome::Async(..)"),
        }
    }
}

/// The volume lifecycle manager. Clones share state.
#[derive(Clone)]
pub struct VolumeService {
    server: Arc<Server>,
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl VolumeService {
    /// Create the service.
    pub fn new(server: Arc<Server>) -> Self {
        Self { server, locks: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }

    pub(crate) fn clone_service(&self) -> Self {
        self.clone()
    }

    /// Serialize mutating operations on one volume identity.
    pub(crate) async fn lock_identity(
        &self,
        pool: &str,
        project: &str,
        volume_type: VolumeType,
        name: &str,
    ) -> OwnedMutexGuard<()> {
        let key = format!("{}/{}/{}/{}", pool, project, volume_type, name);

        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(key).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };

        lock.lock_owned().await
    }

    /// The node ID new volumes on this pool get.
    pub(crate) fn node_id_for(&self, pool: &Pool) -> i64 {
        if pool.driver().info().remote {
            NODE_ID_REMOTE
        } else {
            self.server.cluster.member_id
        }
    }

    /// Render a volume for the API, used-by included.
    pub(crate) async fn volume_info(&self, pool_name: &str, volume: &Volume) -> Result<VolumeInfo> {
        let used_by = usedby::volume_used_by(&self.server.catalog, pool_name, volume).await?;

        // Location is only meaningful on clustered servers with member-bound
        // (non-remote) volumes.
        let location = if !self.server.cluster.clustered || volume.node_id == NODE_ID_REMOTE {
            String::new()
        } else {
            volume.location.clone()
        };

        Ok(VolumeInfo {
            name: volume.name.clone(),
            volume_type: volume.volume_type.as_str().to_string(),
            content_type: volume.content_type.as_str().to_string(),
            description: volume.description.clone(),
            config: volume.config.clone(),
            location,
            created_at: volume.created_at,
            expires_at: volume.expiry_at,
            used_by,
        })
    }

    // ========================
    // Read paths
    // ========================

    /// List volumes on a pool, optionally filtered by project and type.
    /// Snapshots are not listed here.
    pub async fn list(
        &self,
        pool_name: &str,
        request_project: Option<&str>,
        all_projects: bool,
        volume_type: Option<VolumeType>,
    ) -> Result<Vec<VolumeInfo>> {
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let project = if all_projects {
            None
        } else {
            let (_, effective) =
                self.server.storage_project(request_project.unwrap_or_default()).await?;
            Some(effective)
        };

        let volumes = self
            .server
            .catalog
            .volumes(&crate::catalog::VolumeFilter {
                pool_id: Some(pool.id()),
                project,
                volume_type,
                node_id: None,
                include_snapshots: false,
            })
            .await?;

        let mut out = Vec::with_capacity(volumes.len());
        for volume in &volumes {
            out.push(self.volume_info(pool_name, volume).await?);
        }

        Ok(out)
    }

    /// Get one volume plus its ETag.
    pub async fn get(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_type: VolumeType,
        name: &str,
    ) -> Result<(VolumeInfo, String)> {
        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let volume =
            self.server.catalog.volume(pool.id(), &effective, volume_type, name, None).await?;

        let tag = etag(&volume.name, volume.volume_type, &volume.config);
        let info = self.volume_info(pool_name, &volume).await?;

        Ok((info, tag))
    }

    // ========================
    // Update
    // ========================

    /// Replace a volume's description and config; optionally restore it
    /// from one of its snapshots first.
    ///
    /// `if_match` is the caller's ETag; a mismatch fails with
    /// `PreconditionFailed` before anything happens.
    #[instrument(skip(self, put), fields(pool = %pool_name, volume = %name))]
    pub async fn update(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_type: VolumeType,
        name: &str,
        put: VolumePut,
        if_match: Option<&str>,
    ) -> Result<()> {
        if volume_type != VolumeType::Custom {
            return Err(Error::BadRequest(format!(
                "Storage volumes of type {:?} cannot be updated",
                volume_type.as_str()
            )));
        }

        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let _guard = self.lock_identity(pool_name, &effective, volume_type, name).await;

        let current =
            self.server.catalog.volume(pool.id(), &effective, volume_type, name, None).await?;

        if let Some(tag) = if_match {
            let current_tag = etag(&current.name, current.volume_type, &current.config);
            if tag != current_tag {
                return Err(Error::PreconditionFailed(
                    "ETag doesn't match the volume's current state".to_string(),
                ));
            }
        }

        // Restore happens before any config delta in the same request.
        if !put.restore.is_empty() {
            let snapshot_name = volume::join_snapshot_name(name, &put.restore);
            if !self
                .server
                .catalog
                .volume_exists(pool.id(), &effective, volume_type, &snapshot_name)
                .await?
            {
                return Err(Error::NotFound(format!("Snapshot {:?}", put.restore)));
            }

            pool.driver()
                .restore_custom_volume(&effective, name, &put.restore)
                .await
                .map_err(|e| Error::driver(name, e))?;

            info!(snapshot = %put.restore, "Restored volume from snapshot");
        }

        let description = put.description.unwrap_or(current.description);
        let config = put.config.unwrap_or(current.config);

        pool.driver()
            .update_custom_volume(&effective, name, &config)
            .await
            .map_err(|e| Error::driver(name, e))?;

        self.server.catalog.update_volume(current.id, &description, &config, None).await?;

        Ok(())
    }

    /// Merge the supplied config over the current one, then update.
    pub async fn patch(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_type: VolumeType,
        name: &str,
        put: VolumePut,
        if_match: Option<&str>,
    ) -> Result<()> {
        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;
        let current =
            self.server.catalog.volume(pool.id(), &effective, volume_type, name, None).await?;

        let mut config = current.config.clone();
        if let Some(delta) = put.config {
            config.extend(delta);
        }

        self.update(
            pool_name,
            request_project,
            volume_type,
            name,
            VolumePut {
                description: put.description.or(Some(current.description)),
                config: Some(config),
                restore: put.restore,
            },
            if_match,
        )
        .await
    }

    // ========================
    // Delete
    // ========================

    /// Delete a custom or image volume.
    ///
    /// Rejected while consumers exist, except the self-referential image
    /// record of an image volume.
    #[instrument(skip(self), fields(pool = %pool_name, volume = %name))]
    pub async fn delete(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_type: VolumeType,
        name: &str,
    ) -> Result<()> {
        if is_snapshot(name) {
            return Err(Error::BadRequest(format!("Invalid storage volume {:?}", name)));
        }

        if volume_type != VolumeType::Custom && volume_type != VolumeType::Image {
            return Err(Error::BadRequest(format!(
                "Storage volumes of type {:?} cannot be deleted with the storage API",
                volume_type.as_str()
            )));
        }

        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let _guard = self.lock_identity(pool_name, &effective, volume_type, name).await;

        let volume =
            self.server.catalog.volume(pool.id(), &effective, volume_type, name, None).await?;

        let used_by = usedby::volume_used_by(&self.server.catalog, pool_name, &volume).await?;
        let only_self_image = used_by.len() == 1
            && volume_type == VolumeType::Image
            && usedby::is_image_url(&used_by[0], name);

        if !used_by.is_empty() && !only_self_image {
            return Err(Error::BadRequest("The storage volume is still in use".to_string()));
        }

        pool.driver()
            .delete_custom_volume(&effective, name)
            .await
            .map_err(|e| Error::driver(name, e))?;

        self.server.catalog.delete_volume(pool.id(), &effective, volume_type, name).await?;

        info!("Deleted storage volume");
        Ok(())
    }

    // ========================
    // Shared helpers for create/copy paths
    // ========================

    /// Insert the catalog rows for a volume that the driver just created,
    /// undo registered on `reverter`.
    pub(crate) async fn commit_volume_rows(
        &self,
        pool: &Arc<Pool>,
        project: &str,
        name: &str,
        description: &str,
        config: &HashMap<String, String>,
        content_type: ContentType,
        reverter: &Reverter,
    ) -> Result<i64> {
        let id = self
            .server
            .catalog
            .create_volume(&NewVolume {
                pool_id: pool.id(),
                project: project.to_string(),
                name: name.to_string(),
                volume_type: VolumeType::Custom,
                content_type,
                description: description.to_string(),
                config: config.clone(),
                node_id: self.node_id_for(pool),
                created_at: Utc::now(),
                expiry_at: None,
            })
            .await?;

        let catalog = self.server.catalog.clone();
        let pool_id = pool.id();
        let project = project.to_string();
        let name = name.to_string();
        reverter.add(move || async move {
            let _ = catalog.delete_volume(pool_id, &project, VolumeType::Custom, &name).await;
        });

        Ok(id)
    }

    /// Replicate the snapshot rows of a source volume onto a destination
    /// volume (post-copy), undo covered by the destination volume hook.
    pub(crate) async fn replicate_snapshot_rows(
        &self,
        src_pool_id: i64,
        src_project: &str,
        src_name: &str,
        dst_pool: &Arc<Pool>,
        dst_project: &str,
        dst_name: &str,
        content_type: ContentType,
    ) -> Result<()> {
        let snapshots = self
            .server
            .catalog
            .snapshots_of(src_pool_id, src_project, VolumeType::Custom, src_name)
            .await?;

        for snapshot in snapshots {
            let snap_only = volume::split_snapshot_name(&snapshot.name).1;

            self.server
                .catalog
                .create_volume(&NewVolume {
                    pool_id: dst_pool.id(),
                    project: dst_project.to_string(),
                    name: volume::join_snapshot_name(dst_name, snap_only),
                    volume_type: VolumeType::Custom,
                    content_type,
                    description: snapshot.description.clone(),
                    config: snapshot.config.clone(),
                    node_id: self.node_id_for(dst_pool),
                    created_at: snapshot.created_at,
                    expiry_at: snapshot.expiry_at,
                })
                .await?;
        }

        Ok(())
    }

    /// Update every instance and profile device that references
    /// `(old_pool, old_name)` to reference `(new_pool, new_name)`.
    pub(crate) async fn update_volume_users(
        &self,
        project: &str,
        old_pool: &str,
        old_name: &str,
        new_pool: &str,
        new_name: &str,
    ) -> Result<()> {
        fn rewrite(
            devices: &mut HashMap<String, HashMap<String, String>>,
            old_pool: &str,
            old_name: &str,
            new_pool: &str,
            new_name: &str,
        ) -> bool {
            let mut changed = false;
            for cfg in devices.values_mut() {
                if cfg.get("type").map(String::as_str) == Some("disk")
                    && cfg.get("pool").map(String::as_str) == Some(old_pool)
                    && cfg.get("source").map(String::as_str) == Some(old_name)
                {
                    cfg.insert("pool".to_string(), new_pool.to_string());
                    cfg.insert("source".to_string(), new_name.to_string());
                    changed = true;
                }
            }
            changed
        }

        for instance in self.server.catalog.instances().await? {
            if instance.project != project {
                continue;
            }

            let mut devices = instance.devices.clone();
            let mut expanded = instance.expanded_devices.clone();
            let changed = rewrite(&mut devices, old_pool, old_name, new_pool, new_name)
                | rewrite(&mut expanded, old_pool, old_name, new_pool, new_name);

            if changed {
                self.server
                    .catalog
                    .update_instance_devices(instance.id, &devices, &expanded)
                    .await?;
            }
        }

        for profile in self.server.catalog.profiles().await? {
            if profile.project != project {
                continue;
            }

            let mut devices = profile.devices.clone();
            if rewrite(&mut devices, old_pool, old_name, new_pool, new_name) {
                self.server.catalog.update_profile_devices(profile.id, &devices).await?;
            }
        }

        Ok(())
    }
}
