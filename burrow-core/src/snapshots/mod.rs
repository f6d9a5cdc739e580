//! Custom volume snapshot management.
//!
//! Manual snapshots come in through [`SnapshotService`]; scheduled creation
//! and expiry live in [`scheduler`]. Snapshot rows are volumes named
//! `parent/snap` sharing the parent's pool, project and type.

use crate::catalog::NewVolume;
use crate::error::{Error, Result};
use crate::ops::{Operation, OperationClass, Reverter};
use crate::project;
use crate::server::Server;
use crate::types::api::{SnapshotPut, SnapshotsPost, VolumeInfo};
use crate::types::volume::{self, etag};
use crate::types::{Volume, VolumeType};
use crate::usedby;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{info, instrument};

pub mod scheduler;

/// Default snapshot naming pattern.
pub const DEFAULT_PATTERN: &str = "snap%d";

/// The snapshot manager. Clones share state.
#[derive(Clone)]
pub struct SnapshotService {
    server: Arc<Server>,
    /// IDs of snapshots currently being pruned; the only cross-task shared
    /// state of the snapshot subsystem.
    running_prunes: Arc<Mutex<HashSet<i64>>>,
}

impl SnapshotService {
    /// Create the service.
    pub fn new(server: Arc<Server>) -> Self {
        Self { server, running_prunes: Arc::new(Mutex::new(HashSet::new())) }
    }

    pub(crate) fn server(&self) -> &Arc<Server> {
        &self.server
    }

    /// Try to claim a snapshot ID for pruning. Returns false when another
    /// task is already deleting it.
    pub(crate) fn claim_prune(&self, id: i64) -> bool {
        self.running_prunes.lock().expect("prune set lock poisoned").insert(id)
    }

    /// Release a pruning claim.
    pub(crate) fn release_prune(&self, id: i64) {
        self.running_prunes.lock().expect("prune set lock poisoned").remove(&id);
    }

    /// Derive the next snapshot name for a volume from its pattern.
    ///
    /// `%d` may appear at most once; when present it is substituted with
    /// the smallest free index. A literal pattern that is already taken
    /// gets the index appended.
    pub async fn next_snapshot_name(&self, pool_id: i64, volume: &Volume) -> Result<String> {
        let pattern = volume
            .config
            .get("snapshots.pattern")
            .cloned()
            .unwrap_or_else(|| DEFAULT_PATTERN.to_string());

        let placeholders = pattern.matches("%d").count();
        if placeholders > 1 {
            return Err(Error::BadRequest(
                "Snapshot pattern may contain '%d' only once".to_string(),
            ));
        }

        if placeholders == 1 {
            let index = self
                .server
                .catalog
                .next_snapshot_index(
                    pool_id,
                    &volume.project,
                    volume.volume_type,
                    &volume.name,
                    &pattern,
                )
                .await?;
            return Ok(pattern.replacen("%d", &index.to_string(), 1));
        }

        // Literal pattern: use as-is unless taken, then append an index.
        let taken = self
            .server
            .catalog
            .volume_exists(
                pool_id,
                &volume.project,
                volume.volume_type,
                &volume::join_snapshot_name(&volume.name, &pattern),
            )
            .await?;

        if !taken {
            return Ok(pattern);
        }

        let indexed = format!("{}%d", pattern);
        let index = self
            .server
            .catalog
            .next_snapshot_index(pool_id, &volume.project, volume.volume_type, &volume.name, &indexed)
            .await?;

        Ok(indexed.replacen("%d", &index.to_string(), 1))
    }

    /// Create a snapshot of a custom volume as a background operation.
    #[instrument(skip(self, req), fields(pool = %pool_name, volume = %volume_name))]
    pub async fn create(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_name: &str,
        req: SnapshotsPost,
    ) -> Result<Operation> {
        let (project_record, effective) = self.server.storage_project(request_project).await?;
        project::allow_snapshot_creation(&project_record)?;

        if usedby::volume_used_by_daemon(&self.server.catalog, pool_name, volume_name).await? {
            return Err(Error::BadRequest(
                "Volumes used by the daemon itself cannot have snapshots".to_string(),
            ));
        }

        let pool = self.server.pools.load_by_name(pool_name).await?;
        let parent = self
            .server
            .catalog
            .volume(pool.id(), &effective, VolumeType::Custom, volume_name, None)
            .await?;

        let snapshot_name = if req.name.is_empty() {
            self.next_snapshot_name(pool.id(), &parent).await?
        } else {
            let full = volume::join_snapshot_name(volume_name, &req.name);
            if self
                .server
                .catalog
                .volume_exists(pool.id(), &effective, VolumeType::Custom, &full)
                .await?
            {
                return Err(Error::Conflict(format!("Snapshot {:?} already in use", req.name)));
            }
            req.name.clone()
        };

        pool.driver().validate_name(&snapshot_name)?;

        // Expiry: explicit request, else the manual default, else the
        // general default.
        let expiry = match req.expires_at {
            Some(at) => Some(at),
            None => {
                let spec = parent
                    .config
                    .get("snapshots.expiry.manual")
                    .or_else(|| parent.config.get("snapshots.expiry"))
                    .cloned()
                    .unwrap_or_default();
                project::expiry_from(Utc::now(), &spec)?
            }
        };

        let service = self.clone();
        let project = effective.clone();
        let parent_name = volume_name.to_string();
        let snap = snapshot_name.clone();
        let pool_name_owned = pool_name.to_string();

        let resources = HashMap::from([
            (
                "storage_volumes".to_string(),
                vec![format!(
                    "/1.0/storage-pools/{}/volumes/custom/{}",
                    pool_name, volume_name
                )],
            ),
            (
                "storage_volume_snapshots".to_string(),
                vec![format!(
                    "/1.0/storage-pools/{}/volumes/custom/{}/snapshots/{}",
                    pool_name, volume_name, snapshot_name
                )],
            ),
        ]);

        let op = Operation::create(
            &self.server.operations,
            &effective,
            OperationClass::Task,
            "volume_snapshot_create",
            resources,
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    op.context().check()?;
                    service
                        .create_now(&pool_name_owned, &project, &parent_name, &snap, expiry)
                        .await
                })
            }),
            None,
            None,
        );

        op.start()?;
        Ok(op)
    }

    /// Synchronous snapshot creation body, shared with the scheduler.
    pub(crate) async fn create_now(
        &self,
        pool_name: &str,
        project: &str,
        volume_name: &str,
        snapshot_name: &str,
        expiry: Option<chrono::DateTime<Utc>>,
    ) -> Result<()> {
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let parent = self
            .server
            .catalog
            .volume(pool.id(), project, VolumeType::Custom, volume_name, None)
            .await?;

        let reverter = Reverter::new();

        let result = async {
            pool.driver()
                .create_volume_snapshot(project, volume_name, snapshot_name, expiry)
                .await
                .map_err(|e| Error::driver(volume_name, e))?;

            {
                let pool = pool.clone();
                let project = project.to_string();
                let volume_name = volume_name.to_string();
                let snapshot_name = snapshot_name.to_string();
                reverter.add(move || async move {
                    let _ = pool
                        .driver()
                        .delete_volume_snapshot(&project, &volume_name, &snapshot_name)
                        .await;
                });
            }

            self.server
                .catalog
                .create_volume(&NewVolume {
                    pool_id: pool.id(),
                    project: project.to_string(),
                    name: volume::join_snapshot_name(volume_name, snapshot_name),
                    volume_type: VolumeType::Custom,
                    content_type: parent.content_type,
                    description: String::new(),
                    config: HashMap::new(),
                    node_id: parent.node_id,
                    created_at: Utc::now(),
                    expiry_at: expiry,
                })
                .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                reverter.success();
                info!(volume = %volume_name, snapshot = %snapshot_name, "Created volume snapshot");
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    /// List the snapshots of a volume.
    pub async fn list(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_name: &str,
    ) -> Result<Vec<VolumeInfo>> {
        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let snapshots = self
            .server
            .catalog
            .snapshots_of(pool.id(), &effective, VolumeType::Custom, volume_name)
            .await?;

        Ok(snapshots
            .iter()
            .map(|s| VolumeInfo {
                name: s.name.clone(),
                volume_type: s.volume_type.as_str().to_string(),
                content_type: s.content_type.as_str().to_string(),
                description: s.description.clone(),
                config: s.config.clone(),
                location: String::new(),
                created_at: s.created_at,
                expires_at: s.expiry_at,
                used_by: Vec::new(),
            })
            .collect())
    }

    /// Get a single snapshot plus its ETag.
    pub async fn get(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_name: &str,
        snapshot: &str,
    ) -> Result<(VolumeInfo, String)> {
        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let full = volume::join_snapshot_name(volume_name, snapshot);
        let row = self
            .server
            .catalog
            .volume(pool.id(), &effective, VolumeType::Custom, &full, None)
            .await?;

        let tag = etag(&row.name, row.volume_type, &row.config);

        Ok((
            VolumeInfo {
                name: row.name.clone(),
                volume_type: row.volume_type.as_str().to_string(),
                content_type: row.content_type.as_str().to_string(),
                description: row.description.clone(),
                config: row.config.clone(),
                location: String::new(),
                created_at: row.created_at,
                expires_at: row.expiry_at,
                used_by: Vec::new(),
            },
            tag,
        ))
    }

    /// Rename a snapshot.
    #[instrument(skip(self), fields(pool = %pool_name, volume = %volume_name))]
    pub async fn rename(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_name: &str,
        snapshot: &str,
        new_name: &str,
    ) -> Result<()> {
        if new_name.contains('/') {
            return Err(Error::BadRequest(
                "Snapshot names may not contain slashes".to_string(),
            ));
        }

        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let old_full = volume::join_snapshot_name(volume_name, snapshot);
        let new_full = volume::join_snapshot_name(volume_name, new_name);

        if self
            .server
            .catalog
            .volume_exists(pool.id(), &effective, VolumeType::Custom, &new_full)
            .await?
        {
            return Err(Error::Conflict(format!("Snapshot {:?} already in use", new_name)));
        }

        pool.driver()
            .rename_volume_snapshot(&effective, volume_name, snapshot, new_name)
            .await
            .map_err(|e| Error::driver(volume_name, e))?;

        self.server
            .catalog
            .rename_volume(pool.id(), &effective, VolumeType::Custom, &old_full, &new_full)
            .await?;

        info!(snapshot = %snapshot, new_name = %new_name, "Renamed volume snapshot");
        Ok(())
    }

    /// Update a snapshot's description and expiry.
    pub async fn update(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_name: &str,
        snapshot: &str,
        put: SnapshotPut,
        if_match: Option<&str>,
    ) -> Result<()> {
        let (_, effective) = self.server.storage_project(request_project).await?;
        let pool = self.server.pools.load_by_name(pool_name).await?;

        let full = volume::join_snapshot_name(volume_name, snapshot);
        let current = self
            .server
            .catalog
            .volume(pool.id(), &effective, VolumeType::Custom, &full, None)
            .await?;

        if let Some(tag) = if_match {
            let current_tag = etag(&current.name, current.volume_type, &current.config);
            if tag != current_tag {
                return Err(Error::PreconditionFailed(
                    "ETag doesn't match the snapshot's current state".to_string(),
                ));
            }
        }

        let description = put.description.unwrap_or(current.description);

        self.server
            .catalog
            .update_volume(current.id, &description, &current.config, put.expires_at)
            .await?;

        Ok(())
    }

    /// Delete a snapshot.
    #[instrument(skip(self), fields(pool = %pool_name, volume = %volume_name))]
    pub async fn delete(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_name: &str,
        snapshot: &str,
    ) -> Result<()> {
        let (_, effective) = self.server.storage_project(request_project).await?;
        self.delete_in_project(pool_name, &effective, volume_name, snapshot).await
    }

    /// Delete with an already-resolved project, shared with the scheduler.
    pub(crate) async fn delete_in_project(
        &self,
        pool_name: &str,
        project: &str,
        volume_name: &str,
        snapshot: &str,
    ) -> Result<()> {
        let pool = self.server.pools.load_by_name(pool_name).await?;
        let full = volume::join_snapshot_name(volume_name, snapshot);

        // The row must exist before we touch the disk.
        self.server
            .catalog
            .volume(pool.id(), project, VolumeType::Custom, &full, None)
            .await?;

        pool.driver()
            .delete_volume_snapshot(project, volume_name, snapshot)
            .await
            .map_err(|e| Error::driver(volume_name, e))?;

        self.server
            .catalog
            .delete_volume(pool.id(), project, VolumeType::Custom, &full)
            .await?;

        info!(snapshot = %snapshot, "Deleted volume snapshot");
        Ok(())
    }
}
