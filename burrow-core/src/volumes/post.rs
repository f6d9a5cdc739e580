//! Rename, move and migrate dispatch for a single volume.

use super::{Outcome, VolumeService};
use crate::error::{Error, Result};
use crate::migration;
use crate::ops::{Operation, OperationClass, Reverter};
use crate::types::api::{VolumePost, VolumeSource, VolumesPost};
use crate::types::volume::is_snapshot;
use crate::types::VolumeType;
use crate::usedby;
use chrono::Utc;
use std::collections::HashMap;
use tracing::{info, instrument};

impl VolumeService {
    /// Dispatch `POST /storage-pools/{pool}/volumes/{type}/{name}`:
    /// rename, move across pools/projects, or migrate across members.
    #[instrument(skip(self, req), fields(pool = %pool_name, volume = %name))]
    pub async fn rename_or_move(
        &self,
        pool_name: &str,
        request_project: &str,
        volume_type: VolumeType,
        name: &str,
        req: VolumePost,
        target: Option<&str>,
    ) -> Result<Outcome> {
        if is_snapshot(name) {
            return Err(Error::BadRequest("Invalid volume name".to_string()));
        }

        if req.name.is_empty() {
            return Err(Error::BadRequest("No name provided".to_string()));
        }

        if is_snapshot(&req.name) {
            return Err(Error::BadRequest(
                "Storage volume names may not contain slashes".to_string(),
            ));
        }

        if volume_type != VolumeType::Custom {
            return Err(Error::BadRequest(format!(
                "Renaming storage volumes of type {:?} is not allowed",
                volume_type.as_str()
            )));
        }

        let (_, effective) = self.server().storage_project(request_project).await?;

        let target_project = if req.project.is_empty() {
            effective.clone()
        } else {
            let record = self.server().catalog.project(&req.project).await?;
            let target_effective = crate::project::storage_volume_project(&record);

            // A project without its own storage would silently land the
            // volume in the default project; require targeting it directly.
            if target_effective != req.project {
                return Err(Error::BadRequest(
                    "Target project does not have storage volumes of its own".to_string(),
                ));
            }

            if target_effective == effective {
                return Err(Error::BadRequest("Project and target project are the same".to_string()));
            }

            target_effective
        };

        // Cross-member relocation.
        if self.server().cluster.clustered
            && target.is_some()
            && !req.source.location.is_empty()
            && req.migration
        {
            return self
                .relocate(pool_name, &effective, &target_project, name, req, target.unwrap_or_default())
                .await;
        }

        // Plain migration request: hand back a source operation with
        // per-channel secrets.
        if req.migration {
            let pool = self.server().pools.load_by_name(pool_name).await?;
            let op = migration::new_source_operation(
                self.server().clone(),
                pool,
                effective,
                name.to_string(),
                req.volume_only,
                None,
            )?;
            op.start()?;
            return Ok(Outcome::Async(op));
        }

        self.local_rename_or_move(pool_name, &effective, &target_project, name, req).await
    }

    /// Rename within the pool or move across pools/projects on this member.
    async fn local_rename_or_move(
        &self,
        pool_name: &str,
        project: &str,
        target_project: &str,
        name: &str,
        req: VolumePost,
    ) -> Result<Outcome> {
        let pool = self.server().pools.load_by_name(pool_name).await?;

        let target_pool_name =
            if req.pool.is_empty() { pool_name.to_string() } else { req.pool.clone() };
        let target_pool = self.server().pools.load_by_name(&target_pool_name).await?;

        // The new identity must be free.
        if self
            .server()
            .catalog
            .volume_exists(target_pool.id(), target_project, VolumeType::Custom, &req.name)
            .await?
        {
            return Err(Error::Conflict("Volume by that name already exists".to_string()));
        }

        if usedby::volume_used_by_daemon(&self.server().catalog, pool_name, name).await? {
            return Err(Error::BadRequest(
                "Volume is used by the daemon itself and cannot be renamed".to_string(),
            ));
        }

        let volume = self
            .server()
            .catalog
            .volume(pool.id(), project, VolumeType::Custom, name, None)
            .await?;

        let running =
            usedby::running_consumers(&self.server().catalog, pool_name, &volume).await?;
        if !running.is_empty() {
            return Err(Error::BadRequest(
                "Volume is still in use by running instances".to_string(),
            ));
        }

        // Same pool and same project is a rename; anything else is a move.
        if target_pool_name == pool_name && target_project == project {
            self.rename(pool_name, project, name, &req.name).await?;
            return Ok(Outcome::Done);
        }

        let service = self.clone_service();
        let src_pool_name = pool_name.to_string();
        let src_project = project.to_string();
        let dst_project = target_project.to_string();
        let src_name = name.to_string();

        let op = Operation::create(
            &self.server().operations,
            &src_project.clone(),
            OperationClass::Task,
            "volume_move",
            HashMap::new(),
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    op.context().check()?;
                    service
                        .move_volume(
                            &src_pool_name,
                            &src_project,
                            &src_name,
                            &target_pool_name,
                            &dst_project,
                            &req.name,
                        )
                        .await
                })
            }),
            None,
            None,
        );

        op.start()?;
        Ok(Outcome::Async(op))
    }

    /// Rename a volume in place: update consumers, then the driver, then
    /// the catalog.
    pub(crate) async fn rename(
        &self,
        pool_name: &str,
        project: &str,
        name: &str,
        new_name: &str,
    ) -> Result<()> {
        let pool = self.server().pools.load_by_name(pool_name).await?;

        let _guard = self.lock_identity(pool_name, project, VolumeType::Custom, name).await;

        let reverter = Reverter::new();

        let result = async {
            self.update_volume_users(project, pool_name, name, pool_name, new_name).await?;

            {
                let service = self.clone_service();
                let project = project.to_string();
                let pool_name = pool_name.to_string();
                let name = name.to_string();
                let new_name = new_name.to_string();
                reverter.add(move || async move {
                    let _ = service
                        .update_volume_users(&project, &pool_name, &new_name, &pool_name, &name)
                        .await;
                });
            }

            pool.driver()
                .rename_custom_volume(project, name, new_name)
                .await
                .map_err(|e| Error::driver(name, e))?;

            {
                let pool = pool.clone();
                let project = project.to_string();
                let name = name.to_string();
                let new_name = new_name.to_string();
                reverter.add(move || async move {
                    let _ = pool.driver().rename_custom_volume(&project, &new_name, &name).await;
                });
            }

            self.server()
                .catalog
                .rename_volume(pool.id(), project, VolumeType::Custom, name, new_name)
                .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                reverter.success();
                info!(volume = %name, new_name = %new_name, "Renamed storage volume");
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    /// Move a volume: copy-then-delete, with consumers updated to the new
    /// pool during the copy and reverted first on failure.
    #[allow(clippy::too_many_arguments)]
    async fn move_volume(
        &self,
        src_pool_name: &str,
        src_project: &str,
        src_name: &str,
        dst_pool_name: &str,
        dst_project: &str,
        dst_name: &str,
    ) -> Result<()> {
        let src_pool = self.server().pools.load_by_name(src_pool_name).await?;
        let dst_pool = self.server().pools.load_by_name(dst_pool_name).await?;

        let _guard =
            self.lock_identity(src_pool_name, src_project, VolumeType::Custom, src_name).await;

        let src_volume = self
            .server()
            .catalog
            .volume(src_pool.id(), src_project, VolumeType::Custom, src_name, None)
            .await?;

        let reverter = Reverter::new();

        let result = async {
            self.update_volume_users(src_project, src_pool_name, src_name, dst_pool_name, dst_name)
                .await?;

            {
                let service = self.clone_service();
                let src_project = src_project.to_string();
                let src_pool_name = src_pool_name.to_string();
                let src_name = src_name.to_string();
                let dst_pool_name = dst_pool_name.to_string();
                let dst_name = dst_name.to_string();
                reverter.add(move || async move {
                    let _ = service
                        .update_volume_users(
                            &src_project,
                            &dst_pool_name,
                            &dst_name,
                            &src_pool_name,
                            &src_name,
                        )
                        .await;
                });
            }

            dst_pool
                .driver()
                .create_custom_volume_from_copy(
                    dst_project,
                    src_project,
                    dst_name,
                    src_name,
                    src_pool.driver(),
                    true,
                )
                .await
                .map_err(|e| Error::driver(dst_name, e))?;

            {
                let pool = dst_pool.clone();
                let project = dst_project.to_string();
                let name = dst_name.to_string();
                reverter.add(move || async move {
                    let _ = pool.driver().delete_custom_volume(&project, &name).await;
                });
            }

            self.commit_volume_rows(
                &dst_pool,
                dst_project,
                dst_name,
                &src_volume.description,
                &src_volume.config,
                src_volume.content_type,
                &reverter,
            )
            .await?;

            self.replicate_snapshot_rows(
                src_pool.id(),
                src_project,
                src_name,
                &dst_pool,
                dst_project,
                dst_name,
                src_volume.content_type,
            )
            .await?;

            // Source goes away only once the destination is fully committed.
            src_pool
                .driver()
                .delete_custom_volume(src_project, src_name)
                .await
                .map_err(|e| Error::driver(src_name, e))?;

            self.server()
                .catalog
                .delete_volume(src_pool.id(), src_project, VolumeType::Custom, src_name)
                .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                reverter.success();
                info!(
                    volume = %src_name,
                    from = %src_pool_name,
                    to = %dst_pool_name,
                    "Moved storage volume"
                );
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    /// Relocate a volume to another cluster member.
    ///
    /// When the member holding the volume is offline, a pool on shared
    /// storage degrades to a plain rename here; a member-bound pool cannot
    /// proceed at all.
    #[allow(clippy::too_many_arguments)]
    async fn relocate(
        &self,
        pool_name: &str,
        project: &str,
        target_project: &str,
        name: &str,
        req: VolumePost,
        target: &str,
    ) -> Result<Outcome> {
        let now = Utc::now();
        let threshold = self.server().cluster.offline_threshold;

        let source_is_local = req.source.location == self.server().cluster.member_name;
        let source_offline = if source_is_local {
            false
        } else {
            let member = self.server().catalog.member_by_name(&req.source.location).await?;
            member.is_offline(threshold, now)
        };

        if source_offline {
            let pool = self.server().pools.load_by_name(pool_name).await?;

            if pool.driver().info().remote {
                // The data is reachable from here; only the catalog name
                // moves.
                self.rename(pool_name, project, name, &req.name).await?;
                return Ok(Outcome::Done);
            }

            return Err(Error::BadRequest("The source is currently offline".to_string()));
        }

        if target == req.source.location {
            return Err(Error::BadRequest(
                "Target must be different than the storage volume's current location".to_string(),
            ));
        }

        let target_member = self.server().catalog.member_by_name(target).await?;
        if target_member.is_offline(threshold, now) {
            return Err(Error::BadRequest("Target cluster member is offline".to_string()));
        }

        // Source side: a websocket migration-source operation; destination
        // side: a pull-mode create driven over the peer interface. The
        // local volume is deleted only after the destination reports
        // success.
        let pool = self.server().pools.load_by_name(pool_name).await?;
        let server = self.server().clone();
        let src_project = project.to_string();
        let dst_project = target_project.to_string();
        let src_name = name.to_string();
        let new_name = if req.name.is_empty() { name.to_string() } else { req.name.clone() };
        let dst_pool_name = if req.pool.is_empty() { pool_name.to_string() } else { req.pool.clone() };
        let target_address = target_member.address.clone();
        let volume_only = req.volume_only;

        let op = Operation::create(
            &self.server().operations,
            &src_project.clone(),
            OperationClass::Task,
            "volume_migrate",
            HashMap::from([(
                "storage_volumes".to_string(),
                vec![format!("/1.0/storage-pools/{}/volumes/custom/{}", pool_name, name)],
            )]),
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    op.context().check()?;

                    let src_op = migration::new_source_operation(
                        server.clone(),
                        pool.clone(),
                        src_project.clone(),
                        src_name.clone(),
                        volume_only,
                        None,
                    )?;
                    src_op.start()?;

                    let client = server.peers.connect(&target_address).await?;
                    client
                        .create_volume(
                            &dst_pool_name,
                            &dst_project,
                            VolumesPost {
                                name: new_name.clone(),
                                volume_type: "custom".to_string(),
                                source: VolumeSource {
                                    source_type: "migration".to_string(),
                                    mode: "pull".to_string(),
                                    operation: format!(
                                        "https://{}{}",
                                        server.cluster.member_name,
                                        src_op.url()
                                    ),
                                    websockets: src_op.channel_secrets(),
                                    ..Default::default()
                                },
                                ..Default::default()
                            },
                        )
                        .await?;

                    src_op.wait().await?;

                    // Destination committed; drop the local copy.
                    pool.driver()
                        .delete_custom_volume(&src_project, &src_name)
                        .await
                        .map_err(|e| Error::driver(&src_name, e))?;
                    server
                        .catalog
                        .delete_volume(pool.id(), &src_project, VolumeType::Custom, &src_name)
                        .await?;

                    Ok(())
                })
            }),
            None,
            None,
        );

        op.start()?;
        Ok(Outcome::Async(op))
    }
}
