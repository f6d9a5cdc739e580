//! Volume creation paths: empty create, copy, refresh, migration sink,
//! cross-member copy forwarding, ISO import and backup import.

use super::{Outcome, VolumeService};
use crate::backup;
use crate::error::{Error, Result};
use crate::migration;
use crate::ops::{Operation, OperationClass, Reverter};
use crate::paths;
use crate::project;
use crate::types::api::{VolumePost, VolumesPost};
use crate::types::{ContentType, VolumeType};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, instrument};

impl VolumeService {
    /// Dispatch `POST /storage-pools/{pool}/volumes`.
    #[instrument(skip(self, req), fields(pool = %pool_name, volume = %req.name))]
    pub async fn create(
        &self,
        pool_name: &str,
        request_project: &str,
        req: VolumesPost,
    ) -> Result<Outcome> {
        if req.name.is_empty() {
            return Err(Error::BadRequest("No name provided".to_string()));
        }

        if req.name.contains('/') {
            return Err(Error::BadRequest(
                "Storage volume names may not contain slashes".to_string(),
            ));
        }

        if !req.volume_type.is_empty() && req.volume_type != "custom" {
            return Err(Error::BadRequest(format!(
                "Currently not allowed to create storage volumes of type {:?}",
                req.volume_type
            )));
        }

        let content_type = ContentType::parse(&req.content_type)
            .ok_or_else(|| Error::BadRequest(format!("Invalid content type {:?}", req.content_type)))?;

        let (project_record, effective) = self.server().storage_project(request_project).await?;
        project::allow_volume_creation(&project_record)?;

        let pool = self.server().pools.load_by_name(pool_name).await?;
        let exists = self
            .server()
            .catalog
            .volume_exists(pool.id(), &effective, VolumeType::Custom, &req.name)
            .await?;

        if exists && !req.source.refresh {
            return Err(Error::Conflict("Volume by that name already exists".to_string()));
        }

        // A source on another member means the copy must become a pull-mode
        // migration driven from here.
        if self.server().cluster.clustered
            && !req.source.location.is_empty()
            && req.source.location != self.server().cluster.member_name
        {
            return self.cluster_copy(pool_name, &effective, req).await;
        }

        let source_type = req.source.source_type.clone();
        match source_type.as_str() {
            "" => self.create_or_copy(pool_name, &effective, req, content_type).await,
            "copy" => {
                if exists {
                    self.refresh_from_copy(pool_name, &effective, req).await
                } else {
                    self.create_or_copy(pool_name, &effective, req, content_type).await
                }
            }
            "migration" => self.migration_sink(pool_name, &effective, req).await,
            other => Err(Error::BadRequest(format!("Unknown source type {:?}", other))),
        }
    }

    /// Fresh create (synchronous) or copy from a local source (async).
    async fn create_or_copy(
        &self,
        pool_name: &str,
        project: &str,
        req: VolumesPost,
        content_type: ContentType,
    ) -> Result<Outcome> {
        let pool = self.server().pools.load_by_name(pool_name).await?;

        // No source volume: plain create, done within the request.
        if req.source.name.is_empty() {
            pool.driver().validate_name(&req.name)?;

            let _guard =
                self.lock_identity(pool_name, project, VolumeType::Custom, &req.name).await;

            let reverter = Reverter::new();

            let result = async {
                pool.driver()
                    .create_custom_volume(
                        project,
                        &req.name,
                        &req.description,
                        &req.config,
                        content_type,
                    )
                    .await
                    .map_err(|e| Error::driver(&req.name, e))?;

                {
                    let pool = pool.clone();
                    let project = project.to_string();
                    let name = req.name.clone();
                    reverter.add(move || async move {
                        let _ = pool.driver().delete_custom_volume(&project, &name).await;
                    });
                }

                self.commit_volume_rows(
                    &pool,
                    project,
                    &req.name,
                    &req.description,
                    &req.config,
                    content_type,
                    &reverter,
                )
                .await?;

                Ok(())
            }
            .await;

            return match result {
                Ok(()) => {
                    reverter.success();
                    info!("Created storage volume");
                    Ok(Outcome::Done)
                }
                Err(e) => {
                    reverter.fail().await;
                    Err(e)
                }
            };
        }

        // Copy operations potentially take a long time, so run async.
        let service = self.clone_service();
        let src_pool_name =
            if req.source.pool.is_empty() { pool_name.to_string() } else { req.source.pool.clone() };
        let src_project = if req.source.project.is_empty() {
            project.to_string()
        } else {
            let record = self.server().catalog.project(&req.source.project).await?;
            project::storage_volume_project(&record)
        };
        let project = project.to_string();
        let pool_name = pool_name.to_string();

        let op = Operation::create(
            &self.server().operations,
            &project.clone(),
            OperationClass::Task,
            "volume_copy",
            HashMap::new(),
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    let ctx = op.context();
                    ctx.check()?;

                    service
                        .copy_volume(
                            &pool_name,
                            &project,
                            &src_pool_name,
                            &src_project,
                            &req,
                            content_type,
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

    async fn copy_volume(
        &self,
        pool_name: &str,
        project: &str,
        src_pool_name: &str,
        src_project: &str,
        req: &VolumesPost,
        content_type: ContentType,
    ) -> Result<()> {
        let pool = self.server().pools.load_by_name(pool_name).await?;
        let src_pool = self.server().pools.load_by_name(src_pool_name).await?;
        let with_snapshots = !req.source.volume_only;

        let _guard = self.lock_identity(pool_name, project, VolumeType::Custom, &req.name).await;

        let reverter = Reverter::new();

        let result = async {
            pool.driver()
                .create_custom_volume_from_copy(
                    project,
                    src_project,
                    &req.name,
                    &req.source.name,
                    src_pool.driver(),
                    with_snapshots,
                )
                .await
                .map_err(|e| Error::driver(&req.name, e))?;

            {
                let pool = pool.clone();
                let project = project.to_string();
                let name = req.name.clone();
                reverter.add(move || async move {
                    let _ = pool.driver().delete_custom_volume(&project, &name).await;
                });
            }

            // Destination config: the source volume's config overlaid with
            // the request's.
            let src_volume = self
                .server()
                .catalog
                .volume(src_pool.id(), src_project, VolumeType::Custom, &req.source.name, None)
                .await?;

            let mut config = src_volume.config.clone();
            config.extend(req.config.clone());

            self.commit_volume_rows(
                &pool,
                project,
                &req.name,
                &req.description,
                &config,
                content_type,
                &reverter,
            )
            .await?;

            if with_snapshots {
                self.replicate_snapshot_rows(
                    src_pool.id(),
                    src_project,
                    &req.source.name,
                    &pool,
                    project,
                    &req.name,
                    content_type,
                )
                .await?;
            }

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                reverter.success();
                info!(volume = %req.name, source = %req.source.name, "Copied storage volume");
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    /// Refresh an existing destination from a source volume.
    async fn refresh_from_copy(
        &self,
        pool_name: &str,
        project: &str,
        req: VolumesPost,
    ) -> Result<Outcome> {
        if req.source.name.is_empty() {
            return Err(Error::BadRequest("No source volume name supplied".to_string()));
        }

        let service = self.clone_service();
        let project = project.to_string();
        let pool_name = pool_name.to_string();

        let op = Operation::create(
            &self.server().operations,
            &project.clone(),
            OperationClass::Task,
            "volume_copy",
            HashMap::new(),
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    op.context().check()?;

                    let pool = service.server().pools.load_by_name(&pool_name).await?;
                    let src_pool_name = if req.source.pool.is_empty() {
                        pool_name.clone()
                    } else {
                        req.source.pool.clone()
                    };
                    let src_pool = service.server().pools.load_by_name(&src_pool_name).await?;
                    let src_project = if req.source.project.is_empty() {
                        project.clone()
                    } else {
                        req.source.project.clone()
                    };

                    let _guard = service
                        .lock_identity(&pool_name, &project, VolumeType::Custom, &req.name)
                        .await;

                    pool.driver()
                        .refresh_custom_volume(
                            &project,
                            &src_project,
                            &req.name,
                            &req.source.name,
                            src_pool.driver(),
                            !req.source.volume_only,
                            req.source.refresh_exclude_older,
                        )
                        .await
                        .map_err(|e| Error::driver(&req.name, e))?;

                    // Add catalog rows for snapshots the refresh brought over.
                    if !req.source.volume_only {
                        let existing: std::collections::HashSet<String> = service
                            .server()
                            .catalog
                            .snapshots_of(pool.id(), &project, VolumeType::Custom, &req.name)
                            .await?
                            .into_iter()
                            .map(|s| s.name)
                            .collect();

                        let src_snaps = service
                            .server()
                            .catalog
                            .snapshots_of(
                                src_pool.id(),
                                &src_project,
                                VolumeType::Custom,
                                &req.source.name,
                            )
                            .await?;

                        for snapshot in src_snaps {
                            let snap_only =
                                crate::types::volume::split_snapshot_name(&snapshot.name).1;
                            let dst_name =
                                crate::types::volume::join_snapshot_name(&req.name, snap_only);
                            if existing.contains(&dst_name) {
                                continue;
                            }

                            service
                                .server()
                                .catalog
                                .create_volume(&crate::catalog::NewVolume {
                                    pool_id: pool.id(),
                                    project: project.clone(),
                                    name: dst_name,
                                    volume_type: VolumeType::Custom,
                                    content_type: snapshot.content_type,
                                    description: snapshot.description.clone(),
                                    config: snapshot.config.clone(),
                                    node_id: service.node_id_for(&pool),
                                    created_at: snapshot.created_at,
                                    expiry_at: snapshot.expiry_at,
                                })
                                .await?;
                        }
                    }

                    info!(volume = %req.name, "Refreshed storage volume");
                    Ok(())
                })
            }),
            None,
            None,
        );

        op.start()?;
        Ok(Outcome::Async(op))
    }

    /// Forward a copy whose source lives on another member: ask that member
    /// for a migration source operation, then pull from it.
    async fn cluster_copy(
        &self,
        pool_name: &str,
        project: &str,
        mut req: VolumesPost,
    ) -> Result<Outcome> {
        let member = self.server().catalog.member_by_name(&req.source.location).await?;
        if member.address.is_empty() {
            return Err(Error::BadRequest("The source is currently offline".to_string()));
        }

        let client = self.server().peers.connect(&member.address).await?;

        let src_project =
            if req.source.project.is_empty() { project.to_string() } else { req.source.project.clone() };

        let peer_op = client
            .migrate_volume(
                &req.source.pool,
                &src_project,
                &req.source.name,
                VolumePost {
                    name: req.source.name.clone(),
                    pool: req.source.pool.clone(),
                    migration: true,
                    volume_only: req.source.volume_only,
                    ..Default::default()
                },
            )
            .await?;

        debug!(operation = %peer_op.url, "Peer migration source ready");

        // Rewrite the request as a pull-mode migration against the peer.
        req.source.source_type = "migration".to_string();
        req.source.mode = "pull".to_string();
        req.source.operation = peer_op.url;
        req.source.websockets = peer_op.websockets;
        req.source.project = String::new();

        let pool = self.server().pools.load_by_name(pool_name).await?;
        let op = migration::new_sink_pull_operation(
            self.server().clone(),
            pool,
            project.to_string(),
            req,
            client,
            None,
        )?;

        op.start()?;
        Ok(Outcome::Async(op))
    }

    /// Receive a migration: pull mode dials out, push mode waits for the
    /// source to dial in.
    async fn migration_sink(
        &self,
        pool_name: &str,
        project: &str,
        req: VolumesPost,
    ) -> Result<Outcome> {
        let mode = migration::Mode::parse(&req.source.mode)
            .ok_or_else(|| Error::BadRequest(format!("Mode {:?} not implemented", req.source.mode)))?;

        let pool = self.server().pools.load_by_name(pool_name).await?;

        match mode {
            migration::Mode::Pull => {
                let address = address_from_operation_url(&req.source.operation)?;
                let client = self.server().peers.connect(&address).await?;

                let op = migration::new_sink_pull_operation(
                    self.server().clone(),
                    pool,
                    project.to_string(),
                    req,
                    client,
                    None,
                )?;

                op.start()?;
                Ok(Outcome::Async(op))
            }
            migration::Mode::Push => {
                // Websocket-class sink: the source dials our channels.
                let server = self.server().clone();
                let project_owned = project.to_string();
                let dest_name = req.name.clone();
                let dest_config = req.config.clone();

                let op = Operation::create(
                    &self.server().operations,
                    project,
                    OperationClass::Websocket,
                    "volume_create",
                    HashMap::new(),
                    HashMap::new(),
                    Box::new(move |op| {
                        Box::pin(async move {
                            let mut ctx = op.context();
                            let mut control_rx = op.take_channel(migration::CHANNEL_CONTROL)?;
                            let mut fs_rx = op.take_channel(migration::CHANNEL_FILESYSTEM)?;

                            let control = tokio::select! {
                                stream = control_rx.recv() => stream.ok_or_else(|| {
                                    Error::Internal("Control channel closed".to_string())
                                })?,
                                () = ctx.cancelled() => return Err(Error::Cancelled),
                            };
                            let fs = tokio::select! {
                                stream = fs_rx.recv() => stream.ok_or_else(|| {
                                    Error::Internal("Filesystem channel closed".to_string())
                                })?,
                                () = ctx.cancelled() => return Err(Error::Cancelled),
                            };

                            migration::run_sink(
                                server.as_ref(),
                                &pool,
                                &project_owned,
                                &dest_name,
                                &dest_config,
                                control,
                                fs,
                            )
                            .await
                        })
                    }),
                    None,
                    None,
                );

                op.register_channel(migration::CHANNEL_CONTROL);
                op.register_channel(migration::CHANNEL_FILESYSTEM);
                for (name, secret) in op.channel_secrets() {
                    op.set_metadata(&name, serde_json::Value::String(secret));
                }

                op.start()?;
                Ok(Outcome::Async(op))
            }
            migration::Mode::Relay => Err(Error::BadRequest(
                "Relay mode is driven by the orchestrator, not the sink".to_string(),
            )),
        }
    }

    // ========================
    // ISO import
    // ========================

    /// Stream an uploaded ISO into a scratch file and create an ISO volume
    /// from it. The scratch file is removed on every exit path.
    #[instrument(skip(self, data), fields(pool = %pool_name, volume = %name))]
    pub async fn import_iso(
        &self,
        pool_name: &str,
        request_project: &str,
        name: &str,
        mut data: impl AsyncRead + Unpin + Send,
    ) -> Result<Outcome> {
        if name.is_empty() {
            return Err(Error::BadRequest("Missing volume name".to_string()));
        }

        let (_, effective) = self.server().storage_project(request_project).await?;

        let isos_dir = paths::isos_dir();
        fs::create_dir_all(&isos_dir)
            .await
            .map_err(|e| Error::Io { path: isos_dir.clone(), source: e })?;

        let scratch =
            isos_dir.join(format!("{}_{}", paths::ISO_SCRATCH_PREFIX, uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&scratch)
            .await
            .map_err(|e| Error::Io { path: scratch.clone(), source: e })?;
        let size = match tokio::io::copy(&mut data, &mut file).await {
            Ok(size) => size,
            Err(e) => {
                let _ = fs::remove_file(&scratch).await;
                return Err(Error::Io { path: scratch, source: e });
            }
        };
        drop(file);

        let service = self.clone_service();
        let pool_name = pool_name.to_string();
        let name = name.to_string();
        let scratch_path = scratch.clone();

        let op = Operation::create(
            &self.server().operations,
            &effective.clone(),
            OperationClass::Task,
            "volume_create",
            HashMap::from([(
                "storage_volumes".to_string(),
                vec![format!("/1.0/storage-pools/{}/volumes/custom/{}", pool_name, name)],
            )]),
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    let result =
                        service.iso_to_volume(&pool_name, &effective, &name, &scratch_path, size, &op).await;
                    let _ = fs::remove_file(&scratch_path).await;
                    result
                })
            }),
            None,
            None,
        );

        op.start()?;
        Ok(Outcome::Async(op))
    }

    async fn iso_to_volume(
        &self,
        pool_name: &str,
        project: &str,
        name: &str,
        scratch: &PathBuf,
        size: u64,
        op: &Operation,
    ) -> Result<()> {
        op.context().check()?;

        let pool = self.server().pools.load_by_name(pool_name).await?;
        pool.driver().validate_name(name)?;

        let _guard = self.lock_identity(pool_name, project, VolumeType::Custom, name).await;

        if self
            .server()
            .catalog
            .volume_exists(pool.id(), project, VolumeType::Custom, name)
            .await?
        {
            return Err(Error::Conflict("Volume by that name already exists".to_string()));
        }

        let reverter = Reverter::new();

        let result = async {
            pool.driver()
                .create_custom_volume_from_iso(project, name, scratch, size)
                .await
                .map_err(|e| Error::driver(name, e))?;

            {
                let pool = pool.clone();
                let project = project.to_string();
                let name = name.to_string();
                reverter.add(move || async move {
                    let _ = pool.driver().delete_custom_volume(&project, &name).await;
                });
            }

            let mut config = HashMap::new();
            config.insert("size".to_string(), size.to_string());

            self.commit_volume_rows(
                &pool,
                project,
                name,
                "",
                &config,
                ContentType::Iso,
                &reverter,
            )
            .await?;

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                reverter.success();
                info!("Created volume from ISO");
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }

    // ========================
    // Backup import
    // ========================

    /// Stream an uploaded backup tarball into a scratch file, decompress
    /// squashfs payloads, parse the manifest and restore the volume.
    #[instrument(skip(self, data), fields(pool = %pool_name))]
    pub async fn import_backup(
        &self,
        pool_name: &str,
        request_project: &str,
        name_override: &str,
        mut data: impl AsyncRead + Unpin + Send,
    ) -> Result<Outcome> {
        let (_, effective) = self.server().storage_project(request_project).await?;

        let backups_dir = paths::backups_dir();
        fs::create_dir_all(&backups_dir)
            .await
            .map_err(|e| Error::Io { path: backups_dir.clone(), source: e })?;

        let scratch = backups_dir
            .join(format!("{}_{}", paths::BACKUP_WORKING_DIR_PREFIX, uuid::Uuid::new_v4()));

        let mut file = fs::File::create(&scratch)
            .await
            .map_err(|e| Error::Io { path: scratch.clone(), source: e })?;
        if let Err(e) = tokio::io::copy(&mut data, &mut file).await {
            let _ = fs::remove_file(&scratch).await;
            return Err(Error::Io { path: scratch, source: e });
        }
        drop(file);

        let result = self
            .backup_to_volume(pool_name, &effective, name_override, scratch.clone())
            .await;

        if result.is_err() {
            let _ = fs::remove_file(&scratch).await;
        }

        result
    }

    async fn backup_to_volume(
        &self,
        pool_name: &str,
        project: &str,
        name_override: &str,
        mut scratch: PathBuf,
    ) -> Result<Outcome> {
        // A squashfs payload is decompressed to a plain tarball first.
        let mut header = [0u8; 4];
        {
            let mut file = fs::File::open(&scratch)
                .await
                .map_err(|e| Error::Io { path: scratch.clone(), source: e })?;
            let _ = file.read(&mut header).await;
        }

        if backup::is_squashfs(&header) {
            scratch = decompress_squashfs(&scratch).await?;
        }

        let mut info = backup::read_info(&scratch, project).await?;

        if !pool_name.is_empty() {
            info.pool = pool_name.to_string();
        }
        if !name_override.is_empty() {
            info.name = name_override.to_string();
        }

        // Fall back to the default profile's root pool when the manifest
        // names no usable pool.
        match self.server().catalog.pool_by_name(&info.pool).await {
            Ok(_) => {}
            Err(Error::NotFound(_)) => {
                if info.optimized_storage || !pool_name.is_empty() {
                    return Err(Error::Internal(format!(
                        "Storage pool {:?} not found",
                        info.pool
                    )));
                }

                let profile = self.server().catalog.profile(project, "default").await?;
                let (_, root) = profile.root_disk_device().ok_or_else(|| {
                    Error::Internal("Failed to get root disk device".to_string())
                })?;
                info.pool = root
                    .get("pool")
                    .cloned()
                    .ok_or_else(|| Error::Internal("Default profile has no root pool".to_string()))?;
            }
            Err(e) => return Err(e),
        }

        let service = self.clone_service();
        let project = project.to_string();
        let scratch_path = scratch.clone();
        let resources = HashMap::from([(
            "storage_volumes".to_string(),
            vec![format!("/1.0/storage-pools/{}/volumes/custom/{}", info.pool, info.name)],
        )]);

        let op = Operation::create(
            &self.server().operations,
            &project.clone(),
            OperationClass::Task,
            "backup_restore",
            resources,
            HashMap::new(),
            Box::new(move |op| {
                Box::pin(async move {
                    let result = service.restore_backup(&project, info, &op).await;
                    let _ = fs::remove_file(&scratch_path).await;
                    result
                })
            }),
            None,
            None,
        );

        op.start()?;
        Ok(Outcome::Async(op))
    }

    async fn restore_backup(
        &self,
        project: &str,
        info: backup::BackupInfo,
        op: &Operation,
    ) -> Result<()> {
        op.context().check()?;

        let pool = self.server().pools.load_by_name(&info.pool).await?;

        // Optimized payloads only restore onto the driver that wrote them.
        if info.optimized_storage && pool.driver().info().name != info.backend {
            return Err(Error::BadRequest(format!(
                "Optimized backup storage driver {:?} differs from the target storage pool driver {:?}",
                info.backend,
                pool.driver().info().name
            )));
        }

        let _guard = self.lock_identity(&info.pool, project, VolumeType::Custom, &info.name).await;

        let reverter = Reverter::new();

        let result = async {
            pool.driver()
                .create_custom_volume_from_backup(&info)
                .await
                .map_err(|e| Error::driver(&info.name, e))?;

            {
                let pool = pool.clone();
                let project = project.to_string();
                let name = info.name.clone();
                reverter.add(move || async move {
                    let _ = pool.driver().delete_custom_volume(&project, &name).await;
                });
            }

            let volume_spec = info.config.volume.clone().unwrap_or_default();
            let content_type =
                ContentType::parse(&volume_spec.content_type).unwrap_or(ContentType::Filesystem);

            self.commit_volume_rows(
                &pool,
                project,
                &info.name,
                &volume_spec.description,
                &volume_spec.config,
                content_type,
                &reverter,
            )
            .await?;

            for snapshot in &info.config.volume_snapshots {
                self.server()
                    .catalog
                    .create_volume(&crate::catalog::NewVolume {
                        pool_id: pool.id(),
                        project: project.to_string(),
                        name: crate::types::volume::join_snapshot_name(&info.name, &snapshot.name),
                        volume_type: VolumeType::Custom,
                        content_type,
                        description: snapshot.description.clone(),
                        config: snapshot.config.clone(),
                        node_id: self.node_id_for(&pool),
                        created_at: snapshot.created_at.unwrap_or_else(chrono::Utc::now),
                        expiry_at: snapshot.expires_at,
                    })
                    .await?;
            }

            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                reverter.success();
                info!(volume = %info.name, pool = %info.pool, "Restored volume from backup");
                Ok(())
            }
            Err(e) => {
                reverter.fail().await;
                Err(e)
            }
        }
    }
}

/// Extract the member address from a peer operation URL
/// (`https://host:port/1.0/operations/<id>`).
fn address_from_operation_url(url: &str) -> Result<String> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| Error::BadRequest(format!("Invalid operation URL {:?}", url)))?;

    let address = rest.split('/').next().unwrap_or_default();
    if address.is_empty() {
        return Err(Error::BadRequest(format!("Invalid operation URL {:?}", url)));
    }

    Ok(address.to_string())
}

/// Decompress a squashfs payload into a plain tarball using the system
/// `sqfs2tar` tool, mirroring the upload path's scratch layout.
async fn decompress_squashfs(path: &PathBuf) -> Result<PathBuf> {
    let out_path = path.with_file_name(format!(
        "{}_decompress_{}",
        paths::BACKUP_WORKING_DIR_PREFIX,
        uuid::Uuid::new_v4()
    ));

    let out_file = std::fs::File::create(&out_path)
        .map_err(|e| Error::Io { path: out_path.clone(), source: e })?;

    let status = tokio::process::Command::new("sqfs2tar")
        .arg(path)
        .stdout(out_file)
        .status()
        .await
        .map_err(|e| Error::Internal(format!("Failed running sqfs2tar: {}", e)))?;

    if !status.success() {
        let _ = fs::remove_file(&out_path).await;
        return Err(Error::BadRequest("Failed decompressing squashfs backup".to_string()));
    }

    let _ = fs::remove_file(path).await;
    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_from_operation_url() {
        assert_eq!(
            address_from_operation_url("https://10.0.0.1:8443/1.0/operations/abc").unwrap(),
            "10.0.0.1:8443"
        );
        assert!(address_from_operation_url("not-a-url").is_err());
    }
}
