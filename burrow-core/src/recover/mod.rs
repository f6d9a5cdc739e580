//! Disaster recovery: re-derive lost catalog state from on-disk artifacts.
//!
//! The scan walks user-described pools, mounts them (temporarily when no
//! catalog row exists), asks each driver for volumes it knows nothing
//! about and validates their dependencies. Import then recreates catalog
//! rows in dependency order: pools, custom volumes, buckets, instances.
//! Any failure reverts the whole import; a temporary pool that never
//! graduates is unmounted again.

use crate::backup::BackupConfig;
use crate::catalog::NewVolume;
use crate::error::{Error, Result};
use crate::ops::Reverter;
use crate::pools::Pool;
use crate::project::{self, Profile};
use crate::server::Server;
use crate::types::api::{RecoverPool, RecoverValidateResult, UnknownVolume};
use crate::types::volume as volume_names;
use crate::types::{ContentType, InstanceRecord, VolumeType};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// The recovery engine.
#[derive(Clone)]
pub struct RecoveryService {
    server: Arc<Server>,
}

type PoolProjectVols = HashMap<String, Vec<BackupConfig>>;

impl RecoveryService {
    /// Create the service.
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }

    /// Scan the described pools for unknown volumes; with `validate_only`
    /// (or on dependency errors) stop after reporting, otherwise recreate
    /// the catalog rows.
    #[instrument(skip(self, user_pools), fields(pools = user_pools.len(), validate_only))]
    pub async fn scan(
        &self,
        user_pools: Vec<RecoverPool>,
        validate_only: bool,
    ) -> Result<RecoverValidateResult> {
        // All dependency-check inputs are loaded up front.
        let projects: HashMap<String, project::Project> =
            self.server.catalog.projects().await?.into_iter().map(|p| (p.name.clone(), p)).collect();

        let mut project_profiles: HashMap<String, Vec<Profile>> = HashMap::new();
        for profile in self.server.catalog.profiles().await? {
            project_profiles.entry(profile.project.clone()).or_default().push(profile);
        }

        let project_networks = self.server.catalog.networks_by_project().await?;

        let mut result = RecoverValidateResult::default();
        let reverter = Reverter::new();

        let mut pools: HashMap<String, Arc<Pool>> = HashMap::new();
        let mut pool_order: Vec<String> = Vec::new();
        let mut pools_project_vols: HashMap<String, PoolProjectVols> = HashMap::new();
        let mut scan_mounted: Vec<Arc<Pool>> = Vec::new();

        let scan_result = async {
            for user_pool in &user_pools {
                if pools.contains_key(&user_pool.name) {
                    continue;
                }

                let pool = match self.server.pools.load_by_name(&user_pool.name).await {
                    Ok(pool) => pool,
                    Err(Error::NotFound(_)) => {
                        // Pool record recovery relies on local scans alone,
                        // which cannot be reconciled across a cluster.
                        if self.server.cluster.clustered {
                            return Err(Error::BadRequest(
                                "Storage pool recovery not supported when clustered".to_string(),
                            ));
                        }

                        self.server
                            .pools
                            .new_temporary(
                                &user_pool.name,
                                &user_pool.driver,
                                user_pool.config.clone(),
                            )
                            .await
                            .map_err(|e| {
                                Error::Internal(format!(
                                    "Failed to initialize unknown pool {:?}: {}",
                                    user_pool.name, e
                                ))
                            })?
                    }
                    Err(e) => {
                        return Err(Error::Internal(format!(
                            "Failed loading existing pool {:?}: {}",
                            user_pool.name, e
                        )))
                    }
                };

                pool_order.push(user_pool.name.clone());
                pools.insert(user_pool.name.clone(), pool.clone());

                let our_mount = pool.mount().await.map_err(|e| {
                    Error::Internal(format!("Failed mounting pool {:?}: {}", pool.name(), e))
                })?;

                if our_mount {
                    scan_mounted.push(pool.clone());

                    let cleanup = pool.clone();
                    reverter.add(move || async move {
                        let _ = cleanup.unmount().await;
                    });
                }

                let found = match pool.driver().list_unknown_volumes().await {
                    Ok(found) => found,
                    Err(Error::Unsupported(_)) => continue, // Skip drivers that can't enumerate.
                    Err(e) => {
                        return Err(Error::Internal(format!(
                            "Failed checking volumes on pool {:?}: {}",
                            pool.name(),
                            e
                        )))
                    }
                };

                let unknown = self.filter_known(&pool, found).await?;
                pools_project_vols.insert(user_pool.name.clone(), unknown);
            }

            // Validate the dependencies of every unknown instance volume.
            for pool_name in &pool_order {
                let Some(project_vols) = pools_project_vols.get(pool_name) else { continue };

                for (project_name, vols) in project_vols {
                    let Some(project_record) = projects.get(project_name) else {
                        add_dependency_error(
                            &mut result.dependency_errors,
                            format!("Project {:?}", project_name),
                        );
                        continue;
                    };

                    let profile_project = project::profile_project(project_record);
                    let network_project = project::network_project(project_record);

                    for vol in vols {
                        let Some(container) = &vol.container else { continue };

                        for profile_name in &container.profiles {
                            let found = project_profiles
                                .get(&profile_project)
                                .map(|profiles| profiles.iter().any(|p| &p.name == profile_name))
                                .unwrap_or(false);

                            if !found {
                                add_dependency_error(
                                    &mut result.dependency_errors,
                                    format!(
                                        "Profile {:?} in project {:?}",
                                        profile_name, project_name
                                    ),
                                );
                            }
                        }

                        for device in container.expanded_devices.values() {
                            if device.get("type").map(String::as_str) != Some("nic") {
                                continue;
                            }

                            let Some(network) = device.get("network") else { continue };
                            if network.is_empty() {
                                continue;
                            }

                            let found = project_networks
                                .get(&network_project)
                                .map(|networks| networks.iter().any(|n| n == network))
                                .unwrap_or(false);

                            if !found {
                                add_dependency_error(
                                    &mut result.dependency_errors,
                                    format!(
                                        "Network {:?} in project {:?}",
                                        network, project_name
                                    ),
                                );
                            }
                        }
                    }
                }
            }

            Ok(())
        }
        .await;

        if let Err(e) = scan_result {
            reverter.fail().await;
            return Err(e);
        }

        // Validation mode (or failed dependency checks) reports what was
        // found and leaves the catalog untouched.
        if validate_only || !result.dependency_errors.is_empty() {
            for pool_name in &pool_order {
                let Some(project_vols) = pools_project_vols.get(pool_name) else { continue };

                for (project_name, vols) in project_vols {
                    for vol in vols {
                        result.unknown_volumes.push(describe_unknown(pool_name, project_name, vol));
                    }
                }
            }

            reverter.success();

            // Only the mounts this scan itself created are undone, and only
            // for pools that never made it into the catalog.
            for pool in &scan_mounted {
                if pool.is_temporary() {
                    let _ = pool.unmount().await;
                }
            }

            return Ok(result);
        }

        let import_result = self
            .import(&pools, &pool_order, &pools_project_vols, &projects, &project_profiles, &reverter)
            .await;

        match import_result {
            Ok(()) => {
                reverter.success();
                info!("Recovery import complete");
                Ok(RecoverValidateResult::default())
            }
            Err(e) => {
                reverter.fail().await;

                for pool in &scan_mounted {
                    if pool.is_temporary() {
                        let _ = pool.unmount().await;
                    }
                }

                Err(e)
            }
        }
    }

    /// Drop entries the catalog already tracks; what remains is unknown.
    async fn filter_known(
        &self,
        pool: &Arc<Pool>,
        found: PoolProjectVols,
    ) -> Result<PoolProjectVols> {
        let mut unknown: PoolProjectVols = HashMap::new();

        for (project_name, vols) in found {
            for vol in vols {
                let known = if pool.is_temporary() {
                    false
                } else if let Some(container) = &vol.container {
                    match self.server.catalog.instance(&project_name, &container.name).await {
                        Ok(_) => true,
                        Err(Error::NotFound(_)) => false,
                        Err(e) => return Err(e),
                    }
                } else if let Some(bucket) = &vol.bucket {
                    self.server
                        .catalog
                        .buckets(pool.id())
                        .await?
                        .iter()
                        .any(|b| b.project == project_name && b.name == bucket.name)
                } else if let Some(volume) = &vol.volume {
                    self.server
                        .catalog
                        .volume_exists(pool.id(), &project_name, VolumeType::Custom, &volume.name)
                        .await?
                } else {
                    warn!(project = %project_name, "Skipping manifest that is neither instance, bucket nor volume");
                    true
                };

                if !known {
                    unknown.entry(project_name.clone()).or_default().push(vol);
                }
            }
        }

        Ok(unknown)
    }

    /// Phase B: recreate catalog rows for everything the scan found.
    async fn import(
        &self,
        pools: &HashMap<String, Arc<Pool>>,
        pool_order: &[String],
        pools_project_vols: &HashMap<String, PoolProjectVols>,
        projects: &HashMap<String, project::Project>,
        project_profiles: &HashMap<String, Vec<Profile>>,
        reverter: &Reverter,
    ) -> Result<()> {
        // Create missing pool records first.
        for pool_name in pool_order {
            let pool = &pools[pool_name];
            if !pool.is_temporary() {
                continue;
            }

            // An instance manifest with an embedded pool block preserves
            // settings the user request may not carry.
            let embedded_config = pools_project_vols
                .get(pool_name)
                .into_iter()
                .flat_map(|project_vols| project_vols.values().flatten())
                .find_map(|vol| vol.pool.as_ref().filter(|p| !p.config.is_empty()))
                .map(|p| p.config.clone());

            if embedded_config.is_some() {
                info!(pool = %pool_name, "Creating storage pool record from instance manifest config");
            } else {
                info!(pool = %pool_name, "Creating storage pool record from user config");
            }

            self.server.pools.register(pool, embedded_config).await.map_err(|e| {
                Error::Internal(format!(
                    "Failed creating storage pool {:?} database entry: {}",
                    pool_name, e
                ))
            })?;

            let registry = self.server.pools.clone();
            let name = pool_name.clone();
            reverter.add(move || async move {
                let _ = registry.deregister(&name).await;
            });
        }

        // Custom volumes and buckets come before instances so instance disk
        // devices referencing them resolve.
        for pool_name in pool_order {
            let pool = &pools[pool_name];
            let Some(project_vols) = pools_project_vols.get(pool_name) else { continue };

            let mut project_names: Vec<&String> = project_vols.keys().collect();
            project_names.sort();

            for project_name in &project_names {
                for vol in &project_vols[project_name.as_str()] {
                    if vol.container.is_some() || vol.bucket.is_some() {
                        continue;
                    }

                    self.import_custom_volume(pool, project_name, vol, reverter).await?;
                }

                for vol in &project_vols[project_name.as_str()] {
                    if vol.bucket.is_none() {
                        continue;
                    }

                    self.import_bucket(pool, project_name, vol, reverter).await?;
                }
            }
        }

        // Finally the instances.
        for pool_name in pool_order {
            let pool = &pools[pool_name];
            let Some(project_vols) = pools_project_vols.get(pool_name) else { continue };

            let mut project_names: Vec<&String> = project_vols.keys().collect();
            project_names.sort();

            for project_name in &project_names {
                let project_record = projects.get(project_name.as_str()).ok_or_else(|| {
                    Error::Internal(format!("Project {:?} not found", project_name))
                })?;
                let profile_project = project::profile_project(project_record);
                let profiles = project_profiles.get(&profile_project).cloned().unwrap_or_default();

                for vol in &project_vols[project_name.as_str()] {
                    if vol.container.is_none() {
                        continue;
                    }

                    self.import_instance(pool, project_name, vol, &profiles, reverter).await?;
                }
            }
        }

        Ok(())
    }

    async fn import_custom_volume(
        &self,
        pool: &Arc<Pool>,
        project_name: &str,
        vol: &BackupConfig,
        reverter: &Reverter,
    ) -> Result<()> {
        let volume = vol
            .volume
            .as_ref()
            .ok_or_else(|| Error::Internal("Volume is neither instance nor custom volume".to_string()))?;

        let content_type =
            ContentType::parse(&volume.content_type).unwrap_or(ContentType::Filesystem);
        let node_id = if pool.driver().info().remote {
            crate::cluster::NODE_ID_REMOTE
        } else {
            self.server.cluster.member_id
        };

        self.server
            .catalog
            .create_volume(&NewVolume {
                pool_id: pool.id(),
                project: project_name.to_string(),
                name: volume.name.clone(),
                volume_type: VolumeType::Custom,
                content_type,
                description: volume.description.clone(),
                config: volume.config.clone(),
                node_id,
                created_at: volume.created_at.unwrap_or_else(Utc::now),
                expiry_at: None,
            })
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed importing custom volume {:?} in project {:?}: {}",
                    volume.name, project_name, e
                ))
            })?;

        {
            let catalog = self.server.catalog.clone();
            let pool_id = pool.id();
            let project = project_name.to_string();
            let name = volume.name.clone();
            reverter.add(move || async move {
                let _ = catalog.delete_volume(pool_id, &project, VolumeType::Custom, &name).await;
            });
        }

        for snapshot in &vol.volume_snapshots {
            self.server
                .catalog
                .create_volume(&NewVolume {
                    pool_id: pool.id(),
                    project: project_name.to_string(),
                    name: volume_names::join_snapshot_name(&volume.name, &snapshot.name),
                    volume_type: VolumeType::Custom,
                    content_type,
                    description: snapshot.description.clone(),
                    config: snapshot.config.clone(),
                    node_id,
                    created_at: snapshot.created_at.unwrap_or_else(Utc::now),
                    expiry_at: snapshot.expires_at,
                })
                .await?;
        }

        pool.driver()
            .import_custom_volume(project_name, vol)
            .await
            .map_err(|e| Error::driver(&volume.name, e))?;

        Ok(())
    }

    async fn import_bucket(
        &self,
        pool: &Arc<Pool>,
        project_name: &str,
        vol: &BackupConfig,
        reverter: &Reverter,
    ) -> Result<()> {
        let bucket = vol
            .bucket
            .as_ref()
            .ok_or_else(|| Error::Internal("Manifest has no bucket block".to_string()))?;

        self.server
            .catalog
            .insert_bucket(pool.id(), project_name, &bucket.name, &bucket.description, &bucket.config)
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed importing bucket {:?} in project {:?}: {}",
                    bucket.name, project_name, e
                ))
            })?;

        {
            let catalog = self.server.catalog.clone();
            let pool_id = pool.id();
            let project = project_name.to_string();
            let name = bucket.name.clone();
            reverter.add(move || async move {
                let _ = catalog.delete_bucket(pool_id, &project, &name).await;
            });
        }

        pool.driver()
            .import_bucket(project_name, vol)
            .await
            .map_err(|e| Error::driver(&bucket.name, e))?;

        Ok(())
    }

    async fn import_instance(
        &self,
        pool: &Arc<Pool>,
        project_name: &str,
        vol: &BackupConfig,
        profiles: &[Profile],
        reverter: &Reverter,
    ) -> Result<()> {
        let container = vol
            .container
            .as_ref()
            .ok_or_else(|| Error::Internal("Pool volume is not an instance volume".to_string()))?;

        let applied: Vec<&Profile> = container
            .profiles
            .iter()
            .filter_map(|name| profiles.iter().find(|p| &p.name == name))
            .collect();

        let mut devices = container.devices.clone();
        let mut expanded = container.expanded_devices.clone();
        populate_root_device(&pool.name(), &mut devices, &mut expanded, &applied);

        let volume_type = match container.instance_type.as_str() {
            "virtual-machine" => VolumeType::Vm,
            _ => VolumeType::Container,
        };

        let created_at = container.created_at.unwrap_or_else(Utc::now);

        // Instance row first.
        self.server
            .catalog
            .insert_instance(&InstanceRecord {
                id: 0,
                project: project_name.to_string(),
                name: container.name.clone(),
                instance_type: container.instance_type.clone(),
                snapshot: false,
                architecture: container.architecture.clone(),
                config: container.config.clone(),
                devices: devices.clone(),
                expanded_devices: expanded.clone(),
                profiles: container.profiles.clone(),
                running: false,
                created_at,
            })
            .await
            .map_err(|e| {
                Error::Internal(format!(
                    "Failed creating instance {:?} record in project {:?}: {}",
                    container.name, project_name, e
                ))
            })?;

        {
            let catalog = self.server.catalog.clone();
            let project = project_name.to_string();
            let name = container.name.clone();
            reverter.add(move || async move {
                let _ = catalog.delete_instance(&project, &name).await;
            });
        }

        // The instance's storage volume row.
        let node_id = if pool.driver().info().remote {
            crate::cluster::NODE_ID_REMOTE
        } else {
            self.server.cluster.member_id
        };

        self.server
            .catalog
            .create_volume(&NewVolume {
                pool_id: pool.id(),
                project: project_name.to_string(),
                name: container.name.clone(),
                volume_type,
                content_type: if volume_type == VolumeType::Vm {
                    ContentType::Block
                } else {
                    ContentType::Filesystem
                },
                description: String::new(),
                config: HashMap::new(),
                node_id,
                created_at,
                expiry_at: None,
            })
            .await?;

        {
            let catalog = self.server.catalog.clone();
            let pool_id = pool.id();
            let project = project_name.to_string();
            let name = container.name.clone();
            reverter.add(move || async move {
                let _ = catalog.delete_volume(pool_id, &project, volume_type, &name).await;
            });
        }

        // Snapshot rows follow, `parent/snap` named.
        for snapshot in &vol.snapshots {
            let full_name = volume_names::join_snapshot_name(&container.name, &snapshot.name);
            let snap_created = snapshot.created_at.unwrap_or_else(Utc::now);

            self.server
                .catalog
                .insert_instance(&InstanceRecord {
                    id: 0,
                    project: project_name.to_string(),
                    name: full_name.clone(),
                    instance_type: container.instance_type.clone(),
                    snapshot: true,
                    architecture: container.architecture.clone(),
                    config: snapshot.config.clone(),
                    devices: snapshot.devices.clone(),
                    expanded_devices: snapshot.expanded_devices.clone(),
                    profiles: snapshot.profiles.clone(),
                    running: false,
                    created_at: snap_created,
                })
                .await
                .map_err(|e| {
                    Error::Internal(format!(
                        "Failed creating instance {:?} snapshot {:?} record in project {:?}: {}",
                        container.name, snapshot.name, project_name, e
                    ))
                })?;

            self.server
                .catalog
                .create_volume(&NewVolume {
                    pool_id: pool.id(),
                    project: project_name.to_string(),
                    name: full_name,
                    volume_type,
                    content_type: if volume_type == VolumeType::Vm {
                        ContentType::Block
                    } else {
                        ContentType::Filesystem
                    },
                    description: String::new(),
                    config: HashMap::new(),
                    node_id,
                    created_at: snap_created,
                    expiry_at: None,
                })
                .await?;
        }

        // Rebuild the mount path and symlinks (after snapshot recovery).
        pool.driver()
            .import_instance(project_name, vol)
            .await
            .map_err(|e| Error::driver(&container.name, e))?;

        // Reapply the root disk quota so the driver can re-key it to the
        // new volume rows.
        if let Some((_, root)) = project::root_disk_device(&expanded) {
            let size = root.get("size").cloned().unwrap_or_default();
            let size_state = root.get("size.state").cloned().unwrap_or_default();

            pool.driver()
                .set_instance_quota(project_name, &container.name, &size, &size_state)
                .await
                .map_err(|e| {
                    Error::Internal(format!(
                        "Failed reinitializing root disk quota {:?} for instance {:?} in project {:?}: {}",
                        size, container.name, project_name, e
                    ))
                })?;
        }

        Ok(())
    }
}

fn add_dependency_error(errors: &mut Vec<String>, message: String) {
    if !errors.contains(&message) {
        errors.push(message);
    }
}

fn describe_unknown(pool_name: &str, project_name: &str, vol: &BackupConfig) -> UnknownVolume {
    if let Some(container) = &vol.container {
        UnknownVolume {
            pool: pool_name.to_string(),
            project: project_name.to_string(),
            volume_type: container.instance_type.clone(),
            name: container.name.clone(),
            snapshot_count: vol.snapshots.len(),
        }
    } else if let Some(bucket) = &vol.bucket {
        UnknownVolume {
            pool: pool_name.to_string(),
            project: project_name.to_string(),
            volume_type: "bucket".to_string(),
            name: bucket.name.clone(),
            snapshot_count: 0,
        }
    } else {
        let volume = vol.volume.as_ref();
        UnknownVolume {
            pool: pool_name.to_string(),
            project: project_name.to_string(),
            volume_type: "volume".to_string(),
            name: volume.map(|v| v.name.clone()).unwrap_or_default(),
            snapshot_count: vol.volume_snapshots.len(),
        }
    }
}

/// Make sure an instance's device maps contain a root disk, preferring one
/// inherited from its profiles.
fn populate_root_device(
    pool_name: &str,
    devices: &mut HashMap<String, HashMap<String, String>>,
    expanded: &mut HashMap<String, HashMap<String, String>>,
    profiles: &[&Profile],
) {
    if project::root_disk_device(expanded).is_some() {
        return;
    }

    // A profile-provided root disk only needs to appear in the expanded
    // set.
    for profile in profiles {
        if let Some((name, config)) = profile.root_disk_device() {
            expanded.insert(name.clone(), config.clone());
            return;
        }
    }

    if project::root_disk_device(devices).is_none() {
        let mut root = HashMap::new();
        root.insert("type".to_string(), "disk".to_string());
        root.insert("path".to_string(), "/".to_string());
        root.insert("pool".to_string(), pool_name.to_string());
        devices.insert("root".to_string(), root.clone());
        expanded.insert("root".to_string(), root);
    } else if let Some((name, config)) = project::root_disk_device(devices) {
        let (name, config) = (name.clone(), config.clone());
        expanded.insert(name, config);
    }
}
