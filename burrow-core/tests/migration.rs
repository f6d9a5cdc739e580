//! Migration coordinator tests with an in-process peer transport.

mod common;

use async_trait::async_trait;
use burrow_core::catalog::Catalog;
use burrow_core::error::{Error, Result};
use burrow_core::migration::{self, PeerClient, PeerConnector, PeerOperation};
use burrow_core::ops::ChannelStream;
use burrow_core::server::Server;
use burrow_core::types::api::{SnapshotsPost, VolumePost, VolumesPost};
use burrow_core::types::VolumeType;
use burrow_core::{Outcome, SnapshotService, VolumeService};
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;

/// In-process peer: resolves operation URLs against another server's
/// operation registry and bridges channels with duplex streams.
struct LoopbackPeer {
    remote: Arc<Server>,
}

#[async_trait]
impl PeerClient for LoopbackPeer {
    async fn migrate_volume(
        &self,
        pool: &str,
        project: &str,
        volume: &str,
        _req: VolumePost,
    ) -> Result<PeerOperation> {
        let remote_pool = self.remote.pools.load_by_name(pool).await?;
        let op = migration::new_source_operation(
            self.remote.clone(),
            remote_pool,
            project.to_string(),
            volume.to_string(),
            false,
            None,
        )?;
        op.start()?;

        Ok(PeerOperation {
            url: format!("https://m1{}", op.url()),
            websockets: op.channel_secrets(),
        })
    }

    async fn create_volume(&self, _pool: &str, _project: &str, _req: VolumesPost) -> Result<()> {
        Err(Error::Unsupported("Push mode is not used in this test".to_string()))
    }

    async fn connect_operation(
        &self,
        operation_url: &str,
        channel: &str,
        secret: &str,
    ) -> Result<ChannelStream> {
        let id = operation_url
            .rsplit('/')
            .next()
            .ok_or_else(|| Error::BadRequest("Invalid operation URL".to_string()))?;

        let op = self.remote.operations.get(id)?;
        let (local, remote) = tokio::io::duplex(256 * 1024);
        op.connect(channel, secret, remote).await?;

        Ok(local)
    }
}

struct LoopbackConnector {
    remote: Arc<Server>,
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn connect(&self, _address: &str) -> Result<Arc<dyn PeerClient>> {
        Ok(Arc::new(LoopbackPeer { remote: self.remote.clone() }))
    }
}

struct Cluster {
    dest: common::TestEnv,
    source_server: Arc<Server>,
    source_volumes: VolumeService,
    source_snapshots: SnapshotService,
    _src_dir: tempfile::TempDir,
}

/// Two single-member servers wired into one two-member cluster view.
async fn two_member_cluster() -> Cluster {
    common::init_data_dir();

    // Member m1: the source.
    let src_dir = tempfile::tempdir().unwrap();
    let src_catalog = Catalog::new_in_memory().await.unwrap();
    let m1 = src_catalog.insert_member("m1", "10.0.0.1:8443").await.unwrap();
    src_catalog.insert_project("default", &HashMap::new()).await.unwrap();
    common::insert_pool(&src_catalog, "pool-a", src_dir.path()).await;
    let source_server = Server::standalone(src_catalog, "m1", m1);
    let source_volumes = VolumeService::new(source_server.clone());
    let source_snapshots = SnapshotService::new(source_server.clone());

    // Member m2: the destination, clustered, with m1 known and reachable
    // through the loopback connector.
    let dst_dir = tempfile::tempdir().unwrap();
    let dst_catalog = Catalog::new_in_memory().await.unwrap();
    let m2 = dst_catalog.insert_member("m2", "10.0.0.2:8443").await.unwrap();
    dst_catalog.insert_member("m1", "10.0.0.1:8443").await.unwrap();
    dst_catalog.insert_project("default", &HashMap::new()).await.unwrap();
    common::insert_pool(&dst_catalog, "pool-b", dst_dir.path()).await;

    let mut cluster = burrow_core::cluster::ClusterInfo::standalone("m2", m2);
    cluster.clustered = true;

    let dest_server = Server::new(
        dst_catalog,
        cluster,
        Arc::new(LoopbackConnector { remote: source_server.clone() }),
    );

    let dest = common::TestEnv {
        volumes: VolumeService::new(dest_server.clone()),
        snapshots: SnapshotService::new(dest_server.clone()),
        recovery: burrow_core::RecoveryService::new(dest_server.clone()),
        server: dest_server,
        member_id: m2,
        _pool_dir: Some(dst_dir),
    };

    Cluster { dest, source_server, source_volumes, source_snapshots, _src_dir: src_dir }
}

#[tokio::test]
async fn test_cross_member_pull_copy() {
    let cluster = two_member_cluster().await;
    let (dest, source_server, source_volumes, source_snapshots) =
        (&cluster.dest, &cluster.source_server, &cluster.source_volumes, &cluster.source_snapshots);

    // Source volume with config and one snapshot on m1.
    let mut req = VolumesPost {
        name: "vol1".to_string(),
        volume_type: "custom".to_string(),
        ..Default::default()
    };
    req.config.insert("user.origin".to_string(), "m1".to_string());
    match source_volumes.create("pool-a", "default", req).await.unwrap() {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    let expiry = Utc::now() + Duration::days(1);
    let op = source_snapshots
        .create(
            "pool-a",
            "default",
            "vol1",
            SnapshotsPost { name: "snap0".to_string(), expires_at: Some(expiry) },
        )
        .await
        .unwrap();
    op.wait().await.unwrap();

    // m2 requests a copy whose source lives on m1; the service turns it
    // into a pull-mode migration.
    let mut req = VolumesPost {
        name: "vol1".to_string(),
        volume_type: "custom".to_string(),
        ..Default::default()
    };
    req.source.source_type = "copy".to_string();
    req.source.name = "vol1".to_string();
    req.source.pool = "pool-a".to_string();
    req.source.location = "m1".to_string();

    let op = match dest.volumes.create("pool-b", "default", req).await.unwrap() {
        Outcome::Done => panic!("cross-member copy must run as an operation"),
        Outcome::Async(op) => op,
    };
    op.wait().await.unwrap();

    // The destination row exists with the source's config and snapshots.
    let pool = dest.server.pools.load_by_name("pool-b").await.unwrap();
    let volume = dest
        .server
        .catalog
        .volume(pool.id(), "default", VolumeType::Custom, "vol1", None)
        .await
        .unwrap();
    assert_eq!(volume.config.get("user.origin").unwrap(), "m1");

    let snaps = dest
        .server
        .catalog
        .snapshots_of(pool.id(), "default", VolumeType::Custom, "vol1")
        .await
        .unwrap();
    assert_eq!(snaps.len(), 1);
    assert_eq!(snaps[0].name, "vol1/snap0");
    assert_eq!(snaps[0].expiry_at.map(|e| e.timestamp()), Some(expiry.timestamp()));

    // The source keeps its volume (copy, not move).
    let src_pool = source_server.pools.load_by_name("pool-a").await.unwrap();
    assert!(source_server
        .catalog
        .volume_exists(src_pool.id(), "default", VolumeType::Custom, "vol1")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_migration_sink_failure_leaves_no_row() {
    let cluster = two_member_cluster().await;
    let dest = &cluster.dest;

    // A sink pointed at a non-existent source volume fails after the
    // header negotiation and must leave no catalog row behind.
    let mut req = VolumesPost {
        name: "ghost".to_string(),
        volume_type: "custom".to_string(),
        ..Default::default()
    };
    req.source.source_type = "copy".to_string();
    req.source.name = "missing".to_string();
    req.source.pool = "pool-a".to_string();
    req.source.location = "m1".to_string();

    let op = match dest.volumes.create("pool-b", "default", req).await.unwrap() {
        Outcome::Done => panic!("cross-member copy must run as an operation"),
        Outcome::Async(op) => op,
    };
    assert!(op.wait().await.is_err());

    let pool = dest.server.pools.load_by_name("pool-b").await.unwrap();
    assert!(!dest
        .server
        .catalog
        .volume_exists(pool.id(), "default", VolumeType::Custom, "ghost")
        .await
        .unwrap());
}

#[tokio::test]
async fn test_offline_source_member() {
    let cluster = two_member_cluster().await;
    let dest = &cluster.dest;

    // Mark m1 as never having sent a heartbeat recently.
    let m1 = dest.server.catalog.member_by_name("m1").await.unwrap();
    dest.server
        .catalog
        .touch_member(m1.id, Utc::now() - Duration::hours(1))
        .await
        .unwrap();

    // A member with an empty address is unreachable outright; simulate by
    // checking the offline-relocation path instead: migration with an
    // offline source on a member-bound pool is rejected.
    let req = VolumePost {
        name: "vol1".to_string(),
        migration: true,
        source: burrow_core::types::api::VolumeSource {
            location: "m1".to_string(),
            ..Default::default()
        },
        ..Default::default()
    };

    let err = dest
        .volumes
        .rename_or_move("pool-b", "default", VolumeType::Custom, "vol1", req, Some("m2"))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("currently offline"));
}
