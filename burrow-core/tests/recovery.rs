//! Recovery engine tests: scan, dependency validation and catalog
//! reconstruction from on-disk state.

mod common;

use burrow_core::backup::{
    BackupConfig, BucketSpec, InstanceSnapshotSpec, InstanceSpec, PoolSpec, VolumeSpec,
};
use burrow_core::error::Error;
use burrow_core::types::api::{RecoverPool, SnapshotsPost, VolumesPost};
use burrow_core::types::VolumeType;
use burrow_core::Outcome;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;

fn recover_pool(name: &str, source: &Path) -> RecoverPool {
    RecoverPool {
        name: name.to_string(),
        driver: "dir".to_string(),
        description: String::new(),
        config: HashMap::from([(
            "source".to_string(),
            source.to_string_lossy().into_owned(),
        )]),
    }
}

/// Fabricate an on-disk instance volume the way a running daemon would have
/// left it: a directory with a rootfs and an embedded manifest.
async fn write_instance(source: &Path, pool: &str, project: &str, name: &str, profiles: Vec<String>, networks: Vec<String>) {
    let dir = source.join("containers").join(format!("{}_{}", project, name));
    tokio::fs::create_dir_all(dir.join("rootfs")).await.unwrap();

    let mut expanded = HashMap::new();
    for (i, network) in networks.iter().enumerate() {
        expanded.insert(
            format!("eth{}", i),
            common::device(&[("type", "nic"), ("network", network)]),
        );
    }
    expanded.insert(
        "root".to_string(),
        common::device(&[("type", "disk"), ("path", "/"), ("pool", pool), ("size", "4GiB")]),
    );

    let manifest = BackupConfig {
        pool: Some(PoolSpec {
            name: pool.to_string(),
            driver: "dir".to_string(),
            description: String::new(),
            config: HashMap::from([(
                "source".to_string(),
                source.to_string_lossy().into_owned(),
            )]),
        }),
        container: Some(InstanceSpec {
            name: name.to_string(),
            instance_type: "container".to_string(),
            architecture: "x86_64".to_string(),
            profiles,
            config: HashMap::new(),
            devices: HashMap::new(),
            expanded_devices: expanded,
            created_at: Some(Utc::now()),
        }),
        snapshots: vec![
            InstanceSnapshotSpec { name: "s1".to_string(), ..Default::default() },
            InstanceSnapshotSpec { name: "s2".to_string(), ..Default::default() },
        ],
        ..Default::default()
    };

    tokio::fs::write(dir.join("backup.yaml"), manifest.to_yaml().unwrap()).await.unwrap();
}

async fn write_bucket(source: &Path, project: &str, name: &str) {
    let dir = source.join("buckets").join(format!("{}_{}", project, name));
    tokio::fs::create_dir_all(dir.join("objects")).await.unwrap();

    let manifest = BackupConfig {
        bucket: Some(BucketSpec {
            name: name.to_string(),
            description: String::new(),
            config: HashMap::from([("size".to_string(), "5GiB".to_string())]),
        }),
        ..Default::default()
    };

    tokio::fs::write(dir.join("backup.yaml"), manifest.to_yaml().unwrap()).await.unwrap();
}

async fn write_custom_volume(source: &Path, project: &str, name: &str) {
    let dir = source.join("custom").join(format!("{}_{}", project, name));
    tokio::fs::create_dir_all(dir.join("data")).await.unwrap();
    tokio::fs::create_dir_all(dir.join("snapshots").join("snap0")).await.unwrap();

    let manifest = BackupConfig {
        volume: Some(VolumeSpec {
            name: name.to_string(),
            description: String::new(),
            content_type: "filesystem".to_string(),
            config: HashMap::from([("size".to_string(), "1GiB".to_string())]),
            created_at: Some(Utc::now()),
        }),
        volume_snapshots: vec![burrow_core::backup::VolumeSnapshotSpec {
            name: "snap0".to_string(),
            ..Default::default()
        }],
        ..Default::default()
    };

    tokio::fs::write(dir.join("backup.yaml"), manifest.to_yaml().unwrap()).await.unwrap();
}

#[tokio::test]
async fn test_validate_reports_unknown_volumes() {
    let pool_dir = tempfile::tempdir().unwrap();
    write_instance(pool_dir.path(), "P", "default", "c1", vec!["default".to_string()], vec![]).await;
    write_custom_volume(pool_dir.path(), "default", "vol1").await;
    write_bucket(pool_dir.path(), "default", "artifacts").await;

    // A fresh catalog that has never seen pool P.
    let env = common::server_with_pool("unrelated", tempfile::tempdir().unwrap().path()).await;

    let result = env
        .recovery
        .scan(vec![recover_pool("P", pool_dir.path())], true)
        .await
        .unwrap();

    assert!(result.dependency_errors.is_empty());
    assert_eq!(result.unknown_volumes.len(), 3);

    let instance = result
        .unknown_volumes
        .iter()
        .find(|v| v.volume_type == "container")
        .expect("instance volume reported");
    assert_eq!(instance.pool, "P");
    assert_eq!(instance.project, "default");
    assert_eq!(instance.name, "c1");
    assert_eq!(instance.snapshot_count, 2);

    assert!(result.unknown_volumes.iter().any(|v| v.volume_type == "bucket" && v.name == "artifacts"));
    assert!(result.unknown_volumes.iter().any(|v| v.volume_type == "volume" && v.name == "vol1"));

    // Validation never creates catalog rows.
    assert!(matches!(env.server.catalog.pool_by_name("P").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_missing_dependencies_block_import() {
    let pool_dir = tempfile::tempdir().unwrap();

    // Two instances sharing the same missing profile: the error is reported
    // once.
    for name in ["c1", "c2"] {
        write_instance(
            pool_dir.path(),
            "P",
            "default",
            name,
            vec!["missing-profile".to_string()],
            vec!["missing-net".to_string()],
        )
        .await;
    }

    let env = common::server_with_pool("unrelated", tempfile::tempdir().unwrap().path()).await;

    // Import mode still reports instead of importing when dependencies are
    // missing.
    let result = env
        .recovery
        .scan(vec![recover_pool("P", pool_dir.path())], false)
        .await
        .expect("dependency errors are a report, not a failure");

    assert_eq!(
        result.dependency_errors.iter().filter(|e| e.contains("missing-profile")).count(),
        1
    );
    assert_eq!(
        result.dependency_errors.iter().filter(|e| e.contains("missing-net")).count(),
        1
    );
    assert_eq!(result.unknown_volumes.len(), 2);

    assert!(matches!(env.server.catalog.pool_by_name("P").await, Err(Error::NotFound(_))));
    assert!(matches!(env.server.catalog.instance("default", "c1").await, Err(Error::NotFound(_))));
}

#[tokio::test]
async fn test_import_recreates_catalog() {
    let pool_dir = tempfile::tempdir().unwrap();
    write_instance(pool_dir.path(), "P", "default", "c1", vec!["default".to_string()], vec![]).await;
    write_custom_volume(pool_dir.path(), "default", "vol1").await;
    write_bucket(pool_dir.path(), "default", "artifacts").await;

    let env = common::server_with_pool("unrelated", tempfile::tempdir().unwrap().path()).await;

    let result =
        env.recovery.scan(vec![recover_pool("P", pool_dir.path())], false).await.unwrap();
    assert!(result.unknown_volumes.is_empty());
    assert!(result.dependency_errors.is_empty());

    // Pool row exists, config restored from the embedded manifest.
    let pool = env.server.catalog.pool_by_name("P").await.unwrap();
    assert_eq!(pool.driver, "dir");
    assert_eq!(
        pool.config.get("source").unwrap(),
        &pool_dir.path().to_string_lossy().into_owned()
    );

    // Custom volume plus its snapshot.
    let loaded = env.server.pools.load_by_name("P").await.unwrap();
    let volume = env
        .server
        .catalog
        .volume(loaded.id(), "default", VolumeType::Custom, "vol1", None)
        .await
        .unwrap();
    assert_eq!(volume.config.get("size").unwrap(), "1GiB");
    let snaps = env
        .server
        .catalog
        .snapshots_of(loaded.id(), "default", VolumeType::Custom, "vol1")
        .await
        .unwrap();
    assert_eq!(snaps.len(), 1);

    // Bucket row.
    let buckets = env.server.catalog.buckets(loaded.id()).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].name, "artifacts");

    // Instance row plus two snapshot rows.
    let instance = env.server.catalog.instance("default", "c1").await.unwrap();
    assert!(!instance.snapshot);
    assert!(env.server.catalog.instance("default", "c1/s1").await.unwrap().snapshot);
    assert!(env.server.catalog.instance("default", "c1/s2").await.unwrap().snapshot);

    // The instance's volume rows as well.
    assert!(env
        .server
        .catalog
        .volume_exists(loaded.id(), "default", VolumeType::Container, "c1")
        .await
        .unwrap());

    // The root disk quota was re-applied through the driver.
    let quota = pool_dir.path().join("containers").join("default_c1").join("quota");
    let content = tokio::fs::read_to_string(quota).await.unwrap();
    assert!(content.starts_with("4GiB"));

    // Importing again finds nothing unknown.
    let result =
        env.recovery.scan(vec![recover_pool("P", pool_dir.path())], true).await.unwrap();
    assert!(result.unknown_volumes.is_empty());
}

#[tokio::test]
async fn test_recovery_roundtrip_matches_projection() {
    // Build state through the services, then recover it into a brand-new
    // catalog and compare the volume projection.
    let pool_dir = tempfile::tempdir().unwrap();
    let env = common::server_with_pool("P", pool_dir.path()).await;

    let mut req = VolumesPost {
        name: "vol1".to_string(),
        volume_type: "custom".to_string(),
        ..Default::default()
    };
    req.config.insert("snapshots.expiry".to_string(), "7d".to_string());
    match env.volumes.create("P", "default", req).await.unwrap() {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }
    for name in ["snap0", "snap1"] {
        let op = env
            .snapshots
            .create("P", "default", "vol1", SnapshotsPost { name: name.to_string(), expires_at: None })
            .await
            .unwrap();
        op.wait().await.unwrap();
    }

    let old_pool = env.server.pools.load_by_name("P").await.unwrap();
    let before: Vec<(String, String)> = {
        let mut rows = env
            .server
            .catalog
            .snapshots_of(old_pool.id(), "default", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows.iter().map(|v| (v.name.clone(), v.volume_type.to_string())).collect()
    };

    // A wiped catalog: new server over the same disk.
    let fresh = common::server_with_pool("unrelated", tempfile::tempdir().unwrap().path()).await;
    let result =
        fresh.recovery.scan(vec![recover_pool("P", pool_dir.path())], false).await.unwrap();
    assert!(result.dependency_errors.is_empty());

    let pool = fresh.server.pools.load_by_name("P").await.unwrap();
    let volume = fresh
        .server
        .catalog
        .volume(pool.id(), "default", VolumeType::Custom, "vol1", None)
        .await
        .unwrap();
    assert_eq!(volume.config.get("snapshots.expiry").unwrap(), "7d");

    let after: Vec<(String, String)> = {
        let mut rows = fresh
            .server
            .catalog
            .snapshots_of(pool.id(), "default", VolumeType::Custom, "vol1")
            .await
            .unwrap();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows.iter().map(|v| (v.name.clone(), v.volume_type.to_string())).collect()
    };

    assert_eq!(before, after);
}
