//! End-to-end volume lifecycle tests against a dir-backed pool.

mod common;

use burrow_core::error::Error;
use burrow_core::ops::OpContext;
use burrow_core::snapshots::scheduler;
use burrow_core::types::api::{SnapshotsPost, VolumePost, VolumePut, VolumesPost};
use burrow_core::types::instance::InstanceRecord;
use burrow_core::types::volume::etag;
use burrow_core::types::VolumeType;
use burrow_core::Outcome;
use chrono::{Duration, Utc};
use std::collections::HashMap;

fn create_req(name: &str) -> VolumesPost {
    VolumesPost { name: name.to_string(), volume_type: "custom".to_string(), ..Default::default() }
}

async fn create_volume(env: &common::TestEnv, name: &str) {
    match env.volumes.create("local", "default", create_req(name)).await.unwrap() {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }
}

#[tokio::test]
async fn test_create_is_sync_and_unique() {
    let env = common::env().await;

    create_volume(&env, "vol1").await;

    let (info, _) = env.volumes.get("local", "default", VolumeType::Custom, "vol1").await.unwrap();
    assert_eq!(info.name, "vol1");
    assert_eq!(info.content_type, "filesystem");

    // Standalone servers report no location.
    assert_eq!(info.location, "");

    let err = env.volumes.create("local", "default", create_req("vol1")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    let err = env.volumes.create("local", "default", create_req("a/b")).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));

    let err = env.volumes.create("local", "default", create_req("")).await.unwrap_err();
    assert!(matches!(err, Error::BadRequest(_)));
}

#[tokio::test]
async fn test_snapshot_pattern_sequence() {
    let env = common::env().await;
    create_volume(&env, "vol1").await;

    // Explicit name first.
    let op = env
        .snapshots
        .create("local", "default", "vol1", SnapshotsPost { name: "snap0".to_string(), expires_at: None })
        .await
        .unwrap();
    op.wait().await.unwrap();

    // Empty name derives snap1 from the default pattern.
    let op = env
        .snapshots
        .create("local", "default", "vol1", SnapshotsPost::default())
        .await
        .unwrap();
    op.wait().await.unwrap();

    let snapshots = env.snapshots.list("local", "default", "vol1").await.unwrap();
    let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["vol1/snap0", "vol1/snap1"]);

    // Duplicate explicit name conflicts.
    let err = env
        .snapshots
        .create("local", "default", "vol1", SnapshotsPost { name: "snap0".to_string(), expires_at: None })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_rename_roundtrip_restores_etag() {
    let env = common::env().await;

    let mut req = create_req("vol1");
    req.config.insert("size".to_string(), "1GiB".to_string());
    match env.volumes.create("local", "default", req).await.unwrap() {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    let (_, tag_before) =
        env.volumes.get("local", "default", VolumeType::Custom, "vol1").await.unwrap();

    let rename = |to: &str| VolumePost { name: to.to_string(), ..Default::default() };

    match env
        .volumes
        .rename_or_move("local", "default", VolumeType::Custom, "vol1", rename("vol2"), None)
        .await
        .unwrap()
    {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    assert!(env.volumes.get("local", "default", VolumeType::Custom, "vol2").await.is_ok());
    assert!(matches!(
        env.volumes.get("local", "default", VolumeType::Custom, "vol1").await,
        Err(Error::NotFound(_))
    ));

    match env
        .volumes
        .rename_or_move("local", "default", VolumeType::Custom, "vol2", rename("vol1"), None)
        .await
        .unwrap()
    {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    let (_, tag_after) =
        env.volumes.get("local", "default", VolumeType::Custom, "vol1").await.unwrap();
    assert_eq!(tag_before, tag_after);
}

#[tokio::test]
async fn test_move_updates_consumers() {
    let env = common::env().await;
    let other_dir = tempfile::tempdir().unwrap();
    common::insert_pool(&env.server.catalog, "fast", other_dir.path()).await;

    create_volume(&env, "vol1").await;
    let op = env
        .snapshots
        .create("local", "default", "vol1", SnapshotsPost { name: "snap0".to_string(), expires_at: None })
        .await
        .unwrap();
    op.wait().await.unwrap();

    // A profile and a stopped instance both reference the volume.
    let mut devices = HashMap::new();
    devices.insert(
        "data".to_string(),
        common::device(&[("type", "disk"), ("pool", "local"), ("source", "vol1"), ("path", "/data")]),
    );
    env.server
        .catalog
        .insert_profile("default", "with-data", &HashMap::new(), &devices)
        .await
        .unwrap();
    env.server
        .catalog
        .insert_instance(&InstanceRecord {
            id: 0,
            project: "default".to_string(),
            name: "c1".to_string(),
            instance_type: "container".to_string(),
            snapshot: false,
            architecture: "x86_64".to_string(),
            config: HashMap::new(),
            devices: devices.clone(),
            expanded_devices: devices.clone(),
            profiles: vec!["default".to_string()],
            running: false,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let req = VolumePost {
        name: "vol1".to_string(),
        pool: "fast".to_string(),
        ..Default::default()
    };

    match env
        .volumes
        .rename_or_move("local", "default", VolumeType::Custom, "vol1", req, None)
        .await
        .unwrap()
    {
        Outcome::Done => panic!("move must run as an operation"),
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    // Volume only exists on the new pool, snapshots included.
    assert!(matches!(
        env.volumes.get("local", "default", VolumeType::Custom, "vol1").await,
        Err(Error::NotFound(_))
    ));
    let (info, _) = env.volumes.get("fast", "default", VolumeType::Custom, "vol1").await.unwrap();
    assert_eq!(info.name, "vol1");
    let snaps = env.snapshots.list("fast", "default", "vol1").await.unwrap();
    assert_eq!(snaps.len(), 1);

    // Every consumer now references the new pool.
    let profile = env.server.catalog.profile("default", "with-data").await.unwrap();
    assert_eq!(profile.devices["data"]["pool"], "fast");

    let instance = env.server.catalog.instance("default", "c1").await.unwrap();
    assert_eq!(instance.devices["data"]["pool"], "fast");
}

#[tokio::test]
async fn test_rename_rejected_while_consumer_running() {
    let env = common::env().await;
    create_volume(&env, "vol1").await;

    let mut devices = HashMap::new();
    devices.insert(
        "data".to_string(),
        common::device(&[("type", "disk"), ("pool", "local"), ("source", "vol1"), ("path", "/data")]),
    );
    env.server
        .catalog
        .insert_instance(&InstanceRecord {
            id: 0,
            project: "default".to_string(),
            name: "c1".to_string(),
            instance_type: "container".to_string(),
            snapshot: false,
            architecture: String::new(),
            config: HashMap::new(),
            devices: devices.clone(),
            expanded_devices: devices,
            profiles: Vec::new(),
            running: true,
            created_at: Utc::now(),
        })
        .await
        .unwrap();

    let req = VolumePost { name: "vol2".to_string(), ..Default::default() };
    let err = env
        .volumes
        .rename_or_move("local", "default", VolumeType::Custom, "vol1", req, None)
        .await
        .unwrap_err();
    assert!(err.to_string().contains("running instances"));

    // Deleting is also blocked while the instance references it.
    let err =
        env.volumes.delete("local", "default", VolumeType::Custom, "vol1").await.unwrap_err();
    assert!(err.to_string().contains("still in use"));
}

#[tokio::test]
async fn test_update_restore_and_etag_precondition() {
    let env = common::env().await;
    create_volume(&env, "vol1").await;

    let op = env
        .snapshots
        .create("local", "default", "vol1", SnapshotsPost { name: "snap0".to_string(), expires_at: None })
        .await
        .unwrap();
    op.wait().await.unwrap();

    // Restore and config change in the same request: restore runs first.
    let put = VolumePut {
        description: Some("restored".to_string()),
        config: Some(HashMap::from([("size".to_string(), "2GiB".to_string())])),
        restore: "snap0".to_string(),
    };
    env.volumes.update("local", "default", VolumeType::Custom, "vol1", put, None).await.unwrap();

    let (info, tag) =
        env.volumes.get("local", "default", VolumeType::Custom, "vol1").await.unwrap();
    assert_eq!(info.description, "restored");
    assert_eq!(info.config.get("size").unwrap(), "2GiB");

    // A stale ETag is rejected before anything happens.
    let stale = etag("vol1", VolumeType::Custom, &HashMap::new());
    assert_ne!(stale, tag);
    let err = env
        .volumes
        .update(
            "local",
            "default",
            VolumeType::Custom,
            "vol1",
            VolumePut { description: Some("x".to_string()), ..Default::default() },
            Some(&stale),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PreconditionFailed(_)));

    // The current ETag is accepted.
    env.volumes
        .update(
            "local",
            "default",
            VolumeType::Custom,
            "vol1",
            VolumePut { description: Some("x".to_string()), ..Default::default() },
            Some(&tag),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_scheduler_tick_prunes_then_creates_once() {
    let env = common::env().await;

    let mut req = create_req("vol1");
    req.config.insert("snapshots.schedule".to_string(), "* * * * *".to_string());
    match env.volumes.create("local", "default", req).await.unwrap() {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    // One already-expired snapshot.
    let op = env
        .snapshots
        .create(
            "local",
            "default",
            "vol1",
            SnapshotsPost {
                name: "old".to_string(),
                expires_at: Some(Utc::now() - Duration::hours(1)),
            },
        )
        .await
        .unwrap();
    op.wait().await.unwrap();

    let now = Utc::now();
    let mut ctx = OpContext::background();

    let report = scheduler::tick(&env.snapshots, now, &mut ctx).await.unwrap();
    assert_eq!(report.pruned, 1);
    assert_eq!(report.created, 1);

    let snapshots = env.snapshots.list("local", "default", "vol1").await.unwrap();
    let names: Vec<&str> = snapshots.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["vol1/snap0"]);

    // The same minute tick again: nothing left to do.
    let report = scheduler::tick(&env.snapshots, now, &mut ctx).await.unwrap();
    assert_eq!(report.pruned, 0);
    assert_eq!(report.created, 0);
}

#[tokio::test]
async fn test_copy_with_and_without_snapshots() {
    let env = common::env().await;
    create_volume(&env, "vol1").await;

    let op = env
        .snapshots
        .create("local", "default", "vol1", SnapshotsPost { name: "snap0".to_string(), expires_at: None })
        .await
        .unwrap();
    op.wait().await.unwrap();

    let mut req = create_req("vol2");
    req.source.source_type = "copy".to_string();
    req.source.name = "vol1".to_string();
    match env.volumes.create("local", "default", req).await.unwrap() {
        Outcome::Done => panic!("copy must run as an operation"),
        Outcome::Async(op) => op.wait().await.unwrap(),
    }
    assert_eq!(env.snapshots.list("local", "default", "vol2").await.unwrap().len(), 1);

    let mut req = create_req("vol3");
    req.source.source_type = "copy".to_string();
    req.source.name = "vol1".to_string();
    req.source.volume_only = true;
    match env.volumes.create("local", "default", req).await.unwrap() {
        Outcome::Done => panic!("copy must run as an operation"),
        Outcome::Async(op) => op.wait().await.unwrap(),
    }
    assert!(env.snapshots.list("local", "default", "vol3").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_iso_import() {
    let env = common::env().await;

    let payload: &[u8] = b"fake iso payload";
    match env.volumes.import_iso("local", "default", "install-media", payload).await.unwrap() {
        Outcome::Done => panic!("ISO import must run as an operation"),
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    let (info, _) =
        env.volumes.get("local", "default", VolumeType::Custom, "install-media").await.unwrap();
    assert_eq!(info.content_type, "iso");
    assert_eq!(info.config.get("size").unwrap(), &payload.len().to_string());
}

#[tokio::test]
async fn test_backup_roundtrip_preserves_config_and_snapshots() {
    let env = common::env().await;

    let mut req = create_req("vol1");
    req.config.insert("snapshots.expiry".to_string(), "7d".to_string());
    match env.volumes.create("local", "default", req).await.unwrap() {
        Outcome::Done => {}
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    let expiry = Utc::now() + Duration::days(7);
    for (name, expires) in [("snap0", Some(expiry)), ("snap1", None)] {
        let op = env
            .snapshots
            .create(
                "local",
                "default",
                "vol1",
                SnapshotsPost { name: name.to_string(), expires_at: expires },
            )
            .await
            .unwrap();
        op.wait().await.unwrap();
    }

    // Export through the driver, then import as a new volume.
    let pool = env.server.pools.load_by_name("local").await.unwrap();
    let tarball = tempfile::NamedTempFile::new().unwrap();
    let file = tokio::fs::File::create(tarball.path()).await.unwrap();
    pool.driver()
        .export_custom_volume("default", "vol1", true, Box::pin(file))
        .await
        .unwrap();

    let file = tokio::fs::File::open(tarball.path()).await.unwrap();
    match env.volumes.import_backup("local", "default", "vol1-restored", file).await.unwrap() {
        Outcome::Done => panic!("backup import must run as an operation"),
        Outcome::Async(op) => op.wait().await.unwrap(),
    }

    let (original, _) =
        env.volumes.get("local", "default", VolumeType::Custom, "vol1").await.unwrap();
    let (restored, _) =
        env.volumes.get("local", "default", VolumeType::Custom, "vol1-restored").await.unwrap();
    assert_eq!(original.config, restored.config);

    let original_snaps = env.snapshots.list("local", "default", "vol1").await.unwrap();
    let restored_snaps = env.snapshots.list("local", "default", "vol1-restored").await.unwrap();
    assert_eq!(original_snaps.len(), restored_snaps.len());
    for (a, b) in original_snaps.iter().zip(&restored_snaps) {
        let a_name = a.name.split('/').next_back().unwrap();
        let b_name = b.name.split('/').next_back().unwrap();
        assert_eq!(a_name, b_name);
        assert_eq!(a.expires_at, b.expires_at);
    }
}
