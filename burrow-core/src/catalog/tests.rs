use crate::catalog::{Catalog, NewVolume, VolumeFilter};
use crate::error::Error;
use crate::types::{ContentType, PoolRecord, PoolStatus, VolumeType};
use chrono::{Duration, Utc};
use std::collections::HashMap;

async fn catalog_with_pool() -> (Catalog, i64) {
    let catalog = Catalog::new_in_memory().await.unwrap();
    catalog.insert_member("m1", "").await.unwrap();
    catalog.insert_project("default", &HashMap::new()).await.unwrap();

    let pool_id = catalog
        .insert_pool(&PoolRecord {
            id: 0,
            name: "local".to_string(),
            driver: "dir".to_string(),
            description: String::new(),
            config: HashMap::new(),
            status: PoolStatus::Created,
        })
        .await
        .unwrap();

    (catalog, pool_id)
}

fn new_volume(pool_id: i64, name: &str) -> NewVolume {
    NewVolume {
        pool_id,
        project: "default".to_string(),
        name: name.to_string(),
        volume_type: VolumeType::Custom,
        content_type: ContentType::Filesystem,
        description: String::new(),
        config: HashMap::new(),
        node_id: 1,
        created_at: Utc::now(),
        expiry_at: None,
    }
}

#[tokio::test]
async fn test_pool_roundtrip() {
    let (catalog, pool_id) = catalog_with_pool().await;

    let record = catalog.pool_by_name("local").await.unwrap();
    assert_eq!(record.id, pool_id);
    assert_eq!(record.driver, "dir");
    assert_eq!(record.status, PoolStatus::Created);

    assert!(matches!(catalog.pool_by_name("missing").await, Err(Error::NotFound(_))));

    catalog.set_pool_status(pool_id, PoolStatus::Errored).await.unwrap();
    assert_eq!(catalog.pool_by_name("local").await.unwrap().status, PoolStatus::Errored);
}

#[tokio::test]
async fn test_volume_create_and_conflict() {
    let (catalog, pool_id) = catalog_with_pool().await;

    let mut args = new_volume(pool_id, "vol1");
    args.config.insert("size".to_string(), "10GiB".to_string());
    catalog.create_volume(&args).await.unwrap();

    let volume = catalog
        .volume(pool_id, "default", VolumeType::Custom, "vol1", None)
        .await
        .unwrap();
    assert_eq!(volume.config.get("size").unwrap(), "10GiB");
    assert_eq!(volume.location, "m1");

    // Same identity again is a conflict.
    assert!(matches!(catalog.create_volume(&args).await, Err(Error::Conflict(_))));

    // Same name, different type is fine.
    args.volume_type = VolumeType::Image;
    catalog.create_volume(&args).await.unwrap();
}

#[tokio::test]
async fn test_volume_listing_is_sorted() {
    let (catalog, pool_id) = catalog_with_pool().await;

    catalog.create_volume(&new_volume(pool_id, "zebra")).await.unwrap();
    catalog.create_volume(&new_volume(pool_id, "alpha")).await.unwrap();

    let mut img = new_volume(pool_id, "beta");
    img.volume_type = VolumeType::Image;
    catalog.create_volume(&img).await.unwrap();

    let volumes = catalog
        .volumes(&VolumeFilter { pool_id: Some(pool_id), ..Default::default() })
        .await
        .unwrap();

    let names: Vec<(String, String)> =
        volumes.iter().map(|v| (v.volume_type.to_string(), v.name.clone())).collect();

    // Type ascending first (image sorts before custom), then name ascending.
    assert_eq!(
        names,
        vec![
            ("image".to_string(), "beta".to_string()),
            ("custom".to_string(), "alpha".to_string()),
            ("custom".to_string(), "zebra".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_rename_cascades_to_snapshots() {
    let (catalog, pool_id) = catalog_with_pool().await;

    catalog.create_volume(&new_volume(pool_id, "vol1")).await.unwrap();
    catalog.create_volume(&new_volume(pool_id, "vol1/snap0")).await.unwrap();
    catalog.create_volume(&new_volume(pool_id, "vol1/snap1")).await.unwrap();

    catalog.rename_volume(pool_id, "default", VolumeType::Custom, "vol1", "vol2").await.unwrap();

    assert!(catalog
        .volume(pool_id, "default", VolumeType::Custom, "vol2", None)
        .await
        .is_ok());
    assert!(matches!(
        catalog.volume(pool_id, "default", VolumeType::Custom, "vol1", None).await,
        Err(Error::NotFound(_))
    ));

    let snaps = catalog.snapshots_of(pool_id, "default", VolumeType::Custom, "vol2").await.unwrap();
    let names: Vec<&str> = snaps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["vol2/snap0", "vol2/snap1"]);
}

#[tokio::test]
async fn test_delete_cascades_to_snapshots() {
    let (catalog, pool_id) = catalog_with_pool().await;

    catalog.create_volume(&new_volume(pool_id, "vol1")).await.unwrap();
    catalog.create_volume(&new_volume(pool_id, "vol1/snap0")).await.unwrap();

    catalog.delete_volume(pool_id, "default", VolumeType::Custom, "vol1").await.unwrap();

    assert!(!catalog.volume_exists(pool_id, "default", VolumeType::Custom, "vol1").await.unwrap());
    let snaps = catalog.snapshots_of(pool_id, "default", VolumeType::Custom, "vol1").await.unwrap();
    assert!(snaps.is_empty());
}

#[tokio::test]
async fn test_next_snapshot_index() {
    let (catalog, pool_id) = catalog_with_pool().await;

    catalog.create_volume(&new_volume(pool_id, "vol1")).await.unwrap();

    // No snapshots yet.
    let i = catalog
        .next_snapshot_index(pool_id, "default", VolumeType::Custom, "vol1", "snap%d")
        .await
        .unwrap();
    assert_eq!(i, 0);

    // snap0 and snap1 exist.
    catalog.create_volume(&new_volume(pool_id, "vol1/snap0")).await.unwrap();
    catalog.create_volume(&new_volume(pool_id, "vol1/snap1")).await.unwrap();
    let i = catalog
        .next_snapshot_index(pool_id, "default", VolumeType::Custom, "vol1", "snap%d")
        .await
        .unwrap();
    assert_eq!(i, 2);

    // Holes are reused.
    catalog.delete_volume(pool_id, "default", VolumeType::Custom, "vol1/snap0").await.unwrap();
    let i = catalog
        .next_snapshot_index(pool_id, "default", VolumeType::Custom, "vol1", "snap%d")
        .await
        .unwrap();
    assert_eq!(i, 0);

    // Other patterns don't collide with the existing names.
    let i = catalog
        .next_snapshot_index(pool_id, "default", VolumeType::Custom, "vol1", "weekly%d")
        .await
        .unwrap();
    assert_eq!(i, 0);
}

#[tokio::test]
async fn test_expired_snapshots() {
    let (catalog, pool_id) = catalog_with_pool().await;

    catalog.create_volume(&new_volume(pool_id, "vol1")).await.unwrap();

    let mut expired = new_volume(pool_id, "vol1/old");
    expired.expiry_at = Some(Utc::now() - Duration::hours(1));
    catalog.create_volume(&expired).await.unwrap();

    let mut fresh = new_volume(pool_id, "vol1/new");
    fresh.expiry_at = Some(Utc::now() + Duration::hours(1));
    catalog.create_volume(&fresh).await.unwrap();

    let mut remote = new_volume(pool_id, "vol1/remote-old");
    remote.expiry_at = Some(Utc::now() - Duration::hours(2));
    remote.node_id = crate::cluster::NODE_ID_REMOTE;
    catalog.create_volume(&remote).await.unwrap();

    let expired = catalog.expired_snapshots(Utc::now()).await.unwrap();
    let names: Vec<&str> = expired.iter().map(|r| r.volume.name.as_str()).collect();
    assert_eq!(names, vec!["vol1/remote-old", "vol1/old"]);

    let remote_entry = expired.iter().find(|r| r.volume.name == "vol1/remote-old").unwrap();
    assert_eq!(remote_entry.volume.node_id, crate::cluster::NODE_ID_REMOTE);
    assert_eq!(remote_entry.volume.location, "");
    assert_eq!(remote_entry.pool_name, "local");
}

#[tokio::test]
async fn test_update_volume_replaces_config() {
    let (catalog, pool_id) = catalog_with_pool().await;

    let mut args = new_volume(pool_id, "vol1");
    args.config.insert("size".to_string(), "1GiB".to_string());
    args.config.insert("snapshots.expiry".to_string(), "7d".to_string());
    let id = catalog.create_volume(&args).await.unwrap();

    let mut config = HashMap::new();
    config.insert("size".to_string(), "2GiB".to_string());
    catalog.update_volume(id, "resized", &config, None).await.unwrap();

    let volume = catalog
        .volume(pool_id, "default", VolumeType::Custom, "vol1", None)
        .await
        .unwrap();
    assert_eq!(volume.description, "resized");
    assert_eq!(volume.config.get("size").unwrap(), "2GiB");
    assert!(!volume.config.contains_key("snapshots.expiry"));
}

#[tokio::test]
async fn test_bucket_roundtrip() {
    let (catalog, pool_id) = catalog_with_pool().await;

    let mut config = HashMap::new();
    config.insert("size".to_string(), "5GiB".to_string());
    catalog.insert_bucket(pool_id, "default", "artifacts", "", &config).await.unwrap();

    let buckets = catalog.buckets(pool_id).await.unwrap();
    assert_eq!(buckets.len(), 1);
    assert_eq!(buckets[0].name, "artifacts");
    assert_eq!(buckets[0].config.get("size").unwrap(), "5GiB");

    assert!(matches!(
        catalog.insert_bucket(pool_id, "default", "artifacts", "", &config).await,
        Err(Error::Conflict(_))
    ));

    catalog.delete_bucket(pool_id, "default", "artifacts").await.unwrap();
    assert!(catalog.buckets(pool_id).await.unwrap().is_empty());
}
