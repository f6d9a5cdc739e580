//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use burrow_core::catalog::Catalog;
use burrow_core::server::Server;
use burrow_core::types::{PoolRecord, PoolStatus};
use burrow_core::{RecoveryService, SnapshotService, VolumeService};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use tempfile::TempDir;

static DATA_DIR: OnceLock<TempDir> = OnceLock::new();

/// Point the scratch directories at a process-wide tempdir.
pub fn init_data_dir() {
    let dir = DATA_DIR.get_or_init(|| tempfile::tempdir().expect("create data dir"));
    std::env::set_var("BURROW_DATA_DIR", dir.path());
}

pub struct TestEnv {
    pub server: Arc<Server>,
    pub volumes: VolumeService,
    pub snapshots: SnapshotService,
    pub recovery: RecoveryService,
    pub member_id: i64,
    pub _pool_dir: Option<TempDir>,
}

pub fn device(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// A standalone server with a default project, a default profile rooted on
/// `pool_name` and one dir-backed pool at `source`.
pub async fn server_with_pool(pool_name: &str, source: &Path) -> TestEnv {
    init_data_dir();

    let catalog = Catalog::new_in_memory().await.expect("open catalog");
    let member_id = catalog.insert_member("m1", "").await.expect("insert member");
    catalog.insert_project("default", &HashMap::new()).await.expect("insert project");

    let mut root = HashMap::new();
    root.insert("root".to_string(), device(&[("type", "disk"), ("path", "/"), ("pool", pool_name)]));
    catalog.insert_profile("default", "default", &HashMap::new(), &root).await.expect("profile");

    insert_pool(&catalog, pool_name, source).await;

    let server = Server::standalone(catalog, "m1", member_id);

    TestEnv {
        volumes: VolumeService::new(server.clone()),
        snapshots: SnapshotService::new(server.clone()),
        recovery: RecoveryService::new(server.clone()),
        server,
        member_id,
        _pool_dir: None,
    }
}

/// A fresh env owning its pool directory.
pub async fn env() -> TestEnv {
    let pool_dir = tempfile::tempdir().expect("create pool dir");
    let mut env = server_with_pool("local", pool_dir.path()).await;
    env._pool_dir = Some(pool_dir);
    env
}

/// Register an extra dir pool on an existing env.
pub async fn insert_pool(catalog: &Catalog, name: &str, source: &Path) {
    let mut config = HashMap::new();
    config.insert("source".to_string(), source.to_string_lossy().into_owned());

    catalog
        .insert_pool(&PoolRecord {
            id: 0,
            name: name.to_string(),
            driver: "dir".to_string(),
            description: String::new(),
            config,
            status: PoolStatus::Created,
        })
        .await
        .expect("insert pool");
}
