//! Pool registry: loaded pool handles and temporary (pre-catalog) pools.
//!
//! A [`Pool`] couples a catalog record with a live driver. The registry
//! guarantees at most one live handle per pool name; temporary handles used
//! by recovery are never memoized and never persist unless explicitly
//! registered.

use crate::catalog::Catalog;
use crate::drivers::{DriverFactory, PoolDriver};
use crate::error::{Error, Result};
use crate::types::{PoolRecord, PoolStatus, POOL_ID_TEMPORARY};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

/// A loaded storage pool: catalog record plus driver.
pub struct Pool {
    record: RwLock<PoolRecord>,
    driver: Box<dyn PoolDriver>,
}

impl Pool {
    fn new(record: PoolRecord, driver: Box<dyn PoolDriver>) -> Self {
        Self { record: RwLock::new(record), driver }
    }

    /// Pool name.
    pub fn name(&self) -> String {
        self.record.read().expect("pool record lock poisoned").name.clone()
    }

    /// Catalog row ID, [`POOL_ID_TEMPORARY`] for unregistered handles.
    pub fn id(&self) -> i64 {
        self.record.read().expect("pool record lock poisoned").id
    }

    /// Whether this handle has no catalog row yet.
    pub fn is_temporary(&self) -> bool {
        self.id() == POOL_ID_TEMPORARY
    }

    /// Snapshot of the catalog record.
    pub fn record(&self) -> PoolRecord {
        self.record.read().expect("pool record lock poisoned").clone()
    }

    /// The backing driver.
    pub fn driver(&self) -> &dyn PoolDriver {
        self.driver.as_ref()
    }

    /// Mount the pool; returns whether this call performed the mount.
    pub async fn mount(&self) -> Result<bool> {
        self.driver.mount().await
    }

    /// Unmount the pool; returns whether it was mounted.
    pub async fn unmount(&self) -> Result<bool> {
        self.driver.unmount().await
    }

    fn graduate(&self, id: i64) {
        let mut record = self.record.write().expect("pool record lock poisoned");
        record.id = id;
        record.status = PoolStatus::Created;
    }
}

/// In-memory map from pool name to loaded handle.
pub struct PoolRegistry {
    catalog: Catalog,
    pools: Mutex<HashMap<String, Arc<Pool>>>,
}

impl PoolRegistry {
    /// Create a registry over a catalog.
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog, pools: Mutex::new(HashMap::new()) }
    }

    /// Load a pool by name, resolving against the catalog on first use.
    ///
    /// The handle is memoized; the pool is mounted as a side effect so its
    /// directories exist before any volume work.
    #[instrument(skip(self))]
    pub async fn load_by_name(&self, name: &str) -> Result<Arc<Pool>> {
        let mut pools = self.pools.lock().await;

        if let Some(pool) = pools.get(name) {
            return Ok(pool.clone());
        }

        let record = self.catalog.pool_by_name(name).await?;
        let mut driver = DriverFactory::create(&record.driver, &record.name, record.config.clone())?;
        driver.fill_config()?;

        let pool = Arc::new(Pool::new(record, driver));
        pool.mount().await?;

        debug!(pool = %name, "Loaded storage pool");
        pools.insert(name.to_string(), pool.clone());

        Ok(pool)
    }

    /// Construct an unregistered pool handle from user-supplied info.
    ///
    /// Used only by the recovery engine; the handle is not memoized and its
    /// ID stays [`POOL_ID_TEMPORARY`] until [`Self::register`] is called. A
    /// temporary handle that never graduates must be unmounted by its
    /// creator.
    #[instrument(skip(self, config))]
    pub async fn new_temporary(
        &self,
        name: &str,
        driver_name: &str,
        config: HashMap<String, String>,
    ) -> Result<Arc<Pool>> {
        let mut driver = DriverFactory::create(driver_name, name, config)?;
        driver.fill_config()?;
        driver.validate(&driver.config())?;

        let record = PoolRecord {
            id: POOL_ID_TEMPORARY,
            name: name.to_string(),
            driver: driver_name.to_string(),
            description: String::new(),
            config: driver.config(),
            status: PoolStatus::Created,
        };

        Ok(Arc::new(Pool::new(record, driver)))
    }

    /// Persist a temporary pool and transition it to `created`.
    ///
    /// `config_override` replaces the persisted configuration (recovery
    /// prefers the config embedded in a backup manifest over the
    /// user-supplied one). Returns the new catalog row ID; the handle is
    /// memoized from here on, so its mount outlives the recovery scan.
    #[instrument(skip(self, pool, config_override), fields(pool = %pool.name()))]
    pub async fn register(
        &self,
        pool: &Arc<Pool>,
        config_override: Option<HashMap<String, String>>,
    ) -> Result<i64> {
        if !pool.is_temporary() {
            return Err(Error::Internal(format!(
                "Pool {:?} is already registered",
                pool.name()
            )));
        }

        let mut record = pool.record();
        record.status = PoolStatus::Pending;
        if let Some(config) = config_override {
            record.config = config;
        }
        let id = self.catalog.insert_pool(&record).await?;

        // Local apply already happened (the pool is mounted), so the record
        // moves straight to created.
        self.catalog.set_pool_status(id, PoolStatus::Created).await?;
        pool.graduate(id);

        let mut pools = self.pools.lock().await;
        pools.insert(pool.name(), pool.clone());

        info!(pool = %pool.name(), id, "Registered recovered storage pool");
        Ok(id)
    }

    /// Drop the catalog row of a pool and forget its handle.
    pub async fn deregister(&self, name: &str) -> Result<()> {
        self.catalog.delete_pool(name).await?;
        self.pools.lock().await.remove(name);
        Ok(())
    }

    /// Forget a memoized handle without touching the catalog.
    pub async fn forget(&self, name: &str) {
        self.pools.lock().await.remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn registry_with_pool(source: &std::path::Path) -> (PoolRegistry, Catalog) {
        let catalog = Catalog::new_in_memory().await.unwrap();
        catalog.insert_member("m1", "").await.unwrap();

        let mut config = HashMap::new();
        config.insert("source".to_string(), source.to_string_lossy().into_owned());
        catalog
            .insert_pool(&PoolRecord {
                id: 0,
                name: "local".to_string(),
                driver: "dir".to_string(),
                description: String::new(),
                config,
                status: PoolStatus::Created,
            })
            .await
            .unwrap();

        (PoolRegistry::new(catalog.clone()), catalog)
    }

    #[tokio::test]
    async fn test_load_by_name_memoizes() {
        let tmp = tempfile::tempdir().unwrap();
        let (registry, _catalog) = registry_with_pool(tmp.path()).await;

        let a = registry.load_by_name("local").await.unwrap();
        let b = registry.load_by_name("local").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        assert!(matches!(
            registry.load_by_name("missing").await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_temporary_pool_graduates() {
        let tmp = tempfile::tempdir().unwrap();
        let catalog = Catalog::new_in_memory().await.unwrap();
        let registry = PoolRegistry::new(catalog.clone());

        let mut config = HashMap::new();
        config.insert("source".to_string(), tmp.path().to_string_lossy().into_owned());

        let pool = registry.new_temporary("recovered", "dir", config).await.unwrap();
        assert!(pool.is_temporary());

        pool.mount().await.unwrap();
        let id = registry.register(&pool, None).await.unwrap();
        assert!(!pool.is_temporary());
        assert_eq!(pool.id(), id);

        let record = catalog.pool_by_name("recovered").await.unwrap();
        assert_eq!(record.status, PoolStatus::Created);

        // Registering twice is an error.
        assert!(registry.register(&pool, None).await.is_err());
    }
}
