//! The volume catalog: transactional metadata store for pools, volumes,
//! snapshots and buckets, backed by SQLite.
//!
//! Every row in here is a claim about on-disk reality; the lifecycle
//! services keep the two in sync through reverters. Catalog writes retry on
//! SQLite serialization conflicts and surface every other failure as an
//! internal database error.

use crate::cluster::Member;
use crate::error::{Error, Result};
use crate::project::{Profile, Project};
use crate::types::volume::{self, is_snapshot, SNAPSHOT_DELIMITER};
use crate::types::{ContentType, InstanceRecord, PoolRecord, PoolStatus, Volume, VolumeType};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{ConnectOptions, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, instrument};

pub mod migrations;

#[cfg(test)]
mod tests;

const TX_RETRIES: u32 = 5;

/// Arguments for inserting a new volume row.
#[derive(Debug, Clone)]
pub struct NewVolume {
    pub pool_id: i64,
    pub project: String,
    pub name: String,
    pub volume_type: VolumeType,
    pub content_type: ContentType,
    pub description: String,
    pub config: HashMap<String, String>,
    pub node_id: i64,
    pub created_at: DateTime<Utc>,
    pub expiry_at: Option<DateTime<Utc>>,
}

/// Filter for volume listings.
#[derive(Debug, Clone, Default)]
pub struct VolumeFilter {
    pub pool_id: Option<i64>,
    pub project: Option<String>,
    pub volume_type: Option<VolumeType>,
    pub node_id: Option<i64>,
    pub include_snapshots: bool,
}

/// A snapshot row joined with its pool name, as consumed by the scheduler.
#[derive(Debug, Clone)]
pub struct VolumeRef {
    pub volume: Volume,
    pub pool_name: String,
}

/// A bucket catalog record.
#[derive(Debug, Clone)]
pub struct Bucket {
    pub id: i64,
    pub pool_id: i64,
    pub project: String,
    pub name: String,
    pub description: String,
    pub config: HashMap<String, String>,
}

/// Catalog handle over a SQLite connection pool.
#[derive(Clone)]
pub struct Catalog {
    pool: SqlitePool,
}

fn db_err(operation: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| {
        metrics::counter!("burrow_db_errors_total", "operation" => operation).increment(1);
        Error::Database(e.to_string())
    }
}

fn is_retryable(message: &str) -> bool {
    message.contains("database is locked") || message.contains("database table is locked")
}

fn unix(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn from_unix(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

impl Catalog {
    /// Open (or create) a catalog at the given path and run migrations.
    #[instrument(skip(db_path))]
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        info!("Initializing catalog at {:?}", db_path);

        if db_path != Path::new(":memory:") {
            if let Some(parent) = db_path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Io { path: parent.to_path_buf(), source: e })?;
            }
        }

        let options = SqliteConnectOptions::from_str(
            db_path
                .to_str()
                .ok_or_else(|| Error::Internal("Invalid catalog path".to_string()))?,
        )
        .map_err(|e| Error::Database(e.to_string()))?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| Error::Database(e.to_string()))?;

        migrations::run(&pool).await?;

        Ok(Self { pool })
    }

    /// Open an in-memory catalog (for tests).
    pub async fn new_in_memory() -> Result<Self> {
        Self::new(":memory:").await
    }

    async fn with_retries<T, Fut>(&self, mut f: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Err(Error::Database(msg)) if attempt < TX_RETRIES && is_retryable(&msg) => {
                    attempt += 1;
                    tokio::time::sleep(std::time::Duration::from_millis(25 * u64::from(attempt)))
                        .await;
                }
                other => return other,
            }
        }
    }

    // ========================
    // Cluster members
    // ========================

    /// Register a cluster member. The first registered member is the local one.
    pub async fn insert_member(&self, name: &str, address: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO nodes (name, address, heartbeat) VALUES (?, ?, ?)")
            .bind(name)
            .bind(address)
            .bind(unix(Utc::now()))
            .execute(&self.pool)
            .await
            .map_err(db_err("insert_member"))?;

        Ok(result.last_insert_rowid())
    }

    /// List all cluster members.
    pub async fn members(&self) -> Result<Vec<Member>> {
        let rows = sqlx::query("SELECT id, name, address, heartbeat FROM nodes ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("members"))?;

        Ok(rows
            .into_iter()
            .map(|row| Member {
                id: row.get("id"),
                name: row.get("name"),
                address: row.get("address"),
                heartbeat: from_unix(row.get("heartbeat")),
            })
            .collect())
    }

    /// Get a member by name.
    pub async fn member_by_name(&self, name: &str) -> Result<Member> {
        self.members()
            .await?
            .into_iter()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::NotFound(format!("Cluster member {:?}", name)))
    }

    /// Record a heartbeat for a member.
    pub async fn touch_member(&self, id: i64, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE nodes SET heartbeat = ? WHERE id = ?")
            .bind(unix(at))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("touch_member"))?;

        Ok(())
    }

    // ========================
    // Projects, profiles, networks
    // ========================

    /// Insert a project.
    pub async fn insert_project(
        &self,
        name: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64> {
        let config_json = serde_json::to_string(config).map_err(Error::internal)?;
        let result = sqlx::query("INSERT INTO projects (name, config) VALUES (?, ?)")
            .bind(name)
            .bind(config_json)
            .execute(&self.pool)
            .await
            .map_err(db_err("insert_project"))?;

        Ok(result.last_insert_rowid())
    }

    /// Get a project by name.
    pub async fn project(&self, name: &str) -> Result<Project> {
        let row = sqlx::query("SELECT id, name, config FROM projects WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("project"))?
            .ok_or_else(|| Error::NotFound(format!("Project {:?}", name)))?;

        row_to_project(row)
    }

    /// List all projects.
    pub async fn projects(&self) -> Result<Vec<Project>> {
        let rows = sqlx::query("SELECT id, name, config FROM projects ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("projects"))?;

        rows.into_iter().map(row_to_project).collect()
    }

    /// Insert a profile.
    pub async fn insert_profile(
        &self,
        project: &str,
        name: &str,
        config: &HashMap<String, String>,
        devices: &HashMap<String, HashMap<String, String>>,
    ) -> Result<i64> {
        let config_json = serde_json::to_string(config).map_err(Error::internal)?;
        let devices_json = serde_json::to_string(devices).map_err(Error::internal)?;

        let result =
            sqlx::query("INSERT INTO profiles (project, name, config, devices) VALUES (?, ?, ?, ?)")
                .bind(project)
                .bind(name)
                .bind(config_json)
                .bind(devices_json)
                .execute(&self.pool)
                .await
                .map_err(db_err("insert_profile"))?;

        Ok(result.last_insert_rowid())
    }

    /// List all profiles with their configs and devices.
    pub async fn profiles(&self) -> Result<Vec<Profile>> {
        let rows =
            sqlx::query("SELECT id, project, name, config, devices FROM profiles ORDER BY id")
                .fetch_all(&self.pool)
                .await
                .map_err(db_err("profiles"))?;

        rows.into_iter().map(row_to_profile).collect()
    }

    /// Get a profile by project and name.
    pub async fn profile(&self, project: &str, name: &str) -> Result<Profile> {
        let row = sqlx::query(
            "SELECT id, project, name, config, devices FROM profiles WHERE project = ? AND name = ?",
        )
        .bind(project)
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("profile"))?
        .ok_or_else(|| Error::NotFound(format!("Profile {:?} in project {:?}", name, project)))?;

        row_to_profile(row)
    }

    /// Replace the devices of a profile.
    pub async fn update_profile_devices(
        &self,
        id: i64,
        devices: &HashMap<String, HashMap<String, String>>,
    ) -> Result<()> {
        let devices_json = serde_json::to_string(devices).map_err(Error::internal)?;

        sqlx::query("UPDATE profiles SET devices = ? WHERE id = ?")
            .bind(devices_json)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update_profile_devices"))?;

        Ok(())
    }

    /// Insert a network record.
    pub async fn insert_network(&self, project: &str, name: &str) -> Result<i64> {
        let result = sqlx::query("INSERT INTO networks (project, name) VALUES (?, ?)")
            .bind(project)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("insert_network"))?;

        Ok(result.last_insert_rowid())
    }

    /// List network names per project.
    pub async fn networks_by_project(&self) -> Result<HashMap<String, Vec<String>>> {
        let rows = sqlx::query("SELECT project, name FROM networks ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("networks_by_project"))?;

        let mut out: HashMap<String, Vec<String>> = HashMap::new();
        for row in rows {
            out.entry(row.get("project")).or_default().push(row.get("name"));
        }

        Ok(out)
    }

    // ========================
    // Storage pools
    // ========================

    /// Insert a pool record. The returned ID replaces any temporary one.
    pub async fn insert_pool(&self, record: &PoolRecord) -> Result<i64> {
        let config_json = serde_json::to_string(&record.config).map_err(Error::internal)?;

        let result = sqlx::query(
            "INSERT INTO storage_pools (name, driver, description, config, status) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&record.name)
        .bind(&record.driver)
        .bind(&record.description)
        .bind(config_json)
        .bind(record.status.as_str())
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("Storage pool {:?} already exists", record.name))
            }
            other => db_err("insert_pool")(other),
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get a pool by name.
    pub async fn pool_by_name(&self, name: &str) -> Result<PoolRecord> {
        let row = sqlx::query(
            "SELECT id, name, driver, description, config, status FROM storage_pools WHERE name = ?",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err("pool_by_name"))?
        .ok_or_else(|| Error::NotFound(format!("Storage pool {:?}", name)))?;

        row_to_pool(row)
    }

    /// List all pool names.
    pub async fn pool_names(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT name FROM storage_pools ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("pool_names"))?;

        Ok(rows.into_iter().map(|row| row.get("name")).collect())
    }

    /// Update a pool's status.
    pub async fn set_pool_status(&self, id: i64, status: PoolStatus) -> Result<()> {
        sqlx::query("UPDATE storage_pools SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("set_pool_status"))?;

        Ok(())
    }

    /// Delete a pool record by name.
    pub async fn delete_pool(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM storage_pools WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_pool"))?;

        Ok(())
    }

    // ========================
    // Storage volumes
    // ========================

    /// Insert a volume row together with its config, atomically.
    ///
    /// Fails with `Conflict` when the composite identity is already taken.
    #[instrument(skip(self, args), fields(volume = %args.name, project = %args.project))]
    pub async fn create_volume(&self, args: &NewVolume) -> Result<i64> {
        self.with_retries(|| self.create_volume_inner(args)).await
    }

    async fn create_volume_inner(&self, args: &NewVolume) -> Result<i64> {
        let mut tx = self.pool.begin().await.map_err(db_err("create_volume"))?;

        let result = sqlx::query(
            r#"
            INSERT INTO storage_volumes
                (pool_id, project, name, type, content_type, description, node_id, created_at, expiry_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(args.pool_id)
        .bind(&args.project)
        .bind(&args.name)
        .bind(args.volume_type.as_db())
        .bind(args.content_type.as_str())
        .bind(&args.description)
        .bind(args.node_id)
        .bind(unix(args.created_at))
        .bind(args.expiry_at.map(unix))
        .execute(&mut *tx)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("Volume {:?} already exists", args.name))
            }
            other => db_err("create_volume")(other),
        })?;

        let volume_id = result.last_insert_rowid();

        for (key, value) in &args.config {
            sqlx::query(
                "INSERT INTO storage_volumes_config (volume_id, key, value) VALUES (?, ?, ?)",
            )
            .bind(volume_id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(db_err("create_volume"))?;
        }

        tx.commit().await.map_err(db_err("create_volume"))?;

        Ok(volume_id)
    }

    /// Get a volume by its composite identity.
    ///
    /// `node` restricts the lookup to one member (plus remote volumes, which
    /// belong to no member); `None` ignores the member dimension, which is
    /// what a request forwarded to the wrong member needs to discover the
    /// right one.
    pub async fn volume(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        name: &str,
        node: Option<i64>,
    ) -> Result<Volume> {
        let mut sql = String::from(
            r#"
            SELECT v.*, COALESCE(n.name, '') AS location FROM storage_volumes v
            LEFT JOIN nodes n ON n.id = v.node_id
            WHERE v.pool_id = ? AND v.project = ? AND v.type = ? AND v.name = ?
            "#,
        );

        if node.is_some() {
            sql.push_str(" AND (v.node_id = ? OR v.node_id = -1)");
        }

        let mut query = sqlx::query(&sql)
            .bind(pool_id)
            .bind(project)
            .bind(volume_type.as_db())
            .bind(name);

        if let Some(node_id) = node {
            query = query.bind(node_id);
        }

        let row = query
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("volume"))?
            .ok_or_else(|| Error::NotFound(format!("Storage volume {:?}", name)))?;

        let mut volume = row_to_volume(row)?;
        volume.config = self.volume_config(volume.id).await?;

        Ok(volume)
    }

    /// Whether a volume with this identity exists.
    pub async fn volume_exists(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        name: &str,
    ) -> Result<bool> {
        match self.volume(pool_id, project, volume_type, name, None).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// List volumes matching a filter, sorted by `(type, name)` ascending.
    pub async fn volumes(&self, filter: &VolumeFilter) -> Result<Vec<Volume>> {
        let mut sql = String::from(
            r#"
            SELECT v.*, COALESCE(n.name, '') AS location FROM storage_volumes v
            LEFT JOIN nodes n ON n.id = v.node_id
            WHERE 1 = 1
            "#,
        );

        if filter.pool_id.is_some() {
            sql.push_str(" AND v.pool_id = ?");
        }
        if filter.project.is_some() {
            sql.push_str(" AND v.project = ?");
        }
        if filter.volume_type.is_some() {
            sql.push_str(" AND v.type = ?");
        }
        if filter.node_id.is_some() {
            sql.push_str(" AND v.node_id = ?");
        }
        if !filter.include_snapshots {
            sql.push_str(" AND instr(v.name, '/') = 0");
        }

        sql.push_str(" ORDER BY v.type ASC, v.name ASC");

        let mut query = sqlx::query(&sql);
        if let Some(pool_id) = filter.pool_id {
            query = query.bind(pool_id);
        }
        if let Some(project) = &filter.project {
            query = query.bind(project);
        }
        if let Some(volume_type) = filter.volume_type {
            query = query.bind(volume_type.as_db());
        }
        if let Some(node_id) = filter.node_id {
            query = query.bind(node_id);
        }

        let rows = query.fetch_all(&self.pool).await.map_err(db_err("volumes"))?;

        let mut volumes = Vec::with_capacity(rows.len());
        for row in rows {
            let mut volume = row_to_volume(row)?;
            volume.config = self.volume_config(volume.id).await?;
            volumes.push(volume);
        }

        Ok(volumes)
    }

    /// List all custom volumes together with their pool names, snapshots
    /// excluded. Used by the snapshot scheduler.
    pub async fn custom_volumes_all(&self) -> Result<Vec<VolumeRef>> {
        let rows = sqlx::query(
            r#"
            SELECT v.*, COALESCE(n.name, '') AS location, p.name AS pool_name
            FROM storage_volumes v
            JOIN storage_pools p ON p.id = v.pool_id
            LEFT JOIN nodes n ON n.id = v.node_id
            WHERE v.type = ? AND instr(v.name, '/') = 0
            ORDER BY v.name ASC
            "#,
        )
        .bind(VolumeType::Custom.as_db())
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("custom_volumes_all"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let pool_name: String = row.get("pool_name");
            let mut volume = row_to_volume(row)?;
            volume.config = self.volume_config(volume.id).await?;
            out.push(VolumeRef { volume, pool_name });
        }

        Ok(out)
    }

    /// Replace a volume's description, config and expiry, atomically.
    pub async fn update_volume(
        &self,
        id: i64,
        description: &str,
        config: &HashMap<String, String>,
        expiry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_retries(|| self.update_volume_inner(id, description, config, expiry_at)).await
    }

    async fn update_volume_inner(
        &self,
        id: i64,
        description: &str,
        config: &HashMap<String, String>,
        expiry_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("update_volume"))?;

        sqlx::query("UPDATE storage_volumes SET description = ?, expiry_at = ? WHERE id = ?")
            .bind(description)
            .bind(expiry_at.map(unix))
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("update_volume"))?;

        sqlx::query("DELETE FROM storage_volumes_config WHERE volume_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(db_err("update_volume"))?;

        for (key, value) in config {
            sqlx::query(
                "INSERT INTO storage_volumes_config (volume_id, key, value) VALUES (?, ?, ?)",
            )
            .bind(id)
            .bind(key)
            .bind(value)
            .execute(&mut *tx)
            .await
            .map_err(db_err("update_volume"))?;
        }

        tx.commit().await.map_err(db_err("update_volume"))?;

        Ok(())
    }

    /// Rename a volume and the name prefix of all its snapshots, atomically.
    pub async fn rename_volume(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        self.with_retries(|| {
            self.rename_volume_inner(pool_id, project, volume_type, old_name, new_name)
        })
        .await
    }

    async fn rename_volume_inner(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        old_name: &str,
        new_name: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("rename_volume"))?;

        sqlx::query(
            "UPDATE storage_volumes SET name = ? WHERE pool_id = ? AND project = ? AND type = ? AND name = ?",
        )
        .bind(new_name)
        .bind(pool_id)
        .bind(project)
        .bind(volume_type.as_db())
        .bind(old_name)
        .execute(&mut *tx)
        .await
        .map_err(db_err("rename_volume"))?;

        // Snapshot rows keep the `parent/snap` shape, so their prefix follows.
        sqlx::query(
            r#"
            UPDATE storage_volumes SET name = ? || substr(name, ?)
            WHERE pool_id = ? AND project = ? AND type = ? AND name LIKE ?
            "#,
        )
        .bind(new_name)
        .bind(old_name.len() as i64 + 1)
        .bind(pool_id)
        .bind(project)
        .bind(volume_type.as_db())
        .bind(format!("{}{}%", old_name, SNAPSHOT_DELIMITER))
        .execute(&mut *tx)
        .await
        .map_err(db_err("rename_volume"))?;

        tx.commit().await.map_err(db_err("rename_volume"))?;

        Ok(())
    }

    /// Delete a volume row plus all snapshot rows and config, atomically.
    pub async fn delete_volume(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        name: &str,
    ) -> Result<()> {
        self.with_retries(|| self.delete_volume_inner(pool_id, project, volume_type, name)).await
    }

    async fn delete_volume_inner(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        name: &str,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(db_err("delete_volume"))?;

        let like = format!("{}{}%", name, SNAPSHOT_DELIMITER);

        sqlx::query(
            r#"
            DELETE FROM storage_volumes_config WHERE volume_id IN (
                SELECT id FROM storage_volumes
                WHERE pool_id = ? AND project = ? AND type = ? AND (name = ? OR name LIKE ?)
            )
            "#,
        )
        .bind(pool_id)
        .bind(project)
        .bind(volume_type.as_db())
        .bind(name)
        .bind(&like)
        .execute(&mut *tx)
        .await
        .map_err(db_err("delete_volume"))?;

        sqlx::query(
            r#"
            DELETE FROM storage_volumes
            WHERE pool_id = ? AND project = ? AND type = ? AND (name = ? OR name LIKE ?)
            "#,
        )
        .bind(pool_id)
        .bind(project)
        .bind(volume_type.as_db())
        .bind(name)
        .bind(&like)
        .execute(&mut *tx)
        .await
        .map_err(db_err("delete_volume"))?;

        tx.commit().await.map_err(db_err("delete_volume"))?;

        Ok(())
    }

    async fn volume_config(&self, volume_id: i64) -> Result<HashMap<String, String>> {
        let rows = sqlx::query("SELECT key, value FROM storage_volumes_config WHERE volume_id = ?")
            .bind(volume_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("volume_config"))?;

        Ok(rows.into_iter().map(|row| (row.get("key"), row.get("value"))).collect())
    }

    // ========================
    // Snapshots
    // ========================

    /// List the snapshots of a volume, ordered by creation time.
    pub async fn snapshots_of(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        parent: &str,
    ) -> Result<Vec<Volume>> {
        let rows = sqlx::query(
            r#"
            SELECT v.*, COALESCE(n.name, '') AS location FROM storage_volumes v
            LEFT JOIN nodes n ON n.id = v.node_id
            WHERE v.pool_id = ? AND v.project = ? AND v.type = ? AND v.name LIKE ?
            ORDER BY v.created_at ASC, v.id ASC
            "#,
        )
        .bind(pool_id)
        .bind(project)
        .bind(volume_type.as_db())
        .bind(format!("{}{}%", parent, SNAPSHOT_DELIMITER))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("snapshots_of"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut volume = row_to_volume(row)?;
            volume.config = self.volume_config(volume.id).await?;
            out.push(volume);
        }

        Ok(out)
    }

    /// Find the smallest index `i >= 0` such that substituting it into
    /// `pattern` yields a snapshot name not taken by any snapshot of the
    /// volume. The pattern must contain `%d` exactly once.
    pub async fn next_snapshot_index(
        &self,
        pool_id: i64,
        project: &str,
        volume_type: VolumeType,
        parent: &str,
        pattern: &str,
    ) -> Result<i64> {
        let taken: std::collections::HashSet<String> = self
            .snapshots_of(pool_id, project, volume_type, parent)
            .await?
            .into_iter()
            .map(|s| volume::split_snapshot_name(&s.name).1.to_string())
            .collect();

        let mut i: i64 = 0;
        loop {
            let candidate = pattern.replacen("%d", &i.to_string(), 1);
            if !taken.contains(&candidate) {
                return Ok(i);
            }
            i += 1;
        }
    }

    /// List expired snapshots across all pools, remote volumes included.
    pub async fn expired_snapshots(&self, now: DateTime<Utc>) -> Result<Vec<VolumeRef>> {
        let rows = sqlx::query(
            r#"
            SELECT v.*, COALESCE(n.name, '') AS location, p.name AS pool_name
            FROM storage_volumes v
            JOIN storage_pools p ON p.id = v.pool_id
            LEFT JOIN nodes n ON n.id = v.node_id
            WHERE v.type = ? AND v.expiry_at IS NOT NULL AND v.expiry_at <= ?
              AND instr(v.name, '/') > 0
            ORDER BY v.expiry_at ASC
            "#,
        )
        .bind(VolumeType::Custom.as_db())
        .bind(unix(now))
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("expired_snapshots"))?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let pool_name: String = row.get("pool_name");
            let mut volume = row_to_volume(row)?;
            volume.config = self.volume_config(volume.id).await?;
            out.push(VolumeRef { volume, pool_name });
        }

        Ok(out)
    }

    // ========================
    // Buckets
    // ========================

    /// Insert a bucket record.
    pub async fn insert_bucket(
        &self,
        pool_id: i64,
        project: &str,
        name: &str,
        description: &str,
        config: &HashMap<String, String>,
    ) -> Result<i64> {
        let config_json = serde_json::to_string(config).map_err(Error::internal)?;

        let result = sqlx::query(
            "INSERT INTO storage_buckets (pool_id, project, name, description, config) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(pool_id)
        .bind(project)
        .bind(name)
        .bind(description)
        .bind(config_json)
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("Bucket {:?} already exists", name))
            }
            other => db_err("insert_bucket")(other),
        })?;

        Ok(result.last_insert_rowid())
    }

    /// List the buckets of a pool.
    pub async fn buckets(&self, pool_id: i64) -> Result<Vec<Bucket>> {
        let rows = sqlx::query(
            "SELECT id, pool_id, project, name, description, config FROM storage_buckets WHERE pool_id = ? ORDER BY name",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err("buckets"))?;

        rows.into_iter().map(row_to_bucket).collect()
    }

    /// Delete a bucket record.
    pub async fn delete_bucket(&self, pool_id: i64, project: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM storage_buckets WHERE pool_id = ? AND project = ? AND name = ?")
            .bind(pool_id)
            .bind(project)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_bucket"))?;

        Ok(())
    }

    // ========================
    // Instances
    // ========================

    /// Insert an instance (or instance snapshot) record.
    pub async fn insert_instance(&self, record: &InstanceRecord) -> Result<i64> {
        let config_json = serde_json::to_string(&record.config).map_err(Error::internal)?;
        let devices_json = serde_json::to_string(&record.devices).map_err(Error::internal)?;
        let expanded_json =
            serde_json::to_string(&record.expanded_devices).map_err(Error::internal)?;
        let profiles_json = serde_json::to_string(&record.profiles).map_err(Error::internal)?;

        let result = sqlx::query(
            r#"
            INSERT INTO instances
                (project, name, type, snapshot, architecture, config, devices, expanded_devices, profiles, running, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.project)
        .bind(&record.name)
        .bind(&record.instance_type)
        .bind(record.snapshot)
        .bind(&record.architecture)
        .bind(config_json)
        .bind(devices_json)
        .bind(expanded_json)
        .bind(profiles_json)
        .bind(record.running)
        .bind(unix(record.created_at))
        .execute(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.message().contains("UNIQUE") => {
                Error::Conflict(format!("Instance {:?} already exists", record.name))
            }
            other => db_err("insert_instance")(other),
        })?;

        Ok(result.last_insert_rowid())
    }

    /// Get an instance by project and name.
    pub async fn instance(&self, project: &str, name: &str) -> Result<InstanceRecord> {
        let row = sqlx::query("SELECT * FROM instances WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("instance"))?
            .ok_or_else(|| Error::NotFound(format!("Instance {:?}", name)))?;

        row_to_instance(row)
    }

    /// List all instances, snapshot records included.
    pub async fn instances(&self) -> Result<Vec<InstanceRecord>> {
        let rows = sqlx::query("SELECT * FROM instances ORDER BY project, name")
            .fetch_all(&self.pool)
            .await
            .map_err(db_err("instances"))?;

        rows.into_iter().map(row_to_instance).collect()
    }

    /// Delete an instance record.
    pub async fn delete_instance(&self, project: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM instances WHERE project = ? AND name = ?")
            .bind(project)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("delete_instance"))?;

        Ok(())
    }

    /// Replace the device maps of an instance.
    pub async fn update_instance_devices(
        &self,
        id: i64,
        devices: &HashMap<String, HashMap<String, String>>,
        expanded_devices: &HashMap<String, HashMap<String, String>>,
    ) -> Result<()> {
        let devices_json = serde_json::to_string(devices).map_err(Error::internal)?;
        let expanded_json = serde_json::to_string(expanded_devices).map_err(Error::internal)?;

        sqlx::query("UPDATE instances SET devices = ?, expanded_devices = ? WHERE id = ?")
            .bind(devices_json)
            .bind(expanded_json)
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_err("update_instance_devices"))?;

        Ok(())
    }

    /// Mark an instance as running or stopped.
    pub async fn set_instance_running(&self, project: &str, name: &str, running: bool) -> Result<()> {
        sqlx::query("UPDATE instances SET running = ? WHERE project = ? AND name = ?")
            .bind(running)
            .bind(project)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(db_err("set_instance_running"))?;

        Ok(())
    }

    // ========================
    // Daemon config
    // ========================

    /// Read a daemon configuration value.
    pub async fn daemon_config(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM daemon_config WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err("daemon_config"))?;

        Ok(row.map(|r| r.get("value")))
    }

    /// Write a daemon configuration value.
    pub async fn set_daemon_config(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query("INSERT INTO daemon_config (key, value) VALUES (?, ?) ON CONFLICT(key) DO UPDATE SET value = excluded.value")
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            .map_err(db_err("set_daemon_config"))?;

        Ok(())
    }
}

fn row_to_project(row: SqliteRow) -> Result<Project> {
    let config_json: String = row.get("config");
    let config = serde_json::from_str(&config_json).map_err(Error::internal)?;

    Ok(Project { id: row.get("id"), name: row.get("name"), config })
}

fn row_to_profile(row: SqliteRow) -> Result<Profile> {
    let config_json: String = row.get("config");
    let devices_json: String = row.get("devices");

    Ok(Profile {
        id: row.get("id"),
        project: row.get("project"),
        name: row.get("name"),
        config: serde_json::from_str(&config_json).map_err(Error::internal)?,
        devices: serde_json::from_str(&devices_json).map_err(Error::internal)?,
    })
}

fn row_to_pool(row: SqliteRow) -> Result<PoolRecord> {
    let config_json: String = row.get("config");
    let status_str: String = row.get("status");

    Ok(PoolRecord {
        id: row.get("id"),
        name: row.get("name"),
        driver: row.get("driver"),
        description: row.get("description"),
        config: serde_json::from_str(&config_json).map_err(Error::internal)?,
        status: PoolStatus::parse(&status_str)
            .ok_or_else(|| Error::Database(format!("Unknown pool status {:?}", status_str)))?,
    })
}

fn row_to_volume(row: SqliteRow) -> Result<Volume> {
    let type_db: i64 = row.get("type");
    let content_type_str: String = row.get("content_type");
    let name: String = row.get("name");
    let node_id: i64 = row.get("node_id");
    let location: String = row.get("location");

    Ok(Volume {
        id: row.get("id"),
        pool_id: row.get("pool_id"),
        project: row.get("project"),
        volume_type: VolumeType::from_db(type_db)
            .ok_or_else(|| Error::Database(format!("Unknown volume type {}", type_db)))?,
        content_type: ContentType::parse(&content_type_str).ok_or_else(|| {
            Error::Database(format!("Unknown content type {:?}", content_type_str))
        })?,
        description: row.get("description"),
        config: HashMap::new(),
        node_id,
        location,
        created_at: from_unix(row.get("created_at")),
        expiry_at: row.get::<Option<i64>, _>("expiry_at").map(from_unix),
        name,
    })
}

fn row_to_bucket(row: SqliteRow) -> Result<Bucket> {
    let config_json: String = row.get("config");

    Ok(Bucket {
        id: row.get("id"),
        pool_id: row.get("pool_id"),
        project: row.get("project"),
        name: row.get("name"),
        description: row.get("description"),
        config: serde_json::from_str(&config_json).map_err(Error::internal)?,
    })
}

fn row_to_instance(row: SqliteRow) -> Result<InstanceRecord> {
    let config_json: String = row.get("config");
    let devices_json: String = row.get("devices");
    let expanded_json: String = row.get("expanded_devices");
    let profiles_json: String = row.get("profiles");

    Ok(InstanceRecord {
        id: row.get("id"),
        project: row.get("project"),
        name: row.get("name"),
        instance_type: row.get("type"),
        snapshot: row.get("snapshot"),
        architecture: row.get("architecture"),
        config: serde_json::from_str(&config_json).map_err(Error::internal)?,
        devices: serde_json::from_str(&devices_json).map_err(Error::internal)?,
        expanded_devices: serde_json::from_str(&expanded_json).map_err(Error::internal)?,
        profiles: serde_json::from_str(&profiles_json).map_err(Error::internal)?,
        running: row.get("running"),
        created_at: from_unix(row.get("created_at")),
    })
}

// Snapshot-name helpers shared with the services.
pub use crate::types::volume::split_snapshot_name;

/// Whether a catalog name denotes a snapshot row.
#[must_use]
pub fn name_is_snapshot(name: &str) -> bool {
    is_snapshot(name)
}
