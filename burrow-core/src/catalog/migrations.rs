//! Catalog schema migrations.

use crate::error::{Error, Result};
use sqlx::SqlitePool;
use tracing::{info, instrument};

const SCHEMA_VERSION: i64 = 2;

#[instrument(skip(pool))]
pub async fn run(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::MigrationFailed { reason: e.to_string() })?;

    let current_version: Option<i64> =
        sqlx::query_scalar("SELECT version FROM schema_version LIMIT 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| Error::MigrationFailed { reason: e.to_string() })?;

    let current_version = current_version.unwrap_or(0);

    if current_version >= SCHEMA_VERSION {
        info!("Catalog schema is up to date (version {})", current_version);
        return Ok(());
    }

    info!("Migrating catalog from version {} to {}", current_version, SCHEMA_VERSION);

    if current_version < 1 {
        migrate_to_v1(pool).await?;
    }

    if current_version < 2 {
        migrate_to_v2(pool).await?;
    }

    Ok(())
}

async fn set_version(pool: &SqlitePool, version: i64) -> Result<()> {
    sqlx::query("DELETE FROM schema_version")
        .execute(pool)
        .await
        .map_err(|e| Error::MigrationFailed { reason: e.to_string() })?;

    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await
        .map_err(|e| Error::MigrationFailed { reason: e.to_string() })?;

    Ok(())
}

#[instrument(skip(pool))]
async fn migrate_to_v1(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 1");

    let statements = [
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            address TEXT NOT NULL DEFAULT '',
            heartbeat INTEGER NOT NULL DEFAULT 0
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS projects (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            config TEXT NOT NULL DEFAULT '{}'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            devices TEXT NOT NULL DEFAULT '{}',
            UNIQUE(project, name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS networks (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            UNIQUE(project, name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS storage_pools (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT UNIQUE NOT NULL,
            driver TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            config TEXT NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'pending'
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS storage_volumes (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pool_id INTEGER NOT NULL REFERENCES storage_pools(id) ON DELETE CASCADE,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            type INTEGER NOT NULL,
            content_type TEXT NOT NULL DEFAULT 'filesystem',
            description TEXT NOT NULL DEFAULT '',
            node_id INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            expiry_at INTEGER,
            UNIQUE(pool_id, project, type, name, node_id)
        )
        "#,
        "CREATE INDEX IF NOT EXISTS idx_storage_volumes_pool ON storage_volumes(pool_id)",
        "CREATE INDEX IF NOT EXISTS idx_storage_volumes_expiry ON storage_volumes(expiry_at)",
        r#"
        CREATE TABLE IF NOT EXISTS storage_volumes_config (
            volume_id INTEGER NOT NULL REFERENCES storage_volumes(id) ON DELETE CASCADE,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (volume_id, key)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS storage_buckets (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            pool_id INTEGER NOT NULL REFERENCES storage_pools(id) ON DELETE CASCADE,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            config TEXT NOT NULL DEFAULT '{}',
            UNIQUE(pool_id, project, name)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS instances (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            project TEXT NOT NULL,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            snapshot INTEGER NOT NULL DEFAULT 0,
            architecture TEXT NOT NULL DEFAULT '',
            config TEXT NOT NULL DEFAULT '{}',
            devices TEXT NOT NULL DEFAULT '{}',
            expanded_devices TEXT NOT NULL DEFAULT '{}',
            profiles TEXT NOT NULL DEFAULT '[]',
            running INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(project, name)
        )
        "#,
    ];

    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| Error::MigrationFailed { reason: e.to_string() })?;
    }

    set_version(pool, 1).await?;

    info!("Migration to schema version 1 complete");
    Ok(())
}

/// Migration to schema version 2: daemon configuration key/value store.
#[instrument(skip(pool))]
async fn migrate_to_v2(pool: &SqlitePool) -> Result<()> {
    info!("Running migration to schema version 2");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS daemon_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| Error::MigrationFailed { reason: e.to_string() })?;

    set_version(pool, 2).await?;

    info!("Migration to schema version 2 complete");
    Ok(())
}
