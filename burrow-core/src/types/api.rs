//! Wire-level request and response bodies for the storage volume API.
//!
//! These types mirror the JSON bodies accepted and produced by the daemon.
//! They are kept free of catalog IDs so they can travel between cluster
//! members unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Source block of a volume create request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeSource {
    /// Source kind: empty (fresh create), `copy` or `migration`.
    #[serde(rename = "type")]
    pub source_type: String,

    /// Source volume name.
    pub name: String,

    /// Source pool name.
    pub pool: String,

    /// Source project name.
    pub project: String,

    /// Cluster member holding the source volume.
    pub location: String,

    /// Skip snapshots when copying.
    pub volume_only: bool,

    /// Reuse the destination volume if it already exists.
    pub refresh: bool,

    /// When refreshing, skip source snapshots older than the latest
    /// destination snapshot.
    pub refresh_exclude_older: bool,

    /// Migration mode: `pull`, `push` or `relay`.
    pub mode: String,

    /// Remote operation URL for pull-mode migration.
    pub operation: String,

    /// Per-channel websocket secrets for migration.
    pub websockets: HashMap<String, String>,
}

/// Body of `POST /1.0/storage-pools/{pool}/volumes`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesPost {
    /// New volume name.
    pub name: String,

    /// Volume type, only `custom` may be created through this API.
    #[serde(rename = "type")]
    pub volume_type: String,

    /// Content type: `filesystem`, `block` or `iso`.
    pub content_type: String,

    /// Free-form description.
    pub description: String,

    /// Volume configuration.
    pub config: HashMap<String, String>,

    /// Creation source.
    pub source: VolumeSource,
}

/// Body of `POST /1.0/storage-pools/{pool}/volumes/{type}/{name}`.
///
/// Dispatches to rename, move or migrate depending on which fields are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePost {
    /// New volume name.
    pub name: String,

    /// Target pool for a move.
    pub pool: String,

    /// Target project for a cross-project move.
    pub project: String,

    /// Initiate a migration rather than a local rename/move.
    pub migration: bool,

    /// Skip snapshots during migration.
    pub volume_only: bool,

    /// Migration source description (cluster member relocation).
    pub source: VolumeSource,
}

/// Body of `PUT /1.0/storage-pools/{pool}/volumes/{type}/{name}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePut {
    /// New description.
    pub description: Option<String>,

    /// Full replacement configuration.
    pub config: Option<HashMap<String, String>>,

    /// Snapshot to restore the volume from before applying any config
    /// change.
    pub restore: String,
}

/// Body of `POST /…/{name}/snapshots`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotsPost {
    /// Snapshot name; derived from `snapshots.pattern` when empty.
    pub name: String,

    /// Expiry timestamp; derived from the parent volume config when absent.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Body of `POST /…/snapshots/{snap}` (rename).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPost {
    /// New snapshot name.
    pub name: String,
}

/// Body of `PUT /…/snapshots/{snap}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotPut {
    /// New description.
    pub description: Option<String>,

    /// New expiry timestamp; `null` clears it.
    pub expires_at: Option<DateTime<Utc>>,
}

/// Externally visible volume representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub content_type: String,
    pub description: String,
    pub config: HashMap<String, String>,
    pub location: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub used_by: Vec<String>,
}

/// Pool description inside a recovery request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverPool {
    pub name: String,
    pub driver: String,
    pub description: String,
    pub config: HashMap<String, String>,
}

/// Body of `POST /internal/recover/validate` and `/internal/recover/import`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverValidatePost {
    pub pools: Vec<RecoverPool>,
}

/// A discovered volume with no catalog record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnknownVolume {
    pub pool: String,
    pub project: String,
    #[serde(rename = "type")]
    pub volume_type: String,
    pub name: String,
    pub snapshot_count: usize,
}

/// Result of a recovery validate scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecoverValidateResult {
    pub unknown_volumes: Vec<UnknownVolume>,
    pub dependency_errors: Vec<String>,
}
