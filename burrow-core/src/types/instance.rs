//! Instance catalog records.
//!
//! The storage subsystem does not manage instance lifecycles, but recovery
//! recreates instance rows from backup manifests and the used-by computation
//! walks instance devices, so the record shape lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// An instance catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Catalog row ID.
    pub id: i64,

    /// Project the instance belongs to.
    pub project: String,

    /// Instance name (`parent/snap` for snapshot records).
    pub name: String,

    /// Instance type: `container` or `virtual-machine`.
    pub instance_type: String,

    /// Whether this row is a snapshot record.
    pub snapshot: bool,

    /// Architecture name.
    pub architecture: String,

    /// Instance configuration.
    pub config: HashMap<String, String>,

    /// Local devices.
    pub devices: HashMap<String, HashMap<String, String>>,

    /// Devices after profile expansion.
    pub expanded_devices: HashMap<String, HashMap<String, String>>,

    /// Applied profile names, in order.
    pub profiles: Vec<String>,

    /// Whether the instance is currently running.
    pub running: bool,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}
