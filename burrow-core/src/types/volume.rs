//! Volume domain types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

/// Delimiter between a parent volume name and a snapshot name.
pub const SNAPSHOT_DELIMITER: &str = "/";

/// Volume type.
///
/// The integer representation is the catalog storage order and also the
/// listing sort order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeType {
    Container,
    Image,
    Custom,
    Vm,
}

impl VolumeType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Container => "container",
            Self::Image => "image",
            Self::Custom => "custom",
            Self::Vm => "virtual-machine",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "container" => Some(Self::Container),
            "image" => Some(Self::Image),
            "custom" => Some(Self::Custom),
            "virtual-machine" => Some(Self::Vm),
            _ => None,
        }
    }

    /// Catalog integer representation.
    #[must_use]
    pub fn as_db(&self) -> i64 {
        match self {
            Self::Container => 0,
            Self::Image => 1,
            Self::Custom => 2,
            Self::Vm => 3,
        }
    }

    /// Parse from the catalog integer representation.
    #[must_use]
    pub fn from_db(v: i64) -> Option<Self> {
        match v {
            0 => Some(Self::Container),
            1 => Some(Self::Image),
            2 => Some(Self::Custom),
            3 => Some(Self::Vm),
            _ => None,
        }
    }
}

impl std::fmt::Display for VolumeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Volume content type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    #[default]
    Filesystem,
    Block,
    Iso,
}

impl ContentType {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filesystem => "filesystem",
            Self::Block => "block",
            Self::Iso => "iso",
        }
    }

    /// Parse from string. An empty string maps to filesystem for backward
    /// compatibility with older clients.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "" | "filesystem" => Some(Self::Filesystem),
            "block" => Some(Self::Block),
            "iso" => Some(Self::Iso),
            _ => None,
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A storage volume catalog record.
///
/// Snapshots are volumes whose name contains [`SNAPSHOT_DELIMITER`]; they
/// carry an optional expiry and share `(pool_id, project, volume_type)` with
/// their parent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    /// Catalog row ID.
    pub id: i64,

    /// Owning pool row ID.
    pub pool_id: i64,

    /// Project the volume belongs to.
    pub project: String,

    /// Volume name (`parent/snap` for snapshots).
    pub name: String,

    /// Volume type.
    pub volume_type: VolumeType,

    /// Content type.
    pub content_type: ContentType,

    /// Free-form description.
    pub description: String,

    /// Volume configuration.
    pub config: HashMap<String, String>,

    /// Cluster member ID holding the volume, or [`crate::cluster::NODE_ID_REMOTE`]
    /// for volumes on remote-driver pools.
    pub node_id: i64,

    /// Member name resolved from `node_id`, empty for remote volumes.
    pub location: String,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Expiry timestamp, snapshots only.
    pub expiry_at: Option<DateTime<Utc>>,
}

impl Volume {
    /// Whether this record is a snapshot.
    #[must_use]
    pub fn is_snapshot(&self) -> bool {
        is_snapshot(&self.name)
    }
}

/// Whether a volume name refers to a snapshot.
#[must_use]
pub fn is_snapshot(name: &str) -> bool {
    name.contains(SNAPSHOT_DELIMITER)
}

/// Split a volume name into `(parent, snapshot, is_snapshot)`.
#[must_use]
pub fn split_snapshot_name(name: &str) -> (&str, &str, bool) {
    match name.split_once(SNAPSHOT_DELIMITER) {
        Some((parent, snap)) => (parent, snap, true),
        None => (name, "", false),
    }
}

/// Join a parent volume name and a snapshot name.
#[must_use]
pub fn join_snapshot_name(parent: &str, snap: &str) -> String {
    format!("{}{}{}", parent, SNAPSHOT_DELIMITER, snap)
}

/// Compute the ETag for a volume.
///
/// The tag is a deterministic SHA-256 over the name, the type and the
/// canonicalized (key-sorted) configuration, so any observable mutation
/// changes it and a rename round-trip restores it.
#[must_use]
pub fn etag(name: &str, volume_type: VolumeType, config: &HashMap<String, String>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(volume_type.as_str().as_bytes());

    let mut keys: Vec<&String> = config.keys().collect();
    keys.sort();
    for key in keys {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(config[key].as_bytes());
        hasher.update(b"\n");
    }

    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_type_roundtrip() {
        for t in [VolumeType::Container, VolumeType::Image, VolumeType::Custom, VolumeType::Vm] {
            assert_eq!(VolumeType::parse(t.as_str()), Some(t));
            assert_eq!(VolumeType::from_db(t.as_db()), Some(t));
        }
        assert_eq!(VolumeType::parse("floppy"), None);
    }

    #[test]
    fn test_content_type_parse() {
        assert_eq!(ContentType::parse(""), Some(ContentType::Filesystem));
        assert_eq!(ContentType::parse("block"), Some(ContentType::Block));
        assert_eq!(ContentType::parse("iso"), Some(ContentType::Iso));
        assert_eq!(ContentType::parse("tape"), None);
    }

    #[test]
    fn test_snapshot_names() {
        assert!(!is_snapshot("vol1"));
        assert!(is_snapshot("vol1/snap0"));
        assert_eq!(split_snapshot_name("vol1/snap0"), ("vol1", "snap0", true));
        assert_eq!(split_snapshot_name("vol1"), ("vol1", "", false));
        assert_eq!(join_snapshot_name("vol1", "snap0"), "vol1/snap0");
    }

    #[test]
    fn test_etag_is_order_independent() {
        let mut a = HashMap::new();
        a.insert("size".to_string(), "10GiB".to_string());
        a.insert("snapshots.expiry".to_string(), "7d".to_string());

        let mut b = HashMap::new();
        b.insert("snapshots.expiry".to_string(), "7d".to_string());
        b.insert("size".to_string(), "10GiB".to_string());

        assert_eq!(etag("vol1", VolumeType::Custom, &a), etag("vol1", VolumeType::Custom, &b));
        assert_ne!(etag("vol1", VolumeType::Custom, &a), etag("vol2", VolumeType::Custom, &a));
    }
}
