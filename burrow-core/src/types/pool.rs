//! Storage pool domain types.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Sentinel pool ID for unregistered pool handles.
///
/// A temporary pool is backed by a real driver but has no catalog row; it is
/// only used by the recovery engine to reach on-disk data before the row
/// exists. The sentinel never persists.
pub const POOL_ID_TEMPORARY: i64 = -1;

/// Status of a storage pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// Created in the catalog but not yet applied on every member.
    Pending,
    /// Fully created.
    Created,
    /// Local apply failed.
    Errored,
}

impl PoolStatus {
    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::Errored => "errored",
        }
    }

    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "created" => Some(Self::Created),
            "errored" => Some(Self::Errored),
            _ => None,
        }
    }
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A storage pool catalog record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolRecord {
    /// Catalog row ID, or [`POOL_ID_TEMPORARY`] for unregistered handles.
    pub id: i64,

    /// Pool name, unique cluster-wide.
    pub name: String,

    /// Backend driver name.
    pub driver: String,

    /// Free-form description.
    pub description: String,

    /// Driver configuration.
    pub config: HashMap<String, String>,

    /// Pool status.
    pub status: PoolStatus,
}

impl PoolRecord {
    /// Whether this record is an unregistered temporary handle.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.id == POOL_ID_TEMPORARY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_status_roundtrip() {
        for s in [PoolStatus::Pending, PoolStatus::Created, PoolStatus::Errored] {
            assert_eq!(PoolStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(PoolStatus::parse("temporary"), None);
    }
}
