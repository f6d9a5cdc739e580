//! Cluster member bookkeeping and coordination helpers.
//!
//! The storage subsystem never talks to other members directly; it consumes
//! the peer-RPC interface from [`crate::migration`]. This module only holds
//! the member table view and the deterministic member-election helper the
//! snapshot scheduler relies on.

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Sentinel node ID for volumes on remote-driver pools, which are not pinned
/// to any one member.
pub const NODE_ID_REMOTE: i64 = -1;

/// Default duration after which a member with no heartbeat counts as offline.
pub const DEFAULT_OFFLINE_THRESHOLD_SECS: i64 = 20;

/// A cluster member record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Catalog row ID.
    pub id: i64,
    /// Member name, unique cluster-wide.
    pub name: String,
    /// Network address, empty for the local member.
    pub address: String,
    /// Last heartbeat timestamp.
    pub heartbeat: DateTime<Utc>,
}

impl Member {
    /// Whether the member counts as offline at `now`.
    #[must_use]
    pub fn is_offline(&self, threshold: Duration, now: DateTime<Utc>) -> bool {
        now - self.heartbeat > threshold
    }
}

/// Pick a stable pseudo-random entry from `candidates` for `key`.
///
/// The choice is a pure function of the inputs, so every cluster member
/// computes the same owner for a given key without coordination. Used by the
/// scheduler to elect the member that snapshots or expires a remote volume.
pub fn stable_random_member(key: i64, candidates: &[i64]) -> Result<i64> {
    if candidates.is_empty() {
        return Err(Error::Internal("No candidate members to select from".to_string()));
    }

    let mut sorted = candidates.to_vec();
    sorted.sort_unstable();

    let mut hasher = Sha256::new();
    hasher.update(key.to_be_bytes());
    let digest = hasher.finalize();

    let mut first = [0u8; 8];
    first.copy_from_slice(&digest[..8]);
    let idx = (u64::from_be_bytes(first) % sorted.len() as u64) as usize;

    Ok(sorted[idx])
}

/// Static view of this member within the cluster, shared by the services.
#[derive(Debug, Clone)]
pub struct ClusterInfo {
    /// Name of the local member.
    pub member_name: String,
    /// Catalog row ID of the local member.
    pub member_id: i64,
    /// Whether the server is part of a cluster with more than one member.
    pub clustered: bool,
    /// Heartbeat threshold for offline detection.
    pub offline_threshold: Duration,
}

impl ClusterInfo {
    /// A standalone (non-clustered) server view.
    #[must_use]
    pub fn standalone(member_name: &str, member_id: i64) -> Self {
        Self {
            member_name: member_name.to_string(),
            member_id,
            clustered: false,
            offline_threshold: Duration::seconds(DEFAULT_OFFLINE_THRESHOLD_SECS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_random_member_is_deterministic() {
        let candidates = [4, 2, 9];
        let a = stable_random_member(17, &candidates).unwrap();
        let b = stable_random_member(17, &[9, 4, 2]).unwrap();
        assert_eq!(a, b);
        assert!(candidates.contains(&a));
    }

    #[test]
    fn test_stable_random_member_empty() {
        assert!(stable_random_member(1, &[]).is_err());
    }

    #[test]
    fn test_member_offline() {
        let member = Member {
            id: 1,
            name: "m1".to_string(),
            address: "10.0.0.1:8443".to_string(),
            heartbeat: Utc::now() - Duration::seconds(60),
        };
        assert!(member.is_offline(Duration::seconds(20), Utc::now()));
        assert!(!member.is_offline(Duration::seconds(120), Utc::now()));
    }
}
