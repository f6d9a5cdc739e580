//! Shared server state handed to the storage services.

use crate::catalog::Catalog;
use crate::cluster::ClusterInfo;
use crate::error::Result;
use crate::migration::peers::{PeerConnector, StandaloneConnector};
use crate::ops;
use crate::pools::PoolRegistry;
use crate::project::{self, Project};
use std::sync::Arc;

/// Everything the volume, snapshot, migration and recovery services share.
pub struct Server {
    /// The volume catalog.
    pub catalog: Catalog,
    /// Loaded pool handles.
    pub pools: Arc<PoolRegistry>,
    /// Live operations.
    pub operations: ops::Registry,
    /// This member's view of the cluster.
    pub cluster: ClusterInfo,
    /// Injected peer-RPC connector.
    pub peers: Arc<dyn PeerConnector>,
}

impl Server {
    /// Assemble the shared state.
    pub fn new(
        catalog: Catalog,
        cluster: ClusterInfo,
        peers: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pools: Arc::new(PoolRegistry::new(catalog.clone())),
            operations: ops::Registry::new(),
            catalog,
            cluster,
            peers,
        })
    }

    /// Assemble standalone state (no cluster transport), for tests and
    /// single-member servers.
    pub fn standalone(catalog: Catalog, member_name: &str, member_id: i64) -> Arc<Self> {
        Self::new(
            catalog,
            ClusterInfo::standalone(member_name, member_id),
            Arc::new(StandaloneConnector),
        )
    }

    /// Resolve a request's project and the effective project that owns its
    /// storage volumes.
    pub async fn storage_project(&self, request_project: &str) -> Result<(Project, String)> {
        let name = if request_project.is_empty() { project::DEFAULT_PROJECT } else { request_project };
        let record = self.catalog.project(name).await?;
        let effective = project::storage_volume_project(&record);
        Ok((record, effective))
    }
}
