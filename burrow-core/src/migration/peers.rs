//! Injected peer-RPC interface.
//!
//! The storage core never owns a cluster transport. Whatever does (the
//! cluster daemon in production, an in-process stub in tests) implements
//! these traits; migration and cross-member forwarding go through them.

use crate::error::{Error, Result};
use crate::ops::ChannelStream;
use crate::types::api::{VolumePost, VolumesPost};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Handle to an operation created on a peer.
#[derive(Debug, Clone)]
pub struct PeerOperation {
    /// Operation URL on the peer, e.g. `https://host:8443/1.0/operations/<id>`.
    pub url: String,
    /// Per-channel websocket secrets advertised by the peer.
    pub websockets: HashMap<String, String>,
}

/// A connected peer member.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Ask the peer to set up a migration source for one of its volumes.
    /// Returns the websocket-class operation to dial back into.
    async fn migrate_volume(
        &self,
        pool: &str,
        project: &str,
        volume: &str,
        req: VolumePost,
    ) -> Result<PeerOperation>;

    /// Ask the peer to create a volume (used for pushing a migration to the
    /// destination member).
    async fn create_volume(&self, pool: &str, project: &str, req: VolumesPost) -> Result<()>;

    /// Open an authenticated byte stream to a channel of a peer operation.
    async fn connect_operation(
        &self,
        operation_url: &str,
        channel: &str,
        secret: &str,
    ) -> Result<ChannelStream>;
}

/// Connector from member address to peer client.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Connect to the member at `address`.
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerClient>>;
}

/// Connector for standalone servers: every connection attempt fails.
#[derive(Debug, Default)]
pub struct StandaloneConnector;

#[async_trait]
impl PeerConnector for StandaloneConnector {
    async fn connect(&self, address: &str) -> Result<Arc<dyn PeerClient>> {
        Err(Error::OfflineCluster(format!(
            "Server is not clustered, cannot reach {:?}",
            address
        )))
    }
}
