//! Shared handler state.

use burrow_core::server::Server;
use burrow_core::{RecoveryService, SnapshotService, VolumeService};
use std::sync::Arc;

/// State handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub server: Arc<Server>,
    pub volumes: VolumeService,
    pub snapshots: SnapshotService,
    pub recovery: RecoveryService,
}

impl AppState {
    /// Assemble the handler state from the shared server state.
    pub fn new(server: Arc<Server>) -> Self {
        Self {
            volumes: VolumeService::new(server.clone()),
            snapshots: SnapshotService::new(server.clone()),
            recovery: RecoveryService::new(server.clone()),
            server,
        }
    }
}
