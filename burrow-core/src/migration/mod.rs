//! Volume migration between pools and cluster members.
//!
//! A migration moves one volume (and optionally its snapshots) from a source
//! pool to a sink pool through two byte channels: `control` carries the
//! negotiation header and the final acknowledgement, `filesystem` carries
//! the volume data stream. Each channel is FIFO; nothing is ordered across
//! them. The transport is whatever the peer-RPC interface hands us; the
//! core never sees sockets.
//!
//! The sink commits its catalog rows only after the stream has terminated
//! and the driver has finalized the volume; cancelling either side closes
//! the channels and reverts the partial destination.

use crate::catalog::NewVolume;
use crate::cluster::NODE_ID_REMOTE;
use crate::error::{Error, Result};
use crate::ops::{ChannelStream, Operation, OperationClass, Reverter};
use crate::pools::Pool;
use crate::server::Server;
use crate::types::api::VolumesPost;
use crate::types::{volume as volume_names, ContentType, VolumeType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, instrument};

pub mod peers;

pub use peers::{PeerClient, PeerConnector, PeerOperation, StandaloneConnector};

/// Channel carrying the negotiation header and acknowledgement.
pub const CHANNEL_CONTROL: &str = "control";

/// Channel carrying the volume data stream.
pub const CHANNEL_FILESYSTEM: &str = "filesystem";

/// Migration modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Destination dials the source.
    Pull,
    /// Source dials the destination.
    Push,
    /// An orchestrator proxies between two member-local transfers.
    Relay,
}

impl Mode {
    /// Parse from string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pull" => Some(Self::Pull),
            "push" => Some(Self::Push),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

/// Snapshot entry of the negotiation header, chronological order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotHeader {
    pub name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: Option<DateTime<Utc>>,
}

/// Negotiation header sent by the source on the control channel before the
/// data stream starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationHeader {
    pub name: String,
    pub content_type: String,
    pub description: String,
    pub config: HashMap<String, String>,
    pub snapshots: Vec<SnapshotHeader>,
}

async fn write_message<T: Serialize>(stream: &mut ChannelStream, message: &T) -> Result<()> {
    let mut data = serde_json::to_vec(message).map_err(Error::internal)?;
    data.push(b'\n');
    stream
        .write_all(&data)
        .await
        .map_err(|e| Error::Internal(format!("Migration control write failed: {}", e)))
}

async fn read_message<T: serde::de::DeserializeOwned>(stream: &mut ChannelStream) -> Result<T> {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        let n = stream
            .read(&mut byte)
            .await
            .map_err(|e| Error::Internal(format!("Migration control read failed: {}", e)))?;
        if n == 0 {
            return Err(Error::Internal("Migration control channel closed".to_string()));
        }
        if byte[0] == b'\n' {
            break;
        }
        data.push(byte[0]);
    }

    serde_json::from_slice(&data)
        .map_err(|e| Error::Internal(format!("Invalid migration message: {}", e)))
}

#[derive(Debug, Serialize, Deserialize)]
struct Ack {
    ok: bool,
    #[serde(default)]
    error: String,
}

/// Source half of a transfer: send the header, stream the volume, wait for
/// the acknowledgement.
#[instrument(skip_all, fields(pool = %pool.name(), volume = %volume_name))]
pub async fn run_source(
    server: &Server,
    pool: &Pool,
    project: &str,
    volume_name: &str,
    with_snapshots: bool,
    mut control: ChannelStream,
    fs: ChannelStream,
) -> Result<()> {
    let volume = server
        .catalog
        .volume(pool.id(), project, VolumeType::Custom, volume_name, None)
        .await?;

    let snapshots = server
        .catalog
        .snapshots_of(pool.id(), project, VolumeType::Custom, volume_name)
        .await?;

    let header = MigrationHeader {
        name: volume.name.clone(),
        content_type: volume.content_type.as_str().to_string(),
        description: volume.description.clone(),
        config: volume.config.clone(),
        snapshots: if with_snapshots {
            snapshots
                .iter()
                .map(|s| SnapshotHeader {
                    name: volume_names::split_snapshot_name(&s.name).1.to_string(),
                    expires_at: s.expiry_at,
                    created_at: Some(s.created_at),
                })
                .collect()
        } else {
            Vec::new()
        },
    };

    write_message(&mut control, &header).await?;
    debug!(snapshots = header.snapshots.len(), "Sent migration header");

    pool.driver()
        .export_custom_volume(project, volume_name, with_snapshots, Box::pin(fs))
        .await
        .map_err(|e| Error::driver(volume_name, e))?;

    let ack: Ack = read_message(&mut control).await?;
    if !ack.ok {
        return Err(Error::Internal(format!("Migration sink failed: {}", ack.error)));
    }

    info!("Migration source finished");
    Ok(())
}

/// Sink half of a transfer: read the header, materialize the volume, commit
/// catalog rows, acknowledge.
#[instrument(skip_all, fields(pool = %pool.name(), volume = %dest_name))]
pub async fn run_sink(
    server: &Server,
    pool: &Arc<Pool>,
    project: &str,
    dest_name: &str,
    dest_config: &HashMap<String, String>,
    mut control: ChannelStream,
    fs: ChannelStream,
) -> Result<()> {
    let reverter = Reverter::new();

    let result: Result<()> = async {
        let header: MigrationHeader = read_message(&mut control).await?;
        debug!(source = %header.name, snapshots = header.snapshots.len(), "Received migration header");

        let content_type = ContentType::parse(&header.content_type).ok_or_else(|| {
            Error::Internal(format!("Unknown content type {:?}", header.content_type))
        })?;

        let mut config = header.config.clone();
        config.extend(dest_config.clone());

        {
            let pool = pool.clone();
            let project = project.to_string();
            let name = dest_name.to_string();
            reverter.add(move || async move {
                let _ = pool.driver().delete_custom_volume(&project, &name).await;
            });
        }

        pool.driver()
            .import_custom_volume_stream(project, dest_name, &config, content_type, Box::pin(fs))
            .await
            .map_err(|e| Error::driver(dest_name, e))?;

        // The stream terminated and the driver finalized the volume; only
        // now do catalog rows appear.
        let node_id =
            if pool.driver().info().remote { NODE_ID_REMOTE } else { server.cluster.member_id };

        server
            .catalog
            .create_volume(&NewVolume {
                pool_id: pool.id(),
                project: project.to_string(),
                name: dest_name.to_string(),
                volume_type: VolumeType::Custom,
                content_type,
                description: header.description.clone(),
                config,
                node_id,
                created_at: Utc::now(),
                expiry_at: None,
            })
            .await?;

        {
            let server_catalog = server.catalog.clone();
            let pool_id = pool.id();
            let project = project.to_string();
            let name = dest_name.to_string();
            reverter.add(move || async move {
                let _ = server_catalog
                    .delete_volume(pool_id, &project, VolumeType::Custom, &name)
                    .await;
            });
        }

        for snapshot in &header.snapshots {
            server
                .catalog
                .create_volume(&NewVolume {
                    pool_id: pool.id(),
                    project: project.to_string(),
                    name: volume_names::join_snapshot_name(dest_name, &snapshot.name),
                    volume_type: VolumeType::Custom,
                    content_type,
                    description: String::new(),
                    config: HashMap::new(),
                    node_id,
                    created_at: snapshot.created_at.unwrap_or_else(Utc::now),
                    expiry_at: snapshot.expires_at,
                })
                .await?;
        }

        Ok(())
    }
    .await;

    match result {
        Ok(()) => {
            reverter.success();
            write_message(&mut control, &Ack { ok: true, error: String::new() }).await?;
            info!("Migration sink finished");
            Ok(())
        }
        Err(e) => {
            reverter.fail().await;
            let _ =
                write_message(&mut control, &Ack { ok: false, error: e.to_string() }).await;
            Err(e)
        }
    }
}

/// Create the websocket-class source operation a peer dials into (pull
/// mode). Streaming starts once both channels have authenticated.
pub fn new_source_operation(
    server: Arc<Server>,
    pool: Arc<Pool>,
    project: String,
    volume_name: String,
    volume_only: bool,
    requestor: Option<String>,
) -> Result<Operation> {
    let resources = HashMap::from([(
        "storage_volumes".to_string(),
        vec![format!(
            "/1.0/storage-pools/{}/volumes/custom/{}",
            pool.name(),
            volume_name
        )],
    )]);

    let registry = server.operations.clone();
    let op = Operation::create(
        &registry,
        &project.clone(),
        OperationClass::Websocket,
        "volume_migrate",
        resources,
        HashMap::new(),
        Box::new(move |op| {
            Box::pin(async move {
                let mut ctx = op.context();
                let mut control_rx = op.take_channel(CHANNEL_CONTROL)?;
                let mut fs_rx = op.take_channel(CHANNEL_FILESYSTEM)?;

                // All sink websockets must authenticate before data flows.
                let control = tokio::select! {
                    stream = control_rx.recv() => stream
                        .ok_or_else(|| Error::Internal("Control channel closed".to_string()))?,
                    () = ctx.cancelled() => return Err(Error::Cancelled),
                };
                let fs = tokio::select! {
                    stream = fs_rx.recv() => stream
                        .ok_or_else(|| Error::Internal("Filesystem channel closed".to_string()))?,
                    () = ctx.cancelled() => return Err(Error::Cancelled),
                };

                run_source(server.as_ref(), pool.as_ref(), &project, &volume_name, !volume_only, control, fs)
                    .await
            })
        }),
        None,
        requestor,
    );

    op.register_channel(CHANNEL_CONTROL);
    op.register_channel(CHANNEL_FILESYSTEM);

    // The secrets are the operation metadata handed back to the caller.
    for (name, secret) in op.channel_secrets() {
        op.set_metadata(&name, serde_json::Value::String(secret));
    }

    Ok(op)
}

/// Create the task-class sink operation that dials a source operation and
/// pulls the volume (pull mode).
#[allow(clippy::too_many_arguments)]
pub fn new_sink_pull_operation(
    server: Arc<Server>,
    pool: Arc<Pool>,
    project: String,
    req: VolumesPost,
    client: Arc<dyn PeerClient>,
    requestor: Option<String>,
) -> Result<Operation> {
    let resources = HashMap::from([(
        "storage_volumes".to_string(),
        vec![format!("/1.0/storage-pools/{}/volumes/custom/{}", pool.name(), req.name)],
    )]);

    let registry = server.operations.clone();
    let op = Operation::create(
        &registry,
        &project.clone(),
        OperationClass::Task,
        "volume_create",
        resources,
        HashMap::new(),
        Box::new(move |op| {
            Box::pin(async move {
                let ctx = op.context();
                ctx.check()?;

                let operation_url = req.source.operation.clone();
                let control_secret = req
                    .source
                    .websockets
                    .get(CHANNEL_CONTROL)
                    .ok_or_else(|| Error::BadRequest("Missing control secret".to_string()))?;
                let fs_secret = req
                    .source
                    .websockets
                    .get(CHANNEL_FILESYSTEM)
                    .ok_or_else(|| Error::BadRequest("Missing filesystem secret".to_string()))?;

                let control = client
                    .connect_operation(&operation_url, CHANNEL_CONTROL, control_secret)
                    .await?;
                let fs = client
                    .connect_operation(&operation_url, CHANNEL_FILESYSTEM, fs_secret)
                    .await?;

                run_sink(server.as_ref(), &pool, &project, &req.name, &req.config, control, fs)
                    .await
            })
        }),
        None,
        requestor,
    );

    Ok(op)
}

/// Proxy two already-authenticated channel streams into each other until
/// both directions close (relay mode).
pub async fn relay_proxy(a: ChannelStream, b: ChannelStream) -> Result<()> {
    let mut a = a;
    let mut b = b;
    tokio::io::copy_bidirectional(&mut a, &mut b)
        .await
        .map_err(|e| Error::Internal(format!("Relay proxy failed: {}", e)))?;
    Ok(())
}
