//! Domain types for the storage subsystem.

pub mod api;
pub mod instance;
pub mod pool;
pub mod volume;

pub use instance::InstanceRecord;
pub use pool::{PoolRecord, PoolStatus, POOL_ID_TEMPORARY};
pub use volume::{ContentType, Volume, VolumeType, SNAPSHOT_DELIMITER};
