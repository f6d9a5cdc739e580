//! Centralized path configuration for burrow.
//!
//! All persistent state paths go through this module so the daemon and tests
//! agree on the on-disk layout.

use std::path::PathBuf;

/// Get the burrow data directory.
///
/// Resolution order:
/// 1. `BURROW_DATA_DIR` environment variable
/// 2. `/var/lib/burrow` if it exists (system install)
/// 3. `~/.burrow` for user-only installs
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("BURROW_DATA_DIR") {
        return PathBuf::from(dir);
    }

    let system_dir = PathBuf::from("/var/lib/burrow");
    if system_dir.exists() {
        return system_dir;
    }

    dirs::home_dir().map(|h| h.join(".burrow")).unwrap_or(system_dir)
}

/// Get the catalog database path.
pub fn db_path() -> PathBuf {
    data_dir().join("burrow.db")
}

/// Get the scratch directory for uploaded ISO images.
pub fn isos_dir() -> PathBuf {
    data_dir().join("isos")
}

/// Get the scratch directory for uploaded backup tarballs.
pub fn backups_dir() -> PathBuf {
    data_dir().join("backups")
}

/// Get the mount directory for a given instance's devices.
pub fn instance_devices_dir(instance: &str) -> PathBuf {
    data_dir().join("devices").join(instance)
}

/// Get the default directory for storage pool sources.
pub fn storage_dir() -> PathBuf {
    data_dir().join("storage-pools")
}

/// Prefix used for scratch ISO files.
pub const ISO_SCRATCH_PREFIX: &str = "burrow_iso";

/// Prefix used for scratch backup working files.
pub const BACKUP_WORKING_DIR_PREFIX: &str = "burrow_backup";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_consistency() {
        let base = data_dir();
        assert!(db_path().starts_with(&base));
        assert!(isos_dir().starts_with(&base));
        assert!(backups_dir().starts_with(&base));
        assert!(instance_devices_dir("c1").starts_with(&base));
    }
}
