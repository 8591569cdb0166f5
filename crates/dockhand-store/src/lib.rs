//! Durable configuration and instance records for Dockhand.
//!
//! This crate provides the persistence layer: `StoreLayout` for directory
//! structure and format versioning, `ConfigurationStore` for saved container
//! templates, `InstanceStore` for lifecycle records with serialized
//! read-modify-write, and `StoreLock` for cross-process exclusion. Records are
//! JSON files written atomically and verified against an embedded blake3 checksum.

pub mod configurations;
pub mod instances;
pub mod layout;
pub mod lock;

pub use configurations::{ConfigurationRecord, ConfigurationStore};
pub use instances::{Instance, InstanceStatus, InstanceStore, Modified};
pub use layout::{StoreLayout, STORE_FORMAT_VERSION};
pub use lock::StoreLock;

use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// On Linux with ext4 `data=ordered` (the default), renames are usually
/// durable without an explicit dir fsync, but POSIX does not guarantee this.
/// Calling `fsync()` on the parent directory makes the rename durable on
/// all filesystems and mount configurations.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

/// Write `content` to `dest` via a temp file in the same directory and an atomic rename.
pub(crate) fn write_atomic(dir: &Path, dest: &Path, content: &[u8]) -> Result<(), StoreError> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dest).map_err(|e| StoreError::Io(e.error))?;
    fsync_dir(dir)?;
    Ok(())
}

/// blake3 over the pretty JSON of a record whose checksum field has been cleared.
pub(crate) fn checksum_of(value: &impl serde::Serialize) -> Result<String, StoreError> {
    let json = serde_json::to_string_pretty(value)?;
    Ok(blake3::hash(json.as_bytes()).to_hex().to_string())
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("integrity check failed for record '{id}': expected {expected}, got {actual}")]
    IntegrityFailure {
        id: String,
        expected: String,
        actual: String,
    },
    #[error("configuration not found: {0}")]
    ConfigurationNotFound(String),
    #[error("instance not found: {0}")]
    InstanceNotFound(String),
    #[error("configuration already exists: {0}")]
    ConfigurationExists(String),
    #[error("instance already exists: {0}")]
    InstanceExists(String),
    #[error("configuration '{id}' is referenced by {instances} instance(s)")]
    ConfigurationInUse { id: String, instances: usize },
    #[error("instance '{id}': {reason}")]
    ImmutableField { id: String, reason: &'static str },
    #[error("lock acquisition failed: {0}")]
    LockFailed(String),
    #[error("store format version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_display_in_use() {
        let e = StoreError::ConfigurationInUse {
            id: "cfg1".to_owned(),
            instances: 2,
        };
        let msg = e.to_string();
        assert!(msg.contains("cfg1"));
        assert!(msg.contains('2'));
    }

    #[test]
    fn store_error_display_not_found() {
        assert!(StoreError::InstanceNotFound("inst".to_owned())
            .to_string()
            .contains("inst"));
        assert!(StoreError::ConfigurationNotFound("cfg".to_owned())
            .to_string()
            .contains("cfg"));
    }

    #[test]
    fn store_error_display_version_mismatch() {
        let e = StoreError::VersionMismatch {
            expected: 1,
            found: 2,
        };
        let msg = e.to_string();
        assert!(msg.contains('1'));
        assert!(msg.contains('2'));
    }

    #[test]
    fn store_error_display_integrity_failure() {
        let e = StoreError::IntegrityFailure {
            id: "h".to_owned(),
            expected: "exp".to_owned(),
            actual: "act".to_owned(),
        };
        let msg = e.to_string();
        assert!(msg.contains("exp"));
        assert!(msg.contains("act"));
    }

    #[test]
    fn write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("record");
        write_atomic(dir.path(), &dest, b"one").unwrap();
        write_atomic(dir.path(), &dest, b"two").unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"two");
    }
}
