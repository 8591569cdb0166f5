use crate::StoreError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Current store format version. Incremented on incompatible layout changes.
pub const STORE_FORMAT_VERSION: u32 = 1;
const VERSION_FILE: &str = "version";

/// Directory layout for the Dockhand record store.
///
/// Manages paths for configuration records, instance records, the lock file,
/// and the store version marker. All subdirectories are created lazily on
/// [`initialize`](Self::initialize).
#[derive(Debug, Clone)]
pub struct StoreLayout {
    root: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreVersion {
    format_version: u32,
}

impl StoreLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn store_dir(&self) -> PathBuf {
        self.root.join("store")
    }

    #[inline]
    pub fn configurations_dir(&self) -> PathBuf {
        self.store_dir().join("configurations")
    }

    #[inline]
    pub fn instances_dir(&self) -> PathBuf {
        self.store_dir().join("instances")
    }

    #[inline]
    pub fn lock_file(&self) -> PathBuf {
        self.store_dir().join(".lock")
    }

    pub fn initialize(&self) -> Result<(), StoreError> {
        fs::create_dir_all(self.configurations_dir())?;
        fs::create_dir_all(self.instances_dir())?;

        let version_path = self.store_dir().join(VERSION_FILE);
        if version_path.exists() {
            self.verify_version()?;
        } else {
            let ver = StoreVersion {
                format_version: STORE_FORMAT_VERSION,
            };
            let content = serde_json::to_string_pretty(&ver)?;
            crate::write_atomic(&self.store_dir(), &version_path, content.as_bytes())?;
        }

        Ok(())
    }

    pub fn verify_version(&self) -> Result<(), StoreError> {
        let version_path = self.store_dir().join(VERSION_FILE);
        let content = fs::read_to_string(&version_path)?;
        let ver: StoreVersion = serde_json::from_str(&content)?;

        if ver.format_version != STORE_FORMAT_VERSION {
            return Err(StoreError::VersionMismatch {
                expected: STORE_FORMAT_VERSION,
                found: ver.format_version,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths_are_correct() {
        let layout = StoreLayout::new("/tmp/dockhand-test");
        assert_eq!(
            layout.configurations_dir(),
            PathBuf::from("/tmp/dockhand-test/store/configurations")
        );
        assert_eq!(
            layout.instances_dir(),
            PathBuf::from("/tmp/dockhand-test/store/instances")
        );
        assert_eq!(
            layout.lock_file(),
            PathBuf::from("/tmp/dockhand-test/store/.lock")
        );
    }

    #[test]
    fn initialize_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();

        assert!(layout.configurations_dir().is_dir());
        assert!(layout.instances_dir().is_dir());
    }

    #[test]
    fn initialize_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        layout.initialize().unwrap();
        layout.verify_version().unwrap();
    }

    #[test]
    fn rejects_foreign_format_version() {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        fs::write(
            layout.store_dir().join(VERSION_FILE),
            r#"{"format_version": 99}"#,
        )
        .unwrap();

        match layout.initialize() {
            Err(StoreError::VersionMismatch { expected, found }) => {
                assert_eq!(expected, STORE_FORMAT_VERSION);
                assert_eq!(found, 99);
            }
            other => panic!("expected VersionMismatch, got {other:?}"),
        }
    }
}
