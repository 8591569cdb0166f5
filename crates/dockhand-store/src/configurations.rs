use crate::instances::InstanceStore;
use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::{checksum_of, write_atomic, StoreError};
use chrono::{DateTime, Utc};
use dockhand_schema::{ConfigurationId, ContainerSpec};
use serde::{Deserialize, Serialize};
use std::fs;

/// A saved container template. Immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigurationRecord {
    pub id: ConfigurationId,
    pub spec: ContainerSpec,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl ConfigurationRecord {
    pub fn new(spec: ContainerSpec) -> Self {
        Self {
            id: ConfigurationId::generate(),
            spec,
            created_at: Utc::now(),
            checksum: None,
        }
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        checksum_of(&copy)
    }
}

pub struct ConfigurationStore {
    layout: StoreLayout,
}

impl ConfigurationStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    pub fn insert(&self, record: &ConfigurationRecord) -> Result<ConfigurationRecord, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;

        if self.exists(&record.id) {
            return Err(StoreError::ConfigurationExists(record.id.to_string()));
        }

        let mut stored = record.clone();
        stored.checksum = Some(stored.compute_checksum()?);
        let content = serde_json::to_string_pretty(&stored)?;
        let dir = self.layout.configurations_dir();
        write_atomic(&dir, &dir.join(stored.id.as_str()), content.as_bytes())?;
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Result<ConfigurationRecord, StoreError> {
        let path = self.layout.configurations_dir().join(id);
        if !path.exists() {
            return Err(StoreError::ConfigurationNotFound(id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let record: ConfigurationRecord = serde_json::from_str(&content)?;

        if let Some(ref expected) = record.checksum {
            let actual = record.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(record)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.configurations_dir().join(id).exists()
    }

    pub fn list(&self) -> Result<Vec<ConfigurationRecord>, StoreError> {
        let dir = self.layout.configurations_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut results = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let name_str = name.to_str().unwrap_or("");
            if name_str.is_empty() || name_str.starts_with('.') {
                continue;
            }
            match self.get(name_str) {
                Ok(record) => results.push(record),
                Err(e) => {
                    tracing::warn!("skipping corrupted configuration record '{name_str}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    /// Delete a configuration that no instance references.
    ///
    /// The reference check and the removal happen under the store lock, so an
    /// instance inserted concurrently either blocks the removal or fails its
    /// own insert.
    pub fn remove(&self, id: &str) -> Result<(), StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;

        let path = self.layout.configurations_dir().join(id);
        if !path.exists() {
            return Err(StoreError::ConfigurationNotFound(id.to_owned()));
        }

        let referencing = InstanceStore::new(self.layout.clone())
            .find_by_configuration(id)?
            .len();
        if referencing > 0 {
            return Err(StoreError::ConfigurationInUse {
                id: id.to_owned(),
                instances: referencing,
            });
        }

        fs::remove_file(path)?;
        crate::fsync_dir(&self.layout.configurations_dir())?;
        Ok(())
    }
}
