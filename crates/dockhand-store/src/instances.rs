use crate::layout::StoreLayout;
use crate::lock::StoreLock;
use crate::{checksum_of, write_atomic, StoreError};
use chrono::{DateTime, Utc};
use dockhand_schema::{ConfigurationId, InstanceId, RuntimeId};
use serde::{Deserialize, Serialize};
use std::fs;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    Created,
    Running,
    Stopped,
    Failed,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstanceStatus::Created => write!(f, "created"),
            InstanceStatus::Running => write!(f, "running"),
            InstanceStatus::Stopped => write!(f, "stopped"),
            InstanceStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Persisted record of one materialized container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Instance {
    pub id: InstanceId,
    pub configuration_id: ConfigurationId,
    /// Assigned by the runtime on creation; immutable once set.
    #[serde(default)]
    pub runtime_id: Option<RuntimeId>,
    pub status: InstanceStatus,
    pub created_at: DateTime<Utc>,
    /// Set on the first transition into `Running`, never cleared.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// A user stop is in flight: set before the runtime is asked to stop the
    /// container and cleared once the outcome is recorded.
    #[serde(default)]
    pub stop_requested: bool,
    /// Bumped by the store on every write.
    #[serde(default)]
    pub revision: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Instance {
    /// A fresh record in `Created` for a container the runtime just made.
    pub fn created(configuration_id: ConfigurationId, runtime_id: RuntimeId) -> Self {
        let now = Utc::now();
        Self {
            id: InstanceId::generate(),
            configuration_id,
            runtime_id: Some(runtime_id),
            status: InstanceStatus::Created,
            created_at: now,
            started_at: None,
            updated_at: now,
            stop_requested: false,
            revision: 0,
            checksum: None,
        }
    }

    /// The runtime id, treating an empty string as absent.
    pub fn runtime_id(&self) -> Option<&RuntimeId> {
        self.runtime_id.as_ref().filter(|r| !r.is_empty())
    }

    fn compute_checksum(&self) -> Result<String, StoreError> {
        let mut copy = self.clone();
        copy.checksum = None;
        checksum_of(&copy)
    }
}

/// Outcome of [`InstanceStore::modify`].
#[derive(Debug, Clone)]
pub struct Modified {
    pub instance: Instance,
    /// `false` when the closure left the record unchanged and nothing was written.
    pub written: bool,
}

pub struct InstanceStore {
    layout: StoreLayout,
}

impl InstanceStore {
    pub fn new(layout: StoreLayout) -> Self {
        Self { layout }
    }

    /// Persist a new record. Fails if the id is taken or the referenced
    /// configuration no longer exists.
    pub fn insert(&self, instance: &Instance) -> Result<Instance, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;

        if self.exists(&instance.id) {
            return Err(StoreError::InstanceExists(instance.id.to_string()));
        }
        let config_path = self
            .layout
            .configurations_dir()
            .join(instance.configuration_id.as_str());
        if !config_path.exists() {
            return Err(StoreError::ConfigurationNotFound(
                instance.configuration_id.to_string(),
            ));
        }

        let mut record = instance.clone();
        record.revision = 1;
        self.write(&mut record)?;
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<Instance, StoreError> {
        let path = self.layout.instances_dir().join(id);
        if !path.exists() {
            return Err(StoreError::InstanceNotFound(id.to_owned()));
        }
        let content = fs::read_to_string(&path)?;
        let instance: Instance = serde_json::from_str(&content)?;

        if let Some(ref expected) = instance.checksum {
            let actual = instance.compute_checksum()?;
            if actual != *expected {
                return Err(StoreError::IntegrityFailure {
                    id: id.to_owned(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }

        Ok(instance)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.layout.instances_dir().join(id).exists()
    }

    /// All readable records, ordered by creation time. Corrupt entries are
    /// skipped with a warning.
    pub fn list(&self) -> Result<Vec<Instance>, StoreError> {
        let dir = self.layout.instances_dir();
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
                Ok(instance) => results.push(instance),
                Err(e) => {
                    tracing::warn!("skipping corrupted instance record '{name_str}': {e}");
                }
            }
        }
        results.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(results)
    }

    pub fn find_by_configuration(&self, configuration_id: &str) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.configuration_id == *configuration_id)
            .collect())
    }

    /// Every record pointing at `runtime_id`. Normally one, but duplicates are tolerated.
    pub fn find_by_runtime_id(&self, runtime_id: &str) -> Result<Vec<Instance>, StoreError> {
        Ok(self
            .list()?
            .into_iter()
            .filter(|i| i.runtime_id().is_some_and(|r| *r == *runtime_id))
            .collect())
    }

    /// Serialized read-modify-write of one record.
    ///
    /// `f` sees the freshest persisted state while the store lock is held.
    /// If it leaves the record unchanged nothing is written; otherwise the
    /// revision is bumped and the record rewritten. A set runtime id and a
    /// set start time cannot be changed.
    pub fn modify<F, E>(&self, id: &str, f: F) -> Result<Modified, E>
    where
        F: FnOnce(&mut Instance) -> Result<(), E>,
        E: From<StoreError>,
    {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;

        let current = self.get(id)?;
        let mut next = current.clone();
        f(&mut next)?;

        if next == current {
            return Ok(Modified {
                instance: current,
                written: false,
            });
        }

        if next.id != current.id || next.configuration_id != current.configuration_id {
            return Err(StoreError::ImmutableField {
                id: id.to_owned(),
                reason: "identity and configuration reference cannot change",
            }
            .into());
        }
        if current.runtime_id().is_some() && next.runtime_id != current.runtime_id {
            return Err(StoreError::ImmutableField {
                id: id.to_owned(),
                reason: "runtime id cannot change once set",
            }
            .into());
        }
        if current.started_at.is_some() && next.started_at != current.started_at {
            return Err(StoreError::ImmutableField {
                id: id.to_owned(),
                reason: "start time is recorded once",
            }
            .into());
        }

        next.revision = current.revision + 1;
        next.updated_at = Utc::now();
        self.write(&mut next)?;

        Ok(Modified {
            instance: next,
            written: true,
        })
    }

    /// Remove a record. Returns `false` if it did not exist.
    pub fn remove(&self, id: &str) -> Result<bool, StoreError> {
        let _lock = StoreLock::acquire(&self.layout.lock_file())?;
        let path = self.layout.instances_dir().join(id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(path)?;
        crate::fsync_dir(&self.layout.instances_dir())?;
        Ok(true)
    }

    fn write(&self, instance: &mut Instance) -> Result<(), StoreError> {
        instance.checksum = Some(instance.compute_checksum()?);
        let content = serde_json::to_string_pretty(instance)?;
        let dir = self.layout.instances_dir();
        write_atomic(&dir, &dir.join(instance.id.as_str()), content.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configurations::{ConfigurationRecord, ConfigurationStore};
    use dockhand_schema::ContainerSpec;

    fn test_stores() -> (tempfile::TempDir, ConfigurationStore, InstanceStore) {
        let dir = tempfile::tempdir().unwrap();
        let layout = StoreLayout::new(dir.path());
        layout.initialize().unwrap();
        (
            dir,
            ConfigurationStore::new(layout.clone()),
            InstanceStore::new(layout),
        )
    }

    fn saved_config(configs: &ConfigurationStore) -> ConfigurationId {
        let record = ConfigurationRecord::new(ContainerSpec::for_image("nginx", "latest"));
        configs.insert(&record).unwrap().id
    }

    #[test]
    fn insert_and_get_roundtrip() {
        let (_dir, configs, store) = test_stores();
        let cfg = saved_config(&configs);
        let inst = Instance::created(cfg.clone(), RuntimeId::new("r1"));

        let stored = store.insert(&inst).unwrap();
        assert_eq!(stored.revision, 1);
        assert!(stored.checksum.is_some(), "insert() must embed a checksum");

        let back = store.get(&inst.id).unwrap();
        assert_eq!(back, stored);
        assert_eq!(back.status, InstanceStatus::Created);
        assert_eq!(back.configuration_id, cfg);
    }

    #[test]
    fn insert_rejects_missing_configuration() {
        let (_dir, _configs, store) = test_stores();
        let inst = Instance::created("ghost".into(), RuntimeId::new("r1"));
        assert!(matches!(
            store.insert(&inst),
            Err(StoreError::ConfigurationNotFound(_))
        ));
    }

    #[test]
    fn insert_rejects_duplicate_id() {
        let (_dir, configs, store) = test_stores();
        let inst = Instance::created(saved_config(&configs), RuntimeId::new("r1"));
        store.insert(&inst).unwrap();
        assert!(matches!(
            store.insert(&inst),
            Err(StoreError::InstanceExists(_))
        ));
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, _configs, store) = test_stores();
        assert!(matches!(
            store.get("nope"),
            Err(StoreError::InstanceNotFound(_))
        ));
    }

    #[test]
    fn modify_bumps_revision_on_change() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();

        let out = store
            .modify::<_, StoreError>(&inst.id, |i| {
                i.status = InstanceStatus::Running;
                Ok(())
            })
            .unwrap();
        assert!(out.written);
        assert_eq!(out.instance.revision, 2);
        assert_eq!(store.get(&inst.id).unwrap().status, InstanceStatus::Running);
    }

    #[test]
    fn modify_without_change_writes_nothing() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();

        let out = store
            .modify::<_, StoreError>(&inst.id, |i| {
                i.status = InstanceStatus::Created;
                Ok(())
            })
            .unwrap();
        assert!(!out.written);
        assert_eq!(store.get(&inst.id).unwrap().revision, 1);
    }

    #[test]
    fn modify_refuses_runtime_id_change() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();

        let result = store.modify::<_, StoreError>(&inst.id, |i| {
            i.runtime_id = Some(RuntimeId::new("r2"));
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::ImmutableField { .. })));
        assert_eq!(store.get(&inst.id).unwrap().runtime_id, inst.runtime_id);
    }

    #[test]
    fn modify_refuses_clearing_started_at() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();
        store
            .modify::<_, StoreError>(&inst.id, |i| {
                i.status = InstanceStatus::Running;
                i.started_at = Some(Utc::now());
                Ok(())
            })
            .unwrap();

        let result = store.modify::<_, StoreError>(&inst.id, |i| {
            i.started_at = None;
            Ok(())
        });
        assert!(matches!(result, Err(StoreError::ImmutableField { .. })));
    }

    #[test]
    fn modify_closure_error_propagates_without_write() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();

        let result = store.modify::<_, StoreError>(&inst.id, |i| {
            i.status = InstanceStatus::Failed;
            Err(StoreError::LockFailed("refused".to_owned()))
        });
        assert!(result.is_err());
        assert_eq!(store.get(&inst.id).unwrap().status, InstanceStatus::Created);
    }

    #[test]
    fn find_by_runtime_id_returns_duplicates() {
        let (_dir, configs, store) = test_stores();
        let cfg = saved_config(&configs);
        store
            .insert(&Instance::created(cfg.clone(), RuntimeId::new("shared")))
            .unwrap();
        store
            .insert(&Instance::created(cfg.clone(), RuntimeId::new("shared")))
            .unwrap();
        store
            .insert(&Instance::created(cfg, RuntimeId::new("other")))
            .unwrap();

        assert_eq!(store.find_by_runtime_id("shared").unwrap().len(), 2);
        assert_eq!(store.find_by_runtime_id("other").unwrap().len(), 1);
        assert!(store.find_by_runtime_id("none").unwrap().is_empty());
    }

    #[test]
    fn empty_runtime_id_matches_nothing() {
        let (_dir, configs, store) = test_stores();
        store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("")))
            .unwrap();
        assert!(store.find_by_runtime_id("").unwrap().is_empty());
    }

    #[test]
    fn list_skips_corrupted_records() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();

        let path = store.layout.instances_dir().join("broken");
        fs::write(path, "{ not json").unwrap();

        let list = store.list().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, inst.id);
    }

    #[test]
    fn tampered_record_fails_integrity() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();

        let path = store.layout.instances_dir().join(inst.id.as_str());
        let content = fs::read_to_string(&path).unwrap();
        fs::write(&path, content.replace("\"Created\"", "\"Running\"")).unwrap();

        assert!(matches!(
            store.get(&inst.id),
            Err(StoreError::IntegrityFailure { .. })
        ));
    }

    #[test]
    fn remove_reports_presence() {
        let (_dir, configs, store) = test_stores();
        let inst = store
            .insert(&Instance::created(saved_config(&configs), RuntimeId::new("r1")))
            .unwrap();
        assert!(store.remove(&inst.id).unwrap());
        assert!(!store.remove(&inst.id).unwrap());
        assert!(!store.exists(&inst.id));
    }

    #[test]
    fn status_display_is_lowercase() {
        assert_eq!(InstanceStatus::Running.to_string(), "running");
        assert_eq!(InstanceStatus::Failed.to_string(), "failed");
    }
}
