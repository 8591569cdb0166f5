use crate::events::EventConsumer;
use crate::lifecycle::{self, Transition};
use crate::reconcile::Reconciler;
use crate::CoreError;
use chrono::Utc;
use dockhand_runtime::{ObservedState, RuntimeBackend, RuntimeError};
use dockhand_schema::{parse_configuration_file, ConfigurationId, ContainerSpec};
use dockhand_store::{
    ConfigurationRecord, ConfigurationStore, Instance, InstanceStatus, InstanceStore, StoreLayout,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lifecycle operations over container instances.
///
/// Each transition calls the runtime first and persists the outcome only
/// after the runtime accepted it. Status updates go through the instance
/// store's serialized read-modify-write, so they compose safely with
/// reconciliation and the event consumer running against the same records.
pub struct Engine {
    layout: StoreLayout,
    configurations: ConfigurationStore,
    instances: Arc<InstanceStore>,
    runtime: Arc<dyn RuntimeBackend>,
}

/// An instance alongside what the runtime currently reports for it.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceInspection {
    pub instance: Instance,
    pub observed: Option<ObservedState>,
    /// Status the observation implies. Not persisted.
    pub observed_status: InstanceStatus,
}

impl Engine {
    /// Open (and initialize if needed) the store at `store_root`.
    pub fn new(
        store_root: impl Into<PathBuf>,
        runtime: Arc<dyn RuntimeBackend>,
    ) -> Result<Self, CoreError> {
        let layout = StoreLayout::new(store_root);
        layout.initialize()?;
        Ok(Self {
            configurations: ConfigurationStore::new(layout.clone()),
            instances: Arc::new(InstanceStore::new(layout.clone())),
            layout,
            runtime,
        })
    }

    pub fn store_layout(&self) -> &StoreLayout {
        &self.layout
    }

    pub fn runtime(&self) -> &Arc<dyn RuntimeBackend> {
        &self.runtime
    }

    pub fn instance_store(&self) -> &Arc<InstanceStore> {
        &self.instances
    }

    /// A reconciler over this engine's records and control runtime.
    pub fn reconciler(&self) -> Reconciler {
        Reconciler::new(Arc::clone(&self.instances), Arc::clone(&self.runtime))
    }

    /// An event consumer reading from `events_runtime`, normally an adapter
    /// built with an unbounded timeout.
    pub fn event_consumer(
        &self,
        events_runtime: Arc<dyn RuntimeBackend>,
        backoff: Duration,
    ) -> EventConsumer {
        EventConsumer::new(Arc::clone(&self.instances), events_runtime, backoff)
    }

    pub fn save_configuration(&self, spec: ContainerSpec) -> Result<ConfigurationRecord, CoreError> {
        let record = self
            .configurations
            .insert(&ConfigurationRecord::new(spec))?;
        info!("saved configuration {} ({})", record.id, record.spec.image);
        Ok(record)
    }

    /// Parse, validate and save a TOML configuration file.
    pub fn save_configuration_file(&self, path: &Path) -> Result<ConfigurationRecord, CoreError> {
        let spec = parse_configuration_file(path)?.normalize()?;
        self.save_configuration(spec)
    }

    pub fn get_configuration(&self, id: &str) -> Result<ConfigurationRecord, CoreError> {
        Ok(self.configurations.get(id)?)
    }

    pub fn list_configurations(&self) -> Result<Vec<ConfigurationRecord>, CoreError> {
        Ok(self.configurations.list()?)
    }

    /// Delete a configuration. Fails with a conflict while any instance references it.
    pub fn delete_configuration(&self, id: &str) -> Result<(), CoreError> {
        self.configurations.remove(id)?;
        info!("deleted configuration {id}");
        Ok(())
    }

    /// Materialize `spec` as a new container and record it as `Created`.
    pub async fn create(
        &self,
        configuration_id: &ConfigurationId,
        spec: &ContainerSpec,
    ) -> Result<Instance, CoreError> {
        info!("creating container from {} ({})", configuration_id, spec.image);
        let runtime_id = self.runtime.create_container(spec).await?;

        let instance = Instance::created(configuration_id.clone(), runtime_id.clone());
        let inserted = self
            .with_instances(move |store| store.insert(&instance).map_err(CoreError::from))
            .await;
        match inserted {
            Ok(stored) => {
                info!(
                    "created instance {} (container {})",
                    stored.id,
                    runtime_id.short()
                );
                Ok(stored)
            }
            Err(e) => {
                warn!(
                    "recording container {} failed, removing it: {e}",
                    runtime_id.short()
                );
                if let Err(cleanup) = self.runtime.delete_container(&runtime_id).await {
                    warn!("orphaned container {}: {cleanup}", runtime_id.short());
                }
                Err(e)
            }
        }
    }

    /// Look the configuration up and create an instance from it.
    pub async fn create_from_configuration(
        &self,
        configuration_id: &str,
    ) -> Result<Instance, CoreError> {
        let record = self.configurations.get(configuration_id)?;
        self.create(&record.id, &record.spec).await
    }

    pub async fn start(&self, id: &str) -> Result<Instance, CoreError> {
        let runtime_id = self.runtime_id_of(id)?;
        info!("starting instance {id}");
        self.runtime.start_container(&runtime_id).await?;
        self.record(id, Transition::Started).await
    }

    /// Stop an instance. Stopping an already stopped container succeeds; an
    /// instance the runtime already reported as failed stays `Failed`.
    ///
    /// The stop is marked on the record before the runtime is asked, so the
    /// `die` event the stop provokes resolves to `Stopped` whichever write
    /// lands first.
    pub async fn stop(&self, id: &str) -> Result<Instance, CoreError> {
        let runtime_id = self.runtime_id_of(id)?;
        info!("stopping instance {id}");
        self.record(id, Transition::StopRequested).await?;
        if let Err(e) = self.runtime.stop_container(&runtime_id).await {
            if let Err(clear) = self.record(id, Transition::StopAbandoned).await {
                warn!("instance {id}: clearing stop marker failed: {clear}");
            }
            return Err(e.into());
        }
        let instance = self.record(id, Transition::Stopped).await?;
        if instance.status == InstanceStatus::Failed {
            debug!("instance {id} stopped but keeps failed status");
        }
        Ok(instance)
    }

    /// Remove the runtime container, then the record. A container the runtime
    /// no longer knows counts as removed.
    pub async fn delete(&self, id: &str) -> Result<(), CoreError> {
        let instance = self.instances.get(id)?;
        info!("deleting instance {id}");

        if let Some(runtime_id) = instance.runtime_id() {
            match self.runtime.delete_container(runtime_id).await {
                Ok(()) => {}
                Err(RuntimeError::NotFound(_)) => {
                    debug!("container {} already gone", runtime_id.short());
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            warn!("instance {id} has no runtime container; removing record only");
        }

        let id = id.to_owned();
        self.with_instances(move |store| Ok(store.remove(&id)?))
            .await?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Instance, CoreError> {
        Ok(self.instances.get(id)?)
    }

    pub fn list(&self) -> Result<Vec<Instance>, CoreError> {
        Ok(self.instances.list()?)
    }

    /// Read an instance and ask the runtime about its container without
    /// changing anything.
    pub async fn inspect(&self, id: &str) -> Result<InstanceInspection, CoreError> {
        let instance = self.instances.get(id)?;
        let observed = match instance.runtime_id() {
            Some(runtime_id) => self.runtime.inspect_container(runtime_id).await?,
            None => None,
        };
        Ok(InstanceInspection {
            observed_status: lifecycle::derive_status(observed.as_ref()),
            observed,
            instance,
        })
    }

    /// Apply `transition` to the record through the store's serialized
    /// read-modify-write.
    async fn record(&self, id: &str, transition: Transition) -> Result<Instance, CoreError> {
        let id = id.to_owned();
        self.with_instances(move |store| {
            let modified = store.modify::<_, CoreError>(&id, |i| {
                lifecycle::apply(i, &transition, Utc::now());
                Ok(())
            })?;
            Ok(modified.instance)
        })
        .await
    }

    /// Run `f` against the instance store on the blocking pool. Writes wait
    /// on the cross-process store lock, which another CLI process may hold.
    async fn with_instances<T, F>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(&InstanceStore) -> Result<T, CoreError> + Send + 'static,
        T: Send + 'static,
    {
        let instances = Arc::clone(&self.instances);
        tokio::task::spawn_blocking(move || f(&instances))
            .await
            .map_err(|e| CoreError::Task(format!("instance store update: {e}")))?
    }

    fn runtime_id_of(&self, id: &str) -> Result<dockhand_schema::RuntimeId, CoreError> {
        let instance = self.instances.get(id)?;
        instance
            .runtime_id()
            .cloned()
            .ok_or_else(|| CoreError::MissingRuntimeId(id.to_owned()))
    }
}
