use crate::lifecycle::{self, Transition};
use crate::CoreError;
use chrono::Utc;
use dockhand_runtime::{ContainerSummary, RuntimeBackend};
use dockhand_store::{Instance, InstanceStore};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one reconciliation pass.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub examined: usize,
    pub updated: usize,
    /// Per-instance failures. The pass continues past them.
    pub errors: Vec<String>,
    /// The runtime listing failed, so nothing was examined.
    pub runtime_unavailable: bool,
}

/// Corrects persisted instance status against what the runtime reports.
///
/// Idempotent: a second pass with no runtime change in between writes
/// nothing.
pub struct Reconciler {
    instances: Arc<InstanceStore>,
    runtime: Arc<dyn RuntimeBackend>,
}

impl Reconciler {
    pub fn new(instances: Arc<InstanceStore>, runtime: Arc<dyn RuntimeBackend>) -> Self {
        Self { instances, runtime }
    }

    pub async fn run(&self) -> ReconcileReport {
        let mut report = ReconcileReport::default();

        let instances = match self.instances.list() {
            Ok(list) => list,
            Err(e) => {
                warn!("reconcile: cannot list instances: {e}");
                report.errors.push(e.to_string());
                return report;
            }
        };

        // One listing for the whole pass; a failure here says nothing about
        // individual containers, so skip rather than fail everything.
        let summaries: HashMap<String, ContainerSummary> =
            match self.runtime.list_all_containers().await {
                Ok(list) => list.into_iter().map(|s| (s.id.to_string(), s)).collect(),
                Err(e) => {
                    warn!("reconcile: runtime listing failed, skipping pass: {e}");
                    report.runtime_unavailable = true;
                    report.errors.push(e.to_string());
                    return report;
                }
            };
        debug!(
            "reconcile: {} instances, {} runtime containers",
            instances.len(),
            summaries.len()
        );

        for instance in &instances {
            report.examined += 1;
            match self.reconcile_one(instance, &summaries).await {
                Ok(true) => report.updated += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!("reconcile: instance {}: {e}", instance.id);
                    report.errors.push(format!("{}: {e}", instance.id));
                }
            }
        }

        info!(
            "reconcile complete: {} examined, {} updated, {} errors",
            report.examined,
            report.updated,
            report.errors.len()
        );
        report
    }

    async fn reconcile_one(
        &self,
        instance: &Instance,
        summaries: &HashMap<String, ContainerSummary>,
    ) -> Result<bool, CoreError> {
        let transition = match instance.runtime_id() {
            None => Transition::MissingRuntimeId,
            Some(runtime_id) => match summaries.get(runtime_id.as_str()) {
                None => Transition::Vanished,
                Some(summary) => match lifecycle::classify_summary(summary) {
                    Some(status) => Transition::Observed(status),
                    None => {
                        let observed = self.runtime.inspect_container(runtime_id).await?;
                        Transition::Observed(lifecycle::derive_status(observed.as_ref()))
                    }
                },
            },
        };

        let previous = instance.status;
        let store = Arc::clone(&self.instances);
        let id = instance.id.clone();
        let modified = tokio::task::spawn_blocking(move || {
            store.modify::<_, CoreError>(&id, |i| {
                lifecycle::apply(i, &transition, Utc::now());
                Ok(())
            })
        })
        .await
        .map_err(|e| CoreError::Task(format!("instance store update: {e}")))??;
        if modified.written {
            info!(
                "reconcile: instance {} {} -> {}",
                instance.id, previous, modified.instance.status
            );
        }
        Ok(modified.written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockhand_runtime::{MockBackend, MockContainerState};
    use dockhand_schema::{ConfigurationId, ContainerSpec, RuntimeId};
    use dockhand_store::{ConfigurationRecord, ConfigurationStore, InstanceStatus, StoreLayout};

    struct Fixture {
        _dir: tempfile::TempDir,
        instances: Arc<InstanceStore>,
        mock: Arc<MockBackend>,
        cfg: ConfigurationId,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let layout = StoreLayout::new(dir.path());
            layout.initialize().unwrap();
            let cfg = ConfigurationStore::new(layout.clone())
                .insert(&ConfigurationRecord::new(ContainerSpec::for_image(
                    "nginx", "latest",
                )))
                .unwrap()
                .id;
            Self {
                _dir: dir,
                instances: Arc::new(InstanceStore::new(layout)),
                mock: Arc::new(MockBackend::new()),
                cfg,
            }
        }

        fn reconciler(&self) -> Reconciler {
            Reconciler::new(self.instances.clone(), self.mock.clone())
        }

        fn instance(&self, runtime_id: RuntimeId, status: InstanceStatus) -> Instance {
            let inst = self
                .instances
                .insert(&Instance::created(self.cfg.clone(), runtime_id))
                .unwrap();
            self.instances
                .modify::<_, CoreError>(&inst.id, |i| {
                    i.status = status;
                    Ok(())
                })
                .unwrap()
                .instance
        }

        fn status(&self, inst: &Instance) -> InstanceStatus {
            self.instances.get(&inst.id).unwrap().status
        }
    }

    #[tokio::test]
    async fn observed_running_wins_over_stopped() {
        let f = Fixture::new();
        let rid = f.mock.insert_container("nginx:latest", MockContainerState::Running);
        let inst = f.instance(rid, InstanceStatus::Stopped);

        let report = f.reconciler().run().await;
        assert_eq!(report.examined, 1);
        assert_eq!(report.updated, 1);
        assert_eq!(f.status(&inst), InstanceStatus::Running);
        assert!(f.instances.get(&inst.id).unwrap().started_at.is_some());
    }

    #[tokio::test]
    async fn vanished_created_fails_but_stopped_is_kept() {
        let f = Fixture::new();
        let created = f.instance(RuntimeId::new("gone-1"), InstanceStatus::Created);
        let running = f.instance(RuntimeId::new("gone-2"), InstanceStatus::Running);
        let stopped = f.instance(RuntimeId::new("gone-3"), InstanceStatus::Stopped);
        let failed = f.instance(RuntimeId::new("gone-4"), InstanceStatus::Failed);

        let report = f.reconciler().run().await;
        assert_eq!(report.updated, 2);
        assert_eq!(f.status(&created), InstanceStatus::Failed);
        assert_eq!(f.status(&running), InstanceStatus::Failed);
        assert_eq!(f.status(&stopped), InstanceStatus::Stopped);
        assert_eq!(f.status(&failed), InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn missing_runtime_id_fails() {
        let f = Fixture::new();
        let inst = f.instance(RuntimeId::new(""), InstanceStatus::Running);
        f.reconciler().run().await;
        assert_eq!(f.status(&inst), InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn second_pass_writes_nothing() {
        let f = Fixture::new();
        let a = f.mock.insert_container("nginx:latest", MockContainerState::Running);
        let b = f.mock.insert_container("nginx:latest", MockContainerState::Exited);
        let one = f.instance(a, InstanceStatus::Created);
        let two = f.instance(b, InstanceStatus::Running);

        let first = f.reconciler().run().await;
        assert_eq!(first.updated, 2);
        let revisions = (
            f.instances.get(&one.id).unwrap().revision,
            f.instances.get(&two.id).unwrap().revision,
        );

        let second = f.reconciler().run().await;
        assert_eq!(second.updated, 0);
        assert!(second.errors.is_empty());
        assert_eq!(
            revisions,
            (
                f.instances.get(&one.id).unwrap().revision,
                f.instances.get(&two.id).unwrap().revision,
            )
        );
    }

    #[tokio::test]
    async fn paused_falls_back_to_inspection() {
        let f = Fixture::new();
        let rid = f.mock.insert_container("nginx:latest", MockContainerState::Paused);
        let inst = f.instance(rid.clone(), InstanceStatus::Running);

        f.reconciler().run().await;
        assert_eq!(f.status(&inst), InstanceStatus::Stopped);
        assert!(f.mock.calls().contains(&format!("inspect {rid}")));
    }

    #[tokio::test]
    async fn dead_container_fails() {
        let f = Fixture::new();
        let rid = f.mock.insert_container("nginx:latest", MockContainerState::Dead);
        let inst = f.instance(rid, InstanceStatus::Running);
        f.reconciler().run().await;
        assert_eq!(f.status(&inst), InstanceStatus::Failed);
    }

    #[tokio::test]
    async fn per_instance_error_does_not_stop_the_pass() {
        let f = Fixture::new();
        let bad = f.mock.insert_container("nginx:latest", MockContainerState::Paused);
        f.mock.fail_inspect(&bad);
        let good = f.mock.insert_container("nginx:latest", MockContainerState::Running);
        let bad_inst = f.instance(bad, InstanceStatus::Running);
        let good_inst = f.instance(good, InstanceStatus::Created);

        let report = f.reconciler().run().await;
        assert_eq!(report.examined, 2);
        assert_eq!(report.updated, 1);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(f.status(&bad_inst), InstanceStatus::Running);
        assert_eq!(f.status(&good_inst), InstanceStatus::Running);
    }

    #[tokio::test]
    async fn unavailable_runtime_skips_pass() {
        let f = Fixture::new();
        let inst = f.instance(RuntimeId::new("whatever"), InstanceStatus::Running);
        f.mock.set_unavailable(true);

        let report = f.reconciler().run().await;
        assert!(report.runtime_unavailable);
        assert_eq!(report.examined, 0);
        assert_eq!(f.status(&inst), InstanceStatus::Running);
    }
}
