use crate::{DaemonConfig, Engine, ReconcileReport};
use dockhand_runtime::RuntimeBackend;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

/// Run the control plane until `shutdown` resolves.
///
/// Reconciles once, then follows the runtime's event feed through
/// `events_runtime` (an adapter without a response timeout). With
/// `reconcile_interval_secs` set, reconciliation repeats on that period,
/// which also repairs anything the feed missed while disconnected.
///
/// Returns the report of the initial pass.
pub async fn run_daemon<F>(
    engine: &Engine,
    events_runtime: Arc<dyn RuntimeBackend>,
    config: &DaemonConfig,
    shutdown: F,
) -> ReconcileReport
where
    F: Future<Output = ()>,
{
    info!(
        "dockhand daemon starting ({} runtime, store {})",
        engine.runtime().name(),
        engine.store_layout().root().display()
    );

    let reconciler = engine.reconciler();
    let initial = reconciler.run().await;

    let worker = engine
        .event_consumer(events_runtime, config.event_backoff())
        .spawn();

    tokio::pin!(shutdown);
    match config.reconcile_interval() {
        Some(period) => {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately and the initial pass already ran.
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = &mut shutdown => break,
                    _ = ticker.tick() => {
                        reconciler.run().await;
                    }
                }
            }
        }
        None => shutdown.await,
    }

    info!("dockhand daemon shutting down");
    worker.shutdown().await;
    initial
}

#[cfg(test)]
mod tests {
    use super::*;
    use dockhand_runtime::{MockBackend, MockContainerState, RuntimeEvent};
    use dockhand_schema::ContainerSpec;
    use dockhand_store::InstanceStatus;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn periodic_reconcile_repairs_missed_changes() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockBackend::new());
        let engine = Engine::new(dir.path(), mock.clone()).unwrap();
        let cfg = engine
            .save_configuration(ContainerSpec::for_image("nginx", "latest"))
            .unwrap();
        let inst = engine.create(&cfg.id, &cfg.spec).await.unwrap();
        engine.start(&inst.id).await.unwrap();

        let config = DaemonConfig {
            runtime: "mock".to_owned(),
            reconcile_interval_secs: Some(60),
            ..DaemonConfig::default()
        };

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let shutdown = async {
            let _ = rx.await;
        };
        let daemon = run_daemon(&engine, mock.clone(), &config, shutdown);

        let driver = async {
            // Changed behind the daemon's back with no event emitted.
            mock.set_state(inst.runtime_id().unwrap(), MockContainerState::Exited, Some(0));
            tokio::time::sleep(Duration::from_secs(61)).await;
            let status = engine.get(&inst.id).unwrap().status;
            let _ = tx.send(());
            status
        };

        let (report, status) = tokio::join!(daemon, driver);
        assert_eq!(report.examined, 1);
        assert_eq!(status, InstanceStatus::Stopped);
    }

    #[tokio::test]
    async fn daemon_applies_events_until_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockBackend::new());
        let engine = Engine::new(dir.path(), mock.clone()).unwrap();
        let cfg = engine
            .save_configuration(ContainerSpec::for_image("nginx", "latest"))
            .unwrap();
        let inst = engine.create(&cfg.id, &cfg.spec).await.unwrap();
        engine.start(&inst.id).await.unwrap();
        let rid = inst.runtime_id().unwrap().clone();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let config = DaemonConfig::default();
        let daemon = run_daemon(&engine, mock.clone(), &config, async {
            let _ = rx.await;
        });

        let driver = async {
            while mock.subscription_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            mock.set_state(&rid, MockContainerState::Exited, Some(3));
            mock.emit(&RuntimeEvent::container("die", rid.clone()).with_attribute("exitCode", "3"));
            while engine.get(&inst.id).unwrap().status != InstanceStatus::Failed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            let _ = tx.send(());
        };

        tokio::join!(daemon, driver);
        assert_eq!(mock.subscription_count(), 0);
    }
}
