use super::reconcile::print_report;
use super::{json_pretty, CommandError, EXIT_SUCCESS};
use dockhand_core::{run_daemon, DaemonConfig, Engine};
use dockhand_runtime::RuntimeBackend;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn run(
    engine: &Engine,
    events_runtime: Arc<dyn RuntimeBackend>,
    config: &DaemonConfig,
    json: bool,
) -> Result<u8, CommandError> {
    let report = run_daemon(engine, events_runtime, config, shutdown_signal()).await;
    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(EXIT_SUCCESS)
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received Ctrl-C"),
        () = terminate => info!("received SIGTERM"),
    }
}
