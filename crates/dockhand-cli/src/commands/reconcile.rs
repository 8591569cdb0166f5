use super::{json_pretty, CommandError, EXIT_FAILURE, EXIT_RUNTIME_ERROR, EXIT_SUCCESS};
use dockhand_core::{Engine, ReconcileReport};

pub async fn run(engine: &Engine, json: bool) -> Result<u8, CommandError> {
    let report = engine.reconciler().run().await;
    if json {
        println!("{}", json_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(exit_code(&report))
}

pub fn print_report(report: &ReconcileReport) {
    if report.runtime_unavailable {
        println!("runtime unavailable; nothing reconciled");
    } else {
        println!(
            "reconciled {} instances, {} updated",
            report.examined, report.updated
        );
    }
    for error in &report.errors {
        eprintln!("  {error}");
    }
}

pub fn exit_code(report: &ReconcileReport) -> u8 {
    if report.runtime_unavailable {
        EXIT_RUNTIME_ERROR
    } else if report.errors.is_empty() {
        EXIT_SUCCESS
    } else {
        EXIT_FAILURE
    }
}
