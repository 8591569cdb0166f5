use super::{colorize_status, json_pretty, CommandError, EXIT_SUCCESS};
use dockhand_core::Engine;

pub fn run(engine: &Engine, json: bool) -> Result<u8, CommandError> {
    let instances = engine.list()?;
    if json {
        println!("{}", json_pretty(&instances)?);
    } else if instances.is_empty() {
        println!("no instances found");
    } else {
        println!("{:<38} {:<14} {:<10} CONFIGURATION", "ID", "CONTAINER", "STATUS");
        for inst in &instances {
            let container = inst.runtime_id().map_or("-", |r| r.short());
            // Pad before coloring; escape codes would count toward the width.
            let status = format!("{:<10}", inst.status.to_string());
            let status = status.replacen(
                &inst.status.to_string(),
                &colorize_status(inst.status),
                1,
            );
            println!(
                "{:<38} {:<14} {} {}",
                inst.id, container, status, inst.configuration_id
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
