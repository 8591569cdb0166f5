use super::{colorize_status, json_pretty, resolve_instance_id, CommandError, EXIT_SUCCESS};
use dockhand_core::Engine;

pub async fn run(engine: &Engine, instance: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_instance_id(engine, instance)?;
    let inspection = engine.inspect(&id).await?;
    if json {
        println!("{}", json_pretty(&inspection)?);
        return Ok(EXIT_SUCCESS);
    }

    let inst = &inspection.instance;
    println!("id:        {}", inst.id);
    println!(
        "container: {}",
        inst.runtime_id().map_or("(none)", |r| r.as_str())
    );
    println!("recorded:  {}", colorize_status(inst.status));
    println!("observed:  {}", colorize_status(inspection.observed_status));
    match &inspection.observed {
        Some(observed) => {
            println!("state:     {}", observed.status);
            if let Some(code) = observed.exit_code {
                println!("exit code: {code}");
            }
            if observed.oom_killed {
                println!("oom killed");
            }
        }
        None => println!("state:     (no container)"),
    }
    if inst.status != inspection.observed_status {
        println!("note:      recorded status differs; run `dockhand reconcile` to correct it");
    }
    Ok(EXIT_SUCCESS)
}
