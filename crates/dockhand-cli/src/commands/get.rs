use super::{colorize_status, json_pretty, resolve_instance_id, CommandError, EXIT_SUCCESS};
use dockhand_core::Engine;

pub fn run(engine: &Engine, instance: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_instance_id(engine, instance)?;
    let inst = engine.get(&id)?;
    if json {
        println!("{}", json_pretty(&inst)?);
    } else {
        println!("id:             {}", inst.id);
        println!("configuration:  {}", inst.configuration_id);
        println!(
            "container:      {}",
            inst.runtime_id().map_or("(none)", |r| r.as_str())
        );
        println!("status:         {}", colorize_status(inst.status));
        println!("created_at:     {}", inst.created_at);
        match inst.started_at {
            Some(at) => println!("started_at:     {at}"),
            None => println!("started_at:     (never)"),
        }
        println!("updated_at:     {}", inst.updated_at);
        println!("revision:       {}", inst.revision);
    }
    Ok(EXIT_SUCCESS)
}
