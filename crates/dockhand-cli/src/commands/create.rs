use super::{json_pretty, resolve_configuration_id, with_spinner, CommandError, EXIT_SUCCESS};
use dockhand_core::Engine;

pub async fn run(engine: &Engine, configuration: &str, json: bool) -> Result<u8, CommandError> {
    let configuration_id = resolve_configuration_id(engine, configuration)?;
    let instance = with_spinner(
        json,
        "creating container...",
        "container created",
        "create failed",
        engine.create_from_configuration(&configuration_id),
    )
    .await?;

    if json {
        println!("{}", json_pretty(&instance)?);
    } else {
        println!("created instance {}", instance.id);
        if let Some(runtime_id) = instance.runtime_id() {
            println!("container: {}", runtime_id.short());
        }
    }
    Ok(EXIT_SUCCESS)
}
