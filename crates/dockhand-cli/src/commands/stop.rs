use super::{
    colorize_status, json_pretty, resolve_instance_id, with_spinner, CommandError, EXIT_SUCCESS,
};
use dockhand_core::Engine;

pub async fn run(engine: &Engine, instance: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_instance_id(engine, instance)?;
    let stopped = with_spinner(
        json,
        "stopping container...",
        "container stopped",
        "stop failed",
        engine.stop(&id),
    )
    .await?;

    if json {
        println!("{}", json_pretty(&stopped)?);
    } else {
        println!("instance {id} is {}", colorize_status(stopped.status));
    }
    Ok(EXIT_SUCCESS)
}
