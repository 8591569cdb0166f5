use super::{
    colorize_status, json_pretty, resolve_instance_id, with_spinner, CommandError, EXIT_SUCCESS,
};
use dockhand_core::Engine;

pub async fn run(engine: &Engine, instance: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_instance_id(engine, instance)?;
    let started = with_spinner(
        json,
        "starting container...",
        "container started",
        "start failed",
        engine.start(&id),
    )
    .await?;

    if json {
        println!("{}", json_pretty(&started)?);
    } else {
        println!("instance {id} is {}", colorize_status(started.status));
    }
    Ok(EXIT_SUCCESS)
}
