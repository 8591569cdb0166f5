use super::{json_pretty, resolve_instance_id, with_spinner, CommandError, EXIT_SUCCESS};
use dockhand_core::Engine;

pub async fn run(engine: &Engine, instance: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_instance_id(engine, instance)?;
    with_spinner(
        json,
        "removing container...",
        "container removed",
        "delete failed",
        engine.delete(&id),
    )
    .await?;

    if json {
        let payload = serde_json::json!({ "id": id, "deleted": true });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("deleted instance {id}");
    }
    Ok(EXIT_SUCCESS)
}
