use super::{json_pretty, resolve_configuration_id, CommandError, EXIT_SUCCESS};
use dockhand_core::Engine;
use std::path::Path;

pub fn save(engine: &Engine, file: &Path, json: bool) -> Result<u8, CommandError> {
    let record = engine.save_configuration_file(file)?;
    if json {
        println!("{}", json_pretty(&record)?);
    } else {
        println!("saved configuration {} ({})", record.id, record.spec.image);
    }
    Ok(EXIT_SUCCESS)
}

pub fn list(engine: &Engine, json: bool) -> Result<u8, CommandError> {
    let records = engine.list_configurations()?;
    if json {
        println!("{}", json_pretty(&records)?);
    } else if records.is_empty() {
        println!("no configurations found");
    } else {
        println!("{:<38} {:<32} {:<6} CREATED", "ID", "IMAGE", "PORTS");
        for record in &records {
            println!(
                "{:<38} {:<32} {:<6} {}",
                record.id,
                record.spec.image.reference(),
                record.spec.port_mappings.len(),
                record.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    Ok(EXIT_SUCCESS)
}

pub fn show(engine: &Engine, id: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_configuration_id(engine, id)?;
    let record = engine.get_configuration(&id)?;
    if json {
        println!("{}", json_pretty(&record)?);
        return Ok(EXIT_SUCCESS);
    }

    let spec = &record.spec;
    println!("id:         {}", record.id);
    println!("image:      {}", spec.image);
    if let Some(command) = &spec.command {
        println!("command:    {}", command.join(" "));
    }
    for (host, container) in &spec.port_mappings {
        println!("port:       {host} -> {container}");
    }
    for entry in spec.env_list() {
        println!("env:        {entry}");
    }
    for mount in &spec.volume_mounts {
        let mode = if mount.read_only { "ro" } else { "rw" };
        println!(
            "volume:     {} -> {} ({mode})",
            mount.host_path, mount.container_path
        );
    }
    if let Some(bytes) = spec.resource_limits.memory_bytes {
        println!("memory:     {bytes} bytes");
    }
    if let Some(cores) = spec.resource_limits.cpu_cores {
        println!("cpus:       {cores}");
    }
    println!("created_at: {}", record.created_at);
    Ok(EXIT_SUCCESS)
}

pub fn delete(engine: &Engine, id: &str, json: bool) -> Result<u8, CommandError> {
    let id = resolve_configuration_id(engine, id)?;
    engine.delete_configuration(&id)?;
    if json {
        let payload = serde_json::json!({ "id": id, "deleted": true });
        println!("{}", json_pretty(&payload)?);
    } else {
        println!("deleted configuration {id}");
    }
    Ok(EXIT_SUCCESS)
}
