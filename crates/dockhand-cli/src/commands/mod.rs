pub mod completions;
pub mod config;
pub mod create;
pub mod daemon;
pub mod delete;
pub mod get;
pub mod inspect;
pub mod list;
pub mod reconcile;
pub mod start;
pub mod stop;

use dockhand_core::{CoreError, Engine, ErrorKind};
use dockhand_runtime::RuntimeError;
use dockhand_store::InstanceStatus;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

pub const EXIT_SUCCESS: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_INVALID: u8 = 2;
pub const EXIT_STORE_ERROR: u8 = 3;
pub const EXIT_NOT_FOUND: u8 = 4;
pub const EXIT_CONFLICT: u8 = 5;
pub const EXIT_RUNTIME_ERROR: u8 = 6;

/// A failed command: what to print and which exit code to return.
#[derive(Debug)]
pub struct CommandError {
    pub code: u8,
    pub message: String,
}

impl CommandError {
    pub fn new(code: u8, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn runtime(err: RuntimeError) -> Self {
        CoreError::from(err).into()
    }
}

impl From<CoreError> for CommandError {
    fn from(err: CoreError) -> Self {
        let code = match err.kind() {
            ErrorKind::NotFound => EXIT_NOT_FOUND,
            ErrorKind::Conflict => EXIT_CONFLICT,
            ErrorKind::Transient => EXIT_RUNTIME_ERROR,
            ErrorKind::Integrity => EXIT_STORE_ERROR,
            ErrorKind::Invalid => EXIT_INVALID,
            ErrorKind::Internal => EXIT_FAILURE,
        };
        Self::new(code, err.to_string())
    }
}

pub fn json_pretty(value: &impl serde::Serialize) -> Result<String, CommandError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| CommandError::new(EXIT_FAILURE, format!("JSON serialization failed: {e}")))
}

pub fn spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
        pb.set_style(style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]));
    }
    pb.set_message(msg.to_owned());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

pub fn spin_ok(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("✓ {msg}"));
}

pub fn spin_fail(pb: &ProgressBar, msg: &str) {
    if let Ok(style) = ProgressStyle::with_template("{msg}") {
        pb.set_style(style);
    }
    pb.finish_with_message(format!("✗ {msg}"));
}

/// Show a spinner around `fut` unless output is JSON.
pub async fn with_spinner<T, F>(
    json: bool,
    msg: &str,
    ok: &str,
    fail: &str,
    fut: F,
) -> Result<T, CoreError>
where
    F: std::future::Future<Output = Result<T, CoreError>>,
{
    if json {
        return fut.await;
    }
    let pb = spinner(msg);
    let result = fut.await;
    match &result {
        Ok(_) => spin_ok(&pb, ok),
        Err(_) => spin_fail(&pb, fail),
    }
    result
}

pub fn colorize_status(status: InstanceStatus) -> String {
    use console::Style;
    let text = status.to_string();
    match status {
        InstanceStatus::Running => Style::new().cyan().bold().apply_to(text).to_string(),
        InstanceStatus::Stopped => Style::new().dim().apply_to(text).to_string(),
        InstanceStatus::Created => Style::new().yellow().apply_to(text).to_string(),
        InstanceStatus::Failed => Style::new().red().bold().apply_to(text).to_string(),
    }
}

fn resolve_prefix<'a>(
    kind: &str,
    input: &str,
    ids: impl Iterator<Item = &'a str>,
) -> Result<String, CommandError> {
    let mut matches = Vec::new();
    for id in ids {
        if id == input {
            return Ok(id.to_owned());
        }
        if id.starts_with(input) {
            matches.push(id);
        }
    }
    match matches.as_slice() {
        // Let the engine report the miss in its own terms.
        [] => Ok(input.to_owned()),
        [one] => Ok((*one).to_owned()),
        many => Err(CommandError::new(
            EXIT_FAILURE,
            format!(
                "ambiguous {kind} prefix '{input}': matches {} {kind}s",
                many.len()
            ),
        )),
    }
}

/// Full instance id for an id or unique id prefix.
pub fn resolve_instance_id(engine: &Engine, input: &str) -> Result<String, CommandError> {
    let instances = engine.list()?;
    resolve_prefix("instance", input, instances.iter().map(|i| i.id.as_str()))
}

/// Full configuration id for an id or unique id prefix.
pub fn resolve_configuration_id(engine: &Engine, input: &str) -> Result<String, CommandError> {
    let configurations = engine.list_configurations()?;
    resolve_prefix(
        "configuration",
        input,
        configurations.iter().map(|c| c.id.as_str()),
    )
}
