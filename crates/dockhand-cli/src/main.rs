mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{CommandError, EXIT_FAILURE};
use dockhand_core::{DaemonConfig, Engine};
use dockhand_runtime::{select_backend, RuntimeBackend};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

const DEFAULT_STORE: &str = "~/.local/share/dockhand";

#[derive(Debug, Parser)]
#[command(
    name = "dockhand",
    version,
    about = "Container lifecycle control plane with startup reconciliation"
)]
struct Cli {
    /// Path to the Dockhand store directory (also DOCKHAND_STORE).
    #[arg(long, global = true)]
    store: Option<String>,

    /// Daemon configuration file (TOML).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Runtime adapter to use: docker or mock. Overrides the config file.
    #[arg(long, global = true)]
    runtime: Option<String>,

    /// Docker endpoint, e.g. unix:///var/run/docker.sock or tcp://host:2375.
    #[arg(long, global = true)]
    docker_host: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile, then follow runtime events until interrupted.
    Daemon,
    /// Run one reconciliation pass and exit.
    Reconcile,
    /// Manage saved container configurations.
    #[command(subcommand)]
    Config(ConfigCommands),
    /// Create a container instance from a saved configuration.
    Create {
        /// Configuration ID (full or unique prefix).
        configuration: String,
    },
    /// Start an instance.
    Start {
        /// Instance ID (full or unique prefix).
        instance: String,
    },
    /// Stop an instance.
    Stop {
        /// Instance ID (full or unique prefix).
        instance: String,
    },
    /// Remove an instance's container and its record.
    Delete {
        /// Instance ID (full or unique prefix).
        instance: String,
    },
    /// Show an instance record.
    Get {
        /// Instance ID (full or unique prefix).
        instance: String,
    },
    /// List all instances.
    List,
    /// Show an instance together with the runtime's current view of it.
    Inspect {
        /// Instance ID (full or unique prefix).
        instance: String,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigCommands {
    /// Save a configuration from a TOML file.
    Save {
        /// Path to the configuration file.
        #[arg(default_value = "dockhand.toml")]
        file: PathBuf,
    },
    /// List saved configurations.
    List,
    /// Show a saved configuration.
    Show {
        /// Configuration ID (full or unique prefix).
        id: String,
    },
    /// Delete a configuration no instance references.
    Delete {
        /// Configuration ID (full or unique prefix).
        id: String,
    },
}

/// The adapters a command runs against: one for control calls and, for the
/// daemon, one without a response timeout for the event feed.
struct Runtimes {
    control: Arc<dyn RuntimeBackend>,
    events: Arc<dyn RuntimeBackend>,
}

fn connect(config: &DaemonConfig, store_path: &Path) -> Result<Runtimes, CommandError> {
    let mock_state = (config.runtime == "mock").then(|| store_path.join("mock-runtime.json"));
    let control = select_backend(
        &config.runtime,
        &config.control_connection(mock_state.clone()),
    )
    .map_err(CommandError::runtime)?;
    // The mock's event feed lives in-process, so both roles share one adapter.
    let events = if config.runtime == "mock" {
        Arc::clone(&control)
    } else {
        select_backend(&config.runtime, &config.event_connection(mock_state))
            .map_err(CommandError::runtime)?
    };
    Ok(Runtimes { control, events })
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else if matches!(cli.command, Commands::Daemon) {
        "info"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DOCKHAND_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    if let Commands::Completions { shell } = cli.command {
        return finish(commands::completions::run::<Cli>(shell));
    }

    let tokio_rt = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("error: failed to start async runtime: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };
    finish(tokio_rt.block_on(run(cli)))
}

async fn run(cli: Cli) -> Result<u8, CommandError> {
    let mut config = DaemonConfig::load(cli.config.as_deref())?;
    if let Some(runtime) = cli.runtime {
        config.runtime = runtime;
    }
    if cli.docker_host.is_some() {
        config.docker_host = cli.docker_host;
    }
    config.validate()?;

    let store_path = resolve_store(cli.store.as_deref(), &config);
    let runtimes = connect(&config, &store_path)?;
    let engine = Engine::new(&store_path, runtimes.control)?;
    let json = cli.json;

    match cli.command {
        Commands::Daemon => commands::daemon::run(&engine, runtimes.events, &config, json).await,
        Commands::Reconcile => commands::reconcile::run(&engine, json).await,
        Commands::Config(cmd) => match cmd {
            ConfigCommands::Save { file } => commands::config::save(&engine, &file, json),
            ConfigCommands::List => commands::config::list(&engine, json),
            ConfigCommands::Show { id } => commands::config::show(&engine, &id, json),
            ConfigCommands::Delete { id } => commands::config::delete(&engine, &id, json),
        },
        Commands::Create { configuration } => {
            commands::create::run(&engine, &configuration, json).await
        }
        Commands::Start { instance } => commands::start::run(&engine, &instance, json).await,
        Commands::Stop { instance } => commands::stop::run(&engine, &instance, json).await,
        Commands::Delete { instance } => commands::delete::run(&engine, &instance, json).await,
        Commands::Get { instance } => commands::get::run(&engine, &instance, json),
        Commands::List => commands::list::run(&engine, json),
        Commands::Inspect { instance } => commands::inspect::run(&engine, &instance, json).await,
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    }
}

fn finish(result: Result<u8, CommandError>) -> ExitCode {
    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}

/// `--store`, then `DOCKHAND_STORE`, then the config file, then the default.
fn resolve_store(flag: Option<&str>, config: &DaemonConfig) -> PathBuf {
    if let Some(path) = flag {
        return expand_tilde(path);
    }
    if let Ok(path) = std::env::var("DOCKHAND_STORE") {
        if !path.is_empty() {
            return expand_tilde(&path);
        }
    }
    if let Some(path) = &config.store_root {
        return path.clone();
    }
    expand_tilde(DEFAULT_STORE)
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
