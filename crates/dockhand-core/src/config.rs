use crate::CoreError;
use dockhand_runtime::{RuntimeConnection, TimeoutPolicy};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Daemon settings, read from a TOML file. Every field has a default.
///
/// ```toml
/// runtime = "docker"
/// docker_host = "unix:///var/run/docker.sock"
/// control_timeout_secs = 30
/// max_connections = 100
/// event_backoff_secs = 5
/// reconcile_interval_secs = 300
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Runtime adapter: `docker` or `mock`.
    pub runtime: String,
    pub docker_host: Option<String>,
    /// Store root. Command-line and environment settings take precedence.
    pub store_root: Option<PathBuf>,
    /// Bound on every control round-trip (create, start, stop, inspect, list).
    pub control_timeout_secs: u64,
    pub max_connections: usize,
    /// Delay before resubscribing after the event feed is lost.
    pub event_backoff_secs: u64,
    /// Periodic reconciliation while the daemon runs. Off when unset.
    pub reconcile_interval_secs: Option<u64>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            runtime: "docker".to_owned(),
            docker_host: None,
            store_root: None,
            control_timeout_secs: 30,
            max_connections: 100,
            event_backoff_secs: 5,
            reconcile_interval_secs: None,
        }
    }
}

impl DaemonConfig {
    /// Load from `path`, or defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, CoreError> {
        match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Self::from_toml_str(&content)
                    .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))
            }
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self, CoreError> {
        let config: Self = toml::from_str(input).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        if !matches!(self.runtime.as_str(), "docker" | "mock") {
            return Err(CoreError::Config(format!(
                "unknown runtime '{}' (expected docker or mock)",
                self.runtime
            )));
        }
        if self.control_timeout_secs == 0 {
            return Err(CoreError::Config(
                "control_timeout_secs must be positive".to_owned(),
            ));
        }
        if self.max_connections == 0 {
            return Err(CoreError::Config(
                "max_connections must be positive".to_owned(),
            ));
        }
        if self.event_backoff_secs == 0 {
            return Err(CoreError::Config(
                "event_backoff_secs must be positive".to_owned(),
            ));
        }
        if self.reconcile_interval_secs == Some(0) {
            return Err(CoreError::Config(
                "reconcile_interval_secs must be positive when set".to_owned(),
            ));
        }
        Ok(())
    }

    /// Connection for control calls, bounded by `control_timeout_secs`.
    pub fn control_connection(&self, mock_state: Option<PathBuf>) -> RuntimeConnection {
        RuntimeConnection {
            docker_host: self.docker_host.clone(),
            timeout: TimeoutPolicy::Bounded(Duration::from_secs(self.control_timeout_secs)),
            max_connections: self.max_connections,
            mock_state,
        }
    }

    /// Connection for the event feed. The feed is open-ended, so it is never
    /// subject to a response timeout.
    pub fn event_connection(&self, mock_state: Option<PathBuf>) -> RuntimeConnection {
        self.control_connection(mock_state)
            .with_timeout(TimeoutPolicy::Unbounded)
    }

    pub fn event_backoff(&self) -> Duration {
        Duration::from_secs(self.event_backoff_secs)
    }

    pub fn reconcile_interval(&self) -> Option<Duration> {
        self.reconcile_interval_secs.map(Duration::from_secs)
    }
}
