use crate::docker::{DockerBackend, TimeoutPolicy};
use crate::mock::MockBackend;
use crate::RuntimeError;
use async_trait::async_trait;
use dockhand_schema::{ContainerSpec, ImageRef, RuntimeId};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// One row of the runtime's container listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContainerSummary {
    pub id: RuntimeId,
    /// Machine state, e.g. `running`, `exited`, `created`, `paused`.
    pub state: String,
    /// Human status line, e.g. `Up 3 minutes` or `Exited (0) 2 seconds ago`.
    pub status: String,
}

/// The runtime's detailed report of one container.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObservedState {
    pub status: String,
    pub running: bool,
    pub paused: bool,
    pub dead: bool,
    pub oom_killed: bool,
    pub exit_code: Option<i64>,
}

/// A lifecycle event from the runtime's global feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeEvent {
    /// Object type, `container` for container lifecycle events.
    pub kind: String,
    pub action: String,
    pub actor_id: Option<RuntimeId>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl RuntimeEvent {
    pub fn container(action: impl Into<String>, actor_id: impl Into<RuntimeId>) -> Self {
        Self {
            kind: "container".to_owned(),
            action: action.into(),
            actor_id: Some(actor_id.into()),
            attributes: HashMap::new(),
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

/// Open-ended event feed. An `Err` item or the end of the stream means the
/// subscription is lost.
pub type EventStream = BoxStream<'static, Result<RuntimeEvent, RuntimeError>>;

/// Control and observation surface of a container runtime.
///
/// Every method is a network round-trip for real adapters. Implementations
/// normalize their native failures into [`RuntimeError`] so callers never see
/// transport details.
#[async_trait]
pub trait RuntimeBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch `image` from its registry. Fails with `ImageNotFound` if the
    /// reference does not exist remotely.
    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError>;

    /// Create (but do not start) a container, pulling the image first if it is
    /// not present locally.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<RuntimeId, RuntimeError>;

    async fn start_container(&self, id: &RuntimeId) -> Result<(), RuntimeError>;

    /// Stop a container. Stopping an already stopped container succeeds.
    async fn stop_container(&self, id: &RuntimeId) -> Result<(), RuntimeError>;

    /// Stop then remove a container. "Already stopped" and "already removed"
    /// both count as success.
    async fn delete_container(&self, id: &RuntimeId) -> Result<(), RuntimeError>;

    /// `Ok(None)` when the runtime has no record of the container.
    async fn inspect_container(&self, id: &RuntimeId)
        -> Result<Option<ObservedState>, RuntimeError>;

    /// Every container the runtime knows, stopped ones included.
    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError>;

    async fn container_exists(&self, id: &RuntimeId) -> Result<bool, RuntimeError> {
        Ok(self.inspect_container(id).await?.is_some())
    }

    /// Subscribe to container lifecycle events.
    async fn events(&self) -> Result<EventStream, RuntimeError>;
}

/// How to reach the runtime daemon.
#[derive(Debug, Clone)]
pub struct RuntimeConnection {
    /// `unix://` or `tcp://` endpoint. `None` uses the local defaults
    /// (including `DOCKER_HOST`).
    pub docker_host: Option<String>,
    pub timeout: TimeoutPolicy,
    /// Upper bound on concurrent control requests.
    pub max_connections: usize,
    /// File the mock runtime persists its containers to.
    pub mock_state: Option<PathBuf>,
}

impl Default for RuntimeConnection {
    fn default() -> Self {
        Self {
            docker_host: None,
            timeout: TimeoutPolicy::Bounded(Duration::from_secs(30)),
            max_connections: 100,
            mock_state: None,
        }
    }
}

impl RuntimeConnection {
    /// The same endpoint with a different timeout policy.
    #[must_use]
    pub fn with_timeout(&self, timeout: TimeoutPolicy) -> Self {
        Self {
            timeout,
            ..self.clone()
        }
    }
}

/// Build the adapter named `name` (`docker` or `mock`).
///
/// The mock keeps its state under `connection.mock_state` when set so that
/// separate processes observe the same containers.
pub fn select_backend(
    name: &str,
    connection: &RuntimeConnection,
) -> Result<Arc<dyn RuntimeBackend>, RuntimeError> {
    match name {
        "docker" => Ok(Arc::new(DockerBackend::connect(connection)?)),
        "mock" => match &connection.mock_state {
            Some(path) => Ok(Arc::new(MockBackend::persistent(path)?)),
            None => Ok(Arc::new(MockBackend::new())),
        },
        other => Err(RuntimeError::Unavailable(other.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_mock_backend() {
        let backend = select_backend("mock", &RuntimeConnection::default()).unwrap();
        assert_eq!(backend.name(), "mock");
    }

    #[test]
    fn select_invalid_backend_fails() {
        assert!(matches!(
            select_backend("podman", &RuntimeConnection::default()),
            Err(RuntimeError::Unavailable(_))
        ));
    }

    #[test]
    fn container_event_builder() {
        let event = RuntimeEvent::container("die", "abc").with_attribute("exitCode", "137");
        assert_eq!(event.kind, "container");
        assert_eq!(event.actor_id.as_deref(), Some("abc"));
        assert_eq!(event.attribute("exitCode"), Some("137"));
        assert_eq!(event.attribute("signal"), None);
    }
}
