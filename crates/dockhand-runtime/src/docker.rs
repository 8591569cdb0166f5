use crate::backend::{
    ContainerSummary, EventStream, ObservedState, RuntimeBackend, RuntimeConnection, RuntimeEvent,
};
use crate::RuntimeError;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerState, EventMessage, HostConfig, PortBinding};
use bollard::system::EventsOptions;
use bollard::{Docker, API_DEFAULT_VERSION};
use dockhand_schema::{ContainerSpec, ImageRef, RuntimeId};
use futures::{StreamExt, TryStreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, info, warn};

/// Stand-in for "no timeout" on connections that must never time out.
const UNBOUNDED_TIMEOUT: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Request timeout applied to every call made through an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Short control round-trips.
    Bounded(Duration),
    /// Long-lived reads such as the event feed.
    Unbounded,
}

impl TimeoutPolicy {
    pub fn as_duration(self) -> Duration {
        match self {
            TimeoutPolicy::Bounded(d) => d,
            TimeoutPolicy::Unbounded => UNBOUNDED_TIMEOUT,
        }
    }
}

/// Adapter over the Docker Engine API.
///
/// One value owns one client. The control plane builds two: a bounded one for
/// lifecycle calls and an unbounded one for the event feed, so a stalled call
/// on either side cannot block the other.
pub struct DockerBackend {
    docker: Docker,
    permits: Semaphore,
    timeout: TimeoutPolicy,
}

impl DockerBackend {
    pub fn connect(connection: &RuntimeConnection) -> Result<Self, RuntimeError> {
        let timeout = connection.timeout.as_duration();
        let secs = timeout.as_secs();

        let docker = match connection.docker_host.as_deref() {
            None => Docker::connect_with_local_defaults(),
            Some(host) if host.starts_with("unix://") => Docker::connect_with_socket(
                host.trim_start_matches("unix://"),
                secs,
                API_DEFAULT_VERSION,
            ),
            Some(host) if host.starts_with("tcp://") => Docker::connect_with_http(
                &host.replacen("tcp://", "http://", 1),
                secs,
                API_DEFAULT_VERSION,
            ),
            Some(host) if host.starts_with("http://") => {
                Docker::connect_with_http(host, secs, API_DEFAULT_VERSION)
            }
            Some(host) => {
                return Err(RuntimeError::Unavailable(format!(
                    "unsupported docker host '{host}'"
                )))
            }
        }
        .map_err(|e| RuntimeError::Unavailable(format!("docker: {e}")))?
        .with_timeout(timeout);

        debug!(
            "docker client ready ({:?}, {} concurrent requests)",
            connection.timeout, connection.max_connections
        );

        Ok(Self {
            docker,
            permits: Semaphore::new(connection.max_connections.max(1)),
            timeout: connection.timeout,
        })
    }

    pub fn timeout_policy(&self) -> TimeoutPolicy {
        self.timeout
    }

    async fn permit(&self) -> Result<SemaphorePermit<'_>, RuntimeError> {
        self.permits
            .acquire()
            .await
            .map_err(|_| RuntimeError::Unavailable("docker connection pool closed".to_owned()))
    }

    /// Pull `image` unless it is already present locally.
    async fn ensure_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        let reference = image.reference();
        let inspected = {
            let _permit = self.permit().await?;
            self.docker.inspect_image(&reference).await
        };
        match inspected {
            Ok(_) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                info!("image {reference} not present locally, pulling");
                self.pull_image(image).await
            }
            Err(e) => Err(normalize_error(e, &reference)),
        }
    }
}

#[async_trait]
impl RuntimeBackend for DockerBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        let reference = image.reference();
        let _permit = self.permit().await?;
        let options = CreateImageOptions {
            from_image: image.name.clone(),
            tag: image.tag.clone(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_for_each(|progress| {
                if let Some(status) = progress.status {
                    debug!("pull {reference}: {status}");
                }
                futures::future::ok(())
            })
            .await
            .map_err(|e| match normalize_error(e, &reference) {
                RuntimeError::NotFound(msg) => RuntimeError::ImageNotFound(msg),
                other => other,
            })?;
        info!("pulled image {reference}");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<RuntimeId, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let _permit = self.permit().await?;
        let response = self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, container_config(spec))
            .await
            .map_err(|e| normalize_error(e, &spec.image.reference()))?;
        for warning in &response.warnings {
            warn!("create {}: {warning}", spec.image);
        }
        Ok(RuntimeId::new(response.id))
    }

    async fn start_container(&self, id: &RuntimeId) -> Result<(), RuntimeError> {
        let _permit = self.permit().await?;
        match self.docker.start_container::<String>(id, None).await {
            Ok(())
            | Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(normalize_error(e, id)),
        }
    }

    async fn stop_container(&self, id: &RuntimeId) -> Result<(), RuntimeError> {
        let _permit = self.permit().await?;
        match self
            .docker
            .stop_container(id, None::<StopContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!("container {} already stopped", id.short());
                Ok(())
            }
            Err(e) => Err(normalize_error(e, id)),
        }
    }

    async fn delete_container(&self, id: &RuntimeId) -> Result<(), RuntimeError> {
        match self.stop_container(id).await {
            Ok(()) => {}
            Err(RuntimeError::NotFound(_)) => {
                debug!("container {} already removed", id.short());
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let _permit = self.permit().await?;
        match self
            .docker
            .remove_container(id, None::<RemoveContainerOptions>)
            .await
        {
            Ok(())
            | Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(normalize_error(e, id)),
        }
    }

    async fn inspect_container(
        &self,
        id: &RuntimeId,
    ) -> Result<Option<ObservedState>, RuntimeError> {
        let _permit = self.permit().await?;
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => Ok(Some(observed_state(response.state))),
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(normalize_error(e, id)),
        }
    }

    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        let _permit = self.permit().await?;
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| normalize_error(e, "container list"))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| {
                Some(ContainerSummary {
                    id: RuntimeId::new(c.id.filter(|id| !id.is_empty())?),
                    state: c.state.unwrap_or_default(),
                    status: c.status.unwrap_or_default(),
                })
            })
            .collect())
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("type".to_owned(), vec!["container".to_owned()]);
        filters.insert("event".to_owned(), vec!["stop".to_owned(), "die".to_owned()]);
        let options = EventsOptions::<String> {
            filters,
            ..Default::default()
        };

        let stream = self
            .docker
            .events(Some(options))
            .map(|item| {
                item.map(runtime_event)
                    .map_err(|e| normalize_error(e, "event stream"))
            })
            .boxed();
        Ok(stream)
    }
}

/// Translate a spec into Docker's create payload.
///
/// Port mappings become `<container>/tcp` exposures with host bindings, volume
/// mounts become `host:container:ro|rw` binds, and the CPU ceiling is expressed
/// as nano-CPUs.
pub(crate) fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut exposed_ports: HashMap<String, HashMap<(), ()>> = HashMap::new();
    let mut bindings: HashMap<String, Vec<PortBinding>> = HashMap::new();
    for (host, container) in &spec.port_mappings {
        let key = format!("{container}/tcp");
        exposed_ports.insert(key.clone(), HashMap::new());
        bindings.entry(key).or_default().push(PortBinding {
            host_ip: None,
            host_port: Some(host.to_string()),
        });
    }

    let binds: Vec<String> = spec
        .volume_mounts
        .iter()
        .map(|v| {
            let mode = if v.read_only { "ro" } else { "rw" };
            format!("{}:{}:{mode}", v.host_path, v.container_path)
        })
        .collect();

    let env = spec.env_list();

    let host_config = HostConfig {
        port_bindings: (!bindings.is_empty()).then(|| {
            bindings
                .into_iter()
                .map(|(k, v)| (k, Some(v)))
                .collect()
        }),
        binds: (!binds.is_empty()).then_some(binds),
        memory: spec.resource_limits.memory_bytes,
        nano_cpus: spec.resource_limits.nano_cpus(),
        ..Default::default()
    };

    Config {
        image: Some(spec.image.reference()),
        cmd: spec.command.clone(),
        env: (!env.is_empty()).then_some(env),
        exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
        host_config: Some(host_config),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    }
}

fn observed_state(state: Option<ContainerState>) -> ObservedState {
    let Some(state) = state else {
        return ObservedState::default();
    };
    ObservedState {
        status: state
            .status
            .map(|s| s.to_string().to_lowercase())
            .unwrap_or_default(),
        running: state.running.unwrap_or(false),
        paused: state.paused.unwrap_or(false),
        dead: state.dead.unwrap_or(false),
        oom_killed: state.oom_killed.unwrap_or(false),
        exit_code: state.exit_code,
    }
}

fn runtime_event(message: EventMessage) -> RuntimeEvent {
    let (actor_id, attributes) = match message.actor {
        Some(actor) => (
            actor.id.filter(|id| !id.is_empty()).map(RuntimeId::new),
            actor.attributes.unwrap_or_default(),
        ),
        None => (None, HashMap::new()),
    };
    RuntimeEvent {
        kind: message
            .typ
            .map(|t| t.to_string().to_lowercase())
            .unwrap_or_default(),
        action: message.action.unwrap_or_default(),
        actor_id,
        attributes,
    }
}

/// Map a bollard failure onto the adapter taxonomy.
fn normalize_error(err: BollardError, subject: &str) -> RuntimeError {
    let message = format!("{subject}: {err}");
    match &err {
        BollardError::DockerResponseServerError { status_code, .. } => match *status_code {
            404 => RuntimeError::NotFound(message),
            409 => RuntimeError::Conflict(message),
            502..=504 => RuntimeError::Transient(message),
            _ => RuntimeError::Failed(message),
        },
        BollardError::RequestTimeoutError
        | BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. } => RuntimeError::Transient(message),
        BollardError::SocketNotFoundError(_) => RuntimeError::Unavailable(message),
        _ => RuntimeError::Failed(message),
    }
}
