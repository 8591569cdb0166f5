use crate::backend::{ContainerSummary, EventStream, ObservedState, RuntimeBackend, RuntimeEvent};
use crate::RuntimeError;
use async_trait::async_trait;
use dockhand_schema::{ContainerSpec, ImageRef, RuntimeId};
use futures::channel::mpsc;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MockContainerState {
    Created,
    Running,
    Paused,
    Exited,
    Dead,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MockContainer {
    image: String,
    state: MockContainerState,
    exit_code: Option<i64>,
    #[serde(default)]
    oom_killed: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    local_images: BTreeSet<String>,
    /// References the "registry" does not have.
    unknown_images: BTreeSet<String>,
}

type EventSender = mpsc::UnboundedSender<Result<RuntimeEvent, RuntimeError>>;
type StopHook = Arc<dyn Fn(&RuntimeId) + Send + Sync>;

/// In-memory runtime.
///
/// Containers follow Docker's observable behaviour closely enough for the
/// control plane to be exercised end to end: stop is idempotent, delete
/// tolerates missing containers, and paused containers report both running
/// and paused. Test hooks inject events, drop or refuse subscriptions, and
/// fail individual calls. With [`persistent`](Self::persistent) the container
/// table survives across processes.
pub struct MockBackend {
    state: Mutex<MockState>,
    state_file: Option<PathBuf>,
    calls: Mutex<Vec<String>>,
    subscribers: Mutex<Vec<EventSender>>,
    refused_subscriptions: AtomicUsize,
    failing_inspects: Mutex<HashSet<String>>,
    unavailable: AtomicBool,
    stop_hook: Mutex<Option<StopHook>>,
}

fn guard<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Default for MockBackend {
    fn default() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
            state_file: None,
            calls: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
            refused_subscriptions: AtomicUsize::new(0),
            failing_inspects: Mutex::new(HashSet::new()),
            unavailable: AtomicBool::new(false),
            stop_hook: Mutex::new(None),
        }
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mock whose container table is loaded from and saved to `path`.
    pub fn persistent(path: &Path) -> Result<Self, RuntimeError> {
        let state = if path.exists() {
            let content = std::fs::read_to_string(path)
                .map_err(|e| RuntimeError::Failed(format!("mock state {}: {e}", path.display())))?;
            serde_json::from_str(&content)
                .map_err(|e| RuntimeError::Failed(format!("mock state {}: {e}", path.display())))?
        } else {
            MockState::default()
        };
        Ok(Self {
            state: Mutex::new(state),
            state_file: Some(path.to_path_buf()),
            ..Self::default()
        })
    }

    fn save(&self, state: &MockState) -> Result<(), RuntimeError> {
        let Some(path) = &self.state_file else {
            return Ok(());
        };
        let content = serde_json::to_string_pretty(state)
            .map_err(|e| RuntimeError::Failed(format!("mock state: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| RuntimeError::Failed(format!("mock state {}: {e}", path.display())))
    }

    fn record(&self, call: String) -> Result<(), RuntimeError> {
        guard(&self.calls).push(call);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(RuntimeError::Unavailable("mock".to_owned()));
        }
        Ok(())
    }

    /// Calls received so far, e.g. `create nginx:latest` or `stop <id>`.
    pub fn calls(&self) -> Vec<String> {
        guard(&self.calls).clone()
    }

    /// Make the registry report `reference` as nonexistent.
    pub fn mark_image_unknown(&self, reference: &str) {
        guard(&self.state).unknown_images.insert(reference.to_owned());
    }

    pub fn has_image(&self, reference: &str) -> bool {
        guard(&self.state).local_images.contains(reference)
    }

    /// Add a container directly, bypassing create.
    pub fn insert_container(&self, image: &str, state: MockContainerState) -> RuntimeId {
        let id = generate_id();
        guard(&self.state).containers.insert(
            id.to_string(),
            MockContainer {
                image: image.to_owned(),
                state,
                exit_code: None,
                oom_killed: false,
            },
        );
        id
    }

    pub fn state_of(&self, id: &str) -> Option<MockContainerState> {
        guard(&self.state).containers.get(id).map(|c| c.state)
    }

    /// Force a container into `state`. Returns `false` if it does not exist.
    pub fn set_state(&self, id: &str, state: MockContainerState, exit_code: Option<i64>) -> bool {
        let mut s = guard(&self.state);
        match s.containers.get_mut(id) {
            Some(c) => {
                c.state = state;
                c.exit_code = exit_code;
                true
            }
            None => false,
        }
    }

    /// Simulate the kernel OOM killer terminating a container.
    pub fn oom_kill(&self, id: &str) -> bool {
        let mut s = guard(&self.state);
        match s.containers.get_mut(id) {
            Some(c) => {
                c.state = MockContainerState::Exited;
                c.exit_code = Some(137);
                c.oom_killed = true;
                true
            }
            None => false,
        }
    }

    /// Make a container vanish, as if removed behind the control plane's back.
    pub fn forget_container(&self, id: &str) -> bool {
        guard(&self.state).containers.remove(id).is_some()
    }

    /// Inspections of `id` fail with a transient error.
    pub fn fail_inspect(&self, id: &str) {
        guard(&self.failing_inspects).insert(id.to_owned());
    }

    /// While set, every call fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// The next `n` calls to `events()` fail.
    pub fn refuse_subscriptions(&self, n: usize) {
        self.refused_subscriptions.store(n, Ordering::SeqCst);
    }

    /// Run `hook` whenever a stop call brings a live container down, after
    /// the container exited and before the call returns. Docker reports the
    /// resulting `die` in that window.
    pub fn on_stop(&self, hook: impl Fn(&RuntimeId) + Send + Sync + 'static) {
        *guard(&self.stop_hook) = Some(Arc::new(hook));
    }

    /// Deliver `event` to every live subscriber. Returns how many received it.
    pub fn emit(&self, event: &RuntimeEvent) -> usize {
        let mut subs = guard(&self.subscribers);
        subs.retain(|tx| tx.unbounded_send(Ok(event.clone())).is_ok());
        subs.len()
    }

    /// End every open event stream.
    pub fn disconnect(&self) {
        guard(&self.subscribers).clear();
    }

    /// Push a transport error into every open event stream.
    pub fn break_streams(&self) {
        let subs = guard(&self.subscribers);
        for tx in subs.iter() {
            let _ = tx.unbounded_send(Err(RuntimeError::Transient(
                "event stream reset".to_owned(),
            )));
        }
    }

    pub fn subscription_count(&self) -> usize {
        let mut subs = guard(&self.subscribers);
        subs.retain(|tx| !tx.is_closed());
        subs.len()
    }

    fn pull_locked(state: &mut MockState, reference: &str) -> Result<(), RuntimeError> {
        if state.unknown_images.contains(reference) {
            return Err(RuntimeError::ImageNotFound(reference.to_owned()));
        }
        state.local_images.insert(reference.to_owned());
        Ok(())
    }
}

fn generate_id() -> RuntimeId {
    RuntimeId::new(format!(
        "{}{}",
        uuid::Uuid::new_v4().simple(),
        uuid::Uuid::new_v4().simple()
    ))
}

fn summary_strings(c: &MockContainer) -> (String, String) {
    match c.state {
        MockContainerState::Created => ("created".to_owned(), "Created".to_owned()),
        MockContainerState::Running => ("running".to_owned(), "Up 1 second".to_owned()),
        MockContainerState::Paused => ("paused".to_owned(), "Up 1 second (Paused)".to_owned()),
        MockContainerState::Exited => (
            "exited".to_owned(),
            format!("Exited ({}) 1 second ago", c.exit_code.unwrap_or(0)),
        ),
        MockContainerState::Dead => ("dead".to_owned(), "Dead".to_owned()),
    }
}

#[async_trait]
impl RuntimeBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn pull_image(&self, image: &ImageRef) -> Result<(), RuntimeError> {
        let reference = image.reference();
        self.record(format!("pull {reference}"))?;
        let mut state = guard(&self.state);
        Self::pull_locked(&mut state, &reference)?;
        self.save(&state)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<RuntimeId, RuntimeError> {
        let reference = spec.image.reference();
        self.record(format!("create {reference}"))?;
        let mut state = guard(&self.state);
        if !state.local_images.contains(&reference) {
            Self::pull_locked(&mut state, &reference)?;
        }
        let id = generate_id();
        state.containers.insert(
            id.to_string(),
            MockContainer {
                image: reference,
                state: MockContainerState::Created,
                exit_code: None,
                oom_killed: false,
            },
        );
        self.save(&state)?;
        Ok(id)
    }

    async fn start_container(&self, id: &RuntimeId) -> Result<(), RuntimeError> {
        self.record(format!("start {id}"))?;
        let mut state = guard(&self.state);
        let container = state
            .containers
            .get_mut(id.as_str())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = MockContainerState::Running;
        container.exit_code = None;
        container.oom_killed = false;
        self.save(&state)
    }

    async fn stop_container(&self, id: &RuntimeId) -> Result<(), RuntimeError> {
        self.record(format!("stop {id}"))?;
        let mut state = guard(&self.state);
        let container = state
            .containers
            .get_mut(id.as_str())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        let was_live = matches!(
            container.state,
            MockContainerState::Running | MockContainerState::Paused
        );
        if was_live {
            container.state = MockContainerState::Exited;
            container.exit_code = Some(0);
        }
        self.save(&state)?;
        drop(state);

        let hook = if was_live {
            guard(&self.stop_hook).clone()
        } else {
            None
        };
        if let Some(hook) = hook {
            hook(id);
        }
        Ok(())
    }

    async fn delete_container(&self, id: &RuntimeId) -> Result<(), RuntimeError> {
        self.record(format!("delete {id}"))?;
        let mut state = guard(&self.state);
        if state.containers.remove(id.as_str()).is_some() {
            self.save(&state)?;
        }
        Ok(())
    }

    async fn inspect_container(
        &self,
        id: &RuntimeId,
    ) -> Result<Option<ObservedState>, RuntimeError> {
        self.record(format!("inspect {id}"))?;
        if guard(&self.failing_inspects).contains(id.as_str()) {
            return Err(RuntimeError::Transient(format!("inspect {id}: injected failure")));
        }
        let state = guard(&self.state);
        Ok(state.containers.get(id.as_str()).map(|c| ObservedState {
            status: summary_strings(c).0,
            running: matches!(
                c.state,
                MockContainerState::Running | MockContainerState::Paused
            ),
            paused: c.state == MockContainerState::Paused,
            dead: c.state == MockContainerState::Dead,
            oom_killed: c.oom_killed,
            exit_code: c.exit_code,
        }))
    }

    async fn list_all_containers(&self) -> Result<Vec<ContainerSummary>, RuntimeError> {
        self.record("list".to_owned())?;
        let state = guard(&self.state);
        Ok(state
            .containers
            .iter()
            .map(|(id, c)| {
                let (state, status) = summary_strings(c);
                ContainerSummary {
                    id: RuntimeId::new(id.clone()),
                    state,
                    status,
                }
            })
            .collect())
    }

    async fn events(&self) -> Result<EventStream, RuntimeError> {
        self.record("events".to_owned())?;
        let refused = self
            .refused_subscriptions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if refused.is_ok() {
            return Err(RuntimeError::Transient(
                "event subscription refused".to_owned(),
            ));
        }
        let (tx, rx) = mpsc::unbounded();
        guard(&self.subscribers).push(tx);
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nginx() -> ContainerSpec {
        ContainerSpec::for_image("nginx", "latest")
    }

    #[tokio::test]
    async fn create_pulls_missing_image() {
        let backend = MockBackend::new();
        assert!(!backend.has_image("nginx:latest"));
        let id = backend.create_container(&nginx()).await.unwrap();
        assert!(backend.has_image("nginx:latest"));
        assert_eq!(backend.state_of(&id), Some(MockContainerState::Created));
        assert_eq!(id.len(), 64);
    }

    #[tokio::test]
    async fn create_with_unknown_image_fails() {
        let backend = MockBackend::new();
        backend.mark_image_unknown("nginx:latest");
        assert!(matches!(
            backend.create_container(&nginx()).await,
            Err(RuntimeError::ImageNotFound(_))
        ));
        assert!(matches!(
            backend.pull_image(&ImageRef::new("nginx", "latest")).await,
            Err(RuntimeError::ImageNotFound(_))
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let backend = MockBackend::new();
        let id = backend.create_container(&nginx()).await.unwrap();
        backend.start_container(&id).await.unwrap();
        backend.stop_container(&id).await.unwrap();
        backend.stop_container(&id).await.unwrap();
        assert_eq!(backend.state_of(&id), Some(MockContainerState::Exited));
    }

    #[tokio::test]
    async fn stop_hook_fires_for_live_containers_only() {
        let backend = MockBackend::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        backend.on_stop(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let id = backend.create_container(&nginx()).await.unwrap();
        backend.stop_container(&id).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        backend.start_container(&id).await.unwrap();
        backend.stop_container(&id).await.unwrap();
        backend.stop_container(&id).await.unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn start_missing_is_not_found() {
        let backend = MockBackend::new();
        assert!(matches!(
            backend.start_container(&RuntimeId::new("nope")).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_tolerates_missing() {
        let backend = MockBackend::new();
        let id = backend.create_container(&nginx()).await.unwrap();
        backend.delete_container(&id).await.unwrap();
        backend.delete_container(&id).await.unwrap();
        assert!(!backend.container_exists(&id).await.unwrap());
    }

    #[tokio::test]
    async fn paused_reports_running_and_paused() {
        let backend = MockBackend::new();
        let id = backend.insert_container("redis:7", MockContainerState::Paused);
        let observed = backend.inspect_container(&id).await.unwrap().unwrap();
        assert!(observed.running);
        assert!(observed.paused);
    }

    #[tokio::test]
    async fn listing_includes_stopped() {
        let backend = MockBackend::new();
        backend.insert_container("a:1", MockContainerState::Running);
        let exited = backend.insert_container("b:1", MockContainerState::Created);
        backend.set_state(&exited, MockContainerState::Exited, Some(2));
        let list = backend.list_all_containers().await.unwrap();
        assert_eq!(list.len(), 2);
        let row = list.iter().find(|c| c.id == exited).unwrap();
        assert_eq!(row.state, "exited");
        assert!(row.status.contains("(2)"));
    }

    #[tokio::test]
    async fn injected_inspect_failure() {
        let backend = MockBackend::new();
        let id = backend.insert_container("a:1", MockContainerState::Running);
        backend.fail_inspect(&id);
        assert!(backend.inspect_container(&id).await.unwrap_err().is_transient());
    }

    #[tokio::test]
    async fn events_reach_subscribers() {
        let backend = MockBackend::new();
        let mut stream = backend.events().await.unwrap();
        assert_eq!(backend.subscription_count(), 1);

        let delivered = backend.emit(&RuntimeEvent::container("die", "abc"));
        assert_eq!(delivered, 1);
        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.action, "die");

        backend.disconnect();
        assert!(stream.next().await.is_none());
        assert_eq!(backend.subscription_count(), 0);
    }

    #[tokio::test]
    async fn refused_subscriptions_count_down() {
        let backend = MockBackend::new();
        backend.refuse_subscriptions(2);
        assert!(backend.events().await.is_err());
        assert!(backend.events().await.is_err());
        assert!(backend.events().await.is_ok());
    }

    #[tokio::test]
    async fn unavailable_fails_every_call() {
        let backend = MockBackend::new();
        backend.set_unavailable(true);
        assert!(matches!(
            backend.list_all_containers().await,
            Err(RuntimeError::Unavailable(_))
        ));
        backend.set_unavailable(false);
        assert!(backend.list_all_containers().await.is_ok());
    }

    #[tokio::test]
    async fn persistent_state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mock-runtime.json");

        let id = {
            let backend = MockBackend::persistent(&path).unwrap();
            let id = backend.create_container(&nginx()).await.unwrap();
            backend.start_container(&id).await.unwrap();
            id
        };

        let reloaded = MockBackend::persistent(&path).unwrap();
        assert_eq!(reloaded.state_of(&id), Some(MockContainerState::Running));
        assert!(reloaded.has_image("nginx:latest"));
    }

    #[tokio::test]
    async fn calls_are_recorded() {
        let backend = MockBackend::new();
        let id = backend.create_container(&nginx()).await.unwrap();
        backend.start_container(&id).await.unwrap();
        let calls = backend.calls();
        assert_eq!(calls[0], "create nginx:latest");
        assert_eq!(calls[1], format!("start {id}"));
    }
}
