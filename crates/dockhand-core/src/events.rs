use crate::lifecycle::{self, Transition};
use crate::CoreError;
use chrono::Utc;
use dockhand_runtime::{RuntimeBackend, RuntimeEvent};
use dockhand_store::InstanceStore;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Follows the runtime's event feed and applies container `stop` and `die`
/// events to the instances they belong to.
///
/// A lost subscription is retried forever, `backoff` apart, until cancelled.
#[derive(Clone)]
pub struct EventConsumer {
    instances: Arc<InstanceStore>,
    runtime: Arc<dyn RuntimeBackend>,
    backoff: Duration,
}

/// Handle to a spawned [`EventConsumer`].
pub struct EventWorker {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

impl EventWorker {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Cancel the consumer and wait for it to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!("event consumer task ended abnormally: {e}");
        }
    }
}

fn transition_for(event: &RuntimeEvent) -> Option<Transition> {
    if event.kind != "container" {
        return None;
    }
    match event.action.as_str() {
        "stop" => Some(Transition::StopEvent),
        "die" => Some(Transition::DieEvent {
            exit_code: event.attribute("exitCode").map(str::to_owned),
        }),
        _ => None,
    }
}

enum Next<T> {
    Cancelled,
    Ready(T),
}

impl EventConsumer {
    pub fn new(
        instances: Arc<InstanceStore>,
        runtime: Arc<dyn RuntimeBackend>,
        backoff: Duration,
    ) -> Self {
        Self {
            instances,
            runtime,
            backoff,
        }
    }

    /// Apply one event. Returns how many instance records changed.
    ///
    /// Events for other object types, other actions, unknown containers, and
    /// instances that are not `Running` change nothing.
    pub fn handle_event(&self, event: &RuntimeEvent) -> usize {
        let Some(transition) = transition_for(event) else {
            debug!("ignoring {} {} event", event.kind, event.action);
            return 0;
        };
        let Some(actor) = event.actor_id.as_ref() else {
            debug!("ignoring {} event without actor id", event.action);
            return 0;
        };

        let matches = match self.instances.find_by_runtime_id(actor) {
            Ok(found) => found,
            Err(e) => {
                warn!("event {} for {}: lookup failed: {e}", event.action, actor.short());
                return 0;
            }
        };
        if matches.is_empty() {
            debug!(
                "ignoring {} event for unmanaged container {}",
                event.action,
                actor.short()
            );
            return 0;
        }

        let mut changed = 0;
        for instance in matches {
            let result = self.instances.modify::<_, CoreError>(&instance.id, |i| {
                lifecycle::apply(i, &transition, Utc::now());
                Ok(())
            });
            match result {
                Ok(m) if m.written => {
                    info!(
                        "instance {} {} -> {} ({} event{})",
                        instance.id,
                        instance.status,
                        m.instance.status,
                        event.action,
                        event
                            .attribute("exitCode")
                            .map(|c| format!(", exit code {c}"))
                            .unwrap_or_default()
                    );
                    changed += 1;
                }
                Ok(m) => debug!(
                    "instance {} is {}; {} event changes nothing",
                    instance.id, m.instance.status, event.action
                ),
                Err(e) => warn!("event {} for instance {}: {e}", event.action, instance.id),
            }
        }
        changed
    }

    /// Consume events until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!("event consumer started ({} runtime)", self.runtime.name());

        loop {
            let subscribed = tokio::select! {
                biased;
                () = cancel.cancelled() => Next::Cancelled,
                r = self.runtime.events() => Next::Ready(r),
            };
            let Next::Ready(subscribed) = subscribed else {
                break;
            };

            match subscribed {
                Ok(mut stream) => {
                    debug!("subscribed to runtime events");
                    loop {
                        let next = tokio::select! {
                            biased;
                            () = cancel.cancelled() => Next::Cancelled,
                            item = stream.next() => Next::Ready(item),
                        };
                        match next {
                            Next::Cancelled => {
                                info!("event consumer stopped");
                                return;
                            }
                            Next::Ready(Some(Ok(event))) => {
                                let applied = self.apply_off_thread(event, &cancel).await;
                                if let Next::Cancelled = applied {
                                    info!("event consumer stopped");
                                    return;
                                }
                            }
                            Next::Ready(Some(Err(e))) => {
                                error!("event stream failed: {e}");
                                break;
                            }
                            Next::Ready(None) => {
                                error!("event stream closed by runtime");
                                break;
                            }
                        }
                    }
                }
                Err(e) => error!("event subscription failed: {e}"),
            }

            warn!("resubscribing to runtime events in {:?}", self.backoff);
            let slept = tokio::select! {
                biased;
                () = cancel.cancelled() => Next::Cancelled,
                () = tokio::time::sleep(self.backoff) => Next::Ready(()),
            };
            if let Next::Cancelled = slept {
                break;
            }
        }

        info!("event consumer stopped");
    }

    /// [`handle_event`](Self::handle_event) on the blocking pool, since it
    /// waits on the store lock. Cancellation stops waiting for it; a write
    /// already under way still completes.
    async fn apply_off_thread(
        &self,
        event: RuntimeEvent,
        cancel: &CancellationToken,
    ) -> Next<()> {
        let consumer = self.clone();
        let action = event.action.clone();
        let applying = tokio::task::spawn_blocking(move || consumer.handle_event(&event));
        let applied = tokio::select! {
            biased;
            () = cancel.cancelled() => Next::Cancelled,
            r = applying => Next::Ready(r),
        };
        match applied {
            Next::Cancelled => Next::Cancelled,
            Next::Ready(Ok(_)) => Next::Ready(()),
            Next::Ready(Err(e)) => {
                warn!("applying {action} event failed: {e}");
                Next::Ready(())
            }
        }
    }

    /// Run on the current tokio runtime until the returned worker is shut down.
    pub fn spawn(self) -> EventWorker {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { self.run(token).await });
        EventWorker { handle, cancel }
    }
}
