//! Instance status rules.
//!
//! Every status change in the system goes through [`apply`], whether it comes
//! from a user operation, reconciliation, or a runtime event. The rules are
//! evaluated against the freshest persisted status inside the store's
//! serialized read-modify-write.

use chrono::{DateTime, Utc};
use dockhand_runtime::{ContainerSummary, ObservedState};
use dockhand_store::{Instance, InstanceStatus};

/// Something that happened to an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The runtime accepted a start request.
    Started,
    /// A user stop is about to be sent to the runtime.
    StopRequested,
    /// The runtime refused a requested stop.
    StopAbandoned,
    /// The runtime accepted a stop request.
    Stopped,
    /// A `stop` event arrived from the runtime feed.
    StopEvent,
    /// A `die` event arrived, with its `exitCode` attribute if present.
    DieEvent { exit_code: Option<String> },
    /// Reconciliation observed the container in this state.
    Observed(InstanceStatus),
    /// Reconciliation found no runtime container for the instance.
    Vanished,
    /// The record has no runtime container id.
    MissingRuntimeId,
}

/// Status after `transition` is applied to an instance in `current`.
pub fn next_status(current: InstanceStatus, transition: &Transition) -> InstanceStatus {
    use InstanceStatus::{Created, Failed, Running, Stopped};

    match transition {
        Transition::Started => Running,
        Transition::StopRequested | Transition::StopAbandoned => current,
        // A failure the runtime already reported is not masked by a later stop.
        Transition::Stopped => match current {
            Failed => Failed,
            _ => Stopped,
        },
        Transition::StopEvent => match current {
            Running => Stopped,
            other => other,
        },
        Transition::DieEvent { exit_code } => match current {
            Running if exit_code.as_deref() == Some("0") => Stopped,
            Running => Failed,
            other => other,
        },
        Transition::Observed(status) => *status,
        Transition::Vanished => match current {
            Created | Running => Failed,
            other => other,
        },
        Transition::MissingRuntimeId => Failed,
    }
}

/// Status after `transition`, taking a pending user stop into account.
///
/// While a user stop is in flight, the `stop` or `die` it provokes ends the
/// instance as `Stopped` whatever the exit code. A failure recorded before
/// the stop was requested is kept.
pub fn resolve(instance: &Instance, transition: &Transition) -> InstanceStatus {
    match transition {
        Transition::StopEvent | Transition::DieEvent { .. }
            if instance.stop_requested && instance.status == InstanceStatus::Running =>
        {
            InstanceStatus::Stopped
        }
        _ => next_status(instance.status, transition),
    }
}

/// Apply `transition` to `instance`, stamping the start time on the first
/// entry into `Running` and tracking the pending-stop marker. Returns whether
/// the status changed.
pub fn apply(instance: &mut Instance, transition: &Transition, now: DateTime<Utc>) -> bool {
    let next = resolve(instance, transition);
    match transition {
        Transition::StopRequested => instance.stop_requested = true,
        Transition::Started | Transition::Stopped | Transition::StopAbandoned => {
            instance.stop_requested = false;
        }
        _ => {}
    }
    if next == InstanceStatus::Running && instance.started_at.is_none() {
        instance.started_at = Some(now);
    }
    let changed = next != instance.status;
    instance.status = next;
    changed
}

/// Ordered substring rules over a normalized container state string.
const SUMMARY_RULES: &[(&str, InstanceStatus)] = &[
    ("running", InstanceStatus::Running),
    ("exited", InstanceStatus::Stopped),
    ("created", InstanceStatus::Created),
];

fn classify_state_string(state: &str) -> Option<InstanceStatus> {
    let state = state.to_lowercase();
    SUMMARY_RULES
        .iter()
        .find(|(needle, _)| state.contains(needle))
        .map(|(_, status)| *status)
}

/// Coarse classification of a listing row. `None` means inconclusive and the
/// caller should fall back to [`derive_status`] on a detailed inspection.
pub fn classify_summary(summary: &ContainerSummary) -> Option<InstanceStatus> {
    classify_state_string(&summary.state).or_else(|| classify_state_string(&summary.status))
}

/// Status implied by a detailed observation.
///
/// Paused wins over running (Docker reports both for a paused container).
/// A missing observation means the runtime has no record: `Failed`.
pub fn derive_status(observed: Option<&ObservedState>) -> InstanceStatus {
    let Some(observed) = observed else {
        return InstanceStatus::Failed;
    };
    if observed.paused {
        InstanceStatus::Stopped
    } else if observed.running {
        InstanceStatus::Running
    } else if observed.dead || observed.oom_killed {
        InstanceStatus::Failed
    } else {
        classify_state_string(&observed.status).unwrap_or(InstanceStatus::Created)
    }
}
