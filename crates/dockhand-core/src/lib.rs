//! Lifecycle control plane for Dockhand container instances.
//!
//! This crate ties the record store and a runtime adapter together: the
//! `Engine` performs create, start, stop and delete transitions, the
//! `Reconciler` corrects persisted status against the runtime at startup, and
//! the `EventConsumer` follows the runtime's event feed in the background. All
//! three write through `InstanceStore::modify`, and the status rules they apply
//! live in `lifecycle`.

pub mod config;
pub mod daemon;
pub mod engine;
pub mod events;
pub mod lifecycle;
pub mod reconcile;

pub use config::DaemonConfig;
pub use daemon::run_daemon;
pub use engine::{Engine, InstanceInspection};
pub use events::{EventConsumer, EventWorker};
pub use lifecycle::{classify_summary, derive_status, next_status, resolve, Transition};
pub use reconcile::{ReconcileReport, Reconciler};

use dockhand_runtime::RuntimeError;
use dockhand_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Manifest(#[from] dockhand_schema::ManifestError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
    #[error("instance '{0}' has no runtime container id; its record is inconsistent")]
    MissingRuntimeId(String),
    #[error("daemon config: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Task(String),
}

/// Caller-facing classification of a [`CoreError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A configuration, instance, image or runtime container does not exist.
    NotFound,
    /// The operation is not valid for the current state.
    Conflict,
    /// Network or timeout trouble talking to the runtime.
    Transient,
    /// Persisted data failed verification.
    Integrity,
    /// Input failed validation.
    Invalid,
    Internal,
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Manifest(_) | CoreError::Config(_) => ErrorKind::Invalid,
            CoreError::MissingRuntimeId(_) => ErrorKind::Conflict,
            CoreError::Io(_) | CoreError::Task(_) => ErrorKind::Internal,
            CoreError::Store(e) => match e {
                StoreError::ConfigurationNotFound(_) | StoreError::InstanceNotFound(_) => {
                    ErrorKind::NotFound
                }
                StoreError::ConfigurationInUse { .. }
                | StoreError::ConfigurationExists(_)
                | StoreError::InstanceExists(_)
                | StoreError::ImmutableField { .. } => ErrorKind::Conflict,
                StoreError::IntegrityFailure { .. } | StoreError::VersionMismatch { .. } => {
                    ErrorKind::Integrity
                }
                StoreError::Io(_) | StoreError::LockFailed(_) | StoreError::Serialization(_) => {
                    ErrorKind::Internal
                }
            },
            CoreError::Runtime(e) => match e {
                RuntimeError::NotFound(_) | RuntimeError::ImageNotFound(_) => ErrorKind::NotFound,
                RuntimeError::Conflict(_) => ErrorKind::Conflict,
                RuntimeError::Transient(_) | RuntimeError::Unavailable(_) => ErrorKind::Transient,
                RuntimeError::Failed(_) => ErrorKind::Internal,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let not_found = CoreError::from(StoreError::InstanceNotFound("i".to_owned()));
        assert_eq!(not_found.kind(), ErrorKind::NotFound);

        let in_use = CoreError::from(StoreError::ConfigurationInUse {
            id: "c".to_owned(),
            instances: 1,
        });
        assert_eq!(in_use.kind(), ErrorKind::Conflict);

        assert_eq!(
            CoreError::MissingRuntimeId("i".to_owned()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            CoreError::from(RuntimeError::Transient("t".to_owned())).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            CoreError::from(RuntimeError::ImageNotFound("x".to_owned())).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            CoreError::from(StoreError::IntegrityFailure {
                id: "i".to_owned(),
                expected: "a".to_owned(),
                actual: "b".to_owned(),
            })
            .kind(),
            ErrorKind::Integrity
        );
    }
}
