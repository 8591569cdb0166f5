//! Runtime adapters for Dockhand.
//!
//! This crate defines the narrow contract the control plane consumes from a
//! container runtime: the async `RuntimeBackend` trait, observed-state and event
//! types, and the `RuntimeError` taxonomy every adapter normalizes into. Two
//! adapters ship with it: `DockerBackend` over the Docker Engine API (bollard),
//! parameterized by a `TimeoutPolicy` so the same construction serves control
//! calls and the open-ended event feed, and `MockBackend`, an in-memory runtime
//! with event injection for tests and dry runs.

pub mod backend;
pub mod docker;
pub mod mock;

pub use backend::{
    select_backend, ContainerSummary, EventStream, ObservedState, RuntimeBackend,
    RuntimeConnection, RuntimeEvent,
};
pub use docker::{DockerBackend, TimeoutPolicy};
pub use mock::{MockBackend, MockContainerState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("container not found: {0}")]
    NotFound(String),
    #[error("image not found: {0}")]
    ImageNotFound(String),
    #[error("runtime conflict: {0}")]
    Conflict(String),
    #[error("transient runtime error: {0}")]
    Transient(String),
    #[error("runtime operation failed: {0}")]
    Failed(String),
    #[error("runtime '{0}' is not available")]
    Unavailable(String),
}

impl RuntimeError {
    /// Network, timeout and connectivity failures that may succeed on retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Unavailable(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}
