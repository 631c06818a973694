//! Instance control API consumed by the shutdown coordinator.
//!
//! The controller only ever stops and describes instances; starting them is
//! left to users and the surrounding tooling.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use thiserror::Error;

/// Observed lifecycle state of an instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    NotFound,
    Other(String),
}

impl InstanceState {
    /// Map a provider status string onto a state.
    pub fn from_status(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "inservice" | "running" | "in_service" => InstanceState::Running,
            "pending" | "starting" | "updating" => InstanceState::Pending,
            "stopping" => InstanceState::Stopping,
            "stopped" | "terminated" | "failed" => InstanceState::Stopped,
            "notfound" | "not_found" | "deleted" => InstanceState::NotFound,
            other => InstanceState::Other(other.to_string()),
        }
    }

    /// Whether the desired end state of a stop already holds.
    pub fn is_down(&self) -> bool {
        matches!(
            self,
            InstanceState::Stopping | InstanceState::Stopped | InstanceState::NotFound
        )
    }

    pub fn is_up(&self) -> bool {
        matches!(self, InstanceState::Running | InstanceState::Pending)
    }
}

/// Failure of a stop or describe call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StopError {
    #[error("throttled: {0}")]
    Throttled(String),

    #[error("temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("instance already stopped: {0}")]
    AlreadyStopped(String),

    #[error("stop failed: {0}")]
    Other(String),
}

impl StopError {
    /// Errors meaning the instance is already not running.
    pub fn is_permanent(&self) -> bool {
        matches!(self, StopError::NotFound(_) | StopError::AlreadyStopped(_))
    }

    /// Errors worth retrying. Unclassified failures are retried too; after
    /// the attempt cap they surface as a failed decision.
    pub fn is_transient(&self) -> bool {
        !self.is_permanent()
    }
}

/// Boxed future alias for instance control calls.
pub type ControlFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StopError>> + Send + 'a>>;

/// External capability to stop and inspect instances.
pub trait InstanceControl: Send + Sync {
    /// Request that the instance stop.
    fn stop<'a>(&'a self, instance_id: &'a str) -> ControlFuture<'a, ()>;

    /// Current lifecycle state of the instance.
    fn describe<'a>(&'a self, instance_id: &'a str) -> ControlFuture<'a, InstanceState>;
}
