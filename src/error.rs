//! Error taxonomy for the execution engine.
//!
//! Two very different failure classes live here:
//! - [`TaskError`]: structural misuse (wrong state, double attach). These are
//!   programmer errors, returned synchronously at the call site, never
//!   retried by the engine.
//! - [`ComputeFailure`]: abnormal termination of a `compute` body. These are
//!   runtime conditions, captured by the engine and surfaced through the
//!   unit's terminal `Failed` state.

use std::sync::Arc;

use crate::task::TaskState;

/// Structural misuse of the task API.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TaskError {
    /// Operation attempted in an incompatible lifecycle state.
    #[error("operation `{op}` is not allowed while the task is {state:?}")]
    InvalidState {
        op: &'static str,
        state: TaskState,
    },

    /// A task was added as a child more than once, or to more than one group.
    #[error("task is already attached to a group")]
    AlreadyAttached,
}

/// Captured abnormal termination of a `compute` body.
///
/// The original cause is preserved for inspection. The cause is shared
/// (`Arc`) because the same failure is recorded on the failing unit and, when
/// the unit runs inside a group, escalated onto the group as well.
#[derive(Debug, Clone, thiserror::Error)]
#[error("compute failed: {cause}")]
pub struct ComputeFailure {
    cause: Arc<anyhow::Error>,
}

impl ComputeFailure {
    pub(crate) fn new(cause: anyhow::Error) -> Self {
        Self {
            cause: Arc::new(cause),
        }
    }

    /// Build a failure from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "task panicked".to_string());
        Self::new(anyhow::anyhow!("task panicked: {msg}"))
    }

    /// The original cause, as captured from the `compute` body.
    pub fn cause(&self) -> &anyhow::Error {
        &self.cause
    }
}

/// Errors building the execution substrate.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("failed to build worker pool: {0}")]
    Build(#[from] rayon::ThreadPoolBuildError),
}
