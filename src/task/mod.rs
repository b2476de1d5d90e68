//! Task module - hierarchical observable units of work.
//!
//! # Pieces
//! - **`Work`**: the capability trait a consumer implements (`compute`,
//!   `total_work`, `is_cancellable`).
//! - **`Task`**: a single schedulable unit with a lifecycle state machine,
//!   cooperative cancellation, and coalesced progress/message publishing.
//! - **`TaskGroup`**: a composite unit that owns children, sums their
//!   estimated work up front, runs them on a worker pool, and aggregates
//!   their progress deltas under a shared lock.
//!
//! # State Machine
//! ```text
//! Ready -> Running -> Succeeded
//!                 \-> Failed
//!       \-> Cancelled
//! ```
//! Terminal states are `Succeeded`, `Failed`, `Cancelled`. A non-running
//! unit can be reinitialized back to `Ready`.

mod core;
mod group;
mod unit;
mod work;

pub use group::TaskGroup;
pub use unit::Task;
pub use work::{TaskContext, Work, WorkFn};

use serde::Serialize;
use uuid::Uuid;

use crate::progress::Progress;

/// Unique identifier for a task, stable for the unit's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a task.
///
/// Stored in an atomic with sequentially-consistent ordering, so a terminal
/// state observed by the submitter is never stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum TaskState {
    /// Created or reinitialized, waiting to be executed.
    Ready = 0,
    /// `compute` is currently running.
    Running = 1,
    /// `compute` returned normally.
    Succeeded = 2,
    /// A cancellation request was honored.
    Cancelled = 3,
    /// `compute` terminated abnormally (error or panic).
    Failed = 4,
}

impl TaskState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TaskState::Ready,
            1 => TaskState::Running,
            2 => TaskState::Succeeded,
            3 => TaskState::Cancelled,
            _ => TaskState::Failed,
        }
    }

    /// `true` once the task can make no further transitions (except
    /// reinitialization).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Succeeded | TaskState::Cancelled | TaskState::Failed
        )
    }
}

/// Coalesced notification delivered to subscribers on the task's sink thread.
///
/// Each variant corresponds to one independently-coalesced field, so a burst
/// of updates to one field never delays another.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum TaskEvent {
    State(TaskState),
    Title(String),
    Message(String),
    ProgressMessage(String),
    TimeMessage(String),
    Progress(Progress),
}
