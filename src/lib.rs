//! # tasktree
//!
//! Hierarchical observable task execution: run units of work concurrently,
//! track their progress, aggregate child progress into a parent under
//! contention, coalesce high-frequency updates into latest-value
//! notifications, and propagate cancellation and failure across a task tree.
//!
//! ## Architecture
//!
//! ```text
//!        ┌─────────────────────────────────┐
//!        │            TaskGroup            │
//!        │ (counting phase, delta          │
//!        │  aggregation, escalation)       │
//!        └───────┬───────────┬─────────────┘
//!                │           │
//!                ▼           ▼
//!          ┌─────────┐ ┌─────────┐      ┌────────────┐
//!          │  Task   │ │  Task   │ ───► │ Coalescers │──► sink thread
//!          │ (Work)  │ │ (Work)  │      │ (per field)│    ──► observers
//!          └────┬────┘ └────┬────┘      └────────────┘
//!               │           │
//!               ▼           ▼
//!          ┌─────────────────────┐
//!          │     WorkerPool      │  (work-stealing, one per group run)
//!          └─────────────────────┘
//! ```
//!
//! ## Execution Flow
//! 1. A consumer implements [`Work`] (or wraps a closure in [`WorkFn`]) and
//!    builds a [`Task`], optionally attaching several to a [`TaskGroup`].
//! 2. The unit runs on a [`WorkerPool`]; `compute` reports progress and
//!    messages through its [`TaskContext`] and polls `is_cancelled()`.
//! 3. Observers subscribe to coalesced [`TaskEvent`]s: only the latest value
//!    of each field is ever delivered, so a tight reporting loop never
//!    floods the consumer.
//!
//! The engine is agnostic to what "work" means; rendering, persistence, and
//! protocol concerns live entirely in the consumers of this contract.
//!
//! ## Modules
//! - `task`: work units, groups, state machine, observation surface
//! - `pool`: the work-stealing execution substrate
//! - `progress`: counters and the unknown-work sentinel
//! - `error`: error taxonomy

mod coalesce;
mod sink;

pub mod error;
pub mod pool;
pub mod progress;
pub mod task;

pub use error::{ComputeFailure, PoolError, TaskError};
pub use pool::WorkerPool;
pub use progress::{Progress, UNKNOWN_WORK};
pub use task::{Task, TaskContext, TaskEvent, TaskGroup, TaskId, TaskState, Work, WorkFn};
