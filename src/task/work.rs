//! The capability contract between the engine and a consumer's work.
//!
//! # Invariants
//! - `compute()` never unwinds into the worker pool; the engine catches
//!   panics and records them as failures.
//! - Cancellation is cooperative: `compute` is expected to poll
//!   [`TaskContext::is_cancelled`] at its own suspension points. The engine
//!   never preempts a running body.

use crate::progress::UNKNOWN_WORK;

use super::core::TaskCore;

/// A unit of work the engine can schedule.
pub trait Work: Send {
    /// The body of the task. May report progress and messages through `cx`
    /// at any point, and should periodically check `cx.is_cancelled()` if it
    /// wants to honor cooperative cancellation.
    fn compute(&mut self, cx: &TaskContext<'_>) -> anyhow::Result<()>;

    /// Best-effort estimate of total work, invoked only when the unit runs
    /// as a child of a group (the counting phase). May itself require a pass
    /// over data. Return [`UNKNOWN_WORK`] when no estimate exists.
    fn total_work(&mut self, _cx: &TaskContext<'_>) -> i64 {
        UNKNOWN_WORK
    }

    /// Whether this unit honors cancellation requests at all. Units that
    /// return `false` ignore `cancel()` entirely.
    fn is_cancellable(&self) -> bool {
        true
    }
}

/// Handle passed into `compute` and `total_work`, scoped to the executing
/// unit. All publishing goes through the unit's coalescers, so calling these
/// at high frequency costs one slot swap, never a queued backlog.
pub struct TaskContext<'a> {
    core: &'a TaskCore,
}

impl<'a> TaskContext<'a> {
    pub(crate) fn new(core: &'a TaskCore) -> Self {
        Self { core }
    }

    /// Report a message together with numeric progress.
    pub fn update(&self, message: impl Into<String>, work_done: i64, total_work: i64) {
        self.core.set_message(message.into());
        self.core.update_progress(work_done, total_work);
    }

    /// Report a message only (the indeterminate variant).
    pub fn update_message(&self, message: impl Into<String>) {
        self.core.set_message(message.into());
    }

    /// Report numeric progress without touching the message.
    pub fn update_progress(&self, work_done: i64, total_work: i64) {
        self.core.update_progress(work_done, total_work);
    }

    /// Replace the task's display title.
    pub fn set_title(&self, title: impl Into<String>) {
        self.core.set_title(title.into());
    }

    /// Replace the qualitative progress message (e.g. "4 of 9 files").
    pub fn set_progress_message(&self, message: impl Into<String>) {
        self.core.set_progress_message(message.into());
    }

    /// Replace the time message (e.g. an ETA rendered by the consumer).
    pub fn set_time_message(&self, message: impl Into<String>) {
        self.core.set_time_message(message.into());
    }

    /// Cooperative cancellation predicate.
    pub fn is_cancelled(&self) -> bool {
        self.core.is_cancel_requested()
    }
}

/// Closure adapter for consumers and tests that do not want a named type.
///
/// ```
/// use tasktree::{Task, WorkFn};
///
/// let task = Task::new(
///     "count",
///     WorkFn::new(|cx| {
///         for i in 0..10 {
///             cx.update("counting", i, 10);
///         }
///         Ok(())
///     })
///     .with_total(10),
/// );
/// # let _ = task;
/// ```
pub struct WorkFn<F> {
    body: F,
    estimate: i64,
    cancellable: bool,
}

impl<F> WorkFn<F>
where
    F: FnMut(&TaskContext<'_>) -> anyhow::Result<()> + Send,
{
    pub fn new(body: F) -> Self {
        Self {
            body,
            estimate: UNKNOWN_WORK,
            cancellable: true,
        }
    }

    /// Declare a static total-work estimate for the counting phase.
    pub fn with_total(mut self, total_work: i64) -> Self {
        self.estimate = total_work;
        self
    }

    /// Mark the work as ignoring cancellation requests.
    pub fn not_cancellable(mut self) -> Self {
        self.cancellable = false;
        self
    }
}

impl<F> Work for WorkFn<F>
where
    F: FnMut(&TaskContext<'_>) -> anyhow::Result<()> + Send,
{
    fn compute(&mut self, cx: &TaskContext<'_>) -> anyhow::Result<()> {
        (self.body)(cx)
    }

    fn total_work(&mut self, _cx: &TaskContext<'_>) -> i64 {
        self.estimate
    }

    fn is_cancellable(&self) -> bool {
        self.cancellable
    }
}
