//! `TaskGroup`: a composite unit owning child tasks.
//!
//! # Run Protocol
//! 1. **Counting phase.** Every child's `total_work` hook is invoked on the
//!    run's worker pool and the estimates are summed. Any unknown estimate
//!    marks the whole group indeterminate and mutes the numeric channel for
//!    the run; otherwise each child's delta baseline is seeded with its
//!    estimate and the aggregate starts at `(0, sum)`.
//! 2. **Execution phase.** All children are submitted to a fresh worker pool
//!    and the group blocks until every child is terminal. The pool lives for
//!    exactly one run.
//!
//! # Failure & Cancellation
//! A child reaching `Failed` escalates: its cause is adopted by the group,
//! the whole group is cancelled, and the group resolves `Failed` (failure
//! dominates cancellation). Cancelling the group cancels children in list
//! order before the group's own transition.

use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::error::{ComputeFailure, TaskError};
use crate::pool::WorkerPool;
use crate::progress::{Progress, UNKNOWN_WORK};

use super::core::TaskCore;
use super::unit::Task;
use super::work::{TaskContext, Work};
use super::{TaskEvent, TaskId, TaskState};

#[derive(Debug, Clone, Copy)]
struct CountOutcome {
    total: i64,
    indeterminate: bool,
}

struct GroupInner {
    core: Arc<TaskCore>,
    /// Ordered child list. Snapshot-and-release before any child call, so
    /// the list lock is never held across `compute`, cancel, or reset.
    children: Mutex<Vec<Task>>,
    /// `None` means available hardware parallelism.
    parallelism: Option<usize>,
    /// Counting-phase result, cached until reinitialization.
    counted: Mutex<Option<CountOutcome>>,
}

/// A composite unit that owns child tasks and aggregates their progress.
pub struct TaskGroup {
    task: Task,
    inner: Arc<GroupInner>,
}

impl TaskGroup {
    /// Create an empty group running children at hardware parallelism.
    pub fn new(title: impl Into<String>) -> Self {
        Self::build(title.into(), None)
    }

    /// Create an empty group with an explicit degree of parallelism.
    pub fn with_parallelism(title: impl Into<String>, parallelism: usize) -> Self {
        Self::build(title.into(), Some(parallelism.max(1)))
    }

    fn build(title: String, parallelism: Option<usize>) -> Self {
        // The aggregation lock lives inside the core's progress book and is
        // created right here, never lazily on first attach.
        let core = TaskCore::new(title);
        let inner = Arc::new(GroupInner {
            core: Arc::clone(&core),
            children: Mutex::new(Vec::new()),
            parallelism,
            counted: Mutex::new(None),
        });
        {
            // Cancel hooks run before the group's own transition, so
            // children are asked to stop first.
            let weak = Arc::downgrade(&inner);
            core.add_cancel_hook(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.cancel_children();
                }
            });
        }
        {
            let weak = Arc::downgrade(&inner);
            core.add_reset_hook(move || {
                if let Some(inner) = weak.upgrade() {
                    inner.reset_children();
                }
            });
        }
        let task = Task::from_parts(
            core,
            Box::new(GroupRun {
                inner: Arc::clone(&inner),
            }),
        );
        Self { task, inner }
    }

    /// Attach a child. The child's parent back-reference is set here, before
    /// the group ever runs; a child cannot be shared between groups.
    ///
    /// # Errors
    /// - `AlreadyAttached` if the task already has a parent.
    /// - `InvalidState` if the group is `Running`.
    pub fn add_child(&self, child: &Task) -> Result<(), TaskError> {
        // Validated under the list lock: the run's child snapshot takes the
        // same lock after the `Running` transition, so an `Ok` here means
        // the child is visible to any run that starts concurrently.
        let mut children = self.inner.children.lock().expect("child list poisoned");
        let state = self.task.state();
        if state == TaskState::Running {
            return Err(TaskError::InvalidState {
                op: "add_child",
                state,
            });
        }
        child.core().attach_parent(Arc::downgrade(&self.inner.core))?;

        // Escalation listener: a failed child fails the whole group.
        let weak_inner = Arc::downgrade(&self.inner);
        let weak_child = Arc::downgrade(child.core());
        child.core().add_state_hook(move |state| {
            if state == TaskState::Failed {
                if let (Some(inner), Some(child)) = (weak_inner.upgrade(), weak_child.upgrade())
                {
                    inner.escalate(&child);
                }
            }
        });

        children.push(child.clone());
        Ok(())
    }

    /// Number of attached children.
    pub fn child_count(&self) -> usize {
        self.inner.children.lock().expect("child list poisoned").len()
    }

    /// Whether the last counting phase found any child with unknown total
    /// work. `false` before the group has counted.
    pub fn is_indeterminate(&self) -> bool {
        self.inner
            .counted
            .lock()
            .expect("count cache poisoned")
            .map(|outcome| outcome.indeterminate)
            .unwrap_or(false)
    }

    /// The group as an ordinary task, e.g. to nest it inside another group.
    pub fn as_task(&self) -> &Task {
        &self.task
    }

    pub fn into_task(self) -> Task {
        self.task
    }

    // Delegates to the underlying unit.

    pub fn id(&self) -> TaskId {
        self.task.id()
    }

    pub fn state(&self) -> TaskState {
        self.task.state()
    }

    pub fn progress(&self) -> Progress {
        self.task.progress()
    }

    pub fn failure(&self) -> Option<ComputeFailure> {
        self.task.failure()
    }

    pub fn subscribe(&self, callback: impl Fn(&TaskEvent) + Send + Sync + 'static) {
        self.task.subscribe(callback);
    }

    pub fn flush_events(&self) {
        self.task.flush_events();
    }

    /// Run the group on the calling thread (the group's children still run
    /// on the group's own pool).
    pub fn execute(&self) {
        self.task.execute();
    }

    /// Cancel every non-terminal child in list order, then the group itself.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Reinitialize every child, then the group itself.
    ///
    /// # Errors
    /// `InvalidState` while `Running`.
    pub fn reinitialize(&self) -> Result<(), TaskError> {
        self.task.reinitialize()
    }
}

impl std::fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskGroup")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("children", &self.child_count())
            .finish()
    }
}

/// The group's `compute` body.
struct GroupRun {
    inner: Arc<GroupInner>,
}

impl Work for GroupRun {
    fn compute(&mut self, cx: &TaskContext<'_>) -> anyhow::Result<()> {
        self.inner.run(cx)
    }

    /// When the group itself is a child, its estimate is its own counting
    /// phase (run inline; the cache makes the later run reuse it).
    fn total_work(&mut self, _cx: &TaskContext<'_>) -> i64 {
        self.inner.count(None).total
    }
}

impl GroupInner {
    fn snapshot(&self) -> Vec<Task> {
        self.children.lock().expect("child list poisoned").clone()
    }

    fn run(&self, _cx: &TaskContext<'_>) -> anyhow::Result<()> {
        let children = self.snapshot();
        if children.is_empty() {
            self.core.init_aggregate(0);
            return Ok(());
        }

        // One pool per run; dropped (and thereby shut down) when this
        // returns, whether the run succeeded, failed, or was cancelled.
        let pool = match self.parallelism {
            Some(threads) => WorkerPool::new(threads)?,
            None => WorkerPool::with_default_parallelism()?,
        };

        let outcome = self.count(Some(&pool));
        debug!(
            group = %self.core.id(),
            children = children.len(),
            total = outcome.total,
            indeterminate = outcome.indeterminate,
            "counting phase done"
        );
        // The aggregate is published here rather than in the counting phase:
        // a nested group's estimates are gathered while it is still `Ready`,
        // and nothing observable may precede the `Running` transition.
        if !outcome.indeterminate {
            self.core.init_aggregate(outcome.total);
        }

        if self.core.is_cancel_requested() {
            return Ok(());
        }

        pool.run_all(&children);
        Ok(())
    }

    /// Counting phase: gather per-child estimates, decide determinacy, seed
    /// baselines. Cached until reinitialization. Publishes nothing: the
    /// estimate path runs this while the group may still be `Ready`.
    fn count(&self, pool: Option<&WorkerPool>) -> CountOutcome {
        if let Some(outcome) = *self.counted.lock().expect("count cache poisoned") {
            return outcome;
        }
        let children = self.snapshot();
        let estimates: Vec<i64> = match pool {
            Some(pool) => pool.estimate_all(&children),
            None => children.iter().map(Task::request_total_work).collect(),
        };

        let outcome = if estimates.iter().any(|estimate| *estimate < 0) {
            // One unknown child poisons the percentage; mute the numeric
            // channel for everyone and fall back to qualitative messages.
            self.core.mute_numeric(true);
            for child in &children {
                child.core().mute_numeric(true);
            }
            CountOutcome {
                total: UNKNOWN_WORK,
                indeterminate: true,
            }
        } else {
            let total = estimates.iter().sum();
            for (child, estimate) in children.iter().zip(&estimates) {
                child.core().seed_baseline(*estimate);
            }
            CountOutcome {
                total,
                indeterminate: false,
            }
        };
        *self.counted.lock().expect("count cache poisoned") = Some(outcome);
        outcome
    }

    /// A child failed: adopt its cause, then cancel the whole group. The
    /// group resolves `Failed` even when a cancellation is already in
    /// flight.
    fn escalate(&self, child: &Arc<TaskCore>) {
        warn!(
            group = %self.core.id(),
            child = %child.id(),
            "child failed, cancelling remaining children"
        );
        if let Some(failure) = child.failure() {
            self.core.record_failure(failure);
        }
        self.core.set_failure_override();
        self.core.request_cancel();
    }

    fn cancel_children(&self) {
        for child in self.snapshot() {
            if !child.state().is_terminal() {
                child.cancel();
            }
        }
    }

    fn reset_children(&self) {
        *self.counted.lock().expect("count cache poisoned") = None;
        for child in self.snapshot() {
            if let Err(error) = child.reinitialize() {
                // Children only run inside the group, so a running child
                // here means the caller raced reinitialize with execute.
                warn!(child = %child.id(), %error, "failed to reinitialize child");
            }
        }
    }
}
