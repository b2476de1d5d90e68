//! `Task`: a single schedulable unit of work.
//!
//! A `Task` pairs a consumer-supplied [`Work`] body with the shared node
//! that holds its observable state. Handles are cheap to clone; the clones
//! all view the same unit. The worker pool drives a task through
//! [`Task::execute`], the contract described in the module docs of
//! [`crate::task`].

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use crate::error::{ComputeFailure, TaskError};
use crate::progress::Progress;

use super::core::TaskCore;
use super::work::{TaskContext, Work};
use super::{TaskEvent, TaskId, TaskState};

/// A unit of work with a lifecycle, cooperative cancellation, and coalesced
/// progress publishing.
#[derive(Clone)]
pub struct Task {
    core: Arc<TaskCore>,
    work: Arc<Mutex<Box<dyn Work>>>,
}

impl Task {
    /// Create a unit in `Ready` with the given title.
    pub fn new(title: impl Into<String>, work: impl Work + 'static) -> Self {
        Self::from_parts(TaskCore::new(title), Box::new(work))
    }

    pub(crate) fn from_parts(core: Arc<TaskCore>, work: Box<dyn Work>) -> Self {
        core.set_cancellable(work.is_cancellable());
        Self {
            core,
            work: Arc::new(Mutex::new(work)),
        }
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    // ---- observation -----------------------------------------------------

    pub fn id(&self) -> TaskId {
        self.core.id()
    }

    pub fn state(&self) -> TaskState {
        self.core.state()
    }

    pub fn progress(&self) -> Progress {
        self.core.progress()
    }

    pub fn title(&self) -> String {
        self.core.title()
    }

    pub fn message(&self) -> String {
        self.core.message()
    }

    pub fn progress_message(&self) -> String {
        self.core.progress_message()
    }

    pub fn time_message(&self) -> String {
        self.core.time_message()
    }

    /// The captured cause after a `Failed` resolution, if any.
    pub fn failure(&self) -> Option<ComputeFailure> {
        self.core.failure()
    }

    /// Whether cancellation has been requested (the cooperative flag).
    pub fn is_cancel_requested(&self) -> bool {
        self.core.is_cancel_requested()
    }

    /// Register an observer for coalesced notifications. Callbacks run on
    /// the unit's delivery sink thread, never on a worker thread.
    pub fn subscribe(&self, callback: impl Fn(&TaskEvent) + Send + Sync + 'static) {
        self.core.subscribe(callback);
    }

    /// Block until every notification published so far has been delivered.
    pub fn flush_events(&self) {
        self.core.flush();
    }

    // ---- lifecycle -------------------------------------------------------

    /// The execution contract invoked by the worker pool.
    ///
    /// Skips units that are no longer `Ready` (cancelled before start, or
    /// already terminal). Otherwise: transition to `Running`, invoke the
    /// `compute` body catching errors and panics, and resolve the terminal
    /// state with the priority order documented on the state machine. By the
    /// time this returns, any thread reading `state()` sees the terminal
    /// state.
    pub fn execute(&self) {
        if !self.core.begin_running() {
            return;
        }
        let result = {
            let mut work = self.work.lock().expect("work body poisoned");
            let cx = TaskContext::new(&self.core);
            catch_unwind(AssertUnwindSafe(|| work.compute(&cx)))
        };
        let failure = match result {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(ComputeFailure::new(error)),
            Err(payload) => Some(ComputeFailure::from_panic(payload)),
        };
        self.core.resolve(failure);
    }

    /// The counting-phase hook: ask the work body for its total estimate.
    pub(crate) fn request_total_work(&self) -> i64 {
        let mut work = self.work.lock().expect("work body poisoned");
        let cx = TaskContext::new(&self.core);
        work.total_work(&cx)
    }

    /// Request cooperative cancellation.
    ///
    /// A unit that never started moves straight to `Cancelled`; a running
    /// unit keeps running until its `compute` body observes the flag. Units
    /// whose work is not cancellable ignore the request.
    pub fn cancel(&self) {
        self.core.request_cancel();
    }

    /// Reset all mutable fields to their initial values and return to
    /// `Ready`.
    ///
    /// # Errors
    /// `InvalidState` while `Running`.
    pub fn reinitialize(&self) -> Result<(), TaskError> {
        let state = self.core.state();
        if state == TaskState::Running {
            return Err(TaskError::InvalidState {
                op: "reinitialize",
                state,
            });
        }
        // Groups cascade to their children through this hook before the
        // node itself is cleared.
        self.core.run_reset_hooks();
        self.core.reset();
        Ok(())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::WorkFn;
    use super::*;
    use crate::progress::UNKNOWN_WORK;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    fn noop() -> Task {
        Task::new("noop", WorkFn::new(|_| Ok(())))
    }

    #[test]
    fn test_successful_run() {
        let task = Task::new(
            "steps",
            WorkFn::new(|cx| {
                for i in 0..=10 {
                    cx.update("stepping", i, 10);
                }
                Ok(())
            }),
        );
        task.execute();
        assert_eq!(task.state(), TaskState::Succeeded);
        assert_eq!(task.progress(), Progress::clamped(10, 10));
        assert_eq!(task.message(), "stepping");
    }

    #[test]
    fn test_error_resolves_failed_with_cause() {
        let task = Task::new("doomed", WorkFn::new(|_| anyhow::bail!("bad sector")));
        task.execute();
        assert_eq!(task.state(), TaskState::Failed);
        let failure = task.failure().expect("cause must be captured");
        assert!(failure.cause().to_string().contains("bad sector"));
    }

    #[test]
    fn test_panic_is_caught_and_resolves_failed() {
        let task = Task::new("panicky", WorkFn::new(|_| panic!("unexpected eof")));
        task.execute();
        assert_eq!(task.state(), TaskState::Failed);
        let failure = task.failure().expect("cause must be captured");
        assert!(failure.cause().to_string().contains("unexpected eof"));
    }

    #[test]
    fn test_cancel_before_start_goes_straight_to_cancelled() {
        let task = noop();
        task.cancel();
        assert_eq!(task.state(), TaskState::Cancelled);
        // The substrate skips it entirely afterwards.
        task.execute();
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_cooperative_cancel_while_running() {
        let (started_tx, started_rx) = mpsc::channel();
        let task = Task::new(
            "looper",
            WorkFn::new(move |cx| {
                started_tx.send(()).ok();
                while !cx.is_cancelled() {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                Ok(())
            }),
        );
        let runner = {
            let task = task.clone();
            std::thread::spawn(move || task.execute())
        };
        started_rx.recv().unwrap();
        assert_eq!(task.state(), TaskState::Running);
        task.cancel();
        runner.join().unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_cancel_wins_over_local_failure() {
        // A body that observes cancellation and bails out with an error:
        // the honored cancellation decides the terminal state.
        let task = Task::new(
            "quitter",
            WorkFn::new(|cx| {
                while !cx.is_cancelled() {
                    std::thread::sleep(std::time::Duration::from_millis(1));
                }
                anyhow::bail!("interrupted")
            }),
        );
        let runner = {
            let task = task.clone();
            std::thread::spawn(move || task.execute())
        };
        while task.state() != TaskState::Running {
            std::thread::yield_now();
        }
        task.cancel();
        runner.join().unwrap();
        assert_eq!(task.state(), TaskState::Cancelled);
        // The cause is still retrievable for inspection.
        assert!(task.failure().is_some());
    }

    #[test]
    fn test_non_cancellable_unit_ignores_cancel() {
        let task = Task::new("stubborn", WorkFn::new(|_| Ok(())).not_cancellable());
        task.cancel();
        assert_eq!(task.state(), TaskState::Ready);
        task.execute();
        assert_eq!(task.state(), TaskState::Succeeded);
    }

    #[test]
    fn test_reinitialize_while_running_is_rejected() {
        let hold = Arc::new(AtomicBool::new(true));
        let task = {
            let hold = Arc::clone(&hold);
            Task::new(
                "held",
                WorkFn::new(move |_| {
                    while hold.load(Ordering::SeqCst) {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                    Ok(())
                }),
            )
        };
        let runner = {
            let task = task.clone();
            std::thread::spawn(move || task.execute())
        };
        while task.state() != TaskState::Running {
            std::thread::yield_now();
        }
        let err = task.reinitialize().unwrap_err();
        assert!(matches!(err, TaskError::InvalidState { .. }));
        hold.store(false, Ordering::SeqCst);
        runner.join().unwrap();
    }

    #[test]
    fn test_reinitialize_restores_initial_fields() {
        let task = Task::new(
            "fresh",
            WorkFn::new(|cx| {
                cx.update("half way", 5, 10);
                Ok(())
            }),
        );
        task.execute();
        assert_eq!(task.state(), TaskState::Succeeded);

        task.reinitialize().unwrap();
        assert_eq!(task.state(), TaskState::Ready);
        assert_eq!(task.progress(), Progress::indeterminate());
        assert_eq!(task.progress().work_done, UNKNOWN_WORK);
        assert_eq!(task.title(), "fresh");
        assert!(task.message().is_empty());
        assert!(task.progress_message().is_empty());
        assert!(task.time_message().is_empty());
        assert!(!task.is_cancel_requested());

        // The unit is fully runnable again.
        task.execute();
        assert_eq!(task.state(), TaskState::Succeeded);
    }

    #[test]
    fn test_reinitialize_after_cancel_clears_flag() {
        let task = noop();
        task.cancel();
        assert_eq!(task.state(), TaskState::Cancelled);
        task.reinitialize().unwrap();
        assert!(!task.is_cancel_requested());
        task.execute();
        assert_eq!(task.state(), TaskState::Succeeded);
    }

    #[test]
    fn test_terminal_state_published_to_subscribers() {
        let task = noop();
        let (tx, rx) = mpsc::channel();
        task.subscribe(move |event| {
            if let TaskEvent::State(state) = event {
                tx.send(*state).ok();
            }
        });
        task.execute();
        task.flush_events();
        let states: Vec<TaskState> = rx.try_iter().collect();
        assert_eq!(states.last(), Some(&TaskState::Succeeded));
    }

    #[test]
    fn test_retitle_is_published_to_subscribers() {
        let task = Task::new(
            "original",
            WorkFn::new(|cx| {
                cx.set_title("renamed");
                Ok(())
            }),
        );
        let (tx, rx) = mpsc::channel();
        task.subscribe(move |event| {
            if let TaskEvent::Title(title) = event {
                tx.send(title.clone()).ok();
            }
        });
        task.execute();
        task.flush_events();
        assert_eq!(task.title(), "renamed");
        let titles: Vec<String> = rx.try_iter().collect();
        assert_eq!(titles.last().map(String::as_str), Some("renamed"));
    }

    #[test]
    fn test_overshooting_progress_is_clamped() {
        let task = Task::new(
            "eager",
            WorkFn::new(|cx| {
                cx.update_progress(250, 100);
                Ok(())
            }),
        );
        task.execute();
        assert_eq!(task.progress(), Progress::clamped(100, 100));
    }
}
