//! Shared task node: the atomic state machine, progress counters, message
//! fields, and the coalesced publishing machinery behind one task.
//!
//! # Invariants
//! - `state` is only read/written with `SeqCst` ordering; a terminal state
//!   observed by the submitter is never stale.
//! - The progress book mutex doubles as the group aggregation lock for
//!   groups; it is held only for O(1) arithmetic, never across `compute` or
//!   observer callbacks.
//! - Lock ordering is fixed child-then-parent. No engine path locks a
//!   child's book while holding the parent's.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::coalesce::Coalescer;
use crate::error::{ComputeFailure, TaskError};
use crate::progress::Progress;
use crate::sink::DeliverySink;

use super::{TaskEvent, TaskId, TaskState};

type EventCallback = Arc<dyn Fn(&TaskEvent) + Send + Sync>;
type StateHook = Box<dyn Fn(TaskState) + Send + Sync>;
type Hook = Box<dyn Fn() + Send + Sync>;

/// Observer fan-out shared between the node and its coalescers.
#[derive(Default)]
struct Subscribers {
    callbacks: Mutex<Vec<EventCallback>>,
}

impl Subscribers {
    fn emit(&self, event: &TaskEvent) {
        let callbacks = self
            .callbacks
            .lock()
            .expect("subscriber list poisoned")
            .clone();
        for callback in callbacks {
            callback(event);
        }
    }
}

/// Progress counters plus the baseline last folded into the parent.
///
/// The baseline is what makes delta accounting work: children report
/// absolute values against their own counters, and only `new - baseline` is
/// meaningful to the parent. A group seeds each child's baseline with the
/// counting-phase estimate so the estimate is not double counted.
struct ProgressBook {
    current: Progress,
    baseline: Progress,
}

impl Default for ProgressBook {
    fn default() -> Self {
        Self {
            current: Progress::indeterminate(),
            baseline: Progress::indeterminate(),
        }
    }
}

#[derive(Default)]
struct Messages {
    title: String,
    message: String,
    progress_message: String,
    time_message: String,
}

/// One coalescer per observable field, all bound to the node's sink.
struct Channels {
    state: Coalescer<TaskState>,
    title: Coalescer<String>,
    message: Coalescer<String>,
    progress_message: Coalescer<String>,
    time_message: Coalescer<String>,
    progress: Coalescer<Progress>,
}

pub(crate) struct TaskCore {
    id: TaskId,
    initial_title: String,
    state: AtomicU8,
    cancel_requested: AtomicBool,
    cancellable: AtomicBool,
    /// Set when a group adopts a child failure; makes `Failed` win over
    /// `Cancelled` at resolution.
    failure_override: AtomicBool,
    /// Numeric channel suppressed for the remainder of the run (group runs
    /// with an indeterminate child).
    muted: AtomicBool,
    failure: Mutex<Option<ComputeFailure>>,
    book: Mutex<ProgressBook>,
    started_at: Mutex<Option<Instant>>,
    parent: Mutex<Option<Weak<TaskCore>>>,
    strings: Mutex<Messages>,
    subscribers: Arc<Subscribers>,
    state_hooks: Mutex<Vec<StateHook>>,
    cancel_hooks: Mutex<Vec<Hook>>,
    reset_hooks: Mutex<Vec<Hook>>,
    channels: Channels,
    sink: DeliverySink,
}

impl TaskCore {
    pub(crate) fn new(title: impl Into<String>) -> Arc<Self> {
        let id = TaskId::new();
        let title = title.into();
        let sink = DeliverySink::spawn(&id.as_uuid().simple().to_string()[..8]);
        let subscribers = Arc::new(Subscribers::default());
        let handle = sink.handle();

        macro_rules! channel {
            ($variant:ident) => {{
                let subscribers = Arc::clone(&subscribers);
                Coalescer::new(handle.clone(), move |value| {
                    subscribers.emit(&TaskEvent::$variant(value))
                })
            }};
        }

        let channels = Channels {
            state: channel!(State),
            title: channel!(Title),
            message: channel!(Message),
            progress_message: channel!(ProgressMessage),
            time_message: channel!(TimeMessage),
            progress: channel!(Progress),
        };

        Arc::new(Self {
            id,
            initial_title: title.clone(),
            state: AtomicU8::new(TaskState::Ready as u8),
            cancel_requested: AtomicBool::new(false),
            cancellable: AtomicBool::new(true),
            failure_override: AtomicBool::new(false),
            muted: AtomicBool::new(false),
            failure: Mutex::new(None),
            book: Mutex::new(ProgressBook::default()),
            started_at: Mutex::new(None),
            parent: Mutex::new(None),
            strings: Mutex::new(Messages {
                title,
                ..Messages::default()
            }),
            subscribers,
            state_hooks: Mutex::new(Vec::new()),
            cancel_hooks: Mutex::new(Vec::new()),
            reset_hooks: Mutex::new(Vec::new()),
            channels,
            sink,
        })
    }

    // ---- identity & snapshots -------------------------------------------

    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    pub(crate) fn state(&self) -> TaskState {
        TaskState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub(crate) fn progress(&self) -> Progress {
        self.book.lock().expect("progress book poisoned").current
    }

    pub(crate) fn title(&self) -> String {
        self.strings.lock().expect("messages poisoned").title.clone()
    }

    pub(crate) fn message(&self) -> String {
        self.strings
            .lock()
            .expect("messages poisoned")
            .message
            .clone()
    }

    pub(crate) fn progress_message(&self) -> String {
        self.strings
            .lock()
            .expect("messages poisoned")
            .progress_message
            .clone()
    }

    pub(crate) fn time_message(&self) -> String {
        self.strings
            .lock()
            .expect("messages poisoned")
            .time_message
            .clone()
    }

    pub(crate) fn failure(&self) -> Option<ComputeFailure> {
        self.failure.lock().expect("failure slot poisoned").clone()
    }

    // ---- wiring ----------------------------------------------------------

    pub(crate) fn set_cancellable(&self, cancellable: bool) {
        self.cancellable.store(cancellable, Ordering::SeqCst);
    }

    pub(crate) fn subscribe(&self, callback: impl Fn(&TaskEvent) + Send + Sync + 'static) {
        self.subscribers
            .callbacks
            .lock()
            .expect("subscriber list poisoned")
            .push(Arc::new(callback));
    }

    pub(crate) fn add_state_hook(&self, hook: impl Fn(TaskState) + Send + Sync + 'static) {
        self.state_hooks
            .lock()
            .expect("state hooks poisoned")
            .push(Box::new(hook));
    }

    pub(crate) fn add_cancel_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.cancel_hooks
            .lock()
            .expect("cancel hooks poisoned")
            .push(Box::new(hook));
    }

    pub(crate) fn add_reset_hook(&self, hook: impl Fn() + Send + Sync + 'static) {
        self.reset_hooks
            .lock()
            .expect("reset hooks poisoned")
            .push(Box::new(hook));
    }

    /// Set the parent back-reference. Exactly once, before the group runs.
    pub(crate) fn attach_parent(&self, parent: Weak<TaskCore>) -> Result<(), TaskError> {
        let mut slot = self.parent.lock().expect("parent slot poisoned");
        if slot.is_some() {
            return Err(TaskError::AlreadyAttached);
        }
        *slot = Some(parent);
        Ok(())
    }

    pub(crate) fn parent(&self) -> Option<Arc<TaskCore>> {
        self.parent
            .lock()
            .expect("parent slot poisoned")
            .as_ref()
            .and_then(Weak::upgrade)
    }

    // ---- state machine ---------------------------------------------------

    fn enter_state(&self, to: TaskState) {
        self.state.store(to as u8, Ordering::SeqCst);
        trace!(task = %self.id, state = ?to, "state transition");
        self.channels.state.publish(to);
        // Hooks are engine-internal (failure escalation); they must see the
        // transition synchronously, not on the sink thread. Taken out of the
        // lock so a hook may touch this core without deadlocking.
        let hooks = std::mem::take(&mut *self.state_hooks.lock().expect("state hooks poisoned"));
        for hook in &hooks {
            hook(to);
        }
        self.state_hooks
            .lock()
            .expect("state hooks poisoned")
            .extend(hooks);
    }

    /// `Ready -> Running`, recording the start timestamp. Returns `false`
    /// when the unit is not `Ready` (already cancelled, already terminal).
    pub(crate) fn begin_running(&self) -> bool {
        if self
            .state
            .compare_exchange(
                TaskState::Ready as u8,
                TaskState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }
        *self.started_at.lock().expect("start timestamp poisoned") = Some(Instant::now());
        debug!(task = %self.id, "running");
        self.channels.state.publish(TaskState::Running);
        true
    }

    /// Resolve `Running` into a terminal state.
    ///
    /// Priority: an adopted child failure wins over everything; an honored
    /// cancellation wins over the unit's own abnormal termination; otherwise
    /// the outcome of `compute` decides.
    pub(crate) fn resolve(&self, failure: Option<ComputeFailure>) {
        let failed_locally = failure.is_some();
        if let Some(failure) = failure {
            self.record_failure(failure);
        }
        let to = if self.failure_override.load(Ordering::SeqCst) {
            TaskState::Failed
        } else if self.cancel_requested.load(Ordering::SeqCst)
            && self.cancellable.load(Ordering::SeqCst)
        {
            TaskState::Cancelled
        } else if failed_locally {
            TaskState::Failed
        } else {
            TaskState::Succeeded
        };
        match to {
            TaskState::Failed => {
                warn!(task = %self.id, failure = ?self.failure(), "task failed")
            }
            _ => debug!(task = %self.id, state = ?to, "task finished"),
        }
        self.enter_state(to);
    }

    pub(crate) fn record_failure(&self, failure: ComputeFailure) {
        let mut slot = self.failure.lock().expect("failure slot poisoned");
        // First cause wins; later ones raced and lost.
        if slot.is_none() {
            *slot = Some(failure);
        }
    }

    pub(crate) fn set_failure_override(&self) {
        self.failure_override.store(true, Ordering::SeqCst);
    }

    // ---- cancellation ----------------------------------------------------

    pub(crate) fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Request cooperative cancellation.
    ///
    /// Cancel hooks (a group's cascade over its children) run before the
    /// unit's own transition, so children are asked to stop first. A unit
    /// that never started moves straight to `Cancelled`.
    pub(crate) fn request_cancel(&self) {
        if !self.cancellable.load(Ordering::SeqCst) {
            return;
        }
        if self.state().is_terminal() {
            return;
        }
        if self.cancel_requested.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(task = %self.id, "cancellation requested");
        let hooks = std::mem::take(
            &mut *self.cancel_hooks.lock().expect("cancel hooks poisoned"),
        );
        for hook in &hooks {
            hook();
        }
        self.cancel_hooks
            .lock()
            .expect("cancel hooks poisoned")
            .extend(hooks);
        if self
            .state
            .compare_exchange(
                TaskState::Ready as u8,
                TaskState::Cancelled as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.channels.state.publish(TaskState::Cancelled);
        }
    }

    // ---- progress --------------------------------------------------------

    pub(crate) fn mute_numeric(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub(crate) fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    /// Seed the delta baseline with the counting-phase estimate, so a child
    /// reporting its estimated total adds no spurious delta to the parent.
    pub(crate) fn seed_baseline(&self, estimate: i64) {
        let mut book = self.book.lock().expect("progress book poisoned");
        book.baseline = Progress {
            work_done: 0,
            total_work: estimate.max(0),
        };
    }

    /// Install the aggregate starting point `(0, total)` and publish it.
    pub(crate) fn init_aggregate(&self, total: i64) {
        let aggregate = Progress::clamped(0, total);
        self.book.lock().expect("progress book poisoned").current = aggregate;
        self.republish_aggregate(aggregate);
    }

    /// Record a progress report and fold its delta into the parent.
    ///
    /// The incremental contribution is `new - baseline`; only the reporting
    /// thread writes this unit's book, so computing and consuming the delta
    /// under the unit's own lock is race-free. The parent's book mutex is
    /// the group aggregation lock; it is taken afterwards, never nested.
    pub(crate) fn update_progress(&self, work_done: i64, total_work: i64) {
        if self.is_muted() {
            return;
        }
        let new = Progress::clamped(work_done, total_work);
        let mut delta: Option<(i64, i64)> = None;
        {
            let mut book = self.book.lock().expect("progress book poisoned");
            book.current = new;
            if !new.is_indeterminate() {
                let base = book.baseline;
                delta = Some((
                    new.work_done - base.work_done.max(0),
                    new.total_work - base.total_work.max(0),
                ));
                book.baseline = new;
            }
        }
        self.channels.progress.publish(new);
        if let (Some((delta_done, delta_total)), Some(parent)) = (delta, self.parent()) {
            parent.propagate_delta(delta_done, delta_total);
        }
    }

    /// Fold a child's incremental contribution into the aggregate, then
    /// republish and pass the delta further up the tree. The critical
    /// section is O(1) arithmetic.
    fn propagate_delta(&self, delta_done: i64, delta_total: i64) {
        if (delta_done == 0 && delta_total == 0) || self.is_muted() {
            return;
        }
        {
            let mut book = self.book.lock().expect("progress book poisoned");
            let cur = book.current;
            let next = Progress::clamped(
                cur.work_done.max(0) + delta_done,
                cur.total_work.max(0) + delta_total,
            );
            book.current = next;
            // Published while the lock is held so concurrent children cannot
            // reorder aggregates; a publish is a slot swap, nothing in it
            // ever takes a progress book lock.
            self.republish_aggregate(next);
        }
        if let Some(parent) = self.parent() {
            parent.propagate_delta(delta_done, delta_total);
        }
    }

    /// Publish the aggregate and the derived progress/time messages.
    pub(crate) fn republish_aggregate(&self, aggregate: Progress) {
        self.channels.progress.publish(aggregate);
        let progress_message = aggregate.to_string();
        let time_message = self.derive_time_message(aggregate);
        {
            let mut strings = self.strings.lock().expect("messages poisoned");
            strings.progress_message = progress_message.clone();
            strings.time_message = time_message.clone();
        }
        self.channels.progress_message.publish(progress_message);
        self.channels.time_message.publish(time_message);
    }

    fn derive_time_message(&self, aggregate: Progress) -> String {
        let started = *self.started_at.lock().expect("start timestamp poisoned");
        let Some(started) = started else {
            return String::new();
        };
        let elapsed = started.elapsed().as_secs();
        match aggregate.fraction() {
            Some(fraction) if fraction > 0.0 => {
                let remaining = (elapsed as f64 * (1.0 - fraction) / fraction).round() as u64;
                format!("{elapsed}s elapsed, ~{remaining}s remaining")
            }
            _ => format!("{elapsed}s elapsed"),
        }
    }

    // ---- messages --------------------------------------------------------

    pub(crate) fn set_title(&self, title: String) {
        self.strings.lock().expect("messages poisoned").title = title.clone();
        self.channels.title.publish(title);
    }

    pub(crate) fn set_message(&self, message: String) {
        self.strings.lock().expect("messages poisoned").message = message.clone();
        self.channels.message.publish(message);
    }

    pub(crate) fn set_progress_message(&self, message: String) {
        self.strings
            .lock()
            .expect("messages poisoned")
            .progress_message = message.clone();
        self.channels.progress_message.publish(message);
    }

    pub(crate) fn set_time_message(&self, message: String) {
        self.strings.lock().expect("messages poisoned").time_message = message.clone();
        self.channels.time_message.publish(message);
    }

    // ---- reinitialization ------------------------------------------------

    pub(crate) fn run_reset_hooks(&self) {
        let hooks = std::mem::take(&mut *self.reset_hooks.lock().expect("reset hooks poisoned"));
        for hook in &hooks {
            hook();
        }
        self.reset_hooks
            .lock()
            .expect("reset hooks poisoned")
            .extend(hooks);
    }

    /// Clear every mutable field back to its initial value and return to
    /// `Ready`. The caller guarantees the unit is not `Running`.
    pub(crate) fn reset(&self) {
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.failure_override.store(false, Ordering::SeqCst);
        self.muted.store(false, Ordering::SeqCst);
        *self.failure.lock().expect("failure slot poisoned") = None;
        *self.started_at.lock().expect("start timestamp poisoned") = None;
        *self.book.lock().expect("progress book poisoned") = ProgressBook::default();
        {
            let mut strings = self.strings.lock().expect("messages poisoned");
            strings.title = self.initial_title.clone();
            strings.message.clear();
            strings.progress_message.clear();
            strings.time_message.clear();
        }
        self.enter_state(TaskState::Ready);
    }

    /// Block until every notification published so far has been delivered.
    pub(crate) fn flush(&self) {
        self.sink.flush();
    }
}
