//! Execution substrate: a fixed-size work-stealing pool.
//!
//! Thin wrapper over a `rayon::ThreadPool`. A pool instance is created per
//! group run and dropped when the run returns, so resource lifetime is
//! scoped to a single execution and runs never interfere with each other.

use tracing::debug;

use crate::error::PoolError;
use crate::task::Task;

/// Fixed-size work-stealing pool that runs tasks concurrently.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    /// Build a pool with an explicit number of worker threads.
    pub fn new(threads: usize) -> Result<Self, PoolError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("tasktree-worker-{i}"))
            .build()?;
        Ok(Self { pool })
    }

    /// Build a pool sized to the available hardware parallelism.
    pub fn with_default_parallelism() -> Result<Self, PoolError> {
        let threads = std::thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(1);
        Self::new(threads)
    }

    /// Submit every task as an independent job and block until all of them
    /// have returned. Tasks record their own outcome; a failing or panicking
    /// body never unwinds into the pool.
    pub fn run_all(&self, tasks: &[Task]) {
        debug!(tasks = tasks.len(), "submitting batch");
        self.pool.scope(|scope| {
            for task in tasks {
                let task = task.clone();
                scope.spawn(move |_| task.execute());
            }
        });
    }

    /// Counting-phase helper: gather every task's total-work estimate, in
    /// child order, running the hooks concurrently on the pool.
    pub(crate) fn estimate_all(&self, tasks: &[Task]) -> Vec<i64> {
        let mut estimates = vec![0_i64; tasks.len()];
        self.pool.scope(|scope| {
            for (slot, task) in estimates.iter_mut().zip(tasks) {
                let task = task.clone();
                scope.spawn(move |_| *slot = task.request_total_work());
            }
        });
        estimates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskState, WorkFn};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_run_all_blocks_until_every_task_finished() {
        let pool = WorkerPool::new(4).unwrap();
        let finished = Arc::new(AtomicUsize::new(0));
        let tasks: Vec<Task> = (0..16)
            .map(|i| {
                let finished = Arc::clone(&finished);
                Task::new(
                    format!("job-{i}"),
                    WorkFn::new(move |_| {
                        std::thread::sleep(std::time::Duration::from_millis(1));
                        finished.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }),
                )
            })
            .collect();

        pool.run_all(&tasks);

        assert_eq!(finished.load(Ordering::SeqCst), 16);
        for task in &tasks {
            assert_eq!(task.state(), TaskState::Succeeded);
        }
    }

    #[test]
    fn test_run_all_skips_pre_cancelled_tasks() {
        let pool = WorkerPool::new(2).unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let task = {
            let ran = Arc::clone(&ran);
            Task::new(
                "skipped",
                WorkFn::new(move |_| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
            )
        };
        task.cancel();
        pool.run_all(std::slice::from_ref(&task));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn test_estimates_preserve_child_order() {
        let pool = WorkerPool::new(4).unwrap();
        let tasks: Vec<Task> = (0..8_i64)
            .map(|i| {
                Task::new(
                    format!("est-{i}"),
                    WorkFn::new(|_| Ok(())).with_total(i * 10),
                )
            })
            .collect();
        let estimates = pool.estimate_all(&tasks);
        assert_eq!(estimates, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }
}
