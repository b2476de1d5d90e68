//! Dedicated single-threaded delivery sink.
//!
//! Every task node owns one sink: a thread that runs drain jobs scheduled by
//! the node's coalescers. Producers (worker threads reporting progress) never
//! run observer callbacks themselves; they only enqueue, which decouples
//! producer throughput from consumer throughput.
//!
//! # Ordering
//! Jobs run strictly in submission order, so deliveries scheduled on the same
//! sink never race each other.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use tracing::trace;

type Job = Box<dyn FnOnce() + Send>;

enum Command {
    Run(Job),
    Flush(mpsc::Sender<()>),
    Shutdown,
}

/// Owning side of the sink. Dropping it stops the delivery thread; jobs
/// already queued before shutdown still run.
pub(crate) struct DeliverySink {
    tx: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

/// Cheap handle used by coalescers to schedule drain jobs.
#[derive(Clone)]
pub(crate) struct SinkHandle {
    tx: mpsc::Sender<Command>,
}

impl DeliverySink {
    pub(crate) fn spawn(name: &str) -> Self {
        let (tx, rx) = mpsc::channel::<Command>();
        let thread_name = format!("tasktree-sink-{name}");
        let worker = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        Command::Run(job) => job(),
                        Command::Flush(ack) => {
                            // Sender may be gone if the flusher timed out.
                            let _ = ack.send(());
                        }
                        Command::Shutdown => break,
                    }
                }
                trace!("delivery sink stopped");
            })
            .expect("failed to spawn delivery sink thread");
        Self {
            tx,
            worker: Some(worker),
        }
    }

    pub(crate) fn handle(&self) -> SinkHandle {
        SinkHandle {
            tx: self.tx.clone(),
        }
    }

    /// Block until every job submitted before this call has run.
    pub(crate) fn flush(&self) {
        let (ack_tx, ack_rx) = mpsc::channel();
        if self.tx.send(Command::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }
}

impl SinkHandle {
    /// Schedule a job; silently dropped if the sink already shut down.
    pub(crate) fn submit(&self, job: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Command::Run(Box::new(job)));
    }
}

impl Drop for DeliverySink {
    fn drop(&mut self) {
        let _ = self.tx.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_jobs_run_in_submission_order() {
        let sink = DeliverySink::spawn("order");
        let handle = sink.handle();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        for i in 0..64 {
            let seen = Arc::clone(&seen);
            handle.submit(move || seen.lock().unwrap().push(i));
        }
        sink.flush();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_flush_waits_for_queued_jobs() {
        let sink = DeliverySink::spawn("flush");
        let handle = sink.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            handle.submit(move || {
                std::thread::sleep(std::time::Duration::from_millis(1));
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        sink.flush();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_submit_after_shutdown_is_ignored() {
        let handle = {
            let sink = DeliverySink::spawn("gone");
            sink.handle()
        };
        // Must not panic or block.
        handle.submit(|| {});
    }
}
