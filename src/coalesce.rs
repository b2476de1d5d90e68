//! Single-slot coalescing publisher.
//!
//! A [`Coalescer`] funnels a high-frequency stream of values into
//! low-frequency deliveries to one consumer. The consumer only ever sees the
//! *latest* value; superseded values are coalesced away, never queued.
//!
//! # Guarantees
//! - At most one delivery is in flight per slot at any time.
//! - The value delivered is the most recent one published before the drain
//!   job ran.
//! - Once publishing stops, the last published value is delivered exactly
//!   once; it is never starved.
//!
//! The drain job runs on the node's [`DeliverySink`](crate::sink), so all
//! slots bound to the same sink deliver in a single, ordered stream.

use std::sync::{Arc, Mutex};

use crate::sink::SinkHandle;

struct Shared<T> {
    slot: Mutex<Option<T>>,
    sink: SinkHandle,
    deliver: Box<dyn Fn(T) + Send + Sync>,
}

/// Latest-value publisher for one observable field.
pub(crate) struct Coalescer<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send + 'static> Coalescer<T> {
    pub(crate) fn new(sink: SinkHandle, deliver: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                sink,
                deliver: Box::new(deliver),
            }),
        }
    }

    /// Publish a value. Safe from any thread, arbitrarily often; costs one
    /// O(1) slot swap plus, when the slot was empty, one sink submission.
    pub(crate) fn publish(&self, value: T) {
        let was_empty = {
            let mut slot = self.shared.slot.lock().expect("coalescer slot poisoned");
            let was_empty = slot.is_none();
            *slot = Some(value);
            was_empty
        };
        if was_empty {
            let shared = Arc::clone(&self.shared);
            self.shared.sink.submit(move || {
                let taken = shared
                    .slot
                    .lock()
                    .expect("coalescer slot poisoned")
                    .take();
                if let Some(value) = taken {
                    (shared.deliver)(value);
                }
            });
        }
    }
}
