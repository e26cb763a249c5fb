//! # Events
//!
//! Transport carrying completed `CallStack` records from the engine thread to
//! the processing side. The channel is bounded and lossy by design: the
//! engine never blocks on a slow consumer, overflowing records are dropped
//! and counted instead.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::warn;

use crate::core::stack::CallStack;

/// Result of polling the events channel.
pub(crate) enum EventResult {
    Event(Box<CallStack>),
    Timeout,
    /// The producing side went away; no further event will come.
    Closed,
}

/// Producing half, owned by the engine. Cheap to clone.
#[derive(Clone)]
pub(crate) struct EventsTx {
    tx: Sender<Box<CallStack>>,
    dropped: Arc<AtomicU64>,
}

impl EventsTx {
    /// Enqueue a record, dropping it if the consumer is too far behind.
    pub(crate) fn send(&self, record: Box<CallStack>) {
        if let Err(TrySendError::Full(_)) = self.tx.try_send(record) {
            if self.dropped.fetch_add(1, Ordering::Relaxed) == 0 {
                warn!("Events channel is full, dropping records");
            }
        }
    }
}

/// Consuming half, owned by the processing loop.
pub(crate) struct EventsRx {
    rx: Receiver<Box<CallStack>>,
    dropped: Arc<AtomicU64>,
}

impl EventsRx {
    /// Wait for the next record, up to `timeout`.
    pub(crate) fn poll(&self, timeout: Duration) -> EventResult {
        match self.rx.recv_timeout(timeout) {
            Ok(record) => EventResult::Event(record),
            Err(RecvTimeoutError::Timeout) => EventResult::Timeout,
            Err(RecvTimeoutError::Disconnected) => EventResult::Closed,
        }
    }

    /// Non-blocking receive, mostly useful in tests.
    pub(crate) fn try_recv(&self) -> Option<Box<CallStack>> {
        self.rx.try_recv().ok()
    }

    /// Number of records lost to overflow so far.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Build a bounded events channel.
pub(crate) fn channel(capacity: usize) -> (EventsTx, EventsRx) {
    let (tx, rx) = bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));

    (
        EventsTx {
            tx,
            dropped: Arc::clone(&dropped),
        },
        EventsRx { rx, dropped },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_poll() {
        let (tx, rx) = channel(2);

        tx.send(Box::default());
        match rx.poll(Duration::from_millis(10)) {
            EventResult::Event(_) => (),
            _ => panic!("expected an event"),
        }
        match rx.poll(Duration::from_millis(10)) {
            EventResult::Timeout => (),
            _ => panic!("expected a timeout"),
        }
    }

    #[test]
    fn overflow_drops() {
        let (tx, rx) = channel(1);

        tx.send(Box::default());
        tx.send(Box::default());
        tx.send(Box::default());

        assert_eq!(rx.dropped(), 2);
        assert!(rx.try_recv().is_some());
        assert!(rx.try_recv().is_none());
    }

    #[test]
    fn closed_channel() {
        let (tx, rx) = channel(1);
        drop(tx);

        match rx.poll(Duration::from_millis(10)) {
            EventResult::Closed => (),
            _ => panic!("expected closed"),
        }
    }
}
