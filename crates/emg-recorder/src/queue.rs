//! Bounded drop-oldest handoff between the ingestion and consumer threads

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use emg_core::EmgError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::warn;

/// Why a pop returned without an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived within the timeout; the producer is still open
    Timeout,
    /// The producer closed the channel and every item has been taken
    Closed,
}

/// Result of offering an item to the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Queued,
    /// The channel was full and its oldest item was evicted
    Evicted,
    /// The channel is closed; the item was discarded
    Closed,
}

/// Bounded multi-consumer channel that evicts the oldest item when full
///
/// Clones share the same queue. Closing drops the sending side, so a
/// consumer blocked in [`OutputChannel::blocking_pop`] wakes up once the
/// remaining items are drained.
pub struct OutputChannel<T> {
    sender: Arc<RwLock<Option<Sender<T>>>>,
    receiver: Receiver<T>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for OutputChannel<T> {
    fn clone(&self) -> Self {
        OutputChannel {
            sender: Arc::clone(&self.sender),
            receiver: self.receiver.clone(),
            capacity: self.capacity,
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> OutputChannel<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = bounded(capacity);
        OutputChannel {
            sender: Arc::new(RwLock::new(Some(sender))),
            receiver,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Items evicted so far
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Overflow condition, if any item was ever evicted
    pub fn overflow(&self) -> Option<EmgError> {
        match self.dropped() {
            0 => None,
            dropped => Some(EmgError::QueueOverflow { dropped }),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Queue an item without blocking, evicting the oldest one if full
    pub fn try_push(&self, item: T) -> PushOutcome {
        let guard = self.sender.read().unwrap_or_else(PoisonError::into_inner);
        let sender = match guard.as_ref() {
            Some(sender) => sender,
            None => return PushOutcome::Closed,
        };

        let mut item = item;
        let mut evicted = false;
        loop {
            match sender.try_send(item) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    item = rejected;
                    // A consumer may have freed the slot in the meantime
                    if self.receiver.try_recv().is_ok() {
                        evicted = true;
                        self.record_drop();
                    }
                }
                Err(TrySendError::Disconnected(_)) => return PushOutcome::Closed,
            }
        }

        if evicted {
            PushOutcome::Evicted
        } else {
            PushOutcome::Queued
        }
    }

    /// Wait up to `timeout` for the next item
    pub fn blocking_pop(&self, timeout: Duration) -> Result<T, PopError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Ok(item),
            Err(RecvTimeoutError::Timeout) => Err(PopError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(PopError::Closed),
        }
    }

    /// Take the next item if one is ready
    pub fn try_pop(&self) -> Option<T> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting items; queued items remain poppable
    pub fn close(&self) {
        self.sender
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped % 100 == 0 {
            warn!(dropped, capacity = self.capacity, "Output queue full, dropping oldest chunk");
        }
    }
}
