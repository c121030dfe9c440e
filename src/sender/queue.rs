//! Bounded hand-off between caller threads and a background consumer.
//!
//! Two policies apply when the queue is full: blocking mode makes the caller
//! wait, circular mode evicts the oldest packet to the overflow handler. A
//! [`QueueItem::Close`] sentinel tells the consumer to stop.

use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, unbounded};
use log::warn;
use parking_lot::Mutex;

use crate::{
    pending::{OverflowHandler, call_overflow_handler},
    rate_limited_warner::RateLimitedWarner,
};

/// Entries seen by the consumer.
#[derive(Debug)]
pub enum QueueItem<T> {
    Item(T),
    Close,
}

/// Multi-producer queue with a blocking or circular overflow policy.
pub struct EventQueue<T> {
    tx: Sender<QueueItem<T>>,
    rx: Receiver<QueueItem<T>>,
    circular: bool,
    // Held across circular pushes so eviction and the close flag stay consistent.
    closed: Mutex<bool>,
    on_overflow: Option<OverflowHandler>,
    send_timeout: Option<Duration>,
    warner: RateLimitedWarner,
}

impl<T: AsRef<[u8]>> EventQueue<T> {
    /// `maxsize == 0` makes the queue unbounded.
    pub fn new(maxsize: usize, circular: bool, on_overflow: Option<OverflowHandler>) -> Self {
        let (tx, rx) = if maxsize == 0 {
            unbounded()
        } else {
            bounded(maxsize)
        };
        Self {
            tx,
            rx,
            circular,
            closed: Mutex::new(false),
            on_overflow,
            send_timeout: None,
            warner: RateLimitedWarner::default(),
        }
    }

    /// Bound how long a blocking push waits for room. A push that times out
    /// hands its item to the overflow handler.
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Enqueue `item`, applying the overflow policy. Returns `false` when
    /// the queue has been closed.
    pub fn push(&self, item: T) -> bool {
        if self.circular {
            self.push_circular(item)
        } else {
            self.push_blocking(item)
        }
    }

    fn push_blocking(&self, item: T) -> bool {
        if *self.closed.lock() {
            return false;
        }
        let Some(timeout) = self.send_timeout else {
            return self.tx.send(QueueItem::Item(item)).is_ok();
        };
        match self.tx.send_timeout(QueueItem::Item(item), timeout) {
            Ok(()) => true,
            Err(err) => {
                if let QueueItem::Item(item) = err.into_inner() {
                    self.overflow(item.as_ref());
                }
                false
            }
        }
    }

    fn push_circular(&self, item: T) -> bool {
        let closed = self.closed.lock();
        if *closed {
            return false;
        }
        let mut item = QueueItem::Item(item);
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if let Ok(QueueItem::Item(oldest)) = self.rx.try_recv() {
                        self.overflow(oldest.as_ref());
                    }
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Hand a discarded packet to the overflow handler.
    pub fn overflow(&self, bytes: &[u8]) {
        self.warner.record_drop(|count| {
            warn!("femtofluent: queue overflow; discarded {count} packets");
        });
        call_overflow_handler(self.on_overflow.as_ref(), bytes);
    }

    /// Block until an entry is available.
    pub fn pop(&self) -> Option<QueueItem<T>> {
        self.rx.recv().ok()
    }

    /// Take an entry if one is immediately available.
    pub fn try_pop(&self) -> Option<QueueItem<T>> {
        self.rx.try_recv().ok()
    }

    /// Refuse further pushes. Returns `false` if already closed.
    pub fn close(&self) -> bool {
        let mut closed = self.closed.lock();
        !std::mem::replace(&mut *closed, true)
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }

    /// Enqueue the stop sentinel, waiting for room if necessary.
    pub fn send_close(&self) {
        // Both ends live in `self`, so the channel cannot disconnect.
        let _ = self.tx.send(QueueItem::Close);
    }

    /// Remove and return every queued item.
    pub fn drain(&self) -> Vec<T> {
        self.rx
            .try_iter()
            .filter_map(|entry| match entry {
                QueueItem::Item(item) => Some(item),
                QueueItem::Close => None,
            })
            .collect()
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Report drops not yet covered by a warning.
    pub fn flush_warnings(&self) {
        self.warner.flush(|count| {
            warn!("femtofluent: queue overflow; discarded {count} packets");
        });
    }
}
