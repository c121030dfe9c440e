//! The asynchronous sender.

use std::{sync::Arc, thread};

use delegate::delegate;
use log::{debug, warn};
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    codec::Timestamp,
    error::{BuildError, SenderError},
    last_error::LastErrorSlot,
    rate_limited_warner::RateLimitedWarner,
};

use super::{
    config::{SenderBuilder, SenderConfig},
    packet::PacketBuilder,
    queue::EventQueue,
    transmitter::Transmitter,
    worker::spawn_worker,
};

/// Encodes on the calling thread and sends from a background worker.
///
/// Callers only enqueue, so `emit` never waits on the network. In blocking
/// mode a full queue makes `emit` wait for room; in circular mode the oldest
/// queued packet is evicted to the queue overflow handler instead.
///
/// Transport errors happen on the worker; they are published so that
/// [`last_error`](Self::last_error) reports them to callers without an
/// error of their own.
pub struct AsyncSender {
    packets: PacketBuilder,
    queue: Arc<EventQueue<Vec<u8>>>,
    errors: Arc<LastErrorSlot>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    warner: RateLimitedWarner,
}

impl AsyncSender {
    /// Sender for `tag` with default settings.
    pub fn new(tag: impl Into<String>) -> Result<Self, BuildError> {
        SenderBuilder::new(tag).build_async()
    }

    /// Build from a configuration object and start the worker thread.
    pub fn with_config(config: SenderConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let mut transmitter = Transmitter::from_config(&config)?;
        let errors = Arc::new(LastErrorSlot::new());
        if let Err(err) = transmitter.connect() {
            debug!("femtofluent: initial connection failed: {err}");
            errors.set(err.into());
        }
        let queue = Arc::new(EventQueue::new(
            config.queue_maxsize,
            config.queue_circular,
            config.queue_overflow_handler.clone(),
        ));
        let handle = spawn_worker(Arc::clone(&queue), transmitter, Arc::clone(&errors))?;
        Ok(Self {
            packets: PacketBuilder::from_config(&config),
            queue,
            errors,
            handle: Mutex::new(Some(handle)),
            warner: RateLimitedWarner::default(),
        })
    }

    /// Queue `data` labelled `label`, timestamped now.
    ///
    /// Returns `Ok(false)` only when the sender has been closed.
    pub fn emit<T: Serialize + ?Sized>(&self, label: &str, data: &T) -> Result<bool, SenderError> {
        self.emit_with_time(label, self.packets.now(), data)
    }

    /// Queue `data` labelled `label` with an explicit timestamp.
    pub fn emit_with_time<T: Serialize + ?Sized>(
        &self,
        label: &str,
        time: impl Into<Timestamp>,
        data: &T,
    ) -> Result<bool, SenderError> {
        let bytes = self.packets.event(label, time.into(), data, &self.errors)?;
        Ok(self.enqueue(bytes))
    }

    /// Queue several events as one batched packet.
    pub fn emit_batch<T: Serialize>(
        &self,
        label: &str,
        entries: &[(Timestamp, T)],
    ) -> Result<bool, SenderError> {
        let bytes = self.packets.batch(label, entries, &self.errors)?;
        Ok(self.enqueue(bytes))
    }

    fn enqueue(&self, bytes: Vec<u8>) -> bool {
        if self.queue.push(bytes) {
            return true;
        }
        self.warner.record_drop(|count| {
            warn!("femtofluent: dropped {count} packets emitted after close");
        });
        false
    }

    /// Stop the worker and wait for it to exit.
    ///
    /// With `flush` the worker sends everything already queued before it
    /// stops; without it queued packets are discarded. Idempotent, and no
    /// packet is processed after the first call returns.
    pub fn close(&self, flush: bool) {
        let mut handle = self.handle.lock();
        let Some(worker) = handle.take() else {
            return;
        };
        self.queue.close();
        if !flush {
            let discarded = self.queue.drain();
            if !discarded.is_empty() {
                debug!(
                    "femtofluent: discarded {} queued packets on close",
                    discarded.len()
                );
            }
        }
        self.queue.send_close();
        if worker.join().is_err() {
            warn!("femtofluent: sender worker panicked");
        }
        for late in self.queue.drain() {
            self.queue.overflow(&late);
        }
        self.queue.flush_warnings();
        self.warner.flush(|count| {
            warn!("femtofluent: dropped {count} packets emitted after close");
        });
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of packets waiting for the worker.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    delegate! {
        to self.errors {
            /// The calling thread's most recent error, or the worker's when
            /// the calling thread has none.
            #[call(get)]
            pub fn last_error(&self) -> Option<Arc<SenderError>>;
            /// Overwrite the calling thread's last error.
            #[call(set)]
            pub fn set_last_error(&self, error: SenderError);
            /// Forget the calling thread's last error and the worker's.
            #[call(clear)]
            pub fn clear_last_error(&self);
            /// Forget the last errors recorded by every thread.
            #[call(clear_all)]
            pub fn clear_errors_for_all_threads(&self);
        }
    }
}

impl Drop for AsyncSender {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl std::fmt::Debug for AsyncSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncSender")
            .field("packets", &self.packets)
            .field("queue_len", &self.queue.len())
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}
