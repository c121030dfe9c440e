//! Caller-facing handle to the connection manager.

use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use delegate::delegate;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::Notify;

use crate::{
    codec::{ForwardOptions, Timestamp},
    error::{BuildError, SenderError},
    last_error::LastErrorSlot,
    rate_limited_warner::RateLimitedWarner,
    sender::{packet::PacketBuilder, queue::EventQueue},
};

use super::{
    config::{ManagerBuilder, ManagerConfig},
    event_loop::{EventLoop, LoopSettings},
};

/// A message waiting for, or carried by, a connection.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub bytes: Vec<u8>,
    /// Set when acknowledgements are required.
    pub chunk: Option<String>,
}

impl AsRef<[u8]> for Outgoing {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

pub(crate) type OutgoingQueue = Arc<EventQueue<Outgoing>>;

/// State written by the event loop and read by callers.
#[derive(Debug, Default)]
pub(crate) struct Shared {
    ready: Mutex<usize>,
    ready_changed: Condvar,
    pub errors: LastErrorSlot,
}

impl Shared {
    pub fn set_ready(&self, count: usize) {
        let mut ready = self.ready.lock();
        if *ready != count {
            *ready = count;
            self.ready_changed.notify_all();
        }
    }

    pub fn ready(&self) -> usize {
        *self.ready.lock()
    }

    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut ready = self.ready.lock();
        while *ready == 0 {
            if self.ready_changed.wait_until(&mut ready, deadline).timed_out() {
                break;
            }
        }
        *ready > 0
    }
}

/// Fresh chunk id for acknowledgement tracking.
fn new_chunk_id() -> String {
    STANDARD.encode(rand::random::<[u8; 16]>())
}

/// Sends events to a set of collectors behind one or more endpoint URLs.
///
/// A dedicated thread runs the event loop that resolves endpoints, connects,
/// authenticates and spreads messages over ready connections. Callers encode
/// on their own thread and enqueue, exactly as with
/// [`AsyncSender`](crate::AsyncSender).
pub struct ConnectionManager {
    packets: PacketBuilder,
    require_ack: bool,
    queue: OutgoingQueue,
    wake: Arc<Notify>,
    shared: Arc<Shared>,
    handle: Mutex<Option<thread::JoinHandle<()>>>,
    warner: RateLimitedWarner,
}

impl ConnectionManager {
    /// Manager for `tag` sending to `endpoint` with default settings.
    pub fn new(tag: impl Into<String>, endpoint: impl Into<String>) -> Result<Self, BuildError> {
        ManagerBuilder::new(tag).with_endpoint(endpoint).build()
    }

    /// Validate `config` and start the event loop thread.
    pub fn with_config(config: ManagerConfig) -> Result<Self, BuildError> {
        let endpoints = config.validate()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let queue: OutgoingQueue = Arc::new(
            EventQueue::new(
                config.queue_maxsize,
                config.queue_circular,
                config.queue_overflow_handler.clone(),
            )
            .with_send_timeout(config.timeout),
        );
        let wake = Arc::new(Notify::new());
        let shared = Arc::new(Shared::default());
        let settings = LoopSettings {
            endpoints,
            credentials: config.credentials(),
            strategy: config.strategy.build(),
            timeout: config.timeout,
            refresh_period: config.refresh_period,
            backoff: config.backoff.clone(),
            require_ack: config.require_ack,
        };
        let event_loop = EventLoop::new(
            settings,
            Arc::clone(&queue),
            Arc::clone(&wake),
            Arc::clone(&shared),
        );
        let handle = thread::Builder::new()
            .name("femtofluent-manager".into())
            .spawn(move || runtime.block_on(event_loop.run()))?;
        Ok(Self {
            packets: PacketBuilder::new(config.tag.clone(), config.nanosecond_precision),
            require_ack: config.require_ack,
            queue,
            wake,
            shared,
            handle: Mutex::new(Some(handle)),
            warner: RateLimitedWarner::default(),
        })
    }

    /// Queue `data` labelled `label`, timestamped now.
    ///
    /// Returns `Ok(false)` when the manager is closed, or when no room
    /// appeared in a full blocking queue within the timeout and the message
    /// went to the overflow handler.
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
        let (options, chunk) = self.options(1);
        let bytes = self.packets.event_with_options(
            label,
            time.into(),
            data,
            Some(&options),
            &self.shared.errors,
        )?;
        Ok(self.enqueue(Outgoing { bytes, chunk }))
    }

    /// Queue several events as one forward-mode message.
    pub fn emit_batch<T: Serialize>(
        &self,
        label: &str,
        entries: &[(Timestamp, T)],
    ) -> Result<bool, SenderError> {
        let (options, chunk) = self.options(entries.len());
        let bytes =
            self.packets
                .batch_with_options(label, entries, Some(&options), &self.shared.errors)?;
        Ok(self.enqueue(Outgoing { bytes, chunk }))
    }

    fn options(&self, size: usize) -> (ForwardOptions, Option<String>) {
        let chunk = self.require_ack.then(new_chunk_id);
        let options = ForwardOptions {
            size,
            chunk: chunk.clone(),
        };
        (options, chunk)
    }

    fn enqueue(&self, item: Outgoing) -> bool {
        if self.queue.is_closed() {
            self.warner.record_drop(|count| {
                warn!("femtofluent: dropped {count} messages emitted after close");
            });
            return false;
        }
        let queued = self.queue.push(item);
        if queued {
            self.wake.notify_one();
        }
        queued
    }

    /// Stop the event loop and wait for it to exit.
    ///
    /// With `flush` queued messages get up to the configured timeout to find
    /// a ready connection; whatever remains, including unacknowledged
    /// messages, goes to the overflow handler. Without `flush` queued
    /// messages are discarded. Idempotent.
    pub fn close(&self, flush: bool) {
        let mut handle = self.handle.lock();
        let Some(event_loop) = handle.take() else {
            return;
        };
        self.queue.close();
        if !flush {
            let discarded = self.queue.drain();
            if !discarded.is_empty() {
                debug!(
                    "femtofluent: discarded {} queued messages on close",
                    discarded.len()
                );
            }
        }
        self.wake.notify_one();
        if event_loop.join().is_err() {
            warn!("femtofluent: connection manager thread panicked");
        }
        for late in self.queue.drain() {
            self.queue.overflow(&late.bytes);
        }
        self.queue.flush_warnings();
        self.warner.flush(|count| {
            warn!("femtofluent: dropped {count} messages emitted after close");
        });
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    /// Number of connections that have completed the handshake.
    pub fn ready_connections(&self) -> usize {
        self.shared.ready()
    }

    /// Block until at least one connection is ready or `timeout` elapses.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        self.shared.wait_ready(timeout)
    }

    /// Messages waiting for a ready connection.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    delegate! {
        to self.shared.errors {
            /// The calling thread's most recent error, or the event loop's.
            #[call(get)]
            pub fn last_error(&self) -> Option<Arc<SenderError>>;
            #[call(set)]
            pub fn set_last_error(&self, error: SenderError);
            #[call(clear)]
            pub fn clear_last_error(&self);
            #[call(clear_all)]
            pub fn clear_errors_for_all_threads(&self);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close(true);
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("packets", &self.packets)
            .field("require_ack", &self.require_ack)
            .field("ready", &self.shared.ready())
            .field("queued", &self.queue.len())
            .field("closed", &self.queue.is_closed())
            .finish()
    }
}
