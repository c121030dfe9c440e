//! Bytes accepted for transmission but not yet written.
//!
//! A failed send keeps its bytes here so the next attempt can prefix them to
//! new data. The buffer grows until it exceeds `bufmax`; at that point its
//! whole contents go to the overflow handler and it starts again empty.

use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

use log::warn;

use crate::rate_limited_warner::RateLimitedWarner;

/// Callback receiving bytes discarded because a capacity bound was hit.
pub type OverflowHandler = Arc<dyn Fn(&[u8]) + Send + Sync>;

/// Invoke `handler` with `bytes`, containing any panic it raises.
pub(crate) fn call_overflow_handler(handler: Option<&OverflowHandler>, bytes: &[u8]) {
    let Some(handler) = handler else {
        return;
    };
    if panic::catch_unwind(AssertUnwindSafe(|| handler(bytes))).is_err() {
        warn!(
            "femtofluent: overflow handler panicked while receiving {} bytes",
            bytes.len()
        );
    }
}

/// Unacknowledged bytes, in send order, bounded by `bufmax`.
pub struct PendingBuffer {
    buf: Vec<u8>,
    bufmax: usize,
    on_overflow: Option<OverflowHandler>,
    warner: RateLimitedWarner,
}

impl PendingBuffer {
    pub fn new(bufmax: usize, on_overflow: Option<OverflowHandler>) -> Self {
        Self {
            buf: Vec::new(),
            bufmax,
            on_overflow,
            warner: RateLimitedWarner::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn bufmax(&self) -> usize {
        self.bufmax
    }

    pub fn contents(&self) -> &[u8] {
        &self.buf
    }

    /// Append `bytes` behind anything still pending and return the combined
    /// span to write.
    pub fn stage(&mut self, bytes: &[u8]) -> &[u8] {
        self.buf.extend_from_slice(bytes);
        &self.buf
    }

    /// The staged span was written; forget it.
    pub fn acknowledge(&mut self) {
        self.buf.clear();
    }

    /// The staged span could not be written. Keep it for the next attempt
    /// unless it now exceeds `bufmax`, in which case hand it to the overflow
    /// handler and return the number of bytes dropped.
    pub fn retain_or_evict(&mut self) -> Option<usize> {
        (self.buf.len() > self.bufmax).then(|| self.evict())
    }

    /// Hand everything pending to the overflow handler and reset.
    pub fn evict(&mut self) -> usize {
        let dropped = std::mem::take(&mut self.buf);
        if dropped.is_empty() {
            return 0;
        }
        self.warner.record_drop(|count| {
            warn!(
                "femtofluent: pending buffer exceeded {} bytes; discarded {count} buffers",
                self.bufmax
            );
        });
        call_overflow_handler(self.on_overflow.as_ref(), &dropped);
        dropped.len()
    }
}

impl std::fmt::Debug for PendingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingBuffer")
            .field("len", &self.buf.len())
            .field("bufmax", &self.bufmax)
            .finish()
    }
}
