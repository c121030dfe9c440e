//! The synchronous sender.

use std::sync::Arc;

use delegate::delegate;
use log::debug;
use parking_lot::Mutex;
use serde::Serialize;

use crate::{
    codec::Timestamp,
    error::{BuildError, SenderError},
    last_error::LastErrorSlot,
};

use super::{
    config::{SenderBuilder, SenderConfig},
    packet::PacketBuilder,
    transmitter::Transmitter,
};

/// Sends each event on the calling thread.
///
/// All sends are serialised by one mutex held for the whole attempt, so
/// events from concurrent callers reach the collector in lock order. Bytes
/// that fail to send are retried in front of the next event until they
/// exceed `bufmax`.
pub struct FluentSender {
    packets: PacketBuilder,
    transmitter: Mutex<Transmitter>,
    errors: LastErrorSlot,
}

impl FluentSender {
    /// Sender for `tag` with default settings.
    pub fn new(tag: impl Into<String>) -> Result<Self, BuildError> {
        SenderBuilder::new(tag).build()
    }

    /// Build a sender from a configuration object and attempt one
    /// connection. A failed attempt is recorded as the calling thread's last
    /// error; sends retry.
    pub fn with_config(config: SenderConfig) -> Result<Self, BuildError> {
        config.validate()?;
        let mut transmitter = Transmitter::from_config(&config)?;
        let errors = LastErrorSlot::new();
        if let Err(err) = transmitter.connect() {
            debug!("femtofluent: initial connection failed: {err}");
            errors.set(err.into());
        }
        Ok(Self {
            packets: PacketBuilder::from_config(&config),
            transmitter: Mutex::new(transmitter),
            errors,
        })
    }

    /// Send `data` labelled `label`, timestamped now.
    ///
    /// Returns `Ok(false)` when the event could not be delivered; the cause
    /// is available from [`last_error`](Self::last_error).
    pub fn emit<T: Serialize + ?Sized>(&self, label: &str, data: &T) -> Result<bool, SenderError> {
        self.emit_with_time(label, self.packets.now(), data)
    }

    /// Send `data` labelled `label` with an explicit timestamp.
    pub fn emit_with_time<T: Serialize + ?Sized>(
        &self,
        label: &str,
        time: impl Into<Timestamp>,
        data: &T,
    ) -> Result<bool, SenderError> {
        let bytes = self.packets.event(label, time.into(), data, &self.errors)?;
        Ok(self.send(&bytes))
    }

    /// Send several events as one batched packet.
    pub fn emit_batch<T: Serialize>(
        &self,
        label: &str,
        entries: &[(Timestamp, T)],
    ) -> Result<bool, SenderError> {
        let bytes = self.packets.batch(label, entries, &self.errors)?;
        Ok(self.send(&bytes))
    }

    /// Write pre-encoded bytes.
    pub fn send(&self, bytes: &[u8]) -> bool {
        let result = self.transmitter.lock().send(bytes);
        match result {
            Ok(sent) => sent,
            Err(err) => {
                self.errors.set(err);
                false
            }
        }
    }

    /// Flush pending bytes once and release the connection. Idempotent;
    /// later sends return `false`.
    pub fn close(&self) {
        let result = self.transmitter.lock().close();
        if let Err(err) = result {
            self.errors.set(err);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.transmitter.lock().is_closed()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.transmitter.lock().pending_len()
    }

    delegate! {
        to self.errors {
            /// The calling thread's most recent error.
            #[call(get)]
            pub fn last_error(&self) -> Option<Arc<SenderError>>;
            /// Overwrite the calling thread's last error.
            #[call(set)]
            pub fn set_last_error(&self, error: SenderError);
            /// Forget the calling thread's last error.
            #[call(clear)]
            pub fn clear_last_error(&self);
            /// Forget the last errors recorded by every thread.
            #[call(clear_all)]
            pub fn clear_errors_for_all_threads(&self);
        }
    }
}

impl Drop for FluentSender {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for FluentSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FluentSender")
            .field("packets", &self.packets)
            .field("errors", &self.errors)
            .finish_non_exhaustive()
    }
}
