//! The send attempt shared by both sender kinds.

use std::io;

use log::{debug, warn};

use crate::{
    connection::Connection,
    error::{BuildError, SenderError},
    pending::PendingBuffer,
    rate_limited_warner::RateLimitedWarner,
};

use super::config::SenderConfig;

/// A connection plus the bytes it still owes the collector.
///
/// Callers provide the exclusion: the synchronous sender keeps this behind
/// its mutex, the asynchronous sender's worker owns it outright.
#[derive(Debug)]
pub(crate) struct Transmitter {
    connection: Connection,
    pending: PendingBuffer,
    closed: bool,
    failures: RateLimitedWarner,
}

impl Transmitter {
    pub fn from_config(config: &SenderConfig) -> Result<Self, BuildError> {
        let connection = Connection::new(config.address()?, config.timeout)
            .with_half_close_detection(config.half_close_detection);
        Ok(Self {
            connection,
            pending: PendingBuffer::new(config.bufmax, config.buffer_overflow_handler.clone()),
            closed: false,
            failures: RateLimitedWarner::default(),
        })
    }

    pub fn connect(&mut self) -> io::Result<()> {
        self.connection.connect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Write `bytes` behind any pending ones.
    ///
    /// `Ok(false)` means the transmitter is closed and nothing was attempted.
    /// On error the combined bytes stay pending unless they exceed `bufmax`,
    /// in which case they are evicted and the error is an overflow.
    pub fn send(&mut self, bytes: &[u8]) -> Result<bool, SenderError> {
        if self.closed {
            return Ok(false);
        }
        let staged = self.pending.stage(bytes);
        match self.connection.write_all(staged) {
            Ok(()) => {
                self.pending.acknowledge();
                Ok(true)
            }
            Err(err) => {
                let address = self.connection.address();
                debug!("femtofluent: write to {address} failed: {err}");
                self.failures.record_drop(|count| {
                    warn!("femtofluent: {count} writes to {address} failed; latest: {err}");
                });
                match self.pending.retain_or_evict() {
                    Some(dropped) => {
                        debug!("femtofluent: dropped {dropped} pending bytes");
                        Err(SenderError::Overflow {
                            dropped,
                            limit: self.pending.bufmax(),
                        })
                    }
                    None => Err(SenderError::Transport(err)),
                }
            }
        }
    }

    /// Make one last attempt at pending bytes and tear the connection down.
    ///
    /// Idempotent. Bytes that still cannot be written go to the overflow
    /// handler.
    pub fn close(&mut self) -> Result<(), SenderError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut result = Ok(());
        if !self.pending.is_empty() {
            let flushed = self.connection.write_all(self.pending.contents());
            match flushed {
                Ok(()) => self.pending.acknowledge(),
                Err(err) => {
                    warn!(
                        "femtofluent: flushing pending bytes to {} failed on close: {err}",
                        self.connection.address()
                    );
                    self.pending.evict();
                    result = Err(SenderError::Transport(err));
                }
            }
        }
        self.connection.close();
        result
    }
}
