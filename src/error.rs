//! Error types shared by the senders, the codec and the builders.
//!
//! Failures fall into a small closed set of kinds. Only encoding failures can
//! reach the caller of `emit`; transport and overflow failures are absorbed
//! into the per-thread last-error slot and the overflow handlers.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

/// Broad category of a [`SenderError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// The record could not be represented on the wire.
    Encoding,
    /// Connect, write, timeout or broken pipe.
    Transport,
    /// A pending buffer or queue exceeded its capacity.
    Overflow,
    /// Malformed or out-of-state handshake traffic.
    Protocol,
}

/// Errors observed while turning events into bytes and shipping them.
#[derive(Debug, Error)]
pub enum SenderError {
    /// The record for `tag` could not be encoded.
    #[error("failed to encode event for tag {tag:?}: {source}")]
    Encoding {
        tag: String,
        #[source]
        source: CodecError,
    },
    /// The socket could not be opened or written.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// Bytes were discarded after a capacity bound was exceeded.
    #[error("discarded {dropped} bytes after exceeding the {limit} byte limit")]
    Overflow { dropped: usize, limit: usize },
    /// The peer violated the forward protocol handshake.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The sender has already been closed.
    #[error("sender is closed")]
    Closed,
}

impl SenderError {
    /// Classify the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SenderError::Encoding { .. } => ErrorKind::Encoding,
            SenderError::Transport(_) | SenderError::Closed => ErrorKind::Transport,
            SenderError::Overflow { .. } => ErrorKind::Overflow,
            SenderError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}

/// Errors that may occur while building a sender or connection manager.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Invalid user supplied configuration.
    #[error("invalid sender configuration: {0}")]
    InvalidConfig(String),
    /// Underlying I/O error whilst creating the sender.
    #[error(transparent)]
    Io(#[from] io::Error),
}
