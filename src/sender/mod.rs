//! Event senders for a single collector.
//!
//! [`FluentSender`] writes on the calling thread under a mutex;
//! [`AsyncSender`] enqueues and lets a worker thread write. Both build
//! packets the same way and share the pending-buffer retry policy.

mod async_sender;
mod config;
pub(crate) mod packet;
pub(crate) mod queue;
mod sync;
mod transmitter;
mod worker;

#[cfg(test)]
mod tests;

pub use async_sender::AsyncSender;
pub use config::{
    DEFAULT_BUFMAX, DEFAULT_HOST, DEFAULT_PORT, DEFAULT_QUEUE_MAXSIZE, DEFAULT_TIMEOUT,
    SenderBuilder, SenderConfig,
};
pub use sync::FluentSender;
