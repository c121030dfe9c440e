//! Buffered, fault-tolerant client for the Fluentd forward protocol.
//!
//! [`FluentSender`] writes each event on the calling thread, [`AsyncSender`]
//! hands events to a worker thread, and [`ConnectionManager`] spreads them
//! over authenticated connections to several collectors. All three keep
//! transport failures away from `emit`: undeliverable bytes are retried on
//! the next send or passed to an overflow handler, and the most recent
//! failure is available through `last_error`.

pub mod codec;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod global;
mod last_error;
mod macros;
mod pending;
mod rate_limited_warner;
pub mod sender;

pub use codec::{Decoder, EventTime, ForwardOptions, Message, Timestamp};
pub use connection::{Address, Connection, TlsOptions};
pub use endpoint::{
    BackoffOverrides, BackoffPolicy, ConnectionManager, Endpoint, ManagerBuilder, ManagerConfig,
    SelectionStrategy, Strategy,
};
pub use error::{BuildError, ErrorKind, SenderError};
pub use global::{GlobalSender, close, get_global_sender, setup, setup_async};
pub use pending::OverflowHandler;
pub use rate_limited_warner::DEFAULT_WARN_INTERVAL;
pub use sender::{AsyncSender, FluentSender, SenderBuilder, SenderConfig};
