//! Multi-endpoint delivery with authentication and acknowledgements.
//!
//! An endpoint URL names one or more collectors. [`ConnectionManager`]
//! resolves them, keeps a connection to every address, runs the forward
//! protocol handshake where credentials are configured, and distributes
//! messages over the connections that are ready.

mod backoff;
mod config;
mod event_loop;
mod handshake;
mod manager;
mod strategy;
mod url;

pub use backoff::{
    BackoffPolicy, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_CAP, DEFAULT_BACKOFF_DEADLINE,
};
pub use config::{
    BackoffOverrides, DEFAULT_REFRESH_PERIOD, ManagerBuilder, ManagerConfig, local_hostname,
};
pub use handshake::{Credentials, Handshake, HandshakeState, ServerMessage, hex_sha512};
pub use manager::ConnectionManager;
pub use strategy::{Failover, RoundRobin, SelectionStrategy, Strategy};
pub use url::{
    DEFAULT_FORWARD_PORT, DEFAULT_SCHEME, Endpoint, PeerAddr, SchemeRegistry, TransportKind,
};
