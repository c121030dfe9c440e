//! rstest fixtures shared by the integration tests.

use std::{
    net::TcpListener,
    sync::{Arc, Mutex},
};

use femtofluent::OverflowHandler;
use rstest::fixture;

use super::collector::{Collector, CollectorOptions};

/// Bytes handed to an overflow handler, one entry per call.
pub type Overflowed = Arc<Mutex<Vec<Vec<u8>>>>;

/// A collector with default options.
#[fixture]
pub fn collector() -> Collector {
    Collector::start(CollectorOptions::default())
}

/// A port with nothing listening on it.
#[fixture]
pub fn refused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral listener");
    listener.local_addr().expect("listener addr").port()
}

/// An overflow handler recording what it receives.
#[fixture]
pub fn overflow() -> (OverflowHandler, Overflowed) {
    let seen: Overflowed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler: OverflowHandler = Arc::new(move |bytes: &[u8]| {
        sink.lock().expect("overflow mutex").push(bytes.to_vec());
    });
    (handler, seen)
}
