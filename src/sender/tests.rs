//! Unit tests for sender internals.

use std::{
    io::Read,
    net::TcpListener,
    sync::Arc,
    thread,
};

use parking_lot::Mutex;
use rstest::{fixture, rstest};

use super::*;
use crate::error::{ErrorKind, SenderError};

/// A local port with nothing listening on it.
#[fixture]
fn refused_port() -> u16 {
    let listener = TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener");
    listener.local_addr().expect("local addr").port()
}

fn unreachable_builder(port: u16) -> SenderBuilder {
    SenderBuilder::new("test")
        .with_host("127.0.0.1")
        .with_port(port)
        .with_timeout_ms(200)
}

#[rstest]
fn construction_records_connect_failure(refused_port: u16) {
    let sender = unreachable_builder(refused_port).build().unwrap();
    let err = sender.last_error().expect("connect failure recorded");
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[rstest]
fn failed_send_keeps_bytes_pending(refused_port: u16) {
    let sender = unreachable_builder(refused_port).build().unwrap();
    sender.clear_last_error();
    assert!(!sender.send(b"abc"));
    assert_eq!(sender.pending_len(), 3);
    assert!(!sender.send(b"de"));
    assert_eq!(sender.pending_len(), 5);
    assert!(sender.last_error().is_some());
}

#[rstest]
fn overflow_hands_combined_bytes_to_handler(refused_port: u16) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sender = unreachable_builder(refused_port)
        .with_bufmax(4)
        .with_buffer_overflow_handler(move |bytes| sink.lock().push(bytes.to_vec()))
        .build()
        .unwrap();
    assert!(!sender.send(b"abc"));
    assert!(!sender.send(b"de"));
    assert_eq!(sender.pending_len(), 0);
    assert_eq!(*seen.lock(), vec![b"abcde".to_vec()]);
    let err = sender.last_error().expect("overflow recorded");
    assert!(matches!(
        *err,
        SenderError::Overflow {
            dropped: 5,
            limit: 4
        }
    ));
}

#[rstest]
fn closed_sender_refuses_without_io(refused_port: u16) {
    let sender = unreachable_builder(refused_port).build().unwrap();
    sender.close();
    sender.close();
    sender.clear_last_error();
    assert!(sender.is_closed());
    assert!(!sender.send(b"late"));
    assert_eq!(sender.pending_len(), 0);
    assert!(sender.last_error().is_none());
}

#[rstest]
fn close_flushes_pending_bytes_to_handler(refused_port: u16) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let sender = unreachable_builder(refused_port)
        .with_buffer_overflow_handler(move |bytes| sink.lock().push(bytes.to_vec()))
        .build()
        .unwrap();
    assert!(!sender.send(b"kept"));
    sender.close();
    assert_eq!(*seen.lock(), vec![b"kept".to_vec()]);
}

#[rstest]
fn pending_bytes_are_sent_before_new_ones() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let sender = unreachable_builder(port).build().unwrap();
    assert!(!sender.send(b"first-"));

    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        // Port reuse is not guaranteed; nothing more to check.
        Err(_) => return,
    };
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = vec![0u8; 12];
        stream.read_exact(&mut buf).unwrap();
        buf
    });
    assert!(sender.send(b"second"));
    assert_eq!(server.join().unwrap(), b"first-second");
    assert_eq!(sender.pending_len(), 0);
}

#[rstest]
fn close_delivers_pending_bytes_when_collector_returns() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let overflowed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&overflowed);
    let sender = unreachable_builder(port)
        .with_buffer_overflow_handler(move |bytes| sink.lock().push(bytes.to_vec()))
        .build()
        .unwrap();
    assert!(!sender.send(b"kept"));
    assert_eq!(sender.pending_len(), 4);

    let listener = match TcpListener::bind(("127.0.0.1", port)) {
        Ok(listener) => listener,
        // Port reuse is not guaranteed; nothing more to check.
        Err(_) => return,
    };
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut received = Vec::new();
        stream.read_to_end(&mut received).unwrap();
        received
    });
    sender.close();
    assert_eq!(server.join().unwrap(), b"kept");
    assert_eq!(sender.pending_len(), 0);
    assert!(overflowed.lock().is_empty());
}
