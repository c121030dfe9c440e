//! Tests for the single-socket connection.

use std::{
    io::{Read, Write},
    net::{Shutdown, SocketAddr, TcpListener},
    sync::mpsc,
    thread,
    time::Duration,
};

use rstest::{fixture, rstest};

use super::{Address, Connection};

#[fixture]
fn tcp_listener() -> TcpListener {
    TcpListener::bind(("127.0.0.1", 0)).expect("bind ephemeral listener")
}

fn tcp_address(addr: SocketAddr) -> Address {
    Address::parse(&addr.ip().to_string(), addr.port()).expect("valid address")
}

fn read_exact_from(listener: &TcpListener, len: usize) -> Vec<u8> {
    let (mut stream, _) = listener.accept().expect("accept connection");
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).expect("read payload");
    buf
}

#[rstest]
fn write_connects_lazily(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().unwrap();
    let server = thread::spawn(move || read_exact_from(&tcp_listener, 5));

    let mut conn = Connection::new(tcp_address(addr), Duration::from_secs(1));
    assert!(!conn.is_connected());
    conn.write_all(b"hello").expect("write succeeds");
    assert!(conn.is_connected());

    assert_eq!(server.join().unwrap(), b"hello");
}

#[rstest]
fn close_is_idempotent_without_connecting() {
    let mut conn = Connection::new(
        Address::parse("localhost", 24224).unwrap(),
        Duration::from_millis(100),
    );
    conn.close();
    conn.close();
    assert!(!conn.is_connected());
}

#[rstest]
fn failed_write_leaves_connection_closed(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().unwrap();
    drop(tcp_listener);

    let mut conn = Connection::new(tcp_address(addr), Duration::from_millis(200));
    assert!(conn.write_all(b"lost").is_err());
    assert!(!conn.is_connected());
}

#[rstest]
fn half_closed_peer_is_replaced_before_writing(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let (first, _) = tcp_listener.accept().expect("first connection");
        first.shutdown(Shutdown::Write).expect("half close");
        closed_tx.send(()).expect("signal half close");
        let (mut second, _) = tcp_listener.accept().expect("second connection");
        let mut buf = [0u8; 4];
        second.read_exact(&mut buf).expect("read payload");
        drop(first);
        buf
    });

    let mut conn = Connection::new(tcp_address(addr), Duration::from_secs(1));
    conn.connect().expect("initial connect");
    closed_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("server half closed");
    thread::sleep(Duration::from_millis(50));

    conn.write_all(b"next").expect("write after reconnect");
    assert_eq!(&server.join().unwrap(), b"next");
}

#[rstest]
fn half_close_is_seen_behind_unread_replies(tcp_listener: TcpListener) {
    let addr = tcp_listener.local_addr().unwrap();
    let (closed_tx, closed_rx) = mpsc::channel();
    let server = thread::spawn(move || {
        let (mut first, _) = tcp_listener.accept().expect("first connection");
        first.write_all(b"unsolicited reply").expect("send reply");
        first.shutdown(Shutdown::Write).expect("half close");
        closed_tx.send(()).expect("signal half close");
        let (mut second, _) = tcp_listener.accept().expect("second connection");
        let mut buf = [0u8; 4];
        second.read_exact(&mut buf).expect("read payload");
        drop(first);
        buf
    });

    let mut conn = Connection::new(tcp_address(addr), Duration::from_secs(1));
    conn.connect().expect("initial connect");
    closed_rx
        .recv_timeout(Duration::from_secs(2))
        .expect("server half closed");
    thread::sleep(Duration::from_millis(50));

    conn.write_all(b"next").expect("write after reconnect");
    assert_eq!(&server.join().unwrap(), b"next");
}

#[cfg(unix)]
#[rstest]
fn writes_over_unix_sockets() {
    use std::os::unix::net::UnixListener;

    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("collector.sock");
    let listener = UnixListener::bind(&path).expect("bind unix listener");
    let server = thread::spawn(move || {
        let (mut stream, _) = listener.accept().expect("accept");
        let mut buf = [0u8; 3];
        stream.read_exact(&mut buf).expect("read");
        buf
    });

    let address = Address::parse(&format!("unix://{}", path.display()), 0).unwrap();
    let mut conn = Connection::new(address, Duration::from_secs(1));
    conn.write_all(b"uds").expect("unix write");
    assert_eq!(&server.join().unwrap(), b"uds");
}
