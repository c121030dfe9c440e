//! A listener that holds its only connection unread until released.
//!
//! Lets tests stall a sender mid-write: once the socket buffers fill, the
//! writer blocks until [`HeldSink::release`] is called. Everything received
//! is returned in one piece after the sender closes the connection.

use std::{
    io::Read,
    net::TcpListener,
    sync::mpsc,
    thread,
};

use femtofluent::{Decoder, Message};

pub struct HeldSink {
    port: u16,
    release: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<Vec<u8>>>,
}

impl HeldSink {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind sink");
        let port = listener.local_addr().expect("sink addr").port();
        let (release, released) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let Ok((mut stream, _)) = listener.accept() else {
                return Vec::new();
            };
            let _ = released.recv();
            let mut bytes = Vec::new();
            let _ = stream.read_to_end(&mut bytes);
            bytes
        });
        Self {
            port,
            release: Some(release),
            handle: Some(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Start reading.
    pub fn release(&mut self) {
        self.release.take();
    }

    /// Wait for the peer to close and decode what it sent.
    pub fn finish(mut self) -> Vec<Message> {
        self.release();
        let bytes = self
            .handle
            .take()
            .map(|handle| handle.join().expect("sink thread"))
            .unwrap_or_default();
        let mut decoder = Decoder::new();
        decoder.feed(&bytes);
        decoder
            .drain_values()
            .expect("decode sink bytes")
            .into_iter()
            .flat_map(|value| Message::from_value(value).expect("forward message"))
            .collect()
    }
}
