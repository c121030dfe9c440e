//! A small forward protocol collector for integration tests.
//!
//! Accepts connections on a TCP port or a Unix socket, optionally runs the
//! server side of the shared-key handshake, answers `chunk` options with
//! `ack` responses and records every event it decodes.

use std::{
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

#[cfg(unix)]
use std::os::unix::net::UnixListener;

use femtofluent::{
    Decoder, Message,
    codec::map_get,
    endpoint::hex_sha512,
};
use rmpv::Value;

const NONCE: &[u8] = b"collector-nonce";
const POLL: Duration = Duration::from_millis(10);

trait Duplex: Read + Write + Send {}
impl<T: Read + Write + Send> Duplex for T {}

/// Behaviour switches for a [`Collector`].
#[derive(Clone, Debug)]
pub struct CollectorOptions {
    /// Require the shared-key handshake.
    pub shared_key: Option<String>,
    /// Name the collector reports in `PONG`.
    pub hostname: String,
    /// Send a `PONG` whose digest does not prove knowledge of the key.
    pub forge_pong: bool,
    /// Answer `chunk` options with `ack` responses.
    pub ack: bool,
    /// Send a heartbeat byte to each new connection.
    pub heartbeat: bool,
}

impl Default for CollectorOptions {
    fn default() -> Self {
        Self {
            shared_key: None,
            hostname: "collector.test".into(),
            forge_pong: false,
            ack: false,
            heartbeat: false,
        }
    }
}

#[derive(Default)]
struct State {
    messages: Mutex<Vec<Message>>,
    accepted: AtomicUsize,
    handshakes: AtomicUsize,
    stop: AtomicBool,
}

/// A running collector; stops when dropped.
pub struct Collector {
    endpoint: String,
    port: u16,
    state: Arc<State>,
    handle: Option<thread::JoinHandle<()>>,
    #[cfg(unix)]
    _dir: Option<tempfile::TempDir>,
}

impl Collector {
    /// Listen on an ephemeral TCP port on 127.0.0.1.
    pub fn start(options: CollectorOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind collector");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let addr: SocketAddr = listener.local_addr().expect("local addr");
        let state = Arc::new(State::default());
        let handle = spawn_acceptor(Arc::clone(&state), options, move || {
            listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(POLL))?;
                Ok(Box::new(stream) as Box<dyn Duplex>)
            })
        });
        Self {
            endpoint: format!("tcp://{addr}"),
            port: addr.port(),
            state,
            handle: Some(handle),
            #[cfg(unix)]
            _dir: None,
        }
    }

    /// Listen on a Unix socket inside a fresh temporary directory.
    #[cfg(unix)]
    pub fn start_unix(options: CollectorOptions) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("collector.sock");
        let listener = UnixListener::bind(&path).expect("bind unix collector");
        listener.set_nonblocking(true).expect("nonblocking listener");
        let state = Arc::new(State::default());
        let handle = spawn_acceptor(Arc::clone(&state), options, move || {
            listener.accept().and_then(|(stream, _)| {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(POLL))?;
                Ok(Box::new(stream) as Box<dyn Duplex>)
            })
        });
        Self {
            endpoint: format!("unix://{}", path.display()),
            port: 0,
            state,
            handle: Some(handle),
            _dir: Some(dir),
        }
    }

    /// URL for `ManagerBuilder::with_endpoint`.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Host string for `SenderBuilder::with_host`.
    pub fn host(&self) -> String {
        match self.endpoint.strip_prefix("tcp://") {
            Some(_) => "127.0.0.1".into(),
            None => self.endpoint.clone(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn accepted(&self) -> usize {
        self.state.accepted.load(Ordering::SeqCst)
    }

    /// Number of successful shared-key handshakes.
    pub fn handshakes(&self) -> usize {
        self.state.handshakes.load(Ordering::SeqCst)
    }

    /// Events received so far.
    pub fn messages(&self) -> Vec<Message> {
        self.state.messages.lock().expect("collector mutex").clone()
    }

    /// Wait until at least `count` events arrived or `timeout` passed.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            let messages = self.messages();
            if messages.len() >= count || Instant::now() >= deadline {
                return messages;
            }
            thread::sleep(POLL);
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.state.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_acceptor<F>(state: Arc<State>, options: CollectorOptions, mut accept: F) -> thread::JoinHandle<()>
where
    F: FnMut() -> io::Result<Box<dyn Duplex>> + Send + 'static,
{
    thread::spawn(move || {
        while !state.stop.load(Ordering::SeqCst) {
            match accept() {
                Ok(stream) => {
                    state.accepted.fetch_add(1, Ordering::SeqCst);
                    let state = Arc::clone(&state);
                    let options = options.clone();
                    thread::spawn(move || serve(stream, &state, &options));
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => thread::sleep(POLL),
                Err(_) => return,
            }
        }
    })
}

fn serve(mut stream: Box<dyn Duplex>, state: &State, options: &CollectorOptions) {
    let mut decoder = Decoder::new();
    if let Some(key) = &options.shared_key
        && handshake(&mut stream, &mut decoder, state, options, key).is_err()
    {
        return;
    }
    if options.heartbeat && stream.write_all(&[0x00]).is_err() {
        return;
    }
    let mut buf = [0u8; 8192];
    while !state.stop.load(Ordering::SeqCst) {
        match stream.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                for value in decoder.drain_values().unwrap_or_default() {
                    if record(&mut stream, state, options, value).is_err() {
                        return;
                    }
                }
            }
            Err(err) if is_timeout(&err) => {}
            Err(_) => return,
        }
    }
}

fn record(
    stream: &mut Box<dyn Duplex>,
    state: &State,
    options: &CollectorOptions,
    value: Value,
) -> io::Result<()> {
    let Ok(messages) = Message::from_value(value) else {
        return Ok(());
    };
    let chunk = messages
        .first()
        .and_then(|message| message.options.as_ref())
        .and_then(|opts| map_get(opts, "chunk"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    state
        .messages
        .lock()
        .expect("collector mutex")
        .extend(messages);
    if options.ack
        && let Some(chunk) = chunk
    {
        let ack = Value::Map(vec![(Value::from("ack"), Value::from(chunk))]);
        send(stream, &ack)?;
    }
    Ok(())
}

fn handshake(
    stream: &mut Box<dyn Duplex>,
    decoder: &mut Decoder,
    state: &State,
    options: &CollectorOptions,
    key: &str,
) -> io::Result<()> {
    let helo = Value::Array(vec![
        Value::from("HELO"),
        Value::Map(vec![
            (Value::from("nonce"), Value::Binary(NONCE.to_vec())),
            (Value::from("auth"), Value::Binary(Vec::new())),
            (Value::from("keepalive"), Value::from(true)),
        ]),
    ]);
    send(stream, &helo)?;

    let ping = read_one(stream, decoder, state)?;
    let items = ping.as_array().cloned().unwrap_or_default();
    let client_host = items.get(1).and_then(Value::as_str).unwrap_or_default().to_owned();
    let salt = match items.get(2) {
        Some(Value::Binary(salt)) => salt.clone(),
        _ => Vec::new(),
    };
    let expected = hex_sha512(&[salt.as_slice(), client_host.as_bytes(), NONCE, key.as_bytes()]);
    if items.get(3).and_then(Value::as_str) != Some(expected.as_str()) {
        let pong = Value::Array(vec![
            Value::from("PONG"),
            Value::from(false),
            Value::from("shared key mismatch"),
            Value::from(options.hostname.as_str()),
            Value::from(""),
        ]);
        send(stream, &pong)?;
        return Err(io::Error::new(io::ErrorKind::PermissionDenied, "bad PING"));
    }

    let digest = if options.forge_pong {
        "0".repeat(128)
    } else {
        hex_sha512(&[salt.as_slice(), options.hostname.as_bytes(), NONCE, key.as_bytes()])
    };
    let pong = Value::Array(vec![
        Value::from("PONG"),
        Value::from(true),
        Value::from(""),
        Value::from(options.hostname.as_str()),
        Value::from(digest),
    ]);
    send(stream, &pong)?;
    state.handshakes.fetch_add(1, Ordering::SeqCst);
    Ok(())
}

fn read_one(stream: &mut Box<dyn Duplex>, decoder: &mut Decoder, state: &State) -> io::Result<Value> {
    let mut buf = [0u8; 1024];
    loop {
        if let Ok(Some(value)) = decoder.next_value() {
            return Ok(value);
        }
        if state.stop.load(Ordering::SeqCst) {
            return Err(io::ErrorKind::Interrupted.into());
        }
        match stream.read(&mut buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => decoder.feed(&buf[..n]),
            Err(err) if is_timeout(&err) => {}
            Err(err) => return Err(err),
        }
    }
}

fn send(stream: &mut Box<dyn Duplex>, value: &Value) -> io::Result<()> {
    let mut bytes = Vec::new();
    rmpv::encode::write_value(&mut bytes, value).map_err(io::Error::other)?;
    stream.write_all(&bytes)
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
