//! A single socket to a single collector address.
//!
//! [`Connection`] knows how to establish, write to and tear down one stream
//! socket. It performs no retries of its own: a failed write drops the handle
//! so that the next attempt reconnects.

mod address;

use std::{
    io::{self, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::net::UnixStream;

use log::debug;
#[cfg(feature = "tls")]
use native_tls::{TlsConnector, TlsStream};

pub use address::{Address, TlsOptions};

enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<TlsStream<TcpStream>>),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.write_all(buf),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.write_all(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write_all(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }

    /// Probe the read side without blocking. `Ok(true)` means the peer has
    /// shut down its write half.
    fn peer_half_closed(&mut self) -> io::Result<bool> {
        match self {
            Stream::Tcp(stream) => tcp_half_closed(stream),
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => tcp_half_closed(stream.get_ref()),
            #[cfg(unix)]
            Stream::Unix(stream) => {
                stream.set_nonblocking(true)?;
                let closed = drain_until_blocked(&*stream);
                stream.set_nonblocking(false)?;
                closed
            }
        }
    }

    fn shutdown(&mut self) {
        match self {
            Stream::Tcp(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
            #[cfg(feature = "tls")]
            Stream::Tls(stream) => {
                let _ = stream.shutdown();
                let _ = stream.get_ref().shutdown(Shutdown::Both);
            }
            #[cfg(unix)]
            Stream::Unix(stream) => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}

fn tcp_half_closed(stream: &TcpStream) -> io::Result<bool> {
    stream.set_nonblocking(true)?;
    let closed = drain_until_blocked(stream);
    stream.set_nonblocking(false)?;
    closed
}

/// Read and discard whatever the peer has sent. The sender never reads
/// replies, so anything buffered would hide a FIN queued behind it.
fn drain_until_blocked(mut stream: impl Read) -> io::Result<bool> {
    let mut scratch = [0u8; 512];
    loop {
        match stream.read(&mut scratch) {
            Ok(0) => return Ok(true),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(err) => return Err(err),
        }
    }
}

/// Owner of at most one live socket to `address`.
pub struct Connection {
    address: Address,
    timeout: Duration,
    half_close_detection: bool,
    stream: Option<Stream>,
}

impl Connection {
    /// Create a disconnected handle.
    pub fn new(address: Address, timeout: Duration) -> Self {
        Self {
            address,
            timeout,
            half_close_detection: true,
            stream: None,
        }
    }

    /// Enable or disable the read-side half-close check run before writes.
    pub fn with_half_close_detection(mut self, enabled: bool) -> Self {
        self.half_close_detection = enabled;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Establish the socket unless one is already open.
    pub fn connect(&mut self) -> io::Result<()> {
        if self.stream.is_none() {
            let stream = open_stream(&self.address, self.timeout)?;
            debug!("femtofluent: connected to {}", self.address);
            self.stream = Some(stream);
        }
        Ok(())
    }

    /// Write and flush `bytes`, connecting first when necessary.
    ///
    /// A reused socket whose peer has half-closed is replaced before the
    /// write. Any failure leaves the connection closed.
    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        let result = self.try_write(bytes);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn try_write(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.half_close_detection
            && let Some(stream) = self.stream.as_mut()
            && stream.peer_half_closed()?
        {
            debug!(
                "femtofluent: {} closed its side of the connection; reconnecting",
                self.address
            );
            self.close();
        }
        self.connect()?;
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no active socket"))?;
        stream.write_all(bytes)?;
        stream.flush()
    }

    /// Shut down both directions and drop the socket. Safe to call when not
    /// connected; shutdown errors are ignored.
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.shutdown();
            debug!("femtofluent: closed connection to {}", self.address);
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("address", &self.address)
            .field("connected", &self.is_connected())
            .finish()
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                return Ok(stream);
            }
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::NotFound,
            format!("no addresses resolved for {host}:{port}"),
        )
    }))
}

#[cfg(feature = "tls")]
fn tls_connector(options: &TlsOptions) -> io::Result<TlsConnector> {
    let mut builder = TlsConnector::builder();
    if options.insecure_skip_verify {
        builder.danger_accept_invalid_certs(true);
        builder.danger_accept_invalid_hostnames(true);
    }
    builder.build().map_err(io::Error::other)
}

fn open_stream(address: &Address, timeout: Duration) -> io::Result<Stream> {
    match address {
        Address::Tcp {
            host,
            port,
            tls: None,
        } => Ok(Stream::Tcp(connect_tcp(host, *port, timeout)?)),
        Address::Tcp {
            host,
            port,
            tls: Some(options),
        } => {
            #[cfg(feature = "tls")]
            {
                let stream = connect_tcp(host, *port, timeout)?;
                let stream = tls_connector(options)?
                    .connect(&options.domain, stream)
                    .map_err(io::Error::other)?;
                Ok(Stream::Tls(Box::new(stream)))
            }
            #[cfg(not(feature = "tls"))]
            {
                let _ = (host, port, options, timeout);
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "tls support is not compiled in",
                ))
            }
        }
        Address::Unix(path) => {
            #[cfg(unix)]
            {
                let stream = UnixStream::connect(path)?;
                stream.set_read_timeout(Some(timeout))?;
                stream.set_write_timeout(Some(timeout))?;
                Ok(Stream::Unix(stream))
            }
            #[cfg(not(unix))]
            {
                let _ = (path, timeout);
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix domain sockets are not supported on this platform",
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests;
