//! The connection manager's event loop.
//!
//! Everything here runs on one thread inside a current-thread tokio runtime.
//! Connect attempts and socket reads are tasks on that runtime which report
//! back over a channel, so every connection state transition happens in
//! [`EventLoop::handle`] and no connection state is shared with callers.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    io, mem,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use rmpv::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::{Notify, mpsc},
    task::JoinHandle,
};

use crate::{codec::Decoder, error::SenderError, sender::queue::QueueItem};

use super::{
    backoff::{BackoffPolicy, BackoffState},
    handshake::{Credentials, Handshake, ServerMessage},
    manager::{Outgoing, OutgoingQueue, Shared},
    strategy::SelectionStrategy,
    url::{Endpoint, PeerAddr},
};

type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

const READ_BUFFER_SIZE: usize = 4096;

enum ConnEvent {
    Connected {
        id: u64,
        addr: PeerAddr,
        reader: BoxReader,
        writer: BoxWriter,
    },
    ConnectFailed {
        id: u64,
        addr: PeerAddr,
        error: io::Error,
    },
    Received {
        id: u64,
        addr: PeerAddr,
        value: Value,
    },
    Closed {
        id: u64,
        addr: PeerAddr,
        error: Option<SenderError>,
    },
}

struct Peer {
    id: u64,
    handshake: Handshake,
    writer: BoxWriter,
    reader: JoinHandle<()>,
    // Written but not yet acknowledged, oldest first.
    in_flight: Vec<Outgoing>,
}

enum Link {
    Connecting { id: u64 },
    Open(Peer),
    Waiting { until: Instant },
}

struct AddrSlot {
    backoff: BackoffState,
    link: Link,
}

impl AddrSlot {
    fn peer(&self) -> Option<&Peer> {
        match &self.link {
            Link::Open(peer) => Some(peer),
            _ => None,
        }
    }

    fn peer_mut(&mut self, id: u64) -> Option<&mut Peer> {
        match &mut self.link {
            Link::Open(peer) if peer.id == id => Some(peer),
            _ => None,
        }
    }
}

/// Settings the loop needs from `ManagerConfig`.
pub(crate) struct LoopSettings {
    pub endpoints: Vec<Endpoint>,
    pub credentials: Credentials,
    pub strategy: Box<dyn SelectionStrategy>,
    pub timeout: Duration,
    pub refresh_period: Duration,
    pub backoff: BackoffPolicy,
    pub require_ack: bool,
}

pub(crate) struct EventLoop {
    settings: LoopSettings,
    queue: OutgoingQueue,
    wake: Arc<Notify>,
    shared: Arc<Shared>,
    slots: BTreeMap<PeerAddr, AddrSlot>,
    retry: VecDeque<Outgoing>,
    events_tx: mpsc::UnboundedSender<ConnEvent>,
    events_rx: mpsc::UnboundedReceiver<ConnEvent>,
    next_id: u64,
    next_refresh: Instant,
}

enum Wake {
    Event(Option<ConnEvent>),
    Notified,
    Timer,
}

impl EventLoop {
    pub fn new(
        settings: LoopSettings,
        queue: OutgoingQueue,
        wake: Arc<Notify>,
        shared: Arc<Shared>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            settings,
            queue,
            wake,
            shared,
            slots: BTreeMap::new(),
            retry: VecDeque::new(),
            events_tx,
            events_rx,
            next_id: 0,
            next_refresh: Instant::now(),
        }
    }

    /// Run until the queue is closed and drained, or the close grace period
    /// has passed.
    pub async fn run(mut self) {
        let mut close_deadline: Option<Instant> = None;
        loop {
            let now = Instant::now();
            if close_deadline.is_none() && self.queue.is_closed() {
                close_deadline = Some(now + self.settings.timeout);
            }
            if close_deadline.is_none() && now >= self.next_refresh {
                self.refresh(now).await;
            }
            self.reconnect_due(Instant::now());
            self.dispatch().await;
            if let Some(deadline) = close_deadline
                && (self.is_drained() || Instant::now() >= deadline)
            {
                break;
            }

            let wake_at = tokio::time::Instant::from_std(self.next_wakeup(close_deadline));
            let wake = tokio::select! {
                event = self.events_rx.recv() => Wake::Event(event),
                () = self.wake.notified() => Wake::Notified,
                () = tokio::time::sleep_until(wake_at) => Wake::Timer,
            };
            match wake {
                Wake::Event(Some(event)) => self.handle(event).await,
                Wake::Event(None) | Wake::Notified | Wake::Timer => {}
            }
        }
        self.shutdown();
    }

    async fn handle(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Connected {
                id,
                addr,
                reader,
                writer,
            } => self.on_connected(id, addr, reader, writer),
            ConnEvent::ConnectFailed { id, addr, error } => {
                let current = self
                    .slots
                    .get(&addr)
                    .is_some_and(|slot| matches!(slot.link, Link::Connecting { id: c } if c == id));
                if current {
                    debug!("femtofluent: connect to {addr} failed: {error}");
                    self.shared.errors.publish(error.into());
                    self.schedule_retry(&addr, Instant::now());
                }
            }
            ConnEvent::Received { id, addr, value } => self.on_received(id, addr, value).await,
            ConnEvent::Closed { id, addr, error } => {
                let current = self
                    .slots
                    .get_mut(&addr)
                    .is_some_and(|slot| slot.peer_mut(id).is_some());
                if current {
                    let error = error.unwrap_or_else(|| {
                        io::Error::new(io::ErrorKind::ConnectionAborted, "closed by peer").into()
                    });
                    self.close_peer(&addr, error);
                }
            }
        }
    }

    fn on_connected(&mut self, id: u64, addr: PeerAddr, reader: BoxReader, writer: BoxWriter) {
        let Some(slot) = self.slots.get_mut(&addr) else {
            return;
        };
        if !matches!(slot.link, Link::Connecting { id: c } if c == id) {
            return;
        }
        debug!("femtofluent: connected to {addr}");
        let handshake = Handshake::new(&self.settings.credentials);
        let ready = handshake.is_ready();
        let reader = tokio::spawn(read_loop(id, addr.clone(), reader, self.events_tx.clone()));
        slot.link = Link::Open(Peer {
            id,
            handshake,
            writer,
            reader,
            in_flight: Vec::new(),
        });
        if ready {
            self.mark_ready(&addr);
        }
    }

    async fn on_received(&mut self, id: u64, addr: PeerAddr, value: Value) {
        let outcome = match ServerMessage::from_value(value) {
            Ok(ServerMessage::Heartbeat) => Ok(()),
            Ok(ServerMessage::Helo(helo)) => self.answer_helo(id, &addr, &helo).await,
            Ok(ServerMessage::Pong(pong)) => self.check_pong(id, &addr, &pong),
            Ok(ServerMessage::Ack(chunk)) => {
                if let Some(peer) = self.slots.get_mut(&addr).and_then(|slot| slot.peer_mut(id)) {
                    let before = peer.in_flight.len();
                    peer.in_flight.retain(|item| item.chunk.as_deref() != Some(chunk.as_str()));
                    if peer.in_flight.len() == before {
                        debug!("femtofluent: {addr} acknowledged unknown chunk {chunk}");
                    }
                }
                Ok(())
            }
            Err(err) => Err(err),
        };
        if let Err(err) = outcome {
            let current = self
                .slots
                .get_mut(&addr)
                .is_some_and(|slot| slot.peer_mut(id).is_some());
            if current {
                self.close_peer(&addr, err);
            }
        }
    }

    async fn answer_helo(&mut self, id: u64, addr: &PeerAddr, helo: &Value) -> Result<(), SenderError> {
        let timeout = self.settings.timeout;
        let credentials = &self.settings.credentials;
        let Some(peer) = self.slots.get_mut(addr).and_then(|slot| slot.peer_mut(id)) else {
            return Ok(());
        };
        let ping = peer.handshake.on_helo(helo, credentials)?;
        write_with_timeout(&mut peer.writer, &ping, timeout).await?;
        debug!("femtofluent: sent PING to {addr}");
        Ok(())
    }

    fn check_pong(&mut self, id: u64, addr: &PeerAddr, pong: &Value) -> Result<(), SenderError> {
        let credentials = &self.settings.credentials;
        let Some(peer) = self.slots.get_mut(addr).and_then(|slot| slot.peer_mut(id)) else {
            return Ok(());
        };
        peer.handshake.on_pong(pong, credentials)?;
        self.mark_ready(addr);
        Ok(())
    }

    fn mark_ready(&mut self, addr: &PeerAddr) {
        if let Some(slot) = self.slots.get_mut(addr) {
            slot.backoff.record_success();
        }
        info!("femtofluent: connection to {addr} is ready");
        self.publish_ready();
    }

    /// Tear down the connection to `addr` and schedule a reconnect. Messages
    /// still in flight go back to the front of the retry queue.
    fn close_peer(&mut self, addr: &PeerAddr, error: SenderError) {
        let Some(slot) = self.slots.get_mut(addr) else {
            return;
        };
        let link = mem::replace(&mut slot.link, Link::Waiting {
            until: Instant::now(),
        });
        if let Link::Open(peer) = link {
            self.requeue(peer);
        }
        warn!("femtofluent: connection to {addr} closed: {error}");
        self.shared.errors.publish(error);
        self.schedule_retry(addr, Instant::now());
        self.publish_ready();
    }

    fn requeue(&mut self, peer: Peer) {
        peer.reader.abort();
        for item in peer.in_flight.into_iter().rev() {
            self.retry.push_front(item);
        }
    }

    fn schedule_retry(&mut self, addr: &PeerAddr, now: Instant) {
        let Some(slot) = self.slots.get_mut(addr) else {
            return;
        };
        match slot.backoff.next_sleep(now) {
            Some(delay) => {
                debug!("femtofluent: reconnecting to {addr} in {delay:?}");
                slot.link = Link::Waiting { until: now + delay };
            }
            None => {
                warn!("femtofluent: giving up on {addr} until the next refresh");
                self.slots.remove(addr);
            }
        }
    }

    fn reconnect_due(&mut self, now: Instant) {
        let due: Vec<PeerAddr> = self
            .slots
            .iter()
            .filter(|(_, slot)| matches!(slot.link, Link::Waiting { until } if until <= now))
            .map(|(addr, _)| addr.clone())
            .collect();
        for addr in due {
            self.start_connect(addr);
        }
    }

    fn start_connect(&mut self, addr: PeerAddr) {
        self.next_id += 1;
        let id = self.next_id;
        let slot = self
            .slots
            .entry(addr.clone())
            .or_insert_with(|| AddrSlot {
                backoff: BackoffState::new(self.settings.backoff.clone()),
                link: Link::Connecting { id },
            });
        slot.link = Link::Connecting { id };

        let events = self.events_tx.clone();
        let timeout = self.settings.timeout;
        tokio::spawn(async move {
            let event = match tokio::time::timeout(timeout, open(&addr)).await {
                Ok(Ok((reader, writer))) => ConnEvent::Connected {
                    id,
                    addr,
                    reader,
                    writer,
                },
                Ok(Err(error)) => ConnEvent::ConnectFailed { id, addr, error },
                Err(_) => ConnEvent::ConnectFailed {
                    id,
                    addr,
                    error: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                },
            };
            let _ = events.send(event);
        });
    }

    /// Re-resolve every endpoint, closing addresses that disappeared and
    /// connecting to new ones.
    async fn refresh(&mut self, now: Instant) {
        self.next_refresh = now + self.settings.refresh_period;
        let mut desired = BTreeSet::new();
        let mut complete = true;
        for endpoint in &self.settings.endpoints {
            match endpoint.resolve_async().await {
                Ok(addrs) => desired.extend(addrs),
                Err(err) => {
                    complete = false;
                    warn!("femtofluent: failed to resolve {endpoint}: {err}");
                    self.shared.errors.publish(err.into());
                }
            }
        }

        // A failed lookup says nothing about membership; only add.
        if complete {
            let removed: Vec<PeerAddr> = self
                .slots
                .keys()
                .filter(|addr| !desired.contains(*addr))
                .cloned()
                .collect();
            for addr in removed {
                if let Some(slot) = self.slots.remove(&addr) {
                    debug!("femtofluent: {addr} left the endpoint set");
                    if let Link::Open(peer) = slot.link {
                        self.requeue(peer);
                    }
                }
            }
        }
        for addr in desired {
            if !self.slots.contains_key(&addr) {
                self.start_connect(addr);
            }
        }
        self.publish_ready();
    }

    fn ready_addrs(&self) -> Vec<PeerAddr> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.peer().is_some_and(|peer| peer.handshake.is_ready()))
            .map(|(addr, _)| addr.clone())
            .collect()
    }

    fn publish_ready(&self) {
        self.shared.set_ready(self.ready_addrs().len());
    }

    /// Send retried then queued messages while a ready connection exists.
    async fn dispatch(&mut self) {
        loop {
            let ready = self.ready_addrs();
            if ready.is_empty() {
                return;
            }
            let item = match self.retry.pop_front() {
                Some(item) => item,
                None => match self.queue.try_pop() {
                    Some(QueueItem::Item(item)) => item,
                    Some(QueueItem::Close) => continue,
                    None => return,
                },
            };
            let index = self.settings.strategy.select(&ready);
            let Some(addr) = ready.get(index).or_else(|| ready.first()).cloned() else {
                self.retry.push_front(item);
                return;
            };
            self.send_to(&addr, item).await;
        }
    }

    async fn send_to(&mut self, addr: &PeerAddr, item: Outgoing) {
        let timeout = self.settings.timeout;
        let require_ack = self.settings.require_ack;
        let Some(Link::Open(peer)) = self.slots.get_mut(addr).map(|slot| &mut slot.link) else {
            self.retry.push_front(item);
            return;
        };
        let written = write_with_timeout(&mut peer.writer, &item.bytes, timeout).await;
        match written {
            Ok(()) => {
                if require_ack && item.chunk.is_some() {
                    peer.in_flight.push(item);
                }
            }
            Err(err) => {
                self.retry.push_front(item);
                self.close_peer(addr, err.into());
            }
        }
    }

    fn is_drained(&self) -> bool {
        self.retry.is_empty()
            && self.queue.is_empty()
            && self
                .slots
                .values()
                .all(|slot| slot.peer().is_none_or(|peer| peer.in_flight.is_empty()))
    }

    /// Earliest pending reconnect, refresh or close deadline. Refreshes stop
    /// once closing starts, so their due time no longer counts.
    fn next_wakeup(&self, close_deadline: Option<Instant>) -> Instant {
        let retries = self.slots.values().filter_map(|slot| match slot.link {
            Link::Waiting { until } => Some(until),
            _ => None,
        });
        let refresh = close_deadline.is_none().then_some(self.next_refresh);
        retries
            .chain(close_deadline)
            .chain(refresh)
            .min()
            .unwrap_or(self.next_refresh)
    }

    /// Hand every undelivered message to the overflow handler and drop all
    /// connections.
    fn shutdown(mut self) {
        let mut leftovers = Vec::new();
        for (addr, slot) in mem::take(&mut self.slots) {
            if let Link::Open(peer) = slot.link {
                debug!("femtofluent: closing connection to {addr}");
                peer.reader.abort();
                leftovers.extend(peer.in_flight);
            }
        }
        leftovers.extend(self.retry.drain(..));
        leftovers.extend(self.queue.drain());
        for item in &leftovers {
            self.queue.overflow(&item.bytes);
        }
        self.queue.flush_warnings();
        self.shared.set_ready(0);
    }
}

async fn write_with_timeout(
    writer: &mut BoxWriter,
    bytes: &[u8],
    timeout: Duration,
) -> io::Result<()> {
    match tokio::time::timeout(timeout, writer.write_all(bytes)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "write timed out")),
    }
}

async fn open(addr: &PeerAddr) -> io::Result<(BoxReader, BoxWriter)> {
    match addr {
        PeerAddr::Inet(socket) => {
            let stream = TcpStream::connect(socket).await?;
            stream.set_nodelay(true)?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(unix)]
        PeerAddr::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            let (reader, writer) = stream.into_split();
            Ok((Box::new(reader), Box::new(writer)))
        }
        #[cfg(not(unix))]
        PeerAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
    }
}

async fn read_loop(
    id: u64,
    addr: PeerAddr,
    mut reader: BoxReader,
    events: mpsc::UnboundedSender<ConnEvent>,
) {
    let mut decoder = Decoder::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];
    let error = loop {
        match reader.read(&mut buf).await {
            Ok(0) => break None,
            Ok(n) => {
                decoder.feed(&buf[..n]);
                match decoder.drain_values() {
                    Ok(values) => {
                        for value in values {
                            let event = ConnEvent::Received {
                                id,
                                addr: addr.clone(),
                                value,
                            };
                            if events.send(event).is_err() {
                                return;
                            }
                        }
                    }
                    Err(err) => break Some(SenderError::Protocol(err.to_string())),
                }
            }
            Err(err) => break Some(SenderError::Transport(err)),
        }
    };
    let _ = events.send(ConnEvent::Closed { id, addr, error });
}
