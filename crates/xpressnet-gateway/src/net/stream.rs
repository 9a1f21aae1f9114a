use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::SocketAddr,
};

use mio::{Interest, Registry, Token, event::Event};
use tracing::{debug, warn};

/// Hard cap on a single inbound text message. A client that streams more
/// than this without a message boundary is cut off.
const MAX_MESSAGE_LEN: usize = 64 * 1024;
const RX_BUF_SIZE: usize = 8 * 1024;

/// Response type for all external calls.
///
/// `Alive` means the connection is still usable.
/// `Disconnected` means the peer is gone and must be dropped.
#[derive(Debug, PartialEq, Eq)]
pub enum ConnState {
    Alive,
    Disconnected,
}

/// What to do with a subscriber whose outbound backlog is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Shed the oldest queued message and keep the subscriber.
    #[default]
    DropOldest,
    /// Treat a full backlog as a dead subscriber.
    Close,
}

/// Single mio-backed client connection.
///
/// Messages are whole lines of text: one JSON document per `\n`-terminated
/// line in each direction (the websocket layer in front of the gateway maps
/// its text frames onto exactly this boundary).
///
/// Outbound:
///   - `write_or_enqueue(msg)` appends the newline and attempts a
///     non-blocking write.
///   - Any unwritten remainder joins a bounded backlog flushed whenever the
///     socket becomes writable.
///   - On overflow the oldest whole queued message is shed (or the
///     connection reported dead, per [`OverflowPolicy`]); a partially
///     written head is never torn.
///
/// Inbound:
///   - Reads are assembled into lines; `poll_with` invokes the callback
///     once per complete message.
pub struct ClientStream {
    stream: mio::net::TcpStream,
    token: Token,
    peer_addr: SocketAddr,

    rx_buf: Vec<u8>,
    line_buf: Vec<u8>,

    send_backlog: VecDeque<Vec<u8>>,
    /// Bytes of the backlog front already handed to the kernel.
    front_written: usize,
    backlog_cap: usize,
    policy: OverflowPolicy,
    dropped: u64,

    /// True if WRITABLE interest is currently registered in the poll.
    writable_armed: bool,
}

impl ClientStream {
    pub const DEFAULT_BACKLOG_CAP: usize = 64;

    pub fn new(
        stream: mio::net::TcpStream,
        token: Token,
        peer_addr: SocketAddr,
        backlog_cap: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            stream,
            token,
            peer_addr,
            rx_buf: vec![0; RX_BUF_SIZE],
            line_buf: Vec::new(),
            send_backlog: VecDeque::new(),
            front_written: 0,
            backlog_cap,
            policy,
            dropped: 0,
            writable_armed: false,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Messages shed so far because this subscriber could not keep up.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Polls the socket and calls `on_msg` for every complete message.
    /// Message text is only valid for the duration of the callback.
    pub fn poll_with<F>(&mut self, registry: &Registry, ev: &Event, on_msg: &mut F) -> ConnState
    where
        F: FnMut(Token, &str),
    {
        if ev.is_readable() && self.read_messages(on_msg) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }
        if ev.is_writable() && self.drain_backlog(registry) == ConnState::Disconnected {
            return ConnState::Disconnected;
        }
        ConnState::Alive
    }

    /// Happy path: writes the message straight to the socket. A partial
    /// write or `WouldBlock` parks the bytes in the backlog for the next
    /// writable event.
    pub fn write_or_enqueue(&mut self, registry: &Registry, msg: &str) -> ConnState {
        let mut data = Vec::with_capacity(msg.len() + 1);
        data.extend_from_slice(msg.as_bytes());
        data.push(b'\n');

        if !self.send_backlog.is_empty() {
            return self.enqueue(registry, data);
        }
        match self.stream.write(&data) {
            Ok(0) => {
                warn!(peer = %self.peer_addr, "client: wrote nothing, disconnecting");
                ConnState::Disconnected
            }
            Ok(n) if n == data.len() => ConnState::Alive,
            Ok(n) => {
                self.send_backlog.push_back(data);
                self.front_written = n;
                self.arm_writable(registry)
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => self.enqueue(registry, data),
            Err(err) => {
                warn!(?err, peer = %self.peer_addr, "client: write failed");
                ConnState::Disconnected
            }
        }
    }

    pub fn close(&mut self, registry: &Registry) -> SocketAddr {
        debug!(peer = %self.peer_addr, "client: terminating connection");
        let _ = registry.deregister(&mut self.stream);
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        self.peer_addr
    }

    fn read_messages<F>(&mut self, on_msg: &mut F) -> ConnState
    where
        F: FnMut(Token, &str),
    {
        loop {
            match self.stream.read(&mut self.rx_buf) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.line_buf.extend_from_slice(&self.rx_buf[..n]);
                    while let Some(pos) = self.line_buf.iter().position(|&b| b == b'\n') {
                        let line: Vec<u8> = self.line_buf.drain(..=pos).collect();
                        let text = &line[..line.len() - 1];
                        let text = text.strip_suffix(b"\r").unwrap_or(text);
                        match std::str::from_utf8(text) {
                            Ok(text) if !text.trim().is_empty() => on_msg(self.token, text),
                            Ok(_) => {}
                            Err(_) => {
                                debug!(peer = %self.peer_addr, "client: non-utf8 message dropped");
                            }
                        }
                    }
                    if self.line_buf.len() > MAX_MESSAGE_LEN {
                        warn!(peer = %self.peer_addr, "client: unterminated message too large");
                        return ConnState::Disconnected;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return ConnState::Alive,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, peer = %self.peer_addr, "client: read failed");
                    return ConnState::Disconnected;
                }
            }
        }
    }

    /// Flushes queued messages until the kernel blocks or the queue is
    /// empty. WRITABLE interest is dropped only when fully drained.
    fn drain_backlog(&mut self, registry: &Registry) -> ConnState {
        while let Some(front) = self.send_backlog.front() {
            match self.stream.write(&front[self.front_written..]) {
                Ok(0) => return ConnState::Disconnected,
                Ok(n) => {
                    self.front_written += n;
                    if self.front_written == front.len() {
                        self.send_backlog.pop_front();
                        self.front_written = 0;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!(?err, peer = %self.peer_addr, "client: backlog write failed");
                    return ConnState::Disconnected;
                }
            }
        }

        if self.send_backlog.is_empty() && self.writable_armed {
            if let Err(err) =
                registry.reregister(&mut self.stream, self.token, Interest::READABLE)
            {
                debug!(?err, "client: reregister drop writable");
                return ConnState::Disconnected;
            }
            self.writable_armed = false;
        }
        ConnState::Alive
    }

    fn enqueue(&mut self, registry: &Registry, data: Vec<u8>) -> ConnState {
        if self.send_backlog.len() >= self.backlog_cap {
            match self.policy {
                OverflowPolicy::Close => {
                    warn!(peer = %self.peer_addr, "client: backlog overflow, closing");
                    return ConnState::Disconnected;
                }
                OverflowPolicy::DropOldest => {
                    let front_in_flight = self.front_written > 0;
                    if front_in_flight && self.send_backlog.len() == 1 {
                        // The only queued message is mid-transmission; shed
                        // the incoming one instead of tearing the wire.
                        self.dropped += 1;
                        return self.arm_writable(registry);
                    }
                    self.send_backlog.remove(usize::from(front_in_flight));
                    self.dropped += 1;
                }
            }
        }
        self.send_backlog.push_back(data);
        self.arm_writable(registry)
    }

    /// Arms WRITABLE notifications when transitioning from an empty to a
    /// non-empty queue.
    fn arm_writable(&mut self, registry: &Registry) -> ConnState {
        if !self.writable_armed {
            if let Err(err) = registry.reregister(
                &mut self.stream,
                self.token,
                Interest::READABLE | Interest::WRITABLE,
            ) {
                debug!(?err, "client: poll reregister failed");
                return ConnState::Disconnected;
            }
            self.writable_armed = true;
        }
        ConnState::Alive
    }
}
