//! Serial transport: exclusive owner of the port handle and the raw
//! receive buffer.
//!
//! Writes are serialized behind a single writer guard and are atomic per
//! frame. A dedicated reader thread drains the port through the stream
//! framer and decoder, pushing events into the dispatcher channel in wire
//! arrival order. I/O failures on either side drop the link, flip the
//! connection state and surface a single `Disconnected` event; reopening
//! is attempted from the dispatcher tick, and only while disconnected.

use std::{
    io::{self, Read, Write},
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};
use xpressnet::{
    frame::{FramerEvent, StreamFramer},
    reply::{self, Reply},
};

use crate::{envelope::to_hex, error::GatewayError};

pub const READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Connection state of the serial link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connection {
    Connected,
    Disconnected,
}

/// Everything the dispatcher hears from the serial side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A decoded reply. `raw` is the verified wire frame when one exists
    /// (the mock controller synthesizes replies without one).
    Reply { reply: Reply, raw: Option<Vec<u8>> },
    Connected,
    Disconnected,
}

/// Both halves of an open link. `serialport` handles are cloneable, and
/// serial ports allow simultaneous read and write, so the reader thread and
/// the writer guard can work the port concurrently.
pub struct Link {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
}

pub type LinkOpener = Box<dyn Fn() -> io::Result<Link> + Send>;

/// Opener for a real port: 8N1 at `baud` with a 1 s read timeout, which
/// also bounds how long the reader takes to notice a shutdown request.
pub fn serial_opener(device: String, baud: u32) -> LinkOpener {
    Box::new(move || {
        let writer = serialport::new(device.as_str(), baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(io::Error::other)?;
        let reader = writer.try_clone().map_err(io::Error::other)?;
        Ok(Link { reader: Box::new(reader), writer: Box::new(writer) })
    })
}

struct WriterSlot {
    writer: Box<dyn Write + Send>,
    last_send: Option<Instant>,
}

struct Shared {
    writer: Mutex<Option<WriterSlot>>,
    connected: AtomicBool,
    stop: AtomicBool,
}

impl Shared {
    /// Drops the link and reports the transition exactly once, no matter
    /// which side noticed the failure first.
    fn drop_link(&self, events: &Sender<TransportEvent>) {
        *self.writer.lock().expect("writer lock poisoned") = None;
        if self.connected.swap(false, Ordering::SeqCst) {
            let _ = events.send(TransportEvent::Disconnected);
        }
    }
}

pub struct SerialTransport {
    opener: LinkOpener,
    command_delay: Duration,
    events: Sender<TransportEvent>,
    shared: Arc<Shared>,
    reader: Option<thread::JoinHandle<()>>,
}

impl SerialTransport {
    pub fn new(opener: LinkOpener, command_delay: Duration, events: Sender<TransportEvent>) -> Self {
        Self {
            opener,
            command_delay,
            events,
            shared: Arc::new(Shared {
                writer: Mutex::new(None),
                connected: AtomicBool::new(false),
                stop: AtomicBool::new(false),
            }),
            reader: None,
        }
    }

    pub fn status(&self) -> Connection {
        if self.shared.connected.load(Ordering::SeqCst) {
            Connection::Connected
        } else {
            Connection::Disconnected
        }
    }

    /// Attempts to open the port if, and only if, the link is down.
    pub fn maybe_reconnect(&mut self) {
        if self.status() == Connection::Connected || self.shared.stop.load(Ordering::SeqCst) {
            return;
        }
        // A previous reader, if any, has observed the disconnect by now.
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        match (self.opener)() {
            Ok(link) => self.install(link),
            Err(err) => debug!(?err, "serial: open failed"),
        }
    }

    fn install(&mut self, link: Link) {
        *self.shared.writer.lock().expect("writer lock poisoned") =
            Some(WriterSlot { writer: link.writer, last_send: None });
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        let events = self.events.clone();
        let handle = thread::Builder::new()
            .name("serial-reader".into())
            .spawn(move || reader_loop(link.reader, &shared, &events))
            .expect("couldn't spawn serial reader");
        self.reader = Some(handle);

        info!("serial: connected");
        let _ = self.events.send(TransportEvent::Connected);
    }

    /// Writes one complete frame. The guard is held for the duration of
    /// this frame only; the inter-command delay is enforced here so frames
    /// are never slammed back to back at the Elite.
    pub fn send(&self, frame: &[u8]) -> Result<(), GatewayError> {
        let mut guard = self.shared.writer.lock().expect("writer lock poisoned");
        let Some(slot) = guard.as_mut() else {
            return Err(GatewayError::NotConnected);
        };
        if let Some(last) = slot.last_send {
            let since = last.elapsed();
            if since < self.command_delay {
                thread::sleep(self.command_delay - since);
            }
        }
        match slot.writer.write_all(frame).and_then(|()| slot.writer.flush()) {
            Ok(()) => {
                slot.last_send = Some(Instant::now());
                debug!(frame = %to_hex(frame), "serial: sent");
                Ok(())
            }
            Err(err) => {
                warn!(?err, "serial: write failed, dropping link");
                drop(guard);
                self.shared.drop_link(&self.events);
                Err(GatewayError::Transport(err))
            }
        }
    }

    /// Idempotent shutdown: signals the reader, releases the handle and
    /// joins. The 1 s read timeout bounds the join well inside the 2 s
    /// teardown deadline.
    pub fn close(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        *self.shared.writer.lock().expect("writer lock poisoned") = None;
        self.shared.connected.store(false, Ordering::SeqCst);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn reader_loop(
    mut port: Box<dyn Read + Send>,
    shared: &Shared,
    events: &Sender<TransportEvent>,
) {
    let mut framer = StreamFramer::new();
    let mut buf = [0u8; 256];
    loop {
        if shared.stop.load(Ordering::SeqCst) || !shared.connected.load(Ordering::SeqCst) {
            return;
        }
        match port.read(&mut buf) {
            Ok(0) => {
                warn!("serial: device closed the stream, dropping link");
                shared.drop_link(events);
                return;
            }
            Ok(n) => {
                framer.extend(&buf[..n]);
                while let Some(ev) = framer.next_event() {
                    match ev {
                        FramerEvent::Frame(frame) => {
                            debug!(frame = %to_hex(&frame), "serial: frame");
                            let reply = reply::decode(&frame);
                            if events
                                .send(TransportEvent::Reply { reply, raw: Some(frame) })
                                .is_err()
                            {
                                // Dispatcher is gone; nothing left to do.
                                return;
                            }
                        }
                        FramerEvent::Error(err) => debug!(%err, "serial: resync"),
                    }
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                ) =>
            {
                // Idle poll; loop around and re-check the stop flag.
            }
            Err(err) => {
                warn!(?err, "serial: read failed, dropping link");
                shared.drop_link(events);
                return;
            }
        }
    }
}
