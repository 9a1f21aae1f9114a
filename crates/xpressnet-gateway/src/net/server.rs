use std::{io, net::SocketAddr, time::Duration};

use mio::{Events, Interest, Poll, Token, net::TcpListener};
use tracing::{error, info, warn};

use crate::net::stream::{ClientStream, ConnState, OverflowPolicy};

const LISTENER: Token = Token(0);

/// Event emitted by [`SocketServer::poll_with`] for each notable IO
/// occurrence.
pub enum SocketEvent<'a> {
    /// A new client was accepted.
    Connected { token: Token, peer_addr: SocketAddr },
    /// A client went away (remote close, IO error, or overflow under the
    /// strict policy).
    Disconnected { token: Token },
    /// A complete inbound text message.
    Message { token: Token, text: &'a str },
}

struct ConnectionSet {
    poll: Poll,
    listener: TcpListener,
    conns: Vec<(Token, ClientStream)>,
    next_token: usize,
    backlog_cap: usize,
    policy: OverflowPolicy,
}

impl ConnectionSet {
    fn disconnect_at_index(&mut self, index: usize) {
        let (_, mut stream) = self.conns.swap_remove(index);
        stream.close(self.poll.registry());
    }

    fn disconnect_token(&mut self, token: Token) {
        if let Some(i) = self.conns.iter().position(|(t, _)| *t == token) {
            self.disconnect_at_index(i);
        }
    }

    fn broadcast(&mut self, text: &str) {
        let mut i = self.conns.len();
        while i != 0 {
            i -= 1;
            let (_, stream) = &mut self.conns[i];
            if stream.write_or_enqueue(self.poll.registry(), text) == ConnState::Disconnected {
                self.disconnect_at_index(i);
            }
        }
    }

    fn send_to(&mut self, token: Token, text: &str) {
        if let Some(i) = self.conns.iter().position(|(t, _)| *t == token) {
            let (_, stream) = &mut self.conns[i];
            if stream.write_or_enqueue(self.poll.registry(), text) == ConnState::Disconnected {
                warn!("issue when writing to {token:?}, disconnecting");
                self.disconnect_at_index(i);
            }
        } else {
            // Token may legitimately be gone; replies race disconnects.
            tracing::debug!("send to unknown client token {token:?}");
        }
    }

    fn accept_all<F>(&mut self, handler: &mut F)
    where
        F: for<'a> FnMut(SocketEvent<'a>),
    {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer_addr)) => {
                    info!(?peer_addr, "client connected");
                    let token = Token(self.next_token);
                    if let Err(err) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE,
                    ) {
                        error!(?err, "couldn't register client");
                        let _ = stream.shutdown(std::net::Shutdown::Both);
                        continue;
                    }
                    self.conns.push((
                        token,
                        ClientStream::new(stream, token, peer_addr, self.backlog_cap, self.policy),
                    ));
                    self.next_token += 1;
                    handler(SocketEvent::Connected { token, peer_addr });
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) => {
                    warn!(?err, "accept failed");
                    return;
                }
            }
        }
    }

    fn handle_event<F>(&mut self, ev: &mio::event::Event, handler: &mut F)
    where
        F: for<'a> FnMut(SocketEvent<'a>),
    {
        let token = ev.token();
        if token == LISTENER {
            self.accept_all(handler);
            return;
        }
        let Some(index) = self.conns.iter().position(|(t, _)| *t == token) else {
            // Stale event for a client dropped earlier in this poll batch.
            return;
        };
        let (_, stream) = &mut self.conns[index];
        let state = stream.poll_with(self.poll.registry(), ev, &mut |token, text| {
            handler(SocketEvent::Message { token, text });
        });
        if state == ConnState::Disconnected {
            handler(SocketEvent::Disconnected { token });
            self.disconnect_at_index(index);
        }
    }
}

/// Non-blocking message server for the gateway's subscribers, built on
/// `mio`.
///
/// Accepts inbound connections on one listener, assembles whole text
/// messages per client, and fans broadcasts out with non-blocking writes so
/// a slow subscriber can never stall the dispatcher. Drive all IO by
/// calling [`poll_with`] from the dispatcher loop.
///
/// ## Tokens
/// Every client is identified by a `mio::Token`, reported on accept and
/// attached to every message, so single-client replies can be routed with
/// [`send_to`].
pub struct SocketServer {
    events: Events,
    set: ConnectionSet,
}

impl SocketServer {
    /// Binds the listener. This is the only fatal failure in the gateway;
    /// everything downstream degrades instead.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;
        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            events: Events::with_capacity(128),
            set: ConnectionSet {
                poll,
                listener,
                conns: Vec::new(),
                next_token: LISTENER.0 + 1,
                backlog_cap: ClientStream::DEFAULT_BACKLOG_CAP,
                policy: OverflowPolicy::default(),
            },
        })
    }

    /// Treat a full subscriber backlog as a dead client instead of
    /// shedding the oldest message.
    pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.set.policy = policy;
        self
    }

    pub fn with_backlog_cap(mut self, cap: usize) -> Self {
        self.set.backlog_cap = cap;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.set.listener.local_addr()
    }

    pub fn client_count(&self) -> usize {
        self.set.conns.len()
    }

    /// Polls sockets once and dispatches events via [`SocketEvent`].
    /// Returns whether any IO events were processed.
    pub fn poll_with<F>(&mut self, timeout: Option<Duration>, mut handler: F) -> bool
    where
        F: for<'a> FnMut(SocketEvent<'a>),
    {
        if let Err(err) = self.set.poll.poll(&mut self.events, timeout) {
            if err.kind() != io::ErrorKind::Interrupted {
                error!(?err, "poll failed");
            }
            return false;
        }
        let mut any = false;
        for ev in self.events.iter() {
            any = true;
            self.set.handle_event(ev, &mut handler);
        }
        any
    }

    /// Queues `text` to every connected client, non-blocking.
    pub fn broadcast(&mut self, text: &str) {
        self.set.broadcast(text);
    }

    /// Queues `text` to one client, non-blocking.
    pub fn send_to(&mut self, token: Token, text: &str) {
        self.set.send_to(token, text);
    }

    pub fn disconnect(&mut self, token: Token) {
        self.set.disconnect_token(token);
    }
}
