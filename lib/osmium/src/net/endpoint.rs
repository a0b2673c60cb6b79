use crate::net::channel::Channel;
use crate::net::error::{NetError, NetResult};
use crate::proto::Message;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use plasma::logging;
use std::io;
use std::net::SocketAddr;

pub type ChannelId = usize;

const LISTENER: Token = Token(usize::MAX - 1);
const EVENT_CAPACITY: usize = 256;

/// Things that happened on the wire since the last poll.
#[derive(Debug)]
pub enum EndpointEvent {
    /// A peer connected to the listener.
    Opened(ChannelId),
    /// A complete message arrived.
    Frame(ChannelId, Message),
    /// The connection is gone: peer closed, transport failure, or protocol
    /// violation.
    Closed(ChannelId),
}

/// Owns the poll, the listener and every peer connection of one component.
/// The daemon, the server and the arbiter each drive exactly one of these
/// from their single-threaded main loop.
pub struct Endpoint {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    channels: Vec<Option<Channel>>,
    free: Vec<ChannelId>,
    live: IndexSet<ChannelId>,
    log: logging::Logger,
}

impl Endpoint {
    /// Binds the listener and sets up the poll.
    pub fn bind(addr: SocketAddr, log: &logging::Logger) -> io::Result<Endpoint> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(addr)?;

        poll.registry().register(&mut listener, LISTENER, Interest::READABLE)?;

        let log = log.new(logging::o!());
        logging::debug!(log, "endpoint bound"; "context" => "bind", "addr" => %addr);

        Ok(Endpoint {
            poll,
            events: Events::with_capacity(EVENT_CAPACITY),
            listener,
            channels: Vec::new(),
            free: Vec::new(),
            live: IndexSet::new(),
            log,
        })
    }

    /// The address the listener is bound to (for ephemeral-port binds).
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Opens an outgoing connection and returns its channel id. The
    /// connection completes asynchronously; staged writes flush once the
    /// socket becomes writable.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<ChannelId> {
        let stream = TcpStream::connect(addr)?;
        let id = self.install(stream)?;

        logging::debug!(self.log, "outgoing connection";
                        "context" => "connect",
                        "addr" => %addr,
                        "channel_id" => id);

        Ok(id)
    }

    /// Number of live connections.
    #[inline]
    pub fn connection_count(&self) -> usize {
        self.live.len()
    }

    /// Stages a message on the given channel and flushes what the socket
    /// will take.
    pub fn send(&mut self, id: ChannelId, msg: &Message) -> NetResult<()> {
        let channel = match self.channels.get_mut(id).and_then(|slot| slot.as_mut()) {
            Some(channel) => channel,
            None => return Err(NetError::Closed),
        };

        channel.send(msg)
    }

    /// Sends a message to every live channel except `except`.
    pub fn broadcast(&mut self, msg: &Message, except: Option<ChannelId>) -> NetResult<()> {
        let targets: Vec<ChannelId> =
            self.live.iter().copied().filter(|&id| Some(id) != except).collect();

        for id in targets {
            self.send(id, msg)?;
        }

        Ok(())
    }

    /// Closes a channel and releases its slot.
    pub fn close(&mut self, id: ChannelId) {
        if let Some(mut channel) = self.channels.get_mut(id).and_then(|slot| slot.take()) {
            // Push out anything still staged; the peer may be mid-teardown.
            let _ = channel.flush();
            let _ = channel.deregister(self.poll.registry());
            self.live.swap_remove(&id);
            self.free.push(id);

            logging::debug!(self.log, "channel closed"; "context" => "close", "channel_id" => id);
        }
    }

    /// Blocks until socket activity, then appends the resulting events to
    /// `out`. Accepted connections, parsed frames and closed channels are
    /// reported in arrival order.
    pub fn poll(&mut self, out: &mut Vec<EndpointEvent>) -> io::Result<()> {
        loop {
            match self.poll.poll(&mut self.events, None) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|ev| (ev.token(), ev.is_readable(), ev.is_writable()))
            .collect();

        for (token, readable, writable) in ready {
            if token == LISTENER {
                self.accept_pending(out)?;
                continue;
            }

            let id = token.0;

            if readable {
                self.drain_channel(id, out);
            }

            if writable {
                self.flush_channel(id, out);
            }
        }

        // Opportunistic flush for channels with staged output whose
        // writable event already passed.
        let pending: Vec<ChannelId> = self
            .live
            .iter()
            .copied()
            .filter(|&id| {
                self.channels
                    .get(id)
                    .and_then(|slot| slot.as_ref())
                    .map_or(false, Channel::has_egress)
            })
            .collect();

        for id in pending {
            self.flush_channel(id, out);
        }

        Ok(())
    }

    fn accept_pending(&mut self, out: &mut Vec<EndpointEvent>) -> io::Result<()> {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    let id = self.install(stream)?;

                    logging::debug!(self.log, "accepted connection";
                                    "context" => "accept",
                                    "addr" => %addr,
                                    "channel_id" => id);

                    out.push(EndpointEvent::Opened(id));
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn install(&mut self, stream: TcpStream) -> io::Result<ChannelId> {
        let mut channel = Channel::new(stream, &self.log);

        let id = match self.free.pop() {
            Some(id) => id,
            None => {
                self.channels.push(None);
                self.channels.len() - 1
            }
        };

        channel.register(self.poll.registry(), Token(id))?;
        self.channels[id] = Some(channel);
        self.live.insert(id);

        Ok(id)
    }

    /// Reads everything available on a channel and parses out complete
    /// frames. Frames buffered ahead of a close are still delivered before
    /// the close is reported; a clean shutdown ends with the peer's final
    /// message followed by EOF in the same readable burst.
    fn drain_channel(&mut self, id: ChannelId, out: &mut Vec<EndpointEvent>) {
        let mut frames = Vec::new();

        let result = match self.channels.get_mut(id).and_then(|slot| slot.as_mut()) {
            Some(channel) => Self::drain_frames(channel, &mut frames),
            None => return,
        };

        for msg in frames {
            out.push(EndpointEvent::Frame(id, msg));
        }

        if let Err(err) = result {
            if err.is_fatal() {
                self.drop_channel(id, err, out);
            }
        }
    }

    fn drain_frames(channel: &mut Channel, frames: &mut Vec<Message>) -> NetResult<()> {
        let receive_result = channel.receive();

        loop {
            match channel.next_message() {
                Ok(Some(msg)) => frames.push(msg),
                Ok(None) => break,
                // A malformed frame trumps whatever the socket reported.
                Err(err) => return Err(err),
            }
        }

        receive_result.map(|_| ())
    }

    fn flush_channel(&mut self, id: ChannelId, out: &mut Vec<EndpointEvent>) {
        let result = match self.channels.get_mut(id).and_then(|slot| slot.as_mut()) {
            Some(channel) => channel.flush(),
            None => return,
        };

        match result {
            Ok(_) | Err(NetError::Wait) => (),
            Err(err) => self.drop_channel(id, err, out),
        }
    }

    fn drop_channel(&mut self, id: ChannelId, err: NetError, out: &mut Vec<EndpointEvent>) {
        logging::debug!(self.log, "dropping channel";
                        "context" => "drop",
                        "channel_id" => id,
                        "error" => ?err);

        self.close(id);
        out.push(EndpointEvent::Closed(id));
    }
}
