use crate::net::buffer::Buffer;
use crate::net::error::{NetError, NetResult};
use crate::proto::{self, Message, Partial, MSG_SIZE};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use plasma::logging;

/// A framed connection to one peer: a nonblocking stream with buffered
/// ingress and egress. Complete messages are parsed out of the read buffer;
/// writes are staged in the write buffer and flushed opportunistically.
pub struct Channel {
    stream: TcpStream,
    read_buf: Buffer,
    write_buf: Buffer,
    log: logging::Logger,
}

impl Channel {
    pub fn new(stream: TcpStream, log: &logging::Logger) -> Channel {
        Channel {
            stream,
            read_buf: Buffer::new(),
            write_buf: Buffer::new(),
            log: log.new(logging::o!()),
        }
    }

    pub fn register(&mut self, registry: &Registry, token: Token) -> std::io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE | Interest::WRITABLE)
    }

    pub fn deregister(&mut self, registry: &Registry) -> std::io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// Drains the socket into the read buffer.
    pub fn receive(&mut self) -> NetResult<usize> {
        let received = self.read_buf.ingress(&mut self.stream)?;

        logging::trace!(self.log, "received data"; "context" => "receive", "bytes" => received);

        Ok(received)
    }

    /// True if staged output remains unflushed.
    #[inline]
    pub fn has_egress(&self) -> bool {
        !self.write_buf.is_empty()
    }

    /// Pushes staged output to the socket until it would block.
    pub fn flush(&mut self) -> NetResult<usize> {
        if self.write_buf.is_empty() {
            return Ok(0);
        }

        let sent = self.write_buf.egress(&mut self.stream)?;

        logging::trace!(self.log, "flushed data"; "context" => "flush", "bytes" => sent);

        Ok(sent)
    }

    /// Stages a message and attempts to flush it. A would-block result
    /// leaves the remainder buffered for the next writable event.
    pub fn send(&mut self, msg: &Message) -> NetResult<()> {
        let mut wire = Vec::with_capacity(MSG_SIZE);
        proto::write_msg(&mut wire, msg).map_err(NetError::from)?;
        self.write_buf.extend(&wire);

        match self.flush() {
            Ok(_) | Err(NetError::Wait) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Parses the next complete message out of the read buffer. `Ok(None)`
    /// means more bytes are needed.
    pub fn next_message(&mut self) -> NetResult<Option<Message>> {
        next_frame(&mut self.read_buf)
    }
}

/// Frame parser over a byte FIFO. Envelope first; a data envelope waits for
/// its full tail before the message is surfaced.
pub(crate) fn next_frame(buf: &mut Buffer) -> NetResult<Option<Message>> {
    if buf.len() < MSG_SIZE {
        return Ok(None);
    }

    let mut envelope = [0u8; MSG_SIZE];
    envelope.copy_from_slice(&buf.read_slice()[..MSG_SIZE]);

    match Message::decode(&envelope).map_err(NetError::from)? {
        Partial::Done(msg) => {
            buf.consume(MSG_SIZE);
            Ok(Some(msg))
        }
        Partial::Data { offset, size } => {
            if buf.len() < MSG_SIZE + size {
                return Ok(None);
            }

            let bytes = buf.read_slice()[MSG_SIZE..MSG_SIZE + size].to_vec();
            buf.consume(MSG_SIZE + size);
            Ok(Some(Message::WrtData { offset, bytes }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::Name;

    fn frame(msg: &Message) -> Vec<u8> {
        let mut wire = Vec::new();
        proto::write_msg(&mut wire, msg).unwrap();
        wire
    }

    #[test]
    fn test_parse_control_frame() {
        let mut buf = Buffer::new();
        buf.extend(&frame(&Message::HitBar { pid: 42 }));

        assert_eq!(next_frame(&mut buf).unwrap(), Some(Message::HitBar { pid: 42 }));
        assert_eq!(next_frame(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_waits_for_full_envelope() {
        let wire = frame(&Message::CntAll);
        let mut buf = Buffer::new();
        buf.extend(&wire[..MSG_SIZE - 1]);

        assert_eq!(next_frame(&mut buf).unwrap(), None);

        buf.extend(&wire[MSG_SIZE - 1..]);
        assert_eq!(next_frame(&mut buf).unwrap(), Some(Message::CntAll));
    }

    #[test]
    fn test_parse_waits_for_data_tail() {
        let msg = Message::WrtData { offset: 8, bytes: vec![1, 2, 3, 4] };
        let wire = frame(&msg);
        let mut buf = Buffer::new();
        buf.extend(&wire[..MSG_SIZE + 2]);

        assert_eq!(next_frame(&mut buf).unwrap(), None);

        buf.extend(&wire[MSG_SIZE + 2..]);
        assert_eq!(next_frame(&mut buf).unwrap(), Some(msg));
    }

    #[test]
    fn test_parse_back_to_back_frames() {
        let mut buf = Buffer::new();
        buf.extend(&frame(&Message::WaitSem { name: Name::new("sum"), pid: 9 }));
        buf.extend(&frame(&Message::WrtEnd));

        assert_eq!(
            next_frame(&mut buf).unwrap(),
            Some(Message::WaitSem { name: Name::new("sum"), pid: 9 })
        );
        assert_eq!(next_frame(&mut buf).unwrap(), Some(Message::WrtEnd));
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let mut buf = Buffer::new();
        buf.extend(&[0xffu8; MSG_SIZE]);

        match next_frame(&mut buf) {
            Err(NetError::Protocol(_)) => (),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }
}
