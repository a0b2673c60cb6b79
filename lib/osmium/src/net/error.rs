use std::io;

#[derive(Debug, PartialEq, Eq)]
pub enum NetError {
    /// Not enough data yet, or the socket would block. Retry later.
    Wait,
    /// Peer closed the connection.
    Closed,
    /// The peer violated the protocol. Unrecoverable.
    Protocol(&'static str),
    /// Transport failure. Unrecoverable.
    Io(io::ErrorKind),
}

impl NetError {
    /// True for errors that end the connection.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, NetError::Wait)
    }
}

impl From<io::Error> for NetError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            io::ErrorKind::UnexpectedEof => NetError::Closed,
            io::ErrorKind::InvalidData => NetError::Protocol("malformed message"),
            kind => NetError::Io(kind),
        }
    }
}

pub type NetResult<T> = Result<T, NetError>;
