//! The coordination protocol: a closed set of control messages serialized
//! into a fixed 64-byte envelope. Integers are big-endian two's complement,
//! names are fixed 32-byte zero-padded fields. Only `WrtData` carries an
//! appended data tail; tails larger than [`MAX_CHUNK`] are split into
//! independent chunks with adjusted offsets, terminated by one `WrtEnd`.

use crate::{Gid, Pid};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::{self, Cursor, Read, Write};

/// Packed size of every control envelope.
pub const MSG_SIZE: usize = 64;

/// Fixed width of name fields (session and semaphore names).
pub const NAME_SIZE: usize = 32;

/// Largest data tail carried by a single `WrtData` envelope.
pub const MAX_CHUNK: usize = 4096;

// Wire tag values. Fixed by the protocol; never renumber.
const TAG_SET_SID: i32 = 1;
const TAG_DEL_SID: i32 = 2;
const TAG_STP_ALL: i32 = 3;
const TAG_CNT_ALL: i32 = 4;
const TAG_REL_BAR: i32 = 5;
const TAG_WRT_NOW: i32 = 6;
const TAG_SET_GID: i32 = 7;
const TAG_GET_SID: i32 = 8;
const TAG_ALL_STP: i32 = 9;
const TAG_GOT_DATA: i32 = 10;
const TAG_ADD_PID: i32 = 11;
const TAG_REQ_WRT: i32 = 12;
const TAG_HIT_BAR: i32 = 13;
const TAG_WRT_DATA: i32 = 14;
const TAG_POST_SEM: i32 = 15;
const TAG_WAIT_SEM: i32 = 16;
const TAG_EXIT: i32 = 17;
const TAG_WRT_END: i32 = 18;

/// Fixed-width name as it travels on the wire: truncated to 32 bytes,
/// zero-padded, not NUL-terminated in transit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Name([u8; NAME_SIZE]);

impl Name {
    pub fn new(s: &str) -> Name {
        let mut raw = [0u8; NAME_SIZE];
        let n = s.len().min(NAME_SIZE);
        raw[..n].copy_from_slice(&s.as_bytes()[..n]);
        Name(raw)
    }

    pub fn from_raw(raw: [u8; NAME_SIZE]) -> Name {
        Name(raw)
    }

    pub fn as_bytes(&self) -> &[u8; NAME_SIZE] {
        &self.0
    }

    /// The name without its zero padding.
    pub fn trimmed(&self) -> &[u8] {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(NAME_SIZE);
        &self.0[..end]
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.trimmed()))
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "\"{}\"", self)
    }
}

/// A control message. One variant per wire tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Server -> daemon: session is reachable on `port`. Daemon -> arbiter:
    /// connection details for a requested session.
    SetSid { name: Name, port: i32 },
    /// Server -> daemon: retract the session. Daemon -> arbiter: request
    /// rejected.
    DelSid { name: Name },
    /// Retained tag of the superseded stop-the-world write path. Never
    /// emitted by this runtime.
    StpAll,
    /// Server -> arbiters: all processes checked in, session starts.
    CntAll,
    /// Server -> arbiters: release every process waiting at the barrier.
    RelBar,
    /// Server -> arbiter -> process: the addressed process may write now.
    WrtNow { pid: Pid },
    /// Server -> arbiter (-> process at session start): global identifier
    /// assignment.
    SetGid { pid: Pid, gid: Gid },
    /// Arbiter -> daemon: request connection details for a session.
    GetSid { name: Name, nproc: i32 },
    /// Retained tag, sibling of `StpAll`. Never emitted.
    AllStp { nproc: i32 },
    /// Arbiter -> server: local copies are current; `nproc` local processes
    /// are accounted for.
    GotData { nproc: i32 },
    /// Process -> arbiter -> server: process checking in.
    AddPid { pid: Pid },
    /// Process -> arbiter -> server: process wants write access.
    ReqWrt { pid: Pid },
    /// Process -> arbiter -> server: process reached the barrier.
    HitBar { pid: Pid },
    /// Writer -> server -> other arbiters: modified bytes at region offset.
    WrtData { offset: i64, bytes: Vec<u8> },
    /// Process -> server: post the named semaphore. Server -> arbiter ->
    /// process: wake-up for the named waiter.
    PostSem { name: Name, pid: Pid },
    /// Process -> arbiter -> server: wait on the named semaphore.
    WaitSem { name: Name, pid: Pid },
    /// Sender is leaving the session.
    Exit,
    /// Writer -> server -> other arbiters: end of the logical write.
    WrtEnd,
}

/// Envelope decode result: either a complete message, or a `WrtData` header
/// whose `size`-byte tail follows the envelope on the stream.
#[derive(Debug, PartialEq, Eq)]
pub enum Partial {
    Done(Message),
    Data { offset: i64, size: usize },
}

impl Message {
    /// Packs the message envelope. `WrtData` is packed with the size of its
    /// byte tail; the tail itself is not part of the envelope.
    pub fn encode(&self, buf: &mut [u8; MSG_SIZE]) {
        *buf = [0u8; MSG_SIZE];
        let mut c = Cursor::new(&mut buf[..]);

        // The envelope is always large enough; cursor writes cannot fail.
        let put_i32 =
            |c: &mut Cursor<&mut [u8]>, v: i32| c.write_i32::<BigEndian>(v).expect("envelope");
        let put_i64 =
            |c: &mut Cursor<&mut [u8]>, v: i64| c.write_i64::<BigEndian>(v).expect("envelope");
        let put_name =
            |c: &mut Cursor<&mut [u8]>, n: &Name| c.write_all(n.as_bytes()).expect("envelope");

        match self {
            Message::SetSid { name, port } => {
                put_i32(&mut c, TAG_SET_SID);
                put_name(&mut c, name);
                put_i32(&mut c, *port);
            }
            Message::DelSid { name } => {
                put_i32(&mut c, TAG_DEL_SID);
                put_name(&mut c, name);
            }
            Message::StpAll => put_i32(&mut c, TAG_STP_ALL),
            Message::CntAll => put_i32(&mut c, TAG_CNT_ALL),
            Message::RelBar => put_i32(&mut c, TAG_REL_BAR),
            Message::WrtNow { pid } => {
                put_i32(&mut c, TAG_WRT_NOW);
                put_i32(&mut c, *pid);
            }
            Message::SetGid { pid, gid } => {
                put_i32(&mut c, TAG_SET_GID);
                put_i32(&mut c, *pid);
                put_i32(&mut c, *gid);
            }
            Message::GetSid { name, nproc } => {
                put_i32(&mut c, TAG_GET_SID);
                put_name(&mut c, name);
                put_i32(&mut c, *nproc);
            }
            Message::AllStp { nproc } => {
                put_i32(&mut c, TAG_ALL_STP);
                put_i32(&mut c, *nproc);
            }
            Message::GotData { nproc } => {
                put_i32(&mut c, TAG_GOT_DATA);
                put_i32(&mut c, *nproc);
            }
            Message::AddPid { pid } => {
                put_i32(&mut c, TAG_ADD_PID);
                put_i32(&mut c, *pid);
            }
            Message::ReqWrt { pid } => {
                put_i32(&mut c, TAG_REQ_WRT);
                put_i32(&mut c, *pid);
            }
            Message::HitBar { pid } => {
                put_i32(&mut c, TAG_HIT_BAR);
                put_i32(&mut c, *pid);
            }
            Message::WrtData { offset, bytes } => {
                put_i32(&mut c, TAG_WRT_DATA);
                put_i64(&mut c, *offset);
                put_i64(&mut c, bytes.len() as i64);
            }
            Message::PostSem { name, pid } => {
                put_i32(&mut c, TAG_POST_SEM);
                put_name(&mut c, name);
                put_i32(&mut c, *pid);
            }
            Message::WaitSem { name, pid } => {
                put_i32(&mut c, TAG_WAIT_SEM);
                put_name(&mut c, name);
                put_i32(&mut c, *pid);
            }
            Message::Exit => put_i32(&mut c, TAG_EXIT),
            Message::WrtEnd => put_i32(&mut c, TAG_WRT_END),
        }
    }

    /// Unpacks one envelope. A `WrtData` envelope yields `Partial::Data`;
    /// the caller is responsible for collecting the tail.
    pub fn decode(buf: &[u8; MSG_SIZE]) -> io::Result<Partial> {
        let mut c = Cursor::new(&buf[..]);
        let tag = c.read_i32::<BigEndian>()?;

        let msg = match tag {
            TAG_SET_SID => {
                let name = read_name(&mut c)?;
                let port = c.read_i32::<BigEndian>()?;
                Message::SetSid { name, port }
            }
            TAG_DEL_SID => Message::DelSid { name: read_name(&mut c)? },
            TAG_STP_ALL => Message::StpAll,
            TAG_CNT_ALL => Message::CntAll,
            TAG_REL_BAR => Message::RelBar,
            TAG_WRT_NOW => Message::WrtNow { pid: c.read_i32::<BigEndian>()? },
            TAG_SET_GID => {
                let pid = c.read_i32::<BigEndian>()?;
                let gid = c.read_i32::<BigEndian>()?;
                Message::SetGid { pid, gid }
            }
            TAG_GET_SID => {
                let name = read_name(&mut c)?;
                let nproc = c.read_i32::<BigEndian>()?;
                Message::GetSid { name, nproc }
            }
            TAG_ALL_STP => Message::AllStp { nproc: c.read_i32::<BigEndian>()? },
            TAG_GOT_DATA => Message::GotData { nproc: c.read_i32::<BigEndian>()? },
            TAG_ADD_PID => Message::AddPid { pid: c.read_i32::<BigEndian>()? },
            TAG_REQ_WRT => Message::ReqWrt { pid: c.read_i32::<BigEndian>()? },
            TAG_HIT_BAR => Message::HitBar { pid: c.read_i32::<BigEndian>()? },
            TAG_WRT_DATA => {
                let offset = c.read_i64::<BigEndian>()?;
                let size = c.read_i64::<BigEndian>()?;
                if offset < 0 || size < 1 || size as usize > MAX_CHUNK {
                    return Err(invalid(format!(
                        "bad data envelope: offset {} size {}",
                        offset, size
                    )));
                }
                return Ok(Partial::Data { offset, size: size as usize });
            }
            TAG_POST_SEM => {
                let name = read_name(&mut c)?;
                let pid = c.read_i32::<BigEndian>()?;
                Message::PostSem { name, pid }
            }
            TAG_WAIT_SEM => {
                let name = read_name(&mut c)?;
                let pid = c.read_i32::<BigEndian>()?;
                Message::WaitSem { name, pid }
            }
            TAG_EXIT => Message::Exit,
            TAG_WRT_END => Message::WrtEnd,
            other => return Err(invalid(format!("unknown message tag {}", other))),
        };

        Ok(Partial::Done(msg))
    }
}

fn read_name(c: &mut Cursor<&[u8]>) -> io::Result<Name> {
    let mut raw = [0u8; NAME_SIZE];
    c.read_exact(&mut raw)?;
    Ok(Name::from_raw(raw))
}

fn invalid(reason: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, reason)
}

/// Writes one message to a blocking stream, envelope plus data tail.
/// Oversized `WrtData` is split into independent chunks.
pub fn write_msg<W: Write>(w: &mut W, msg: &Message) -> io::Result<()> {
    let mut buf = [0u8; MSG_SIZE];

    if let Message::WrtData { offset, bytes } = msg {
        if bytes.is_empty() {
            return Err(invalid("empty data payload".to_string()));
        }

        let mut chunk_offset = *offset;
        for chunk in bytes.chunks(MAX_CHUNK) {
            let envelope = Message::WrtData { offset: chunk_offset, bytes: chunk.to_vec() };
            envelope.encode(&mut buf);
            w.write_all(&buf)?;
            w.write_all(chunk)?;
            chunk_offset += chunk.len() as i64;
        }

        return Ok(());
    }

    msg.encode(&mut buf);
    w.write_all(&buf)
}

/// Reads one message from a blocking stream. For chunked writes every chunk
/// comes back as its own `WrtData`; recipients apply them independently.
pub fn read_msg<R: Read>(r: &mut R) -> io::Result<Message> {
    let mut buf = [0u8; MSG_SIZE];
    r.read_exact(&mut buf)?;

    match Message::decode(&buf)? {
        Partial::Done(msg) => Ok(msg),
        Partial::Data { offset, size } => {
            let mut bytes = vec![0u8; size];
            r.read_exact(&mut bytes)?;
            Ok(Message::WrtData { offset, bytes })
        }
    }
}
