//! Core runtime pieces shared by the session daemon, the session server and
//! the client runtime: the wire codec, the poll-driven endpoint, and the
//! bookkeeping tables (processes, holes, pending writes, semaphores) plus
//! the shared memory region and signal plumbing.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod holes;
pub mod net;
pub mod opqueue;
pub mod proto;
pub mod ptab;
pub mod region;
pub mod semtab;
pub mod signal;

/// Local (per-host) process identifier, as transmitted on the wire.
pub type Pid = i32;

/// Session-global process identifier, assigned by the server.
pub type Gid = i32;

/// Identifies a peer connection within one endpoint.
pub type ConnId = usize;

/// Well-known port of the per-host session daemon.
pub const DAEMON_PORT: u16 = 4210;

/// Well-known port of the per-host arbiter.
pub const ARBITER_PORT: u16 = 4800;

/// Loopback address used for all intra-host connections.
pub const LOOPBACK: &str = "127.0.0.1";

/// Name of the per-host shared region file. Only the first arbiter on a
/// host creates it; later attachers open the existing one.
pub const REGION_NAME: &str = "/osmium-region";

pub(crate) fn nix_to_io(err: nix::Error) -> std::io::Error {
    std::io::Error::from_raw_os_error(err as i32)
}
