//! Per-process session state. The C original kept this as a pile of
//! globals; here it is one `Session` value in a process-wide slot whose
//! lifetime is governed by `init` and `exit`. Every process is
//! single-threaded by design, and the fault handlers run on the only
//! thread, so the slot needs no locking.

use crate::arbiter;
use crate::sync::{self, SyncState};
use nix::sys::signal::{SigAction, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::{fork, setsid, ForkResult};
use osmium::holes::HoleTable;
use osmium::proto::{self, Message};
use osmium::region::{Protection, SharedRegion};
use osmium::signal;
use osmium::{Gid, Pid, ARBITER_PORT, DAEMON_PORT, LOOPBACK, REGION_NAME};
use serde_derive::{Deserialize, Serialize};
use std::net::TcpStream;
use std::ptr;
use std::thread;
use std::time::Duration;

// Fixed-backoff retry budget for reaching a freshly spawned arbiter.
const CONNECT_ATTEMPTS: u32 = 50;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);

/// Session parameters handed to [`crate::init`]. Serializable so launcher
/// tooling can keep session descriptions in config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Session name; truncated to 32 bytes on the wire.
    pub session: String,
    /// Number of processes on this host (the caller plus forked siblings).
    pub lproc: u32,
    /// Total number of processes in the session, across all hosts.
    pub tproc: u32,
    /// Requested shared region size in bytes.
    pub size: usize,
    /// Address of the host running the session daemon.
    pub daemon_addr: String,
    /// Port of the session daemon.
    pub daemon_port: u16,
}

impl Config {
    /// Parameters for a session coordinated through the local daemon.
    pub fn new(session: &str, lproc: u32, tproc: u32, size: usize) -> Config {
        Config {
            session: session.to_string(),
            lproc,
            tproc,
            size,
            daemon_addr: LOOPBACK.to_string(),
            daemon_port: DAEMON_PORT,
        }
    }
}

pub(crate) struct Session {
    pub(crate) region: SharedRegion,
    pub(crate) holes: HoleTable,
    pub(crate) gid: Gid,
    pub(crate) sync: SyncState,
    pub(crate) saved_segv: SigAction,
    stream: TcpStream,
    children: Vec<nix::unistd::Pid>,
    saved_ill: SigAction,
    saved_tstp: SigAction,
}

static mut SESSION: Option<Session> = None;

/// The process-wide session slot. Accessed from the fault handlers as well
/// as the API; sound because each participant process is single-threaded.
pub(crate) fn slot() -> &'static mut Option<Session> {
    unsafe { &mut *ptr::addr_of_mut!(SESSION) }
}

pub(crate) fn active() -> &'static mut Session {
    match slot() {
        Some(sess) => sess,
        None => fatal!("shared memory system not initialized"),
    }
}

#[inline]
pub(crate) fn my_pid() -> Pid {
    std::process::id() as Pid
}

impl Session {
    /// Sends one message to the arbiter. A transport failure means a lost
    /// peer, which is fatal by design.
    pub(crate) fn send(&mut self, msg: &Message) {
        if let Err(err) = proto::write_msg(&mut self.stream, msg) {
            fatal!("lost arbiter connection: {}", err);
        }
    }

    /// Blocks for the next message from the arbiter.
    pub(crate) fn recv(&mut self) -> Message {
        match proto::read_msg(&mut self.stream) {
            Ok(msg) => msg,
            Err(err) => fatal!("lost arbiter connection: {}", err),
        }
    }
}

/// Builds the session: arbiter spawn, sibling forks, registration, fault
/// handlers, and the blocking wait for the session start.
pub(crate) fn establish(cfg: Config) -> *mut u8 {
    if slot().is_some() {
        fatal!("init called twice");
    }

    if cfg.lproc == 0 || cfg.tproc < 2 || cfg.lproc > cfg.tproc {
        fatal!("invalid process counts: lproc {} tproc {}", cfg.lproc, cfg.tproc);
    }

    spawn_arbiter(&cfg);
    let children = fork_siblings(cfg.lproc);

    let mut stream = connect_arbiter();

    // The arbiter created the region before it started listening, so a
    // successful connection means the file exists.
    let region = SharedRegion::attach(REGION_NAME)
        .unwrap_or_else(|err| fatal!("couldn't attach shared region: {}", err));

    let pid = my_pid();
    if let Err(err) = proto::write_msg(&mut stream, &Message::AddPid { pid }) {
        fatal!("couldn't register with arbiter: {}", err);
    }

    // Interception handlers go in before the region is locked down. The
    // barrier relies on SIGTSTP keeping its default stop disposition.
    let saved_segv = signal::install(Signal::SIGSEGV, sync::on_segv)
        .unwrap_or_else(|err| fatal!("couldn't install fault handler: {}", err));
    let saved_ill = signal::install(Signal::SIGILL, sync::on_ill)
        .unwrap_or_else(|err| fatal!("couldn't install trap handler: {}", err));
    let saved_tstp = signal::set_default(Signal::SIGTSTP)
        .unwrap_or_else(|err| fatal!("couldn't reset stop disposition: {}", err));

    if let Err(err) = region.protect(Protection::ReadOnly) {
        fatal!("couldn't protect shared region: {}", err);
    }

    // Blocks until the server has seen every expected process; the arbiter
    // forwards the identifier at session start.
    let gid = match proto::read_msg(&mut stream) {
        Ok(Message::SetGid { pid: target, gid }) if target == pid => gid,
        Ok(other) => fatal!("unexpected reply during init: {:?}", other),
        Err(err) => fatal!("lost arbiter during init: {}", err),
    };

    let base = region.base();

    *slot() = Some(Session {
        region,
        holes: HoleTable::new(),
        gid,
        sync: SyncState::new(),
        stream,
        children,
        saved_segv,
        saved_ill,
        saved_tstp,
    });

    base
}

/// Tears the session down after the caller's final barrier: exit message,
/// handler restoration, sibling reaping, unmapping.
pub(crate) fn teardown() {
    let mut sess = slot().take().expect("teardown without an active session");

    sess.send(&Message::Exit);

    let _ = signal::restore(Signal::SIGSEGV, &sess.saved_segv);
    let _ = signal::restore(Signal::SIGILL, &sess.saved_ill);
    let _ = signal::restore(Signal::SIGTSTP, &sess.saved_tstp);

    // The local root reaps the siblings it forked; they hold no children.
    for child in &sess.children {
        let _ = waitpid(*child, None);
    }

    // Dropping the session closes the socket and unmaps the region.
}

/// Launches the arbiter as a detached grandchild: fork twice, new session
/// group, arbiter loop. If another arbiter already owns the well-known
/// port, the grandchild exits quietly.
fn spawn_arbiter(cfg: &Config) {
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let _ = waitpid(child, None);
        }
        Ok(ForkResult::Child) => match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let _ = setsid();
                arbiter::run(cfg);
            }
            _ => unsafe { libc::_exit(0) },
        },
        Err(err) => fatal!("couldn't fork arbiter: {}", err),
    }
}

/// Forks the local siblings. The caller keeps the child list; each sibling
/// returns with an empty one and continues through the rest of `init` on
/// its own.
fn fork_siblings(lproc: u32) -> Vec<nix::unistd::Pid> {
    let mut children = Vec::new();

    for _ in 1..lproc {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => children.push(child),
            Ok(ForkResult::Child) => {
                children.clear();
                break;
            }
            Err(err) => fatal!("couldn't fork sibling: {}", err),
        }
    }

    children
}

/// Connects to the arbiter, retrying with a fixed backoff while it boots.
fn connect_arbiter() -> TcpStream {
    for _ in 0..CONNECT_ATTEMPTS {
        match TcpStream::connect((LOOPBACK, ARBITER_PORT)) {
            Ok(stream) => return stream,
            Err(_) => thread::sleep(CONNECT_BACKOFF),
        }
    }

    fatal!("arbiter never started listening on port {}", ARBITER_PORT);
}
