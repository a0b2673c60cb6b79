//! The client runtime of the distributed shared memory system. Link this
//! into a worker program, call [`init`] once, and the returned region reads
//! and writes like local memory: stray writes are intercepted through page
//! protection, serialized by the session server, and broadcast to every
//! participant.
//!
//! The public surface mirrors the session lifecycle: `init`, `barrier`,
//! `wait_sem`/`post_sem`, `dig_hole`/`fill_hole`, `exit`.

#[macro_use]
mod macros;

mod arbiter;
mod session;
mod sync;

pub use session::Config;

use osmium::proto::{Message, Name};
use osmium::signal;
use osmium::Gid;

/// Joins (or establishes) the named session and returns the base pointer
/// of the shared region. Forks `lproc - 1` local siblings; every sibling
/// returns from this call with its own connection to the arbiter. The
/// usable region size is the requested size rounded up to a page multiple,
/// at least two pages.
///
/// Calling `init` twice without an intervening [`exit`] is a usage error
/// and terminates the process.
pub fn init(cfg: Config) -> *mut u8 {
    session::establish(cfg)
}

/// The global identifier assigned by the server, or -1 before `init`
/// completes.
pub fn get_gid() -> Gid {
    match session::slot() {
        Some(sess) => sess.gid,
        None => -1,
    }
}

/// Blocks until every process in the session has reached the barrier.
pub fn barrier() {
    let sess = session::active();

    sess.send(&Message::HitBar { pid: session::my_pid() });

    // The arbiter wakes us with SIGCONT once the release arrives.
    if let Err(err) = signal::stop_self() {
        fatal!("couldn't stop for barrier: {}", err);
    }
}

/// Posts (ups) the named semaphore, creating it on first use. Names are
/// truncated to 32 bytes.
pub fn post_sem(name: &str) {
    let sess = session::active();
    sess.send(&Message::PostSem { name: Name::new(name), pid: session::my_pid() });
}

/// Waits (downs) on the named semaphore, creating it on first use. Blocks
/// until a token is available.
pub fn wait_sem(name: &str) {
    let sess = session::active();
    let pid = session::my_pid();

    sess.send(&Message::WaitSem { name: Name::new(name), pid });

    match sess.recv() {
        Message::PostSem { pid: woken, .. } if woken == pid => (),
        other => fatal!("unexpected reply to semaphore wait: {:?}", other),
    }
}

/// Suspends write interception over `[addr, addr + size)`. Writes whose
/// full footprint lands in the hole stay local until the hole is filled.
/// Returns the hole identifier, or -1 if the range leaves the region or
/// overlaps an existing hole.
pub fn dig_hole(addr: *const u8, size: usize) -> i32 {
    let sess = session::active();
    let start = addr as usize;

    let end = match start.checked_add(size) {
        Some(end) if size > 0 => end,
        _ => return -1,
    };

    if !sess.region.contains(start) || !sess.region.contains(end - 1) {
        return -1;
    }

    let offset = sess.region.offset_of(start);
    sess.holes.dig(offset, size).unwrap_or(-1)
}

/// Fills a hole: broadcasts its entire byte range through the ordinary
/// write protocol and removes it. Filling an unknown hole is a usage error
/// and terminates the process.
pub fn fill_hole(id: i32) {
    let sess = session::active();

    let hole = match sess.holes.fill(id) {
        Some(hole) => hole,
        None => fatal!("no hole with identifier {}", id),
    };

    sync::flush_range(sess, hole.offset, hole.size);
}

/// Leaves the session: one final barrier, then teardown. The local root
/// process reaps its forked siblings; signal dispositions saved by `init`
/// are restored.
pub fn exit() {
    if session::slot().is_none() {
        fatal!("exit called without init");
    }

    barrier();
    session::teardown();
}
