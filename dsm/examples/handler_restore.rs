//! Installs user handlers for the signals the runtime borrows, runs a
//! trivial two-process session, and checks the handlers survive the
//! round trip. Needs a running session daemon.

use nix::sys::signal::Signal;
use osmium::signal;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

static SEGV_SEEN: AtomicBool = AtomicBool::new(false);
static ILL_SEEN: AtomicBool = AtomicBool::new(false);
static TSTP_SEEN: AtomicBool = AtomicBool::new(false);

extern "C" fn user_segv(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    SEGV_SEEN.store(true, Ordering::SeqCst);
}

extern "C" fn user_ill(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    ILL_SEEN.store(true, Ordering::SeqCst);
}

extern "C" fn user_tstp(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {
    TSTP_SEEN.store(true, Ordering::SeqCst);
}

fn main() {
    signal::install(Signal::SIGSEGV, user_segv).unwrap();
    signal::install(Signal::SIGILL, user_ill).unwrap();
    signal::install(Signal::SIGTSTP, user_tstp).unwrap();

    let base = dsm::init(dsm::Config::new("handlers", 2, 2, 4096));

    // One intercepted write each, so both fault paths get exercised.
    let slot = unsafe { (base as *mut i32).add(dsm::get_gid() as usize) };
    unsafe { ptr::write_volatile(slot, 7) };

    dsm::exit();

    // The runtime is gone; raising each signal must reach our handlers.
    unsafe {
        libc::raise(libc::SIGSEGV);
        libc::raise(libc::SIGILL);
        libc::raise(libc::SIGTSTP);
    }

    assert!(SEGV_SEEN.load(Ordering::SeqCst), "user SIGSEGV handler lost");
    assert!(ILL_SEEN.load(Ordering::SeqCst), "user SIGILL handler lost");
    assert!(TSTP_SEEN.load(Ordering::SeqCst), "user SIGTSTP handler lost");

    println!("handlers restored");
}
