//! The write-interception synchronizer. A write to the protected region
//! raises SIGSEGV; the handler obtains the write grant, snapshots the
//! addressable footprint, plants a UD2 trap after the faulting instruction
//! and unlocks the region. The instruction then completes for real and the
//! trap raises SIGILL, whose handler re-locks the region, sizes the
//! modification against the snapshot and ships the bytes.
//!
//! x86-64 only: the trap is the two-byte UD2 opcode and instruction
//! lengths come from a long-mode decoder.

use crate::session::{self, Session};
use iced_x86::{Decoder, DecoderOptions};
use nix::sys::mman::{mprotect, ProtFlags};
use nix::sys::signal::Signal;
use osmium::proto::Message;
use osmium::region::{self, Protection};
use osmium::signal;
use std::ptr;

/// Widest addressable store footprint considered by the snapshot diff.
pub(crate) const ADDR_WIDTH: usize = 8;

const UD2_SIZE: usize = 2;
const UD2: [u8; UD2_SIZE] = [0x0f, 0x0b];

// Long-mode instructions never exceed fifteen bytes.
const MAX_INSTR_LEN: usize = 15;

/// Interception state carried between the fault and the trap.
pub(crate) struct SyncState {
    /// Faulting address; null while no write is in flight.
    fault_addr: *mut u8,
    /// The footprint lies in a hole; skip the wire protocol.
    local: bool,
    pre_image: [u8; ADDR_WIDTH],
    pre_len: usize,
    /// Where the trap was planted.
    patch_addr: *mut u8,
    saved_instr: [u8; UD2_SIZE],
}

impl SyncState {
    pub(crate) fn new() -> SyncState {
        SyncState {
            fault_addr: ptr::null_mut(),
            local: false,
            pre_image: [0; ADDR_WIDTH],
            pre_len: 0,
            patch_addr: ptr::null_mut(),
            saved_instr: [0; UD2_SIZE],
        }
    }
}

/// SIGSEGV: start of an intercepted write.
pub(crate) extern "C" fn on_segv(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let sess = match session::slot() {
        Some(sess) => sess,
        None => fatal!("segmentation fault with no active session"),
    };

    let fault = unsafe { (*info).si_addr() } as *mut u8;
    let addr = fault as usize;

    if !sess.region.contains(addr) {
        // Not ours. Put the previous disposition back and return; the
        // access re-faults as a genuine segmentation violation.
        let _ = signal::restore(Signal::SIGSEGV, &sess.saved_segv);
        return;
    }

    if !sess.sync.fault_addr.is_null() {
        fatal!("nested write fault at {:p}", fault);
    }

    let offset = sess.region.offset_of(addr);
    let local = sess.holes.in_hole(offset, ADDR_WIDTH);

    if !local {
        take_access(sess);
    }

    // Snapshot after the grant: the region may have changed while the
    // request waited in the queue.
    let pre = sess.region.snapshot(offset, ADDR_WIDTH);
    sess.sync.pre_len = pre.len();
    sess.sync.pre_image[..pre.len()].copy_from_slice(&pre);
    sess.sync.fault_addr = fault;
    sess.sync.local = local;

    let pc = program_counter(ctx);
    let len = match decode_len(code_at(pc), pc as u64) {
        Some(len) => len,
        None => fatal!("undecodable instruction at {:#x}", pc),
    };

    let next = (pc + len) as *mut u8;
    unsafe {
        ptr::copy_nonoverlapping(next as *const u8, sess.sync.saved_instr.as_mut_ptr(), UD2_SIZE);
    }
    sess.sync.patch_addr = next;

    unprotect_code(next as usize);
    unsafe {
        ptr::copy_nonoverlapping(UD2.as_ptr(), next, UD2_SIZE);
    }

    // Let the write complete; the planted trap fires right after it.
    if let Err(err) = sess.region.protect(Protection::ReadWrite) {
        fatal!("couldn't unlock shared region: {}", err);
    }
}

/// SIGILL: the intercepted write has completed.
pub(crate) extern "C" fn on_ill(
    _sig: libc::c_int,
    _info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let sess = match session::slot() {
        Some(sess) => sess,
        None => fatal!("illegal instruction with no active session"),
    };

    if sess.sync.fault_addr.is_null() {
        fatal!("illegal instruction outside a write replay");
    }

    let pc = program_counter(ctx) as *mut u8;
    if pc != sess.sync.patch_addr {
        fatal!("trap at {:p}, expected {:p}", pc, sess.sync.patch_addr);
    }

    unsafe {
        ptr::copy_nonoverlapping(sess.sync.saved_instr.as_ptr(), pc, UD2_SIZE);
    }

    if let Err(err) = sess.region.protect(Protection::ReadOnly) {
        fatal!("couldn't re-protect shared region: {}", err);
    }

    let offset = sess.region.offset_of(sess.sync.fault_addr as usize);
    let post = sess.region.snapshot(offset, sess.sync.pre_len);
    let modified = modified_len(&sess.sync.pre_image[..sess.sync.pre_len], &post);

    if !sess.sync.local {
        release_access(sess, offset, modified);
    }

    sess.sync.fault_addr = ptr::null_mut();
}

/// Ships a region range through the ordinary grant/data/end dance. Used by
/// hole filling; the range is whatever the hole covered.
pub(crate) fn flush_range(sess: &mut Session, offset: usize, size: usize) {
    take_access(sess);
    release_access(sess, offset, size);
}

/// Obtains the write grant. SIGTSTP is ignored for the duration so a
/// racing barrier release cannot stop us while we hold the grant.
fn take_access(sess: &mut Session) {
    let _ = signal::ignore(Signal::SIGTSTP);

    let pid = session::my_pid();
    sess.send(&Message::ReqWrt { pid });

    match sess.recv() {
        Message::WrtNow { pid: granted } if granted == pid => (),
        other => fatal!("unexpected reply to write request: {:?}", other),
    }
}

/// Ships the modified bytes and ends the operation. The release is
/// non-blocking: the writer continues immediately, and a subsequent write
/// simply re-faults and re-serializes.
fn release_access(sess: &mut Session, offset: usize, len: usize) {
    let _ = signal::set_default(Signal::SIGTSTP);

    let bytes = sess.region.snapshot(offset, len);
    sess.send(&Message::WrtData { offset: offset as i64, bytes });
    sess.send(&Message::WrtEnd);
}

/// Size of the modified prefix: the snapshot and the post-image are
/// compared from the high end, and the last differing byte bounds the
/// range. At least one byte is always shipped; a write of an unchanged
/// value still happened.
pub(crate) fn modified_len(pre: &[u8], post: &[u8]) -> usize {
    debug_assert_eq!(pre.len(), post.len());

    for i in (0..pre.len()).rev() {
        if pre[i] != post[i] {
            return i + 1;
        }
    }

    1
}

fn program_counter(ctx: *mut libc::c_void) -> usize {
    let uc = ctx as *mut libc::ucontext_t;
    unsafe { (*uc).uc_mcontext.gregs[libc::REG_RIP as usize] as usize }
}

fn code_at(pc: usize) -> &'static [u8] {
    unsafe { std::slice::from_raw_parts(pc as *const u8, MAX_INSTR_LEN) }
}

/// Length of the instruction at `ip`, by long-mode instruction-length
/// decoding.
fn decode_len(code: &[u8], ip: u64) -> Option<usize> {
    let mut decoder = Decoder::with_ip(64, code, ip, DecoderOptions::NONE);
    let instruction = decoder.decode();

    if instruction.is_invalid() {
        return None;
    }

    Some(instruction.len())
}

/// Opens the code page holding the trap site for writing. The two trap
/// bytes may straddle a page boundary, in which case both pages open up.
fn unprotect_code(next: usize) {
    let page = region::page_size();
    let start = next & !(page - 1);
    let len = if next + UD2_SIZE > start + page { 2 * page } else { page };

    let flags = ProtFlags::PROT_READ | ProtFlags::PROT_WRITE | ProtFlags::PROT_EXEC;
    if let Err(err) = unsafe { mprotect(start as *mut libc::c_void, len, flags) } {
        fatal!("couldn't open code page at {:#x}: {}", start, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modified_len_finds_last_difference() {
        assert_eq!(modified_len(&[0, 0, 0, 0], &[1, 0, 0, 0]), 1);
        assert_eq!(modified_len(&[0, 0, 0, 0], &[0, 0, 1, 0]), 3);
        assert_eq!(modified_len(&[5, 5, 5, 5], &[5, 5, 5, 6]), 4);
    }

    #[test]
    fn test_modified_len_never_zero() {
        // Writing back identical bytes still counts as one modified byte.
        assert_eq!(modified_len(&[7, 7, 7, 7], &[7, 7, 7, 7]), 1);
        assert_eq!(modified_len(&[], &[]), 1);
    }

    #[test]
    fn test_decode_common_store_lengths() {
        // mov byte [rax], 42
        assert_eq!(decode_len(&[0xc6, 0x00, 0x2a], 0x1000), Some(3));
        // mov [rax], rcx
        assert_eq!(decode_len(&[0x48, 0x89, 0x08], 0x1000), Some(3));
        // mov dword [rax], imm32
        assert_eq!(decode_len(&[0xc7, 0x00, 0x01, 0x00, 0x00, 0x00], 0x1000), Some(6));
        // ud2 itself decodes as a two-byte instruction
        assert_eq!(decode_len(&UD2, 0x1000), Some(2));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        // A lone operand-size prefix is not an instruction.
        assert_eq!(decode_len(&[0x66], 0x1000), None);
    }
}
