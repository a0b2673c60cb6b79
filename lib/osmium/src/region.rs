//! The shared memory region: a file-backed, page-aligned mapping of
//! identical size in every participant. One participant per host creates
//! and sizes the file; everyone else attaches. The mapping alternates
//! between read-only (steady state) and read-write (during a local commit
//! or a broadcast apply).

use crate::nix_to_io;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, mprotect, munmap, shm_open, shm_unlink, MapFlags, ProtFlags};
use nix::sys::stat::{fstat, Mode};
use nix::unistd::{close, ftruncate};
use std::io;
use std::num::NonZeroUsize;
use std::os::unix::io::RawFd;
use std::ptr;

/// Smallest region ever created, in pages.
pub const MIN_PAGES: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadOnly,
    ReadWrite,
}

pub struct SharedRegion {
    base: *mut u8,
    size: usize,
    name: String,
}

pub fn page_size() -> usize {
    let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if raw > 0 {
        raw as usize
    } else {
        4096
    }
}

/// Rounds a requested size up to a page multiple, at least [`MIN_PAGES`].
pub fn aligned_size(requested: usize) -> usize {
    let page = page_size();
    let floor = MIN_PAGES * page;
    let wanted = requested.max(floor);

    match wanted % page {
        0 => wanted,
        rem => wanted + (page - rem),
    }
}

impl SharedRegion {
    /// Creates the region file if it does not exist yet, otherwise attaches
    /// to the existing one. The creator sizes the file (zero-filled by the
    /// kernel); attachers adopt whatever size they find. Returns the region
    /// and whether this call created it.
    pub fn create_or_attach(name: &str, requested: usize) -> io::Result<(SharedRegion, bool)> {
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;

        let (fd, owner) = match shm_open(name, OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR, mode)
        {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => (shm_open(name, OFlag::O_RDWR, mode).map_err(nix_to_io)?, false),
            Err(err) => return Err(nix_to_io(err)),
        };

        let region = Self::map(fd, name, if owner { Some(aligned_size(requested)) } else { None });

        // The fd is no longer needed once mapped; the mapping keeps the
        // file alive.
        let _ = close(fd);

        region.map(|r| (r, owner))
    }

    /// Attaches to an existing region file.
    pub fn attach(name: &str) -> io::Result<SharedRegion> {
        let fd = shm_open(name, OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR).map_err(nix_to_io)?;
        let region = Self::map(fd, name, None);
        let _ = close(fd);
        region
    }

    fn map(fd: RawFd, name: &str, truncate_to: Option<usize>) -> io::Result<SharedRegion> {
        let size = match truncate_to {
            Some(size) => {
                ftruncate(fd, size as i64).map_err(nix_to_io)?;
                size
            }
            None => fstat(fd).map_err(nix_to_io)?.st_size as usize,
        };

        let length = NonZeroUsize::new(size)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "empty region file"))?;

        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd,
                0,
            )
            .map_err(nix_to_io)?
        };

        Ok(SharedRegion { base: base as *mut u8, size, name: name.to_string() })
    }

    /// Removes the region name from the host. Existing mappings stay valid.
    pub fn unlink(name: &str) -> io::Result<()> {
        shm_unlink(name).map_err(nix_to_io)
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True if `addr` falls inside the mapping.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base as usize;
        addr >= base && addr < base + self.size
    }

    /// Offset of an address inside the mapping. The address must satisfy
    /// [`contains`](Self::contains).
    #[inline]
    pub fn offset_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        addr - self.base as usize
    }

    /// Flips the whole mapping between read-only and read-write.
    pub fn protect(&self, protection: Protection) -> io::Result<()> {
        let flags = match protection {
            Protection::ReadOnly => ProtFlags::PROT_READ,
            Protection::ReadWrite => ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
        };

        unsafe { mprotect(self.base as *mut libc::c_void, self.size, flags).map_err(nix_to_io) }
    }

    /// Copies bytes into the mapping at `offset`, clamped so the copy never
    /// runs off the end. Returns the number of bytes applied. The mapping
    /// must currently be writable.
    pub fn apply(&self, offset: usize, bytes: &[u8]) -> usize {
        if offset >= self.size {
            return 0;
        }

        let len = bytes.len().min(self.size - offset);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.base.add(offset), len);
        }
        len
    }

    /// Copies bytes out of the mapping, clamped at the end of the mapping.
    pub fn snapshot(&self, offset: usize, len: usize) -> Vec<u8> {
        if offset >= self.size {
            return Vec::new();
        }

        let len = len.min(self.size - offset);
        let mut out = vec![0u8; len];
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), len);
        }
        out
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        format!("/osmium-test-{}-{}", tag, std::process::id())
    }

    #[test]
    fn test_aligned_size_floor_and_rounding() {
        let page = page_size();
        assert_eq!(aligned_size(0), MIN_PAGES * page);
        assert_eq!(aligned_size(1), MIN_PAGES * page);
        assert_eq!(aligned_size(MIN_PAGES * page), MIN_PAGES * page);
        assert_eq!(aligned_size(MIN_PAGES * page + 1), (MIN_PAGES + 1) * page);
    }

    #[test]
    fn test_create_apply_attach_roundtrip() {
        let name = unique_name("roundtrip");
        let (region, owner) = SharedRegion::create_or_attach(&name, 64).unwrap();
        assert!(owner);
        assert_eq!(region.size(), aligned_size(64));

        let applied = region.apply(16, &[1, 2, 3, 4]);
        assert_eq!(applied, 4);

        // A second mapping of the same file sees the write.
        let twin = SharedRegion::attach(&name).unwrap();
        assert_eq!(twin.snapshot(16, 4), vec![1, 2, 3, 4]);
        assert_eq!(twin.snapshot(0, 4), vec![0, 0, 0, 0]);

        let (_again, owner_again) = SharedRegion::create_or_attach(&name, 64).unwrap();
        assert!(!owner_again);

        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_apply_clamps_at_end() {
        let name = unique_name("clamp");
        let (region, _) = SharedRegion::create_or_attach(&name, 64).unwrap();
        let size = region.size();

        assert_eq!(region.apply(size - 2, &[9; 8]), 2);
        assert_eq!(region.apply(size, &[9; 8]), 0);
        assert_eq!(region.apply(size + 10, &[9; 8]), 0);
        assert_eq!(region.snapshot(size - 2, 8), vec![9, 9]);

        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_contains_and_offsets() {
        let name = unique_name("contains");
        let (region, _) = SharedRegion::create_or_attach(&name, 64).unwrap();

        let base = region.base() as usize;
        assert!(region.contains(base));
        assert!(region.contains(base + region.size() - 1));
        assert!(!region.contains(base + region.size()));
        assert_eq!(region.offset_of(base + 10), 10);

        SharedRegion::unlink(&name).unwrap();
    }

    #[test]
    fn test_protection_flips() {
        let name = unique_name("protect");
        let (region, _) = SharedRegion::create_or_attach(&name, 64).unwrap();

        region.protect(Protection::ReadOnly).unwrap();
        // Reading stays legal on a read-only mapping.
        assert_eq!(region.snapshot(0, 1), vec![0]);
        region.protect(Protection::ReadWrite).unwrap();
        assert_eq!(region.apply(0, &[5]), 1);

        SharedRegion::unlink(&name).unwrap();
    }
}
