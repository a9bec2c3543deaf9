//! The shared heap both processes stage bulk call data in.
//!
//! The host creates it before the child exists; the child attaches it
//! by name from the INIT message. Before any real traffic flows, the
//! two sides prove the mapping works in both directions: the host arms
//! the word at the heap base with a sentinel, the child refuses to sign
//! off unless it sees that sentinel and overwrites it with the magic
//! value, and the host accepts INIT only once the magic is in place.

use std::ffi::c_void;
use std::os::unix::io::RawFd;
use std::ptr;

use nix::fcntl::OFlag;
use nix::sys::mman::{MapFlags, ProtFlags};
use nix::sys::stat::Mode;

use crate::error::{ProtoError, Result};
use crate::{HeapSlice, HEAP_MAGIC, HEAP_SENTINEL};

/// Bounds-carrying view of a mapped heap. Every boundary-supplied
/// range goes through `slice`/`slice_mut`; nothing dereferences a raw
/// offset without the check.
#[derive(Clone, Copy)]
pub struct HeapRef {
    base: *mut u8,
    size: usize,
}

unsafe impl Send for HeapRef {}
unsafe impl Sync for HeapRef {}

impl HeapRef {
    /// View over externally owned memory.
    ///
    /// # Safety
    ///
    /// `base` must point to `size` readable and writable bytes that
    /// stay mapped for the view's lifetime.
    pub unsafe fn new(base: *mut u8, size: usize) -> HeapRef {
        HeapRef { base, size }
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn slice(&self, range: HeapSlice) -> Result<&[u8]> {
        self.check(range)?;
        Ok(unsafe {
            std::slice::from_raw_parts(self.base.add(range.offset as usize), range.len as usize)
        })
    }

    pub fn slice_mut(&self, range: HeapSlice) -> Result<&mut [u8]> {
        self.check(range)?;
        Ok(unsafe {
            std::slice::from_raw_parts_mut(self.base.add(range.offset as usize), range.len as usize)
        })
    }

    fn check(&self, range: HeapSlice) -> Result<()> {
        let out_of_bounds = ProtoError::HeapBounds {
            offset: range.offset,
            len: range.len,
            heap: self.size as u64,
        };
        let end = match range.offset.checked_add(range.len) {
            Some(end) => end,
            None => return Err(out_of_bounds),
        };
        if end > self.size as u64 {
            return Err(out_of_bounds);
        }
        Ok(())
    }

    fn read_word(&self) -> u64 {
        unsafe { ptr::read_volatile(self.base as *const u64) }
    }

    fn write_word(&self, value: u64) {
        unsafe { ptr::write_volatile(self.base as *mut u64, value) }
    }

    /// Host half of the crosscheck: arm the base word before INIT.
    pub fn arm_crosscheck(&self) {
        self.write_word(HEAP_SENTINEL);
    }

    /// Host half, step two: only a child that really wrote the heap
    /// leaves the magic behind.
    pub fn crosscheck_passed(&self) -> bool {
        self.read_word() == HEAP_MAGIC
    }

    /// Child half: prove the mapping in both directions. Refuses when
    /// the host's sentinel is missing, otherwise overwrites it.
    pub fn answer_crosscheck(&self) -> bool {
        if self.read_word() != HEAP_SENTINEL {
            return false;
        }
        self.write_word(HEAP_MAGIC);
        true
    }
}

fn map_fd(fd: RawFd, size: usize, hint: *mut c_void) -> Result<*mut u8> {
    let base = unsafe {
        nix::sys::mman::mmap(
            hint,
            size,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(|errno| ProtoError::sys("mmap", errno))?;
    Ok(base as *mut u8)
}

/// Host-side heap: created, owned, unlinked on drop.
pub struct SharedHeap {
    name: String,
    href: HeapRef,
}

impl SharedHeap {
    pub fn create(name: &str, size: usize) -> Result<SharedHeap> {
        let fd = nix::sys::mman::shm_open(
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(|errno| ProtoError::sys("shm_open", errno))?;

        let mapped = nix::unistd::ftruncate(fd, size as i64)
            .map_err(|errno| ProtoError::sys("ftruncate", errno))
            .and_then(|()| map_fd(fd, size, ptr::null_mut()));
        let _ = nix::unistd::close(fd);

        match mapped {
            Ok(base) => Ok(SharedHeap {
                name: name.to_owned(),
                href: unsafe { HeapRef::new(base, size) },
            }),
            Err(err) => {
                let _ = nix::sys::mman::shm_unlink(name);
                Err(err)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn href(&self) -> HeapRef {
        self.href
    }
}

impl Drop for SharedHeap {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.href.base().cast(), self.href.size());
        }
        let _ = nix::sys::mman::shm_unlink(self.name.as_str());
    }
}

/// Child-side heap: attached by name, detached (not unlinked) on drop.
pub struct AttachedHeap {
    href: HeapRef,
}

impl AttachedHeap {
    pub fn attach(name: &str, size: usize, hint: u64) -> Result<AttachedHeap> {
        let fd = nix::sys::mman::shm_open(name, OFlag::O_RDWR, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(|errno| ProtoError::sys("shm_open", errno))?;
        let mapped = map_fd(fd, size, hint as usize as *mut c_void);
        let _ = nix::unistd::close(fd);
        let base = mapped?;
        if base as u64 != hint {
            // Harmless: nothing crosses the boundary as a raw address.
            log::debug!("Heap attached at {:p}, hint was {:#x}", base, hint);
        }
        Ok(AttachedHeap {
            href: unsafe { HeapRef::new(base, size) },
        })
    }

    pub fn href(&self) -> HeapRef {
        self.href
    }
}

impl Drop for AttachedHeap {
    fn drop(&mut self) {
        unsafe {
            let _ = nix::sys::mman::munmap(self.href.base().cast(), self.href.size());
        }
    }
}
