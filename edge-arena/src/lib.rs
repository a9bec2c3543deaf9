//! Per-thread bump arenas for staging marshaled call data.
//!
//! Buffers that cross the trust boundary carry no allocator metadata:
//! an arena is a fixed region plus a high-water mark, released in bulk.
//! There is nothing linked inside the region for the other side to
//! corrupt, and the allocation path never takes a lock because each
//! thread owns its arena outright.

use std::cell::RefCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use nix::sys::mman::{MapFlags, ProtFlags};

/// A shared anonymous mapping, unmapped on drop. This is the region
/// provider behind every owned arena; the mapping is `MAP_SHARED` so a
/// cooperating process spawned later can see staged call data.
pub struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}

impl Region {
    pub fn anonymous(len: usize) -> Option<Region> {
        if len == 0 {
            return None;
        }
        let base = unsafe {
            nix::sys::mman::mmap(
                std::ptr::null_mut(),
                len,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED | MapFlags::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        let base = match base {
            Ok(base) => base as *mut u8,
            Err(errno) => {
                log::error!("Failed to map a {} byte arena region: {}", len, errno);
                return None;
            }
        };
        Some(Region { base, len })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if let Err(errno) = unsafe { nix::sys::mman::munmap(self.base.cast(), self.len) } {
            log::error!("Failed to unmap arena region: {}", errno);
        }
    }
}

/// Bump allocator over a fixed region. Individual allocations are never
/// freed; `reset` rewinds the whole arena.
pub struct Arena {
    buf: NonNull<u8>,
    capacity: usize,
    used: usize,
    // None when the arena borrows memory owned elsewhere.
    region: Option<Region>,
}

impl Arena {
    /// Arena over a freshly mapped region of its own.
    pub fn with_capacity(capacity: usize) -> Option<Arena> {
        let region = Region::anonymous(capacity)?;
        let buf = NonNull::new(region.base())?;
        Some(Arena {
            buf,
            capacity,
            used: 0,
            region: Some(region),
        })
    }

    /// Arena over memory owned by someone else, e.g. a slice of the
    /// virtual-enclave heap.
    ///
    /// # Safety
    ///
    /// `buf` must point to `capacity` writable bytes that stay mapped
    /// for the arena's lifetime.
    pub unsafe fn from_raw(buf: *mut u8, capacity: usize) -> Option<Arena> {
        Some(Arena {
            buf: NonNull::new(buf)?,
            capacity,
            used: 0,
            region: None,
        })
    }

    /// Carve `size` bytes out of the arena, rounded up to the
    /// marshaling alignment. The returned memory is not zeroed.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let total = round_up(size, kconfig::MARSHAL_ALIGN)?;
        let used_after = self.used.checked_add(total)?;
        if used_after > self.capacity {
            return None;
        }
        let addr = unsafe { self.buf.as_ptr().add(self.used) };
        self.used = used_after;
        NonNull::new(addr)
    }

    /// As `alloc(num * size)`, zero-filled, failing if the product
    /// overflows.
    pub fn calloc(&mut self, num: usize, size: usize) -> Option<NonNull<u8>> {
        let total = num.checked_mul(size)?;
        let ptr = self.alloc(total)?;
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Some(ptr)
    }

    /// Rewind the high-water mark. Pointers handed out earlier become
    /// free for reuse; the region itself stays mapped.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Offset of an allocation inside the arena, if it lies within it.
    pub fn offset_of(&self, ptr: NonNull<u8>) -> Option<usize> {
        let base = self.buf.as_ptr() as usize;
        let addr = ptr.as_ptr() as usize;
        if addr < base || addr >= base + self.capacity {
            return None;
        }
        Some(addr - base)
    }

    pub fn is_owned(&self) -> bool {
        self.region.is_some()
    }
}

fn round_up(size: usize, align: usize) -> Option<usize> {
    let mask = align - 1;
    size.checked_add(mask).map(|n| n & !mask)
}

// Process-wide capacity for arenas that have not materialized yet.
// Arenas already created keep the capacity they were born with.
static DEFAULT_CAPACITY: AtomicUsize = AtomicUsize::new(kconfig::ARENA_DEFAULT_CAPACITY);

thread_local! {
    static THREAD_ARENA: RefCell<Option<Arena>> = RefCell::new(None);
}

/// Set the capacity used when a thread's arena first materializes.
/// Refuses capacities above the hard ceiling.
pub fn configure_capacity(capacity: usize) -> bool {
    if capacity > kconfig::ARENA_MAX_CAPACITY {
        return false;
    }
    DEFAULT_CAPACITY.store(capacity, Ordering::Relaxed);
    true
}

/// Allocate from the calling thread's arena, materializing it on first
/// use.
pub fn alloc(size: usize) -> Option<NonNull<u8>> {
    with_thread_arena(|arena| arena.alloc(size))
}

/// Zeroed variant of [`alloc`]; fails if `num * size` overflows.
pub fn calloc(num: usize, size: usize) -> Option<NonNull<u8>> {
    with_thread_arena(|arena| arena.calloc(num, size))
}

/// Rewind the calling thread's arena. A no-op if it never materialized.
pub fn reset() {
    THREAD_ARENA.with(|cell| {
        if let Some(arena) = cell.borrow_mut().as_mut() {
            arena.reset();
        }
    });
}

/// Release the calling thread's arena and its region entirely. The next
/// allocation materializes a fresh arena at the then-current capacity.
pub fn teardown() {
    THREAD_ARENA.with(|cell| {
        cell.borrow_mut().take();
    });
}

fn with_thread_arena<F, R>(f: F) -> Option<R>
where
    F: FnOnce(&mut Arena) -> Option<R>,
{
    THREAD_ARENA.with(|cell| {
        let mut slot = cell.borrow_mut();
        if slot.is_none() {
            *slot = Arena::with_capacity(DEFAULT_CAPACITY.load(Ordering::Relaxed));
        }
        f(slot.as_mut()?)
    })
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    fn allocations_stay_inside_and_never_overlap() {
        let mut arena = Arena::with_capacity(0x1000).expect("map arena");
        let first = arena.alloc(1).expect("first alloc");
        let base = arena.offset_of(first).unwrap();
        assert_eq!(base, 0);

        let mut ranges = vec![(0usize, kconfig::MARSHAL_ALIGN)];
        for size in [1usize, 16, 17, 64, 100, 255] {
            let ptr = arena.alloc(size).expect("alloc");
            let offset = arena.offset_of(ptr).expect("inside arena");
            assert_eq!(offset % kconfig::MARSHAL_ALIGN, 0);
            let end = offset + size;
            assert!(end <= arena.capacity());
            for &(start, len) in &ranges {
                assert!(end <= start || offset >= start + len, "overlap at {}", offset);
            }
            ranges.push((offset, size));
        }
        assert!(arena.used() <= arena.capacity());
    }

    #[test]
    fn exhaustion_is_reported_not_fatal() {
        let mut arena = Arena::with_capacity(0x100).expect("map arena");
        assert!(arena.alloc(0x100).is_some());
        assert!(arena.alloc(1).is_none());
        let used = arena.used();
        assert!(arena.alloc(1).is_none());
        assert_eq!(arena.used(), used);
    }

    #[test]
    fn reset_makes_the_whole_arena_reusable() {
        let mut arena = Arena::with_capacity(0x1000).expect("map arena");
        assert!(arena.alloc(0x1000).is_some());
        assert!(arena.alloc(1).is_none());
        arena.reset();
        assert!(arena.alloc(0x1000).is_some());
        assert!(arena.alloc(1).is_none());
    }

    #[test]
    fn calloc_overflow_fails_without_allocating() {
        let mut arena = Arena::with_capacity(0x1000).expect("map arena");
        assert!(arena.calloc(usize::MAX, 2).is_none());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn alloc_rounding_overflow_fails() {
        let mut arena = Arena::with_capacity(0x1000).expect("map arena");
        assert!(arena.alloc(usize::MAX - 2).is_none());
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn calloc_zeroes_recycled_memory() {
        let mut arena = Arena::with_capacity(0x100).expect("map arena");
        let ptr = arena.alloc(64).expect("alloc");
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0xA5, 64) };
        arena.reset();
        let ptr = arena.calloc(4, 16).expect("calloc");
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn empty_region_is_refused() {
        assert!(Region::anonymous(0).is_none());
    }

    #[test]
    #[serial]
    fn configure_does_not_resize_a_live_arena() {
        // Thread-local state, so run the whole scenario on a fresh
        // thread and restore the process default afterwards.
        let worker = std::thread::spawn(|| {
            assert!(configure_capacity(0x1000));
            assert!(alloc(16).is_some());
            assert!(configure_capacity(0x2000));
            reset();
            assert!(alloc(0x1000).is_some());
            // Still the original 0x1000 capacity.
            assert!(alloc(1).is_none());
            teardown();
            // A fresh arena picks up the new capacity.
            reset();
            assert!(alloc(0x2000).is_some());
            teardown();
        });
        worker.join().expect("worker");
        assert!(configure_capacity(kconfig::ARENA_DEFAULT_CAPACITY));
    }

    #[test]
    #[serial]
    fn capacity_ceiling_is_enforced() {
        assert!(!configure_capacity(kconfig::ARENA_MAX_CAPACITY + 1));
        assert!(configure_capacity(kconfig::ARENA_MAX_CAPACITY));
        assert!(configure_capacity(kconfig::ARENA_DEFAULT_CAPACITY));
    }

    #[test]
    fn teardown_then_alloc_rematerializes() {
        let worker = std::thread::spawn(|| {
            let first = alloc(32).expect("first");
            teardown();
            let second = alloc(32).expect("second");
            // Nothing to assert about addresses; the point is that both
            // calls succeed and the arena state is coherent.
            let _ = (first, second);
            reset();
            teardown();
        });
        worker.join().expect("worker");
    }
}
