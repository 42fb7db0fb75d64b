use core::ptr::{self, NonNull};

use crate::{ArenaSource, GRANULARITY};

/// The address space reserved for the arena. Pages are committed as the
/// break advances.
#[cfg(target_pointer_width = "64")]
const RESERVE_SIZE: usize = 1 << 32;
#[cfg(not(target_pointer_width = "64"))]
const RESERVE_SIZE: usize = 1 << 28;

pub type Source = MmapSource;

pub struct Mutex(());

impl Mutex {
    pub const INIT: Self = Self(());
}

/// `pthread_mutex_t` might be unsafe to move, so we can't put it in `Mutex`.
static mut MUTEX: libc::pthread_mutex_t = libc::PTHREAD_MUTEX_INITIALIZER;

impl Mutex {
    #[inline]
    pub fn lock(&self) {
        unsafe { libc::pthread_mutex_lock(ptr::addr_of_mut!(MUTEX)) };
    }

    #[inline]
    pub fn unlock(&self) {
        unsafe { libc::pthread_mutex_unlock(ptr::addr_of_mut!(MUTEX)) };
    }
}

/// An [`ArenaSource`] emulating `sbrk` on top of `mmap`.
///
/// The first extension reserves a large inaccessible address range. Each
/// extension then makes the pages up to the new break readable and writable
/// with `mprotect`, so the arena stays contiguous without interfering with
/// the program break used by the system allocator.
#[derive(Debug)]
pub struct MmapSource {
    base: Option<NonNull<u8>>,
    /// The current break, relative to `base`.
    brk: usize,
    /// The number of bytes made accessible so far. Always a multiple of the
    /// page size.
    committed: usize,
    /// The memory page size minus 1.
    page_size_m1: usize,
}

// Safety: `MmapSource` exclusively owns the mapping
unsafe impl Send for MmapSource {}
unsafe impl Sync for MmapSource {}

impl const_default1::ConstDefault for MmapSource {
    const DEFAULT: Self = Self::INIT;
}

impl MmapSource {
    /// The initializer. No memory is mapped until the first extension.
    pub const INIT: Self = Self {
        base: None,
        brk: 0,
        committed: 0,
        page_size_m1: 0,
    };

    /// The number of bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.brk
    }

    #[cold]
    fn reserve(&mut self) -> Option<NonNull<u8>> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        let page_size = page_size as usize;
        // Such a memory page size is quite unusual.
        if !page_size.is_power_of_two() || page_size < GRANULARITY {
            return None;
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                RESERVE_SIZE,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            log::warn!("mmap: failed to reserve {} bytes for the arena", RESERVE_SIZE);
            return None;
        }

        let base = NonNull::new(ptr as *mut u8)?;
        self.base = Some(base);
        self.page_size_m1 = page_size - 1;
        Some(base)
    }
}

unsafe impl ArenaSource for MmapSource {
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        let base = match self.base {
            Some(base) => base,
            None => self.reserve()?,
        };

        let new_brk = self.brk.checked_add(len).filter(|&x| x <= RESERVE_SIZE)?;

        if new_brk > self.committed {
            let new_committed =
                (new_brk.checked_add(self.page_size_m1)? & !self.page_size_m1).min(RESERVE_SIZE);
            let result = libc::mprotect(
                base.as_ptr().add(self.committed) as *mut libc::c_void,
                new_committed - self.committed,
                libc::PROT_READ | libc::PROT_WRITE,
            );
            if result != 0 {
                return None;
            }
            self.committed = new_committed;
        }

        let region = NonNull::new_unchecked(base.as_ptr().add(self.brk));
        self.brk = new_brk;
        Some(region)
    }
}

impl Drop for MmapSource {
    fn drop(&mut self) {
        if let Some(base) = self.base {
            unsafe { libc::munmap(base.as_ptr() as *mut libc::c_void, RESERVE_SIZE) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Heap;

    #[test]
    fn mmap_source_is_contiguous() {
        let mut source = MmapSource::INIT;
        unsafe {
            let first = source.extend(GRANULARITY).unwrap();
            assert_eq!(first.as_ptr() as usize % GRANULARITY, 0);
            first.as_ptr().write_bytes(0xaa, GRANULARITY);

            // Cross a page boundary
            let second = source.extend(1 << 20).unwrap();
            assert_eq!(second.as_ptr() as usize, first.as_ptr() as usize + GRANULARITY);
            second.as_ptr().write_bytes(0x55, 1 << 20);
            assert_eq!(*first.as_ptr(), 0xaa);

            assert!(source.extend(RESERVE_SIZE).is_none());
            assert_eq!(source.used(), GRANULARITY + (1 << 20));
        }
    }

    #[test]
    fn heap_on_mmap() {
        let _ = env_logger::builder().is_test(true).try_init();

        let mut heap: Heap<MmapSource> = Heap::INIT;
        heap.init().unwrap();

        let ptrs: std::vec::Vec<_> = (1..200).map(|i| heap.allocate(i * 97).unwrap()).collect();
        assert!(heap.check());
        for (i, ptr) in ptrs.iter().enumerate() {
            if i % 3 != 0 {
                unsafe { heap.release(*ptr) };
            }
        }
        assert!(heap.check());
        for (i, ptr) in ptrs.iter().enumerate() {
            if i % 3 == 0 {
                unsafe { heap.release(*ptr) };
            }
        }
        assert!(heap.check());

        // Everything was coalesced into one free block
        assert_eq!(heap.free_blocks().count(), 1);
        assert_eq!(heap.source().used(), heap.arena_len());
    }
}
