//! Arena sources
use core::{marker::PhantomData, mem::MaybeUninit, ptr::NonNull};

use crate::GRANULARITY;

/// The memory-extension primitive a [`Heap`] grows its arena with. It's
/// modeled after `sbrk`: each call appends a region at the current break.
///
/// [`Heap`]: crate::Heap
///
/// # Safety
///
/// A successful call to [`extend`] must return a region that
///
///  - is `len` bytes long, readable and writable;
///  - is aligned to [`GRANULARITY`] bytes if it's the first region returned by
///    `self`;
///  - starts immediately after the region returned by the previous successful
///    call otherwise;
///  - stays valid and untouched by anyone else for as long as `self` is
///    alive.
///
/// [`extend`]: Self::extend
pub unsafe trait ArenaSource {
    /// Move the break forward by `len` bytes and return the start of the new
    /// region, or `None` if the arena can't grow any further.
    ///
    /// # Safety
    ///
    /// `len` must be a non-zero multiple of [`GRANULARITY`].
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>>;
}

/// An [`ArenaSource`] that hands out a caller-provided memory pool and fails
/// once the pool is exhausted.
///
/// # Examples
///
/// ```
/// use tagheap::{FixedSource, Heap};
/// use std::mem::MaybeUninit;
///
/// let mut pool = [MaybeUninit::uninit(); 65536];
/// let mut heap: Heap<_> = Heap::new(FixedSource::new(&mut pool));
/// heap.init().unwrap();
///
/// // The arena can't grow beyond the pool
/// assert!(heap.allocate(65536).is_none());
/// assert!(heap.allocate(64).is_some());
/// assert!(heap.check());
/// ```
#[derive(Debug)]
pub struct FixedSource<'pool> {
    start: NonNull<u8>,
    capacity: usize,
    brk: usize,
    _phantom: PhantomData<&'pool mut [MaybeUninit<u8>]>,
}

// Safety: `FixedSource` logically owns `*start..*start + capacity` and has no
//         interior mutability
unsafe impl Send for FixedSource<'_> {}
unsafe impl Sync for FixedSource<'_> {}

impl<'pool> FixedSource<'pool> {
    /// Construct a `FixedSource` serving from `pool`. The pool's start is
    /// rounded up to [`GRANULARITY`] bytes and its length is rounded down.
    pub fn new(pool: &'pool mut [MaybeUninit<u8>]) -> Self {
        let unaligned_start = pool.as_mut_ptr() as *mut u8;
        let pad = unaligned_start.align_offset(GRANULARITY);
        let capacity = pool.len().saturating_sub(pad) & !(GRANULARITY - 1);

        let start = if capacity > 0 {
            // Safety: `pad < pool.len()`, so this stays inside `pool`
            unsafe { NonNull::new_unchecked(unaligned_start.add(pad)) }
        } else {
            NonNull::dangling()
        };

        Self {
            start,
            capacity,
            brk: 0,
            _phantom: PhantomData,
        }
    }

    /// The number of bytes this source can hand out in total.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The number of bytes handed out so far.
    #[inline]
    pub fn used(&self) -> usize {
        self.brk
    }
}

unsafe impl ArenaSource for FixedSource<'_> {
    #[inline]
    unsafe fn extend(&mut self, len: usize) -> Option<NonNull<u8>> {
        debug_assert_eq!(len % GRANULARITY, 0);
        let new_brk = self.brk.checked_add(len).filter(|&x| x <= self.capacity)?;
        let region = NonNull::new_unchecked(self.start.as_ptr().add(self.brk));
        self.brk = new_brk;
        Some(region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(align(64))]
    struct Align<T>(T);

    #[test]
    fn fixed_source_is_contiguous() {
        let mut pool = Align([MaybeUninit::uninit(); 256]);
        let mut source = FixedSource::new(&mut pool.0);
        assert_eq!(source.capacity(), 256);

        unsafe {
            let first = source.extend(GRANULARITY * 2).unwrap();
            assert_eq!(first.as_ptr() as usize % GRANULARITY, 0);
            let second = source.extend(GRANULARITY).unwrap();
            assert_eq!(
                second.as_ptr() as usize,
                first.as_ptr() as usize + GRANULARITY * 2
            );
            assert_eq!(source.used(), GRANULARITY * 3);

            assert!(source.extend(256).is_none());
            assert_eq!(source.used(), GRANULARITY * 3);
            assert!(source.extend(256 - GRANULARITY * 3).is_some());
            assert!(source.extend(GRANULARITY).is_none());
        }
    }

    #[test]
    fn fixed_source_aligns_pool() {
        let mut pool = Align([MaybeUninit::uninit(); 256]);
        let source = FixedSource::new(&mut pool.0[1..]);
        assert_eq!(source.capacity(), 256 - GRANULARITY);
        assert_eq!(source.start.as_ptr() as usize % GRANULARITY, 0);

        let mut pool = Align([MaybeUninit::uninit(); 8]);
        let source = FixedSource::new(&mut pool.0[1..]);
        assert_eq!(source.capacity(), 0);
    }
}
