use core::{
    alloc,
    cell::UnsafeCell,
    ops,
    ptr::{self, NonNull},
};

use crate::{Heap, HeapOptions};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        use self::unix as os;
        pub use self::unix::MmapSource;
    }
}

/// The default [`HeapOptions`] of [`GlobalTagHeap`]. The arena grows in
/// 64KiB steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalOptions;

impl HeapOptions for GlobalOptions {
    const CHUNK_SIZE: usize = 1 << 16;
}

/// [`Heap`] as a global allocator.
///
/// Every operation is serialized by a process-wide mutex. The heap is
/// initialized by the first allocation request.
///
/// Layouts with an alignment greater than [`GRANULARITY`] bytes are served
/// by [`Heap::allocate_aligned`].
///
/// [`GRANULARITY`]: crate::GRANULARITY
///
/// # Examples
///
/// ```rust
/// #[global_allocator]
/// static A: tagheap::GlobalTagHeap = tagheap::GlobalTagHeap::INIT;
///
/// let mut m = std::collections::HashMap::new();
/// m.insert(1, 2);
/// m.insert(5, 3);
/// drop(m);
/// ```
pub struct GlobalTagHeap<Options: HeapOptions = GlobalOptions> {
    inner: UnsafeCell<Heap<os::Source, Options>>,
    mutex: os::Mutex,
}

impl<Options: HeapOptions> const_default1::ConstDefault for GlobalTagHeap<Options> {
    const DEFAULT: Self = Self::INIT;
}

unsafe impl<Options: HeapOptions> Send for GlobalTagHeap<Options> {}
unsafe impl<Options: HeapOptions> Sync for GlobalTagHeap<Options> {}

impl<Options: HeapOptions> GlobalTagHeap<Options> {
    /// The initializer.
    pub const INIT: Self = Self {
        inner: UnsafeCell::new(Heap::INIT),
        mutex: os::Mutex::INIT,
    };

    /// Check the heap's structural invariants. See [`Heap::check`].
    pub fn check(&self) -> bool {
        self.lock_inner().map_or(false, |inner| inner.check())
    }

    /// Lock the heap, initializing it if it hasn't been yet. Returns `None` if
    /// the initialization failed.
    #[inline]
    fn lock_inner(&self) -> Option<impl ops::DerefMut<Target = Heap<os::Source, Options>> + '_> {
        struct LockGuard<'a, Options: HeapOptions>(&'a GlobalTagHeap<Options>);

        impl<Options: HeapOptions> ops::Deref for LockGuard<'_, Options> {
            type Target = Heap<os::Source, Options>;

            #[inline]
            fn deref(&self) -> &Self::Target {
                // Safety: Protected by `mutex`
                unsafe { &*self.0.inner.get() }
            }
        }

        impl<Options: HeapOptions> ops::DerefMut for LockGuard<'_, Options> {
            #[inline]
            fn deref_mut(&mut self) -> &mut Self::Target {
                // Safety: Protected by `mutex`
                unsafe { &mut *self.0.inner.get() }
            }
        }

        impl<Options: HeapOptions> Drop for LockGuard<'_, Options> {
            #[inline]
            fn drop(&mut self) {
                self.0.mutex.unlock();
            }
        }

        self.mutex.lock();
        let mut guard = LockGuard(self);
        if !guard.is_initialized() {
            guard.init().ok()?;
        }
        Some(guard)
    }
}

unsafe impl<Options: HeapOptions> alloc::GlobalAlloc for GlobalTagHeap<Options> {
    #[inline]
    unsafe fn alloc(&self, layout: alloc::Layout) -> *mut u8 {
        self.lock_inner()
            .and_then(|mut inner| inner.allocate_aligned(layout.size(), layout.align()))
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }

    #[inline]
    unsafe fn alloc_zeroed(&self, layout: alloc::Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            // Safety: The allocation is at least `layout.size()` bytes long
            ptr.write_bytes(0, layout.size());
        }
        ptr
    }

    #[inline]
    unsafe fn dealloc(&self, ptr: *mut u8, _layout: alloc::Layout) {
        // Safety: All allocations are non-null
        let ptr = NonNull::new_unchecked(ptr);
        if let Some(mut inner) = self.lock_inner() {
            // Safety: `ptr` denotes a previous allocation
            inner.release(ptr);
        }
    }

    #[inline]
    unsafe fn realloc(&self, ptr: *mut u8, layout: alloc::Layout, new_size: usize) -> *mut u8 {
        // Safety: All allocations are non-null
        let ptr = NonNull::new_unchecked(ptr);
        // Safety: `ptr` denotes a previous allocation aligned to
        //         `layout.align()`, and `new_size` is non-zero, so the
        //         allocation won't be released
        self.lock_inner()
            .and_then(|mut inner| inner.resize_aligned(Some(ptr), new_size, layout.align()))
            .map(NonNull::as_ptr)
            .unwrap_or(ptr::null_mut())
    }
}
