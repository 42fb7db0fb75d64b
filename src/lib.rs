//! This crate implements a boundary-tag dynamic memory allocator managing a
//! single contiguous, growable arena.
//!
//!  - **Drop-in `allocate`/`release`/`resize` triad.** [`Heap`] provides the
//!    classic `malloc`/`free`/`realloc` semantics, including `resize(None, n)`
//!    and `resize(p, 0)`.
//!
//!  - **Bounded fragmentation.** Freed blocks are coalesced with both of their
//!    physical neighbors immediately, so no two adjacent blocks are ever free.
//!    Each block carries a header and a footer tag, which makes both
//!    neighbors reachable in constant time.
//!
//!  - **The arena is provided by an [`ArenaSource`].** It's the
//!    sbrk-like primitive the heap grows its arena with. [`FixedSource`]
//!    serves from a caller-provided pool; `MmapSource` (Unix only) commits
//!    pages of a reserved address range.
//!
//!  - **Self-checking.** [`Heap::verify`] scans the arena and reports any
//!    broken invariant as a [`Corruption`].
//!
//!  - **This crate supports `#![no_std]`.**
//!
//! # Examples
//!
//! ## `Heap`: Core API
//!
//! ```rust
//! use tagheap::{FixedSource, Heap};
//! use std::mem::MaybeUninit;
//!
//! let mut pool = [MaybeUninit::uninit(); 65536];
//! let mut heap: Heap<_> = Heap::new(FixedSource::new(&mut pool));
//! heap.init().unwrap();
//!
//! unsafe {
//!     let mut ptr1 = heap.allocate(8).unwrap().cast::<u64>();
//!     let mut ptr2 = heap.allocate(8).unwrap().cast::<u64>();
//!     *ptr1.as_mut() = 42;
//!     *ptr2.as_mut() = 56;
//!     assert_eq!(*ptr1.as_ref(), 42);
//!     assert_eq!(*ptr2.as_ref(), 56);
//!
//!     let ptr1 = heap.resize(Some(ptr1.cast()), 1000).unwrap().cast::<u64>();
//!     assert_eq!(*ptr1.as_ref(), 42);
//!
//!     heap.release(ptr1.cast());
//!     heap.release(ptr2.cast());
//! }
//!
//! assert!(heap.check());
//! ```
//!
//! ## `GlobalTagHeap`: Global Allocator
//!
//! ```rust
//! #[cfg(unix)]
//! #[global_allocator]
//! static A: tagheap::GlobalTagHeap = tagheap::GlobalTagHeap::INIT;
//!
//! let mut m = std::collections::HashMap::new();
//! m.insert(1, 2);
//! m.insert(5, 3);
//! drop(m);
//! ```
#![no_std]
#![cfg_attr(feature = "doc_cfg", feature(doc_cfg))]

mod heap;
mod options;
mod source;
mod tag;
pub use self::{
    heap::{Corruption, Heap, InitError},
    options::{DefaultOptions, HeapOptions},
    source::{ArenaSource, FixedSource},
    tag::{GRANULARITY, MIN_BLOCK_SIZE},
};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        #[cfg_attr(feature = "doc_cfg", doc(cfg(unix)))]
        mod global;
        pub use self::global::*;
    }
}

#[cfg(any(test, feature = "std"))]
extern crate std;

#[cfg(test)]
mod tests;
