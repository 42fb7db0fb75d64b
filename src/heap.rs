//! The boundary-tag heap core
use core::{
    fmt,
    marker::PhantomData,
    ptr::{self, NonNull},
};

use crate::{
    options::{DefaultOptions, HeapOptions},
    source::ArenaSource,
    tag::{Tag, GRANULARITY, MIN_BLOCK_SIZE, WORD},
};

mod check;
mod free_list;
pub use self::check::Corruption;

/// The free list sentinel. It's a permanently allocated block placed at the
/// start of the arena, and its link words anchor the free list.
const SENTINEL: Block = Block(GRANULARITY);

/// The length of a freshly initialized arena: a padding word (so that
/// payloads are aligned to [`GRANULARITY`]), the sentinel block, and the
/// epilogue tag.
const INITIAL_LEN: usize = WORD + MIN_BLOCK_SIZE + WORD;

/// A reference to a block: the byte offset of its payload from the arena's
/// start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block(usize);

impl Block {
    /// The offset of the header tag.
    #[inline]
    fn header(self) -> usize {
        self.0 - WORD
    }

    /// The offset of the footer tag, given the block size.
    #[inline]
    fn footer(self, size: usize) -> usize {
        self.0 + size - GRANULARITY
    }
}

/// The error type for [`Heap::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// `init` was called on a heap that already owns an arena.
    AlreadyInitialized,
    /// The [`ArenaSource`] couldn't provide the initial region.
    OutOfMemory,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::AlreadyInitialized => "the heap is already initialized",
            Self::OutOfMemory => "the arena source could not provide the initial region",
        })
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for InitError {}

/// A dynamic memory allocator managing one contiguous, growable arena
/// obtained from an [`ArenaSource`].
///
/// # Data Structure Overview
///
#[cfg_attr(doc, doc = svgbobdoc::transform!(
    r#"
<center>
```svgbob
      sentinel              used block               free block
  ,---+---+----+----+---+---+-------------+---+---+----+----+-----+---+---,
  |pad|hdr|next|prev|ftr|hdr|   payload   |ftr|hdr|next|prev|     |ftr|end|
  '---+---+-+--+-+--+---+---+-------------+---+---+-+--+-+--+-----+---+---'
            |    ^                                  |    |
            |    '----------------------------------'    |
            '--------------------------------------------'
```
</center>
"#
))]
///
/// Every block is framed by a header and a footer tag encoding its size and
/// whether it's allocated. The two tags of a block are always identical,
/// which lets the heap find both physical neighbors of a block in constant
/// time. A free block stores the free list links in its payload.
///
/// # Properties
///
/// Payloads are aligned to [`GRANULARITY`] bytes. Each block has an
/// overhead of two words, and the smallest block is [`MIN_BLOCK_SIZE`]
/// bytes.
///
/// Allocation is first-fit over the free list, which is ordered by insertion
/// (the most recently freed block comes first). Deallocation coalesces the
/// block with both neighbors immediately, so no two adjacent blocks are ever
/// free.
///
/// The arena never shrinks.
pub struct Heap<Source, Options = DefaultOptions> {
    source: Source,
    /// The start of the arena. Dangling if `len == 0`.
    base: NonNull<u8>,
    /// The length of the arena. Zero if the heap hasn't been initialized.
    len: usize,
    _phantom: PhantomData<fn() -> Options>,
}

// Safety: All memory blocks referenced by a particular instance of `Heap` are
//         logically owned by that `Heap` and have no interior mutability, so
//         these are safe.
unsafe impl<Source: Send, Options> Send for Heap<Source, Options> {}
unsafe impl<Source: Sync, Options> Sync for Heap<Source, Options> {}

impl<Source: fmt::Debug, Options> fmt::Debug for Heap<Source, Options> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("source", &self.source)
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

impl<Source: const_default1::ConstDefault, Options> const_default1::ConstDefault
    for Heap<Source, Options>
{
    const DEFAULT: Self = Self::new(Source::DEFAULT);
}

impl<Source: const_default1::ConstDefault, Options> Heap<Source, Options> {
    /// An uninitialized heap backed by a default-constructed source.
    pub const INIT: Self = Self::new(Source::DEFAULT);
}

impl<Source, Options> Heap<Source, Options> {
    /// Construct an uninitialized heap. Call [`Self::init`] before using it.
    #[inline]
    pub const fn new(source: Source) -> Self {
        Self {
            source,
            base: NonNull::dangling(),
            len: 0,
            _phantom: PhantomData,
        }
    }

    /// Get a flag indicating whether [`Self::init`] has succeeded.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.len != 0
    }

    /// The number of bytes obtained from the [`ArenaSource`] so far.
    #[inline]
    pub fn arena_len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn source(&self) -> &Source {
        &self.source
    }

    /// Tear down the heap, returning the underlying source. Outstanding
    /// allocations must not be used after this.
    #[inline]
    pub fn into_source(self) -> Source {
        self.source
    }

    /// Iterate over the free blocks in free list order, yielding each
    /// block's payload address and total size.
    pub fn free_blocks(&self) -> impl Iterator<Item = (NonNull<u8>, usize)> + '_ {
        self.free_list()
            .map(move |block| (self.ptr(block), self.header(block).size()))
    }

    /// Check the heap's structural invariants. Returns `true` if they all
    /// hold.
    ///
    /// This scans the whole arena. See [`Self::verify`] for details.
    #[inline]
    pub fn check(&self) -> bool {
        self.verify().is_ok()
    }

    /// Get the usable size of an allocation, which is at least the requested
    /// size.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a live allocation made by `self`.
    #[inline]
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.header(self.block_for(ptr)).size() - GRANULARITY
    }

    #[inline]
    fn load(&self, offset: usize) -> usize {
        debug_assert!(
            offset % WORD == 0 && offset + WORD <= self.len,
            "offset {:#x} is outside the arena",
            offset
        );
        // Safety: `offset` lies inside the arena, which is exclusively owned
        //         by `self`
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().read() }
    }

    #[inline]
    fn store(&mut self, offset: usize, value: usize) {
        debug_assert!(
            offset % WORD == 0 && offset + WORD <= self.len,
            "offset {:#x} is outside the arena",
            offset
        );
        // Safety: See `load`
        unsafe { self.base.as_ptr().add(offset).cast::<usize>().write(value) }
    }

    #[inline]
    fn header(&self, block: Block) -> Tag {
        Tag::from_bits(self.load(block.header()))
    }

    #[inline]
    fn footer(&self, block: Block) -> Tag {
        let size = self.header(block).size();
        Tag::from_bits(self.load(block.footer(size)))
    }

    /// Get the physically next block. It's the epilogue if `block` is the
    /// last one.
    #[inline]
    fn next(&self, block: Block) -> Block {
        Block(block.0 + self.header(block).size())
    }

    /// Get the physically previous block from its footer, which immediately
    /// precedes `block`'s header.
    #[inline]
    fn prev(&self, block: Block) -> Block {
        let prev_footer = Tag::from_bits(self.load(block.0 - GRANULARITY));
        Block(block.0 - prev_footer.size())
    }

    /// Write matching header and footer tags.
    #[inline]
    fn format(&mut self, block: Block, size: usize, used: bool) {
        let tag = Tag::new(size, used);
        self.store(block.header(), tag.to_bits());
        self.store(block.footer(size), tag.to_bits());
    }

    /// Flip the allocated bit in both tags.
    #[inline]
    fn toggle(&mut self, block: Block) {
        let tag = self.header(block).toggled();
        self.store(block.header(), tag.to_bits());
        self.store(block.footer(tag.size()), tag.to_bits());
    }

    #[inline]
    fn ptr(&self, block: Block) -> NonNull<u8> {
        // Safety: `block` lies inside the arena, and `base` is non-null
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block.0)) }
    }

    #[inline]
    fn block_for(&self, ptr: NonNull<u8>) -> Block {
        let offset = (ptr.as_ptr() as usize).wrapping_sub(self.base.as_ptr() as usize);
        debug_assert!(
            offset > SENTINEL.0 && offset < self.len,
            "{:p} was not allocated by this heap",
            ptr
        );
        Block(offset)
    }
}

impl<Source: ArenaSource, Options: HeapOptions> Heap<Source, Options> {
    /// Obtain the initial region from the source and set up the sentinel and
    /// epilogue tags.
    ///
    /// # Examples
    ///
    /// ```
    /// use tagheap::{FixedSource, Heap, InitError};
    /// use std::mem::MaybeUninit;
    ///
    /// let mut pool = [MaybeUninit::uninit(); 4096];
    /// let mut heap: Heap<_> = Heap::new(FixedSource::new(&mut pool));
    /// assert_eq!(heap.init(), Ok(()));
    /// assert_eq!(heap.init(), Err(InitError::AlreadyInitialized));
    /// ```
    pub fn init(&mut self) -> Result<(), InitError> {
        if self.is_initialized() {
            return Err(InitError::AlreadyInitialized);
        }

        // Safety: `INITIAL_LEN` is a multiple of `GRANULARITY`
        let base = unsafe { self.source.extend(INITIAL_LEN) }.ok_or(InitError::OutOfMemory)?;
        debug_assert_eq!(base.as_ptr() as usize % GRANULARITY, 0);

        self.base = base;
        self.len = INITIAL_LEN;

        self.store(0, 0);
        self.format(SENTINEL, MIN_BLOCK_SIZE, true);
        self.set_next_free(SENTINEL, SENTINEL);
        self.set_prev_free(SENTINEL, SENTINEL);
        self.store(INITIAL_LEN - WORD, Tag::BOUNDARY.to_bits());

        log::debug!("heap: initialized the arena at {:p}", base);
        Ok(())
    }

    /// Attempt to allocate a block of memory with at least `size` bytes of
    /// payload. The returned address is aligned to [`GRANULARITY`] bytes.
    ///
    /// Returns `None` if `size` is zero, the heap isn't initialized, or the
    /// arena can't grow enough to satisfy the request.
    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        if size == 0 || !self.is_initialized() {
            return None;
        }

        let block_size = block_size_for(size)?;
        let block = match self.find_fit(block_size) {
            Some(block) => block,
            None => self.grow(block_size)?,
        };

        self.place(block, block_size);
        Some(self.ptr(block))
    }

    /// Attempt to allocate a block of memory with at least `size` bytes of
    /// payload, aligned to `align` bytes.
    ///
    /// If `align` exceeds [`GRANULARITY`], the space in front of the aligned
    /// payload is split off as a free block of its own.
    ///
    /// # Panics
    ///
    /// `align` must be a power of two. This is only checked in debug builds.
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
    /// let ptr = heap.allocate_aligned(100, 256).unwrap();
    /// assert_eq!(ptr.as_ptr() as usize % 256, 0);
    /// unsafe { heap.release(ptr) };
    /// assert!(heap.check());
    /// ```
    pub fn allocate_aligned(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        debug_assert!(align.is_power_of_two());
        if align <= GRANULARITY {
            return self.allocate(size);
        }
        if size == 0 || !self.is_initialized() {
            return None;
        }

        let block_size = block_size_for(size)?;
        let (block, start) = match self.find_fit_aligned(block_size, align) {
            Some(fit) => fit,
            None => {
                // Enough for the worst-case leading gap
                let min_size = block_size
                    .checked_add(align)?
                    .checked_add(MIN_BLOCK_SIZE)?;
                let block = self.grow(min_size)?;
                (block, self.aligned_start(block, block_size, align)?)
            }
        };

        self.place_aligned(block, start, block_size);
        Some(self.ptr(start))
    }

    /// Similar to [`Self::allocate`] but the first `size` bytes of the
    /// returned memory block are zero-filled.
    pub fn allocate_zeroed(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.allocate(size)?;
        // Safety: The allocation is at least `size` bytes long
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Some(ptr)
    }

    /// Deallocate a previously allocated memory block.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in constant time.
    ///
    /// # Safety
    ///
    ///  - `ptr` must denote a memory block previously allocated via `self`.
    ///  - The memory block must not have been deallocated yet.
    ///
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) {
        let block = self.block_for(ptr);
        debug_assert!(self.header(block).is_used(), "double release of {:p}", ptr);
        debug_assert_eq!(self.header(block), self.footer(block));

        self.toggle(block);
        self.coalesce(block);
    }

    /// Shrink or grow a previously allocated memory block.
    ///
    ///  - If `ptr` is `None`, this is equivalent to [`Self::allocate`].
    ///  - If `size` is zero, this is equivalent to [`Self::release`] and
    ///    returns `None`.
    ///
    /// Shrinking always happens in place. Growing moves the contents to a new
    /// memory block. Returns the new starting address on success; `None`
    /// otherwise, in which case the original memory block is left intact.
    ///
    /// # Time Complexity
    ///
    /// Unlike other methods, this method will complete in linear time
    /// (`O(old_size)`).
    ///
    /// # Safety
    ///
    /// `ptr`, if any, must denote a live memory block previously allocated
    /// via `self`.
    #[inline]
    pub unsafe fn resize(&mut self, ptr: Option<NonNull<u8>>, size: usize) -> Option<NonNull<u8>> {
        self.resize_aligned(ptr, size, GRANULARITY)
    }

    /// Similar to [`Self::resize`] but a relocated memory block is aligned to
    /// `align` bytes, as by [`Self::allocate_aligned`].
    ///
    /// # Safety
    ///
    /// `ptr`, if any, must denote a live memory block previously allocated
    /// via `self` and aligned to `align` bytes.
    pub unsafe fn resize_aligned(
        &mut self,
        ptr: Option<NonNull<u8>>,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>> {
        let ptr = match ptr {
            Some(ptr) => ptr,
            None => return self.allocate_aligned(size, align),
        };

        if size == 0 {
            self.release(ptr);
            return None;
        }

        let block = self.block_for(ptr);
        let new_size = block_size_for(size)?;
        let old_size = self.header(block).size();

        if new_size <= old_size {
            // The excess, if any, is merged into a free successor, which
            // keeps the no-adjacent-free-blocks invariant
            if let Some(rest) = self.split(block, new_size) {
                self.coalesce(rest);
            }
            return Some(ptr);
        }

        let new_ptr = self.allocate_aligned(size, align)?;
        ptr::copy_nonoverlapping(
            ptr.as_ptr(),
            new_ptr.as_ptr(),
            (old_size - GRANULARITY).min(size),
        );
        self.release(ptr);
        Some(new_ptr)
    }

    /// Find the first free block at least `size` bytes large.
    #[inline]
    fn find_fit(&self, size: usize) -> Option<Block> {
        self.free_list()
            .find(|&block| self.header(block).size() >= size)
    }

    /// Find the first free block that can hold a `size`-byte block whose
    /// payload is aligned to `align` bytes. Returns the block and the
    /// aligned payload.
    #[inline]
    fn find_fit_aligned(&self, size: usize, align: usize) -> Option<(Block, Block)> {
        self.free_list()
            .find_map(|block| Some((block, self.aligned_start(block, size, align)?)))
    }

    /// Find the first payload in the free block `block` aligned to `align`
    /// bytes such that the leading gap is either empty or large enough to
    /// form a block, and a `size`-byte block starting there still fits.
    #[inline]
    fn aligned_start(&self, block: Block, size: usize, align: usize) -> Option<Block> {
        let base = self.base.as_ptr() as usize;
        let unaligned = base + block.0;
        let mut aligned = unaligned.checked_add(align - 1)? & !(align - 1);
        if aligned != unaligned && aligned - unaligned < MIN_BLOCK_SIZE {
            aligned = aligned.checked_add(align)?;
        }

        let start = aligned - base;
        let end = block.0 + self.header(block).size();
        if start.checked_add(size)? <= end {
            Some(Block(start))
        } else {
            None
        }
    }

    /// Turn a part of a free block into a used memory block of `size` bytes
    /// starting at `start`. The leading gap becomes a free block.
    #[inline]
    fn place_aligned(&mut self, block: Block, start: Block, size: usize) {
        if start == block {
            self.place(block, size);
            return;
        }

        let total = self.header(block).size();
        let gap = start.0 - block.0;
        debug_assert!(gap >= MIN_BLOCK_SIZE);

        // `block` stays in the free list as the gap. Its predecessor is not
        // free, and its successor is about to be allocated.
        self.format(block, gap, false);
        self.format(start, total - gap, false);
        if let Some(rest) = self.split(start, size) {
            self.link(rest);
        }
    }

    /// Grow the arena to accommodate a free block of at least `min_size`
    /// bytes, and return the (possibly coalesced) free block.
    #[cold]
    fn grow(&mut self, min_size: usize) -> Option<Block> {
        let len = min_size
            .max(Options::CHUNK_SIZE)
            .checked_add(GRANULARITY - 1)?
            & !(GRANULARITY - 1);
        let new_len = self.len.checked_add(len)?;

        // Safety: `len` is a non-zero multiple of `GRANULARITY`
        let region = match unsafe { self.source.extend(len) } {
            Some(region) => region,
            None => {
                log::trace!("heap: the arena source refused to grow by {} bytes", len);
                return None;
            }
        };
        debug_assert_eq!(
            region.as_ptr() as usize,
            self.base.as_ptr() as usize + self.len,
            "the arena source returned a discontiguous region"
        );
        log::trace!("heap: grew the arena by {} bytes to {} bytes", len, new_len);

        // The old epilogue becomes the new block's header
        let block = Block(self.len);
        self.len = new_len;
        self.format(block, len, false);
        self.store(new_len - WORD, Tag::BOUNDARY.to_bits());

        // The previous last block might be free
        Some(self.coalesce(block))
    }

    /// Turn a free block into a used memory block of `size` bytes.
    #[inline]
    fn place(&mut self, block: Block, size: usize) {
        self.unlink(block);
        if let Some(rest) = self.split(block, size) {
            // `block` was free, so the block following `rest` is not
            self.link(rest);
        }
    }

    /// Mark `block` as used and shrink it to `size` bytes if the excess can
    /// form a block of its own. Returns the excess as an unlinked free block.
    #[inline]
    fn split(&mut self, block: Block, size: usize) -> Option<Block> {
        let block_size = self.header(block).size();
        debug_assert!(block_size >= size);

        if block_size - size >= MIN_BLOCK_SIZE {
            self.format(block, size, true);
            let rest = self.next(block);
            self.format(rest, block_size - size, false);
            Some(rest)
        } else {
            self.format(block, block_size, true);
            None
        }
    }

    /// Merge a free block that isn't in the free list yet with its free
    /// neighbors, and link the result to the free list. Returns the merged
    /// block, which starts at the lowest address of the merged ones.
    fn coalesce(&mut self, mut block: Block) -> Block {
        let mut size = self.header(block).size();
        debug_assert!(!self.header(block).is_used());

        // Merge with the next block if it's a free block. The epilogue is a
        // used tag, so this stops at the end of the arena.
        let next = self.next(block);
        let next_tag = self.header(next);
        if !next_tag.is_used() {
            self.unlink(next);
            size += next_tag.size();
        }

        // Merge with the previous block if it's a free block. The sentinel is
        // a used block, so this stops at the start of the arena.
        let prev_tag = Tag::from_bits(self.load(block.0 - GRANULARITY));
        if !prev_tag.is_used() {
            let prev = self.prev(block);
            self.unlink(prev);
            size += prev_tag.size();
            block = prev;
        }

        self.format(block, size, false);
        self.link(block);
        block
    }
}

/// Calculate the block size needed for a payload of `size` bytes. Returns
/// `None` on overflow.
#[inline]
fn block_size_for(size: usize) -> Option<usize> {
    let size = size.checked_add(2 * WORD + GRANULARITY - 1)? & !(GRANULARITY - 1);
    Some(size.max(MIN_BLOCK_SIZE))
}
