//! The consistency checker
use core::fmt;

use super::{Block, Heap, SENTINEL};
use crate::tag::{Tag, TagKind, GRANULARITY, MIN_BLOCK_SIZE, WORD};

/// A structural defect found by [`Heap::verify`]. Offsets are relative to
/// the arena's start and denote a block's payload unless noted otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Corruption {
    /// The sentinel block anchoring the free list has been overwritten.
    BadSentinel,
    /// A tag or a free list link at the given offset is misaligned or lies
    /// outside the arena.
    OutOfBounds { offset: usize },
    /// A block's size is not a multiple of [`GRANULARITY`], is smaller than
    /// [`MIN_BLOCK_SIZE`], or overruns the arena.
    ///
    /// [`GRANULARITY`]: crate::GRANULARITY
    /// [`MIN_BLOCK_SIZE`]: crate::MIN_BLOCK_SIZE
    BadSize { offset: usize },
    /// A block's header and footer disagree.
    TagMismatch { offset: usize },
    /// The block chain doesn't end at the epilogue tag.
    BadEpilogue { offset: usize },
    /// Two physically adjacent blocks are both free. `offset` is the second
    /// one.
    AdjacentFree { offset: usize },
    /// The free list contains a block marked as allocated.
    UsedBlockInFreeList { offset: usize },
    /// A free list member's successor doesn't link back to it.
    BrokenLink { offset: usize },
    /// A free block is missing from the free list.
    MissingFromFreeList { offset: usize },
    /// The free list's length doesn't match the number of free blocks, which
    /// means it contains duplicates or stray entries.
    FreeListLength { expected: usize, found: usize },
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::BadSentinel => write!(f, "the free list sentinel is damaged"),
            Self::OutOfBounds { offset } => write!(f, "offset {:#x} is out of bounds", offset),
            Self::BadSize { offset } => write!(f, "block {:#x} has an invalid size", offset),
            Self::TagMismatch { offset } => {
                write!(f, "block {:#x} has mismatched header and footer", offset)
            }
            Self::BadEpilogue { offset } => {
                write!(f, "the block chain ends at {:#x}, not at the epilogue", offset)
            }
            Self::AdjacentFree { offset } => {
                write!(f, "block {:#x} and its predecessor are both free", offset)
            }
            Self::UsedBlockInFreeList { offset } => {
                write!(f, "allocated block {:#x} is in the free list", offset)
            }
            Self::BrokenLink { offset } => {
                write!(f, "free list links around {:#x} are inconsistent", offset)
            }
            Self::MissingFromFreeList { offset } => {
                write!(f, "free block {:#x} is not in the free list", offset)
            }
            Self::FreeListLength { expected, found } => write!(
                f,
                "the free list has {} entries but there are {} free blocks",
                found, expected
            ),
        }
    }
}

#[cfg(feature = "std")]
#[cfg_attr(feature = "doc_cfg", doc(cfg(feature = "std")))]
impl std::error::Error for Corruption {}

impl<Source, Options> Heap<Source, Options> {
    /// Check the heap's structural invariants, reporting the first violation
    /// found:
    ///
    ///  - Every block's header and footer are identical.
    ///  - No two physically adjacent blocks are both free.
    ///  - The free list contains exactly the free blocks, each exactly once.
    ///
    /// This never reads outside the arena and terminates even if the free
    /// list links are garbage. An uninitialized heap is trivially
    /// consistent.
    ///
    /// # Time Complexity
    ///
    /// This method will complete in linear time (`O(n)`, where `n` is the
    /// number of blocks).
    pub fn verify(&self) -> Result<(), Corruption> {
        if !self.is_initialized() {
            return Ok(());
        }

        let sentinel = Tag::new(MIN_BLOCK_SIZE, true);
        if self.checked_tag(SENTINEL.header())? != sentinel
            || self.checked_tag(SENTINEL.footer(MIN_BLOCK_SIZE))? != sentinel
        {
            return Err(Corruption::BadSentinel);
        }

        let num_listed = self.verify_free_list()?;

        // Walk the block chain
        let mut num_free = 0;
        let mut prev_free = false;
        let mut block = Block(SENTINEL.0 + MIN_BLOCK_SIZE);
        loop {
            let tag = self.checked_tag(block.header())?;
            let (size, used) = match tag.kind() {
                TagKind::Boundary if block.header() == self.len - WORD => break,
                TagKind::Boundary => return Err(Corruption::BadEpilogue { offset: block.0 }),
                TagKind::Block { size, used } => (size, used),
            };

            if size < MIN_BLOCK_SIZE
                || size % GRANULARITY != 0
                || block.0.checked_add(size).map_or(true, |end| end > self.len)
            {
                return Err(Corruption::BadSize { offset: block.0 });
            }

            if self.checked_tag(block.footer(size))? != tag {
                return Err(Corruption::TagMismatch { offset: block.0 });
            }

            if !used {
                if prev_free {
                    return Err(Corruption::AdjacentFree { offset: block.0 });
                }
                if !self.links_back(block) {
                    return Err(Corruption::MissingFromFreeList { offset: block.0 });
                }
                num_free += 1;
            }

            prev_free = !used;
            block = Block(block.0 + size);
        }

        // Every free block is linked to by its neighbors, and every list member
        // is free. If the counts match, the list contains each free block
        // exactly once.
        if num_listed != num_free {
            return Err(Corruption::FreeListLength {
                expected: num_free,
                found: num_listed,
            });
        }

        Ok(())
    }

    /// Walk the free list with bounds checking and return its length. After
    /// this succeeds, [`Self::free_list`] is safe to use.
    fn verify_free_list(&self) -> Result<usize, Corruption> {
        // No arena can contain more blocks than this
        let max_blocks = self.len / MIN_BLOCK_SIZE;

        let mut num_listed = 0;
        let mut cursor = SENTINEL;
        loop {
            let next = Block(self.checked_load(cursor.0)?);
            if next == SENTINEL {
                break;
            }

            if next.0 % GRANULARITY != 0 || next.0 <= SENTINEL.0 {
                return Err(Corruption::OutOfBounds { offset: next.0 });
            }
            if self.checked_tag(next.header())?.is_used() {
                return Err(Corruption::UsedBlockInFreeList { offset: next.0 });
            }
            if self.checked_load(next.0 + WORD)? != cursor.0 {
                return Err(Corruption::BrokenLink { offset: next.0 });
            }

            num_listed += 1;
            if num_listed > max_blocks {
                // There must be a cycle
                return Err(Corruption::FreeListLength {
                    expected: max_blocks,
                    found: num_listed,
                });
            }
            cursor = next;
        }

        if self.checked_load(SENTINEL.0 + WORD)? != cursor.0 {
            return Err(Corruption::BrokenLink { offset: SENTINEL.0 });
        }

        Ok(num_listed)
    }

    /// Check that the free list neighbors of `block` link back to it.
    fn links_back(&self, block: Block) -> bool {
        let points_to_block = |offset: usize| self.checked_load(offset) == Ok(block.0);
        match (
            self.checked_load(block.0),
            self.checked_load(block.0 + WORD),
        ) {
            (Ok(next), Ok(prev)) => points_to_block(next.wrapping_add(WORD)) && points_to_block(prev),
            _ => false,
        }
    }

    #[inline]
    fn checked_load(&self, offset: usize) -> Result<usize, Corruption> {
        if offset % WORD != 0 || offset.checked_add(WORD).map_or(true, |end| end > self.len) {
            return Err(Corruption::OutOfBounds { offset });
        }
        Ok(self.load(offset))
    }

    #[inline]
    fn checked_tag(&self, offset: usize) -> Result<Tag, Corruption> {
        self.checked_load(offset).map(Tag::from_bits)
    }
}
