//! Boundary tags
use core::{fmt, mem};

/// The size of a boundary tag and of a free list link.
pub(crate) const WORD: usize = mem::size_of::<usize>();

/// The allocation granularity.
///
/// It is `size_of::<usize>() * 2` bytes. Every block size is a multiple of
/// this, and every payload address is aligned to it.
pub const GRANULARITY: usize = WORD * 2;

/// The minimum size of a block, including both boundary tags.
///
/// It is `size_of::<usize>() * 4` bytes, just enough to hold a header, a
/// footer, and the two free list links of a free block.
pub const MIN_BLOCK_SIZE: usize = WORD * 4;

/// The bit of a [`Tag`] indicating whether the block is allocated or not.
const USED: usize = 1;

/// A block header or footer.
///
///  - `bit[0]` ([`USED`]) indicates whether the block is allocated.
///
///  - `bit[1..]` holds the block size in words. Block sizes are multiples of
///    [`GRANULARITY`], so the word count is always even and never collides
///    with `bit[0]`.
///
/// A zero-size, allocated tag marks a boundary (the epilogue at the arena's
/// end).
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub(crate) struct Tag(usize);

/// A decoded [`Tag`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TagKind {
    /// The end of the block chain.
    Boundary,
    /// A live block spanning `size` bytes.
    Block { size: usize, used: bool },
}

impl Tag {
    pub const BOUNDARY: Self = Self(USED);

    #[inline]
    pub fn new(size: usize, used: bool) -> Self {
        debug_assert!(size >= MIN_BLOCK_SIZE, "block size {} is too small", size);
        debug_assert_eq!(size % GRANULARITY, 0);
        Self(size / WORD | used as usize)
    }

    #[inline]
    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn to_bits(self) -> usize {
        self.0
    }

    /// The block size in bytes. Saturates for a garbage tag so that the
    /// consistency checker can reject it instead of overflowing.
    #[inline]
    pub fn size(self) -> usize {
        (self.0 & !USED).saturating_mul(WORD)
    }

    #[inline]
    pub fn is_used(self) -> bool {
        (self.0 & USED) != 0
    }

    /// Flip the allocated bit. The size is unchanged.
    #[inline]
    pub fn toggled(self) -> Self {
        Self(self.0 ^ USED)
    }

    #[inline]
    pub fn kind(self) -> TagKind {
        if self == Self::BOUNDARY {
            TagKind::Boundary
        } else {
            TagKind::Block {
                size: self.size(),
                used: self.is_used(),
            }
        }
    }
}

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind() {
            TagKind::Boundary => f.write_str("Boundary"),
            TagKind::Block { size, used } => write!(
                f,
                "{}({})",
                if used { "Used" } else { "Free" },
                size
            ),
        }
    }
}
