//! Compile-time heap configuration

/// Compile-time parameters of a [`Heap`].
///
/// [`Heap`]: crate::Heap
pub trait HeapOptions {
    /// The minimum number of bytes requested from the [`ArenaSource`] each
    /// time the arena grows. Larger values mean fewer, larger extensions.
    ///
    /// The arena grows by exactly the missing block size if this is smaller
    /// than that.
    ///
    /// [`ArenaSource`]: crate::ArenaSource
    const CHUNK_SIZE: usize = 1 << 12;
}

/// The default [`HeapOptions`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DefaultOptions;

impl HeapOptions for DefaultOptions {}
