//! The free list: a circular doubly-linked list threaded through the payloads
//! of free blocks and anchored at [`SENTINEL`].
use super::{Block, Heap, SENTINEL};
use crate::tag::WORD;

impl<Source, Options> Heap<Source, Options> {
    #[inline]
    pub(super) fn next_free(&self, block: Block) -> Block {
        Block(self.load(block.0))
    }

    #[inline]
    pub(super) fn prev_free(&self, block: Block) -> Block {
        Block(self.load(block.0 + WORD))
    }

    #[inline]
    pub(super) fn set_next_free(&mut self, block: Block, next: Block) {
        self.store(block.0, next.0);
    }

    #[inline]
    pub(super) fn set_prev_free(&mut self, block: Block, prev: Block) {
        self.store(block.0 + WORD, prev.0);
    }

    /// Insert a free block at the head of the free list.
    ///
    /// `block` must not be in the free list already.
    #[inline]
    pub(super) fn link(&mut self, block: Block) {
        debug_assert_ne!(block, SENTINEL);
        let next = self.next_free(SENTINEL);
        self.set_next_free(block, next);
        self.set_prev_free(block, SENTINEL);
        self.set_prev_free(next, block);
        self.set_next_free(SENTINEL, block);
    }

    /// Remove a free block from the free list.
    ///
    /// `block` must be currently included in the free list.
    #[inline]
    pub(super) fn unlink(&mut self, block: Block) {
        debug_assert_ne!(block, SENTINEL);
        let next = self.next_free(block);
        let prev = self.prev_free(block);
        self.set_next_free(prev, next);
        self.set_prev_free(next, prev);
    }

    /// Iterate over the free blocks in list order. The iterator borrows
    /// `self`, so the list can't change under it.
    #[inline]
    pub(super) fn free_list(&self) -> FreeList<'_, Source, Options> {
        FreeList {
            heap: self,
            cursor: if self.is_initialized() {
                Some(SENTINEL)
            } else {
                None
            },
        }
    }
}

/// An iterator over the free blocks of a [`Heap`].
pub(super) struct FreeList<'a, Source, Options> {
    heap: &'a Heap<Source, Options>,
    cursor: Option<Block>,
}

impl<Source, Options> Iterator for FreeList<'_, Source, Options> {
    type Item = Block;

    #[inline]
    fn next(&mut self) -> Option<Block> {
        let next = self.heap.next_free(self.cursor?);
        if next == SENTINEL {
            self.cursor = None;
            None
        } else {
            self.cursor = Some(next);
            Some(next)
        }
    }
}
