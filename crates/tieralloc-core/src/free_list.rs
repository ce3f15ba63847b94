//! Size-class segregated free lists.
//!
//! One intrusive singly linked LIFO list per size class. While a block sits
//! on a list its first word holds the link to the next free block of the same
//! class; once popped, the block belongs entirely to the caller and the bank
//! never touches it again.

#![allow(unsafe_code)]

use std::ptr::{self, NonNull};

use crate::size_class::NUM_SIZE_CLASSES;

/// Overlay of a free block's first word.
#[repr(C)]
struct FreeBlock {
    next: *mut FreeBlock,
}

/// Heads of the 16 class lists.
pub(crate) struct FreeListBank {
    heads: [*mut FreeBlock; NUM_SIZE_CLASSES],
}

// SAFETY: the bank only stores addresses of blocks it exclusively owns while
// they are free; it is always reached through the allocator's mutex.
unsafe impl Send for FreeListBank {}

impl FreeListBank {
    pub(crate) const fn new() -> Self {
        Self {
            heads: [ptr::null_mut(); NUM_SIZE_CLASSES],
        }
    }

    pub(crate) fn is_empty(&self, class: usize) -> bool {
        self.heads[class].is_null()
    }

    /// Links `block` in as the new head of `class`.
    ///
    /// # Safety
    ///
    /// `block` must be 8-byte aligned, writable for at least one pointer, and
    /// unused by anyone else until popped again.
    pub(crate) unsafe fn push(&mut self, class: usize, block: NonNull<u8>) {
        let node = block.as_ptr().cast::<FreeBlock>();
        // SAFETY: caller guarantees exclusive, aligned, writable storage.
        unsafe {
            node.write(FreeBlock {
                next: self.heads[class],
            });
        }
        self.heads[class] = node;
    }

    /// Detaches the head of `class`.
    pub(crate) fn pop(&mut self, class: usize) -> Option<NonNull<u8>> {
        let head = NonNull::new(self.heads[class])?;
        // SAFETY: every linked node was written by `push`/`thread` and is still free.
        self.heads[class] = unsafe { (*head.as_ptr()).next };
        Some(head.cast())
    }

    /// Detaches one block from the first non-empty class at or above `from_class`.
    pub(crate) fn take_from_classes(&mut self, from_class: usize) -> Option<(NonNull<u8>, usize)> {
        let class = (from_class..NUM_SIZE_CLASSES).find(|&class| !self.is_empty(class))?;
        self.pop(class).map(|block| (block, class))
    }

    /// Links `count` contiguous blocks of `block_size` bytes starting at
    /// `first` onto `class`, in address order. The last block links to the
    /// previous head, which is empty whenever a refill threads a batch.
    ///
    /// # Safety
    ///
    /// `[first, first + count * block_size)` must be exclusively owned,
    /// writable, and `first` and `block_size` must keep every block 8-byte aligned.
    pub(crate) unsafe fn thread(
        &mut self,
        class: usize,
        first: NonNull<u8>,
        block_size: usize,
        count: usize,
    ) {
        if count == 0 {
            return;
        }
        let base = first.as_ptr();
        for i in 0..count {
            // SAFETY: every offset stays inside the caller-provided range.
            unsafe {
                let node = base.add(i * block_size).cast::<FreeBlock>();
                let next = if i + 1 == count {
                    self.heads[class]
                } else {
                    base.add((i + 1) * block_size).cast::<FreeBlock>()
                };
                node.write(FreeBlock { next });
            }
        }
        self.heads[class] = base.cast::<FreeBlock>();
    }

    /// Number of blocks on `class` (walks the list).
    pub(crate) fn len(&self, class: usize) -> usize {
        self.iter(class).count()
    }

    /// Returns true if `block` is currently linked on `class` (walks the list).
    pub(crate) fn contains(&self, class: usize, block: NonNull<u8>) -> bool {
        let target = block.as_ptr().cast::<FreeBlock>();
        self.iter(class).any(|node| node == target)
    }

    fn iter(&self, class: usize) -> impl Iterator<Item = *mut FreeBlock> + '_ {
        let mut cursor = self.heads[class];
        std::iter::from_fn(move || {
            let node = NonNull::new(cursor)?;
            // SAFETY: linked nodes are free blocks written by `push`/`thread`.
            cursor = unsafe { (*node.as_ptr()).next };
            Some(node.as_ptr())
        })
    }
}
