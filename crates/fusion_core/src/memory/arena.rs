//! # Arena Allocator
//!
//! First-fit free-list allocator over a fixed range of offsets.
//!
//! The arena never touches the memory it manages: block metadata lives out of
//! band, so every byte of the pool is allocatable and a corrupted payload can
//! never corrupt the allocator.

use std::collections::{BTreeMap, HashMap};

use crate::error::{FusionError, FusionResult};

/// Allocation granularity in bytes.
pub const ARENA_ALIGN: usize = 8;

/// Rounds a size up to the arena granularity.
#[inline]
#[must_use]
pub const fn align_up(size: usize) -> usize {
    (size + ARENA_ALIGN - 1) & !(ARENA_ALIGN - 1)
}

/// A live allocation as seen by the arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArenaBlock {
    /// Start offset.
    pub offset: usize,
    /// Aligned length.
    pub len: usize,
    /// Serial distinguishing this allocation from earlier ones at the same offset.
    pub serial: u32,
}

/// Offset allocator with coalescing free list.
///
/// # Thread Safety
///
/// This arena is NOT thread-safe. The owning pool serializes access.
#[derive(Debug)]
pub struct ArenaAllocator {
    /// Total capacity in bytes.
    capacity: usize,
    /// Free ranges, offset -> length. Never adjacent (always coalesced).
    free: BTreeMap<usize, usize>,
    /// Live allocations, offset -> (length, serial).
    live: HashMap<usize, (usize, u32)>,
    /// Bytes handed out.
    used: usize,
    /// Next allocation serial.
    next_serial: u32,
}

impl ArenaAllocator {
    /// Creates an arena managing `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(0, capacity);
        }
        Self {
            capacity,
            free,
            live: HashMap::new(),
            used: 0,
            next_serial: 1,
        }
    }

    /// Returns the total capacity in bytes.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the bytes currently allocated.
    #[inline]
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Returns the free bytes (possibly fragmented).
    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.capacity - self.used
    }

    /// Returns the number of live allocations.
    #[inline]
    #[must_use]
    pub fn allocation_count(&self) -> usize {
        self.live.len()
    }

    /// Allocates `size` bytes.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] for zero sizes,
    /// [`FusionError::OutOfMemory`] if no free range is large enough.
    pub fn allocate(&mut self, size: usize) -> FusionResult<ArenaBlock> {
        if size == 0 {
            return Err(FusionError::InvalidArgument("zero sized allocation".into()));
        }
        let len = align_up(size);

        let found = self
            .free
            .iter()
            .find(|(_, &free_len)| free_len >= len)
            .map(|(&offset, &free_len)| (offset, free_len));

        let Some((offset, free_len)) = found else {
            return Err(FusionError::OutOfMemory {
                requested: len,
                available: self.available(),
            });
        };

        self.free.remove(&offset);
        if free_len > len {
            self.free.insert(offset + len, free_len - len);
        }

        Ok(self.record(offset, len))
    }

    /// Frees a block previously returned by this arena.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live (double free or
    /// stale pointer). The arena is left untouched in that case.
    pub fn free(&mut self, block: ArenaBlock) -> FusionResult<()> {
        self.check(block)?;
        self.live.remove(&block.offset);
        self.used -= block.len;
        self.release_range(block.offset, block.len);
        Ok(())
    }

    /// Tries to resize a block without moving it.
    ///
    /// Returns the resized block, or `None` if the following free range is
    /// too small (the caller then relocates).
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn resize_in_place(&mut self, block: ArenaBlock, new_size: usize) -> FusionResult<Option<ArenaBlock>> {
        self.check(block)?;
        if new_size == 0 {
            return Err(FusionError::InvalidArgument("zero sized reallocation".into()));
        }
        let new_len = align_up(new_size);

        if new_len <= block.len {
            self.live.remove(&block.offset);
            self.used -= block.len;
            if new_len < block.len {
                self.release_range(block.offset + new_len, block.len - new_len);
            }
            return Ok(Some(self.record(block.offset, new_len)));
        }

        let end = block.offset + block.len;
        let grow = new_len - block.len;
        match self.free.get(&end).copied() {
            Some(next_len) if next_len >= grow => {
                self.free.remove(&end);
                if next_len > grow {
                    self.free.insert(end + grow, next_len - grow);
                }
                self.live.remove(&block.offset);
                self.used -= block.len;
                Ok(Some(self.record(block.offset, new_len)))
            }
            _ => Ok(None),
        }
    }

    /// Verifies that a block is live.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] on double free or stale pointers.
    pub fn check(&self, block: ArenaBlock) -> FusionResult<()> {
        match self.live.get(&block.offset) {
            Some(&(len, serial)) if serial == block.serial && len == block.len => Ok(()),
            Some(_) => Err(FusionError::InvalidState(format!(
                "stale block at offset {} (serial {})",
                block.offset, block.serial
            ))),
            None => Err(FusionError::InvalidState(format!(
                "block at offset {} is not allocated (double free?)",
                block.offset
            ))),
        }
    }

    /// Iterates over live blocks.
    pub fn live_blocks(&self) -> impl Iterator<Item = ArenaBlock> + '_ {
        self.live
            .iter()
            .map(|(&offset, &(len, serial))| ArenaBlock { offset, len, serial })
    }

    fn record(&mut self, offset: usize, len: usize) -> ArenaBlock {
        let serial = self.next_serial;
        self.next_serial = self.next_serial.wrapping_add(1).max(1);
        self.live.insert(offset, (len, serial));
        self.used += len;
        ArenaBlock { offset, len, serial }
    }

    /// Returns a range to the free list, merging with its neighbours.
    fn release_range(&mut self, mut offset: usize, mut len: usize) {
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(next_len) = self.free.remove(&(offset + len)) {
            len += next_len;
        }
        self.free.insert(offset, len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_arena_allocation() {
        let mut arena = ArenaAllocator::new(1024);
        let block = arena.allocate(10).unwrap();
        assert_eq!(block.len, 16);
        assert_eq!(arena.used(), 16);
    }

    #[test]
    fn test_exhaustion_is_safe() {
        let mut arena = ArenaAllocator::new(64);
        let blocks: Vec<_> = (0..8).map(|_| arena.allocate(8).unwrap()).collect();
        assert_eq!(arena.available(), 0);

        let err = arena.allocate(8).unwrap_err();
        assert_eq!(err, FusionError::OutOfMemory { requested: 8, available: 0 });

        for block in blocks {
            arena.free(block).unwrap();
        }
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.allocate(64).unwrap().offset, 0); // fully coalesced
    }

    #[test]
    fn test_double_free_detected() {
        let mut arena = ArenaAllocator::new(256);
        let block = arena.allocate(32).unwrap();
        arena.free(block).unwrap();
        assert!(matches!(arena.free(block), Err(FusionError::InvalidState(_))));
        assert_eq!(arena.used(), 0);
    }

    #[test]
    fn test_stale_block_after_reuse() {
        let mut arena = ArenaAllocator::new(256);
        let old = arena.allocate(32).unwrap();
        arena.free(old).unwrap();
        let new = arena.allocate(32).unwrap();
        assert_eq!(old.offset, new.offset);
        assert!(arena.free(old).is_err());
        assert!(arena.free(new).is_ok());
    }

    #[test]
    fn test_resize_in_place() {
        let mut arena = ArenaAllocator::new(256);
        let block = arena.allocate(32).unwrap();

        let grown = arena.resize_in_place(block, 64).unwrap().unwrap();
        assert_eq!(grown.offset, block.offset);
        assert_eq!(grown.len, 64);
        assert!(arena.check(block).is_err());

        let shrunk = arena.resize_in_place(grown, 8).unwrap().unwrap();
        assert_eq!(shrunk.len, 8);
        assert_eq!(arena.used(), 8);
    }

    #[test]
    fn test_resize_blocked_by_neighbour() {
        let mut arena = ArenaAllocator::new(256);
        let first = arena.allocate(32).unwrap();
        let _second = arena.allocate(32).unwrap();
        assert_eq!(arena.resize_in_place(first, 64).unwrap(), None);
        assert!(arena.check(first).is_ok());
    }
}
