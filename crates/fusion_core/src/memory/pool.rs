//! # SHM Pool
//!
//! A named arena of shared memory with its own allocator, attach counts and
//! (for debug pools) allocation provenance.
//!
//! ## Locking
//!
//! [`ShmPool::allocate`] and friends take the pool lock for the duration of
//! the call. Code that needs several operations under one critical section
//! calls [`ShmPool::lock`] and works on the returned [`PoolGuard`], which
//! offers the same operations without locking again.

use std::collections::{HashMap, HashSet};
use std::panic::Location;
use std::path::PathBuf;

use parking_lot::{Mutex, MutexGuard};

use crate::error::{FusionError, FusionResult};
use crate::id::{FusionId, PoolId};
use crate::memory::arena::{ArenaAllocator, ArenaBlock};
use crate::memory::storage::PoolStorage;

/// Pointer to an allocation inside a pool.
///
/// Resolving a block always goes through its pool, which validates that the
/// block is still live.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShmBlock {
    pool: PoolId,
    block: ArenaBlock,
    size: usize,
}

impl ShmBlock {
    /// Pool the block belongs to.
    #[inline]
    #[must_use]
    pub const fn pool(&self) -> PoolId {
        self.pool
    }

    /// Offset inside the pool.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.block.offset
    }

    /// Requested size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }
}

/// Options fixed at pool creation.
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolOptions {
    /// Track allocation provenance.
    pub debug: bool,
    /// Discard freed bytes right away.
    pub discard_on_free: bool,
    /// Only the owner and granted processes may attach.
    pub secure: bool,
}

/// Where an allocation was made (debug pools only).
#[derive(Clone, Copy, Debug)]
struct Provenance {
    location: &'static Location<'static>,
    size: usize,
}

/// Outstanding allocation reported by [`ShmPool::leaks`].
#[derive(Clone, Copy, Debug)]
pub struct LeakReport {
    /// Offset inside the pool.
    pub offset: usize,
    /// Requested size.
    pub size: usize,
    /// Allocation site, known for debug pools.
    pub location: Option<&'static Location<'static>>,
}

/// Pool usage counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Maximum size in bytes.
    pub capacity: usize,
    /// Bytes allocated (aligned).
    pub used: usize,
    /// Live allocations.
    pub allocations: usize,
    /// Processes holding an attachment.
    pub attached_processes: usize,
}

struct PoolInner {
    storage: Box<dyn PoolStorage>,
    arena: ArenaAllocator,
    provenance: HashMap<usize, Provenance>,
    /// Set once by [`ShmPool::destroy`]; nothing is allocated afterwards.
    destroyed: bool,
}

/// A named shared memory arena.
pub struct ShmPool {
    id: PoolId,
    name: String,
    owner: FusionId,
    max_size: usize,
    options: PoolOptions,
    inner: Mutex<PoolInner>,
    /// Per-process mapping counts.
    attachments: Mutex<HashMap<FusionId, u32>>,
    /// Processes allowed to attach in secure mode.
    granted: Mutex<HashSet<FusionId>>,
}

impl std::fmt::Debug for ShmPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmPool")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl ShmPool {
    /// Creates a pool over `storage`. The owner starts attached.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] if the storage is empty.
    pub fn new(
        id: PoolId,
        name: impl Into<String>,
        owner: FusionId,
        storage: Box<dyn PoolStorage>,
        options: PoolOptions,
    ) -> FusionResult<Self> {
        let max_size = storage.as_slice().len();
        if max_size == 0 {
            return Err(FusionError::InvalidArgument("pool size must be positive".into()));
        }

        let mut attachments = HashMap::new();
        attachments.insert(owner, 1);

        Ok(Self {
            id,
            name: name.into(),
            owner,
            max_size,
            options,
            inner: Mutex::new(PoolInner {
                storage,
                arena: ArenaAllocator::new(max_size),
                provenance: HashMap::new(),
                destroyed: false,
            }),
            attachments: Mutex::new(attachments),
            granted: Mutex::new(HashSet::new()),
        })
    }

    /// Returns the pool id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> PoolId {
        self.id
    }

    /// Returns the pool name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the creating process.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> FusionId {
        self.owner
    }

    /// Returns the maximum size in bytes.
    #[inline]
    #[must_use]
    pub const fn max_size(&self) -> usize {
        self.max_size
    }

    /// Returns true if allocation provenance is tracked.
    #[inline]
    #[must_use]
    pub const fn is_debug(&self) -> bool {
        self.options.debug
    }

    /// Location of the backing file, for pools backed by one.
    #[must_use]
    pub fn path(&self) -> Option<PathBuf> {
        self.inner.lock().storage.path().map(std::path::Path::to_path_buf)
    }

    /// Takes the pool lock.
    pub fn lock(&self) -> PoolGuard<'_> {
        PoolGuard {
            pool: self,
            inner: self.inner.lock(),
        }
    }

    /// Allocates `size` bytes, zero-filled if `clear` is set.
    ///
    /// # Errors
    ///
    /// [`FusionError::OutOfMemory`] if the pool is exhausted,
    /// [`FusionError::InvalidState`] once the pool was destroyed.
    #[track_caller]
    pub fn allocate(&self, size: usize, clear: bool) -> FusionResult<ShmBlock> {
        self.lock().allocate(size, clear)
    }

    /// Resizes a block. The old block must not be used afterwards.
    ///
    /// # Errors
    ///
    /// [`FusionError::OutOfMemory`] if the block cannot grow (it stays valid),
    /// [`FusionError::InvalidState`] if the block is not live.
    #[track_caller]
    pub fn reallocate(&self, block: ShmBlock, new_size: usize) -> FusionResult<ShmBlock> {
        self.lock().reallocate(block, new_size)
    }

    /// Returns a block to the pool.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] on double free or stale blocks.
    pub fn deallocate(&self, block: ShmBlock) -> FusionResult<()> {
        self.lock().deallocate(block)
    }

    /// Copies the contents of a block.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn read(&self, block: ShmBlock) -> FusionResult<Vec<u8>> {
        let guard = self.lock();
        Ok(guard.bytes(block)?.to_vec())
    }

    /// Writes `data` at `offset` within a block.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] if the write exceeds the block,
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn write(&self, block: ShmBlock, offset: usize, data: &[u8]) -> FusionResult<()> {
        let mut guard = self.lock();
        let bytes = guard.bytes_mut(block)?;
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= bytes.len())
            .ok_or_else(|| {
                FusionError::InvalidArgument(format!(
                    "write of {} bytes at {offset} exceeds block of {}",
                    data.len(),
                    bytes.len()
                ))
            })?;
        bytes[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Runs `f` over the bytes of a block under the pool lock.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn with_bytes<R>(&self, block: ShmBlock, f: impl FnOnce(&[u8]) -> R) -> FusionResult<R> {
        let guard = self.lock();
        Ok(f(guard.bytes(block)?))
    }

    /// Runs `f` over the mutable bytes of a block under the pool lock.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn with_bytes_mut<R>(&self, block: ShmBlock, f: impl FnOnce(&mut [u8]) -> R) -> FusionResult<R> {
        let mut guard = self.lock();
        Ok(f(guard.bytes_mut(block)?))
    }

    /// Allows a process to attach in secure mode.
    pub fn grant(&self, process: FusionId) {
        self.granted.lock().insert(process);
    }

    /// Maps the pool for a process. Returns the new attach count.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] in secure mode for processes that were
    /// not granted access, [`FusionError::InvalidState`] once destroyed.
    pub fn attach(&self, process: FusionId) -> FusionResult<u32> {
        if self.options.secure && process != self.owner && !self.granted.lock().contains(&process) {
            return Err(FusionError::AccessDenied(format!(
                "{process} may not attach pool '{}'",
                self.name
            )));
        }
        // Pool lock first, then attachments: the order destroy() uses
        let inner = self.inner.lock();
        self.check_alive(&inner)?;
        let mut attachments = self.attachments.lock();
        let count = attachments.entry(process).or_insert(0);
        *count += 1;
        Ok(*count)
    }

    /// Drops one attachment. Returns the remaining count (0 = unmapped).
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the process has no attachment.
    pub fn detach(&self, process: FusionId) -> FusionResult<u32> {
        let mut attachments = self.attachments.lock();
        let Some(count) = attachments.get_mut(&process) else {
            return Err(FusionError::InvalidState(format!(
                "{process} has not attached pool '{}'",
                self.name
            )));
        };
        *count -= 1;
        let remaining = *count;
        if remaining == 0 {
            attachments.remove(&process);
        }
        Ok(remaining)
    }

    /// Drops every attachment of a departed process.
    pub fn detach_all(&self, process: FusionId) -> u32 {
        self.attachments.lock().remove(&process).unwrap_or(0)
    }

    /// Returns true if the process has the pool mapped.
    #[must_use]
    pub fn is_attached(&self, process: FusionId) -> bool {
        self.attachments.lock().contains_key(&process)
    }

    /// Processes other than the owner that still have the pool mapped.
    #[must_use]
    pub fn foreign_attachments(&self) -> Vec<FusionId> {
        let mut ids: Vec<_> = self
            .attachments
            .lock()
            .keys()
            .copied()
            .filter(|&id| id != self.owner)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Retires the pool. Every later allocation or attachment fails.
    ///
    /// Allocations and foreign attachments are checked under the pool lock,
    /// so neither can appear between the check and the retirement.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] while other processes are attached,
    /// allocations remain, or if the pool was destroyed already.
    pub fn destroy(&self) -> FusionResult<()> {
        let mut inner = self.inner.lock();
        self.check_alive(&inner)?;

        let foreign = self.foreign_attachments();
        if !foreign.is_empty() {
            return Err(FusionError::InvalidState(format!(
                "'{}' is still attached by {:?}",
                self.name, foreign
            )));
        }
        let allocations = inner.arena.allocation_count();
        if allocations > 0 {
            return Err(FusionError::InvalidState(format!(
                "'{}' still has {} allocations ({} bytes)",
                self.name,
                allocations,
                inner.arena.used()
            )));
        }

        inner.destroyed = true;
        Ok(())
    }

    /// Returns true once [`destroy`](Self::destroy) succeeded.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.inner.lock().destroyed
    }

    fn check_alive(&self, inner: &PoolInner) -> FusionResult<()> {
        if inner.destroyed {
            Err(FusionError::InvalidState(format!("pool '{}' was destroyed", self.name)))
        } else {
            Ok(())
        }
    }

    /// Returns usage counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let attached_processes = self.attachments.lock().len();
        PoolStats {
            capacity: self.max_size,
            used: inner.arena.used(),
            allocations: inner.arena.allocation_count(),
            attached_processes,
        }
    }

    /// Lists outstanding allocations, sorted by offset.
    #[must_use]
    pub fn leaks(&self) -> Vec<LeakReport> {
        let inner = self.inner.lock();
        let mut leaks: Vec<_> = inner
            .arena
            .live_blocks()
            .map(|block| match inner.provenance.get(&block.offset) {
                Some(p) => LeakReport {
                    offset: block.offset,
                    size: p.size,
                    location: Some(p.location),
                },
                None => LeakReport {
                    offset: block.offset,
                    size: block.len,
                    location: None,
                },
            })
            .collect();
        leaks.sort_by_key(|leak| leak.offset);
        leaks
    }

    /// Logs every outstanding allocation.
    pub fn print_leaks(&self) {
        for leak in self.leaks() {
            match leak.location {
                Some(location) => tracing::warn!(
                    "Pool '{}': {} bytes at offset {} leaked, allocated at {}",
                    self.name,
                    leak.size,
                    leak.offset,
                    location
                ),
                None => tracing::warn!("Pool '{}': {} bytes at offset {} leaked", self.name, leak.size, leak.offset),
            }
        }
    }
}

/// Exclusive access to a pool's allocator and bytes.
pub struct PoolGuard<'a> {
    pool: &'a ShmPool,
    inner: MutexGuard<'a, PoolInner>,
}

impl PoolGuard<'_> {
    /// Allocates `size` bytes without taking the lock again.
    ///
    /// # Errors
    ///
    /// [`FusionError::OutOfMemory`] if the pool is exhausted.
    #[track_caller]
    pub fn allocate(&mut self, size: usize, clear: bool) -> FusionResult<ShmBlock> {
        self.pool.check_alive(&self.inner)?;
        let block = self.inner.arena.allocate(size)?;
        if clear {
            self.inner.storage.as_mut_slice()[block.offset..block.offset + block.len].fill(0);
        }
        self.note(block, size);
        Ok(ShmBlock {
            pool: self.pool.id,
            block,
            size,
        })
    }

    /// Resizes a block without taking the lock again.
    ///
    /// # Errors
    ///
    /// See [`ShmPool::reallocate`].
    #[track_caller]
    pub fn reallocate(&mut self, block: ShmBlock, new_size: usize) -> FusionResult<ShmBlock> {
        self.own(block)?;
        self.pool.check_alive(&self.inner)?;

        if let Some(resized) = self.inner.arena.resize_in_place(block.block, new_size)? {
            self.inner.provenance.remove(&block.block.offset);
            self.note(resized, new_size);
            return Ok(ShmBlock {
                pool: self.pool.id,
                block: resized,
                size: new_size,
            });
        }

        let moved = self.inner.arena.allocate(new_size)?;
        let keep = block.size.min(new_size);
        self.inner
            .storage
            .as_mut_slice()
            .copy_within(block.block.offset..block.block.offset + keep, moved.offset);
        self.inner.arena.free(block.block)?;
        self.inner.provenance.remove(&block.block.offset);
        self.note(moved, new_size);
        Ok(ShmBlock {
            pool: self.pool.id,
            block: moved,
            size: new_size,
        })
    }

    /// Returns a block to the pool without taking the lock again.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] on double free or stale blocks.
    pub fn deallocate(&mut self, block: ShmBlock) -> FusionResult<()> {
        self.own(block)?;
        self.inner.arena.free(block.block)?;
        self.inner.provenance.remove(&block.block.offset);
        if self.pool.options.discard_on_free {
            self.inner.storage.discard(block.block.offset, block.block.len);
        }
        Ok(())
    }

    /// Bytes of a live block.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn bytes(&self, block: ShmBlock) -> FusionResult<&[u8]> {
        self.own(block)?;
        self.inner.arena.check(block.block)?;
        Ok(&self.inner.storage.as_slice()[block.block.offset..block.block.offset + block.size])
    }

    /// Mutable bytes of a live block.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the block is not live.
    pub fn bytes_mut(&mut self, block: ShmBlock) -> FusionResult<&mut [u8]> {
        self.own(block)?;
        self.inner.arena.check(block.block)?;
        Ok(&mut self.inner.storage.as_mut_slice()[block.block.offset..block.block.offset + block.size])
    }

    fn own(&self, block: ShmBlock) -> FusionResult<()> {
        if block.pool == self.pool.id {
            Ok(())
        } else {
            Err(FusionError::InvalidArgument(format!(
                "block of {} passed to {}",
                block.pool, self.pool.id
            )))
        }
    }

    #[track_caller]
    fn note(&mut self, block: ArenaBlock, size: usize) {
        if self.pool.options.debug {
            self.inner.provenance.insert(
                block.offset,
                Provenance {
                    location: Location::caller(),
                    size,
                },
            );
        }
    }
}
