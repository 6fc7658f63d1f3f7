//! # Memory Management
//!
//! Shared memory pools: named arenas over mapped files or heap blocks.
//!
//! ## Layering
//!
//! - [`ArenaAllocator`] hands out offsets and tracks live blocks out of band
//! - [`PoolStorage`] provides the bytes (mapped file or heap)
//! - [`ShmPool`] combines both with attach counts and debug provenance

mod arena;
mod pool;
mod storage;

pub use arena::{align_up, ArenaAllocator, ArenaBlock, ARENA_ALIGN};
pub use pool::{LeakReport, PoolGuard, PoolOptions, PoolStats, ShmBlock, ShmPool};
pub use storage::{HeapStorage, MappedStorage, PoolStorage};
