//! # Fusion Core
//!
//! Foundation of the Fusion shared-memory object system:
//! - Named SHM pools with out-of-band allocator metadata
//! - Generation-checked slot tables and handles
//! - Backends providing pool memory (mapped files or heap)
//! - Process-wide configuration and ordered initialization
//!
//! The membership, call, reference, reactor and object layers live in
//! `fusion_ipc` and are built on these pieces.
//!
//! ## Example
//!
//! ```rust
//! use fusion_core::{FusionId, HeapStorage, PoolId, PoolOptions, ShmPool};
//!
//! let storage = HeapStorage::new(4096).unwrap();
//! let pool = ShmPool::new(PoolId(1), "surfaces", FusionId::MASTER, Box::new(storage), PoolOptions::default()).unwrap();
//!
//! let block = pool.allocate(256, true).unwrap();
//! pool.write(block, 0, b"pixels").unwrap();
//! pool.deallocate(block).unwrap();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod backend;
pub mod config;
pub mod error;
pub mod id;
pub mod init;
pub mod memory;
pub mod slots;
pub mod sync;

pub use backend::{Backend, BackendKind, FakeBackend, SharedBackend};
pub use config::{FusionConfig, TraceRef, CONFIG_USAGE};
pub use error::{FusionError, FusionResult};
pub use id::{FusionId, Handle, PoolId};
pub use init::InitSequence;
pub use memory::{
    ArenaAllocator, ArenaBlock, HeapStorage, LeakReport, MappedStorage, PoolGuard, PoolOptions, PoolStats, PoolStorage,
    ShmBlock, ShmPool,
};
pub use slots::SlotTable;
pub use sync::{deadline_after, WaitWord, MAX_WAIT};
