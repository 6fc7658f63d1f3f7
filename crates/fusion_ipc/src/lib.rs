//! # Fusion IPC
//!
//! Worlds of cooperating fusionees sharing memory, objects and calls:
//! - Membership: one master, any number of slaves, liveness sweeps
//! - Calls: synchronous, one-way and batched remote procedure calls
//! - References counted across fusionees
//! - Reactors: non-blocking notification channels
//! - Object pools: typed, reference-counted objects stored in SHM pools
//! - Skirmishes: recursive locks shared across fusionees
//! - Arenas: named meeting points with shared fields
//!
//! ## Example
//!
//! ```rust
//! use fusion_core::FusionConfig;
//! use fusion_ipc::{CallOutcome, ExecFlags, Registry};
//!
//! let registry = Registry::fake(FusionConfig::default()).unwrap();
//! let master = registry.enter(0).unwrap();
//! let slave = registry.enter(0).unwrap();
//!
//! let call = master
//!     .call_register(|_: &fusion_ipc::CallContext, request: &[u8]| {
//!         CallOutcome::Return(request.iter().rev().copied().collect())
//!     }, 0)
//!     .unwrap();
//! let reply = slave.call_execute(call, ExecFlags::NONE, 0, b"abc", 16).unwrap();
//! assert_eq!(reply, b"cba");
//!
//! slave.leave().unwrap();
//! master.leave().unwrap();
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod arena;
pub mod call;
pub mod object;
pub mod protocol;
pub mod reactor;
pub mod reference;
pub mod skirmish;
pub mod world;

mod shm;

pub use arena::{Arena, ArenaResult};
pub use call::{CallContext, CallHandler, CallId, CallOutcome, ExecFlags, ReturnToken};
pub use object::{ObjectHandle, ObjectInfo, ObjectPool, ObjectPoolStats, ObjectState};
pub use protocol::{FusionMessage, MessageType, ReturnStatus};
pub use reactor::{
    DispatchReport, GlobalReaction, GlobalReactionId, Listener, Reaction, ReactorId, ReactorMessage,
};
pub use reference::FusionRef;
pub use skirmish::{Skirmish, SkirmishGuard};
pub use world::{Fusionee, MemberState, Registry};
