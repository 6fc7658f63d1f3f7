//! # Fusion Error Types
//!
//! All errors that can occur in pools, membership, calls and objects.

use thiserror::Error;

/// Errors that can occur in the Fusion core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FusionError {
    /// A pool or backing store cannot satisfy the request.
    #[error("out of shared memory: requested {requested} bytes, {available} available")]
    OutOfMemory {
        /// Bytes requested (after alignment).
        requested: usize,
        /// Bytes still free in the pool.
        available: usize,
    },

    /// The target process, object, call or pool departed or never existed.
    #[error("no such instance: {0}")]
    NoSuchInstance(String),

    /// A call did not receive its reply before the deadline.
    #[error("operation timed out")]
    Timeout,

    /// A reply does not fit into the capacity offered by the caller.
    #[error("buffer too small: reply needs {needed} bytes, capacity is {capacity}")]
    BufferTooSmall {
        /// Size of the actual reply.
        needed: usize,
        /// Capacity offered by the caller.
        capacity: usize,
    },

    /// Stale handle, destroyed object, double free or membership violation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The backend lacks a primitive needed for the operation.
    #[error("unimplemented: {0}")]
    Unimplemented(&'static str),

    /// A lock is held by someone else, or others still use a resource.
    #[error("busy: {0}")]
    Busy(String),

    /// An argument is out of range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Secure mode refused the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The remote handler reported a failure through its reply.
    #[error("call handler failed with code {code}")]
    HandlerFailed {
        /// Code returned by the handler.
        code: i32,
    },

    /// Backing file or mapping failed.
    #[error("io error: {0}")]
    Io(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for FusionError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// Result type for Fusion operations.
pub type FusionResult<T> = Result<T, FusionError>;
