//! # Call Engine
//!
//! Remote procedure calls between fusionees.
//!
//! ## Paths
//!
//! ```text
//!   direct:  caller thread ──> handler ──> reply
//!   queued:  caller ──CALL──> [owner mailbox] ──> owner dispatcher ──> handler
//!                 <──CALLRET── written into the caller's reply slot
//! ```
//!
//! A call runs directly when the backend routes every call directly, or when
//! the caller owns the call and did not ask for [`ExecFlags::QUEUE`].
//! Everything else goes through the owner's mailbox and is handled in send
//! order by the owner's single dispatcher.
//!
//! Replies never pass through the caller's own mailbox, so a handler may
//! itself make synchronous calls to third fusionees while its caller waits.

mod bin;
mod engine;
mod pending;
mod registry;

use std::fmt;
use std::ops::BitOr;

use fusion_core::{FusionId, Handle};

pub(crate) use bin::CallBin;
pub(crate) use engine::{deliver_reply, execute, serve, Invocation};
pub(crate) use pending::PendingReplies;
pub(crate) use registry::CallRegistry;

/// Handle of a registered call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CallId(Handle);

impl CallId {
    /// Wraps a slot handle.
    #[inline]
    #[must_use]
    pub const fn from_handle(handle: Handle) -> Self {
        Self(handle)
    }

    /// Returns the slot handle.
    #[inline]
    #[must_use]
    pub const fn handle(self) -> Handle {
        self.0
    }

    /// Packs the id for the wire.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    /// Unpacks a wire value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(Handle::from_raw(raw))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "call {}", self.0)
    }
}

/// Execution flags of a call.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ExecFlags(u32);

impl ExecFlags {
    /// Wait for the reply, direct when possible.
    pub const NONE: Self = Self(0);
    /// Do not wait for a reply.
    pub const ONEWAY: Self = Self(1 << 0);
    /// Always go through the owner's mailbox.
    pub const QUEUE: Self = Self(1 << 1);

    /// Returns the raw bits.
    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Builds flags from raw bits, dropping unknown ones.
    #[inline]
    #[must_use]
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & (Self::ONEWAY.0 | Self::QUEUE.0))
    }

    /// Returns true if every flag of `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ExecFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// What a handler did with a call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CallOutcome {
    /// Reply now.
    Return(Vec<u8>),
    /// Reply later through [`Fusionee::call_return`](crate::Fusionee::call_return).
    Retain,
    /// Report a failure code to the caller.
    Fail(i32),
}

/// Identifies a retained call so it can be answered later.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReturnToken {
    /// Waiting fusionee.
    pub caller: FusionId,
    /// Serial the caller waits for.
    pub serial: u32,
    /// Reply capacity offered by the caller.
    pub max_reply: usize,
}

/// Everything a handler learns about an invocation.
#[derive(Clone, Copy, Debug)]
pub struct CallContext {
    /// Invoked call.
    pub call: CallId,
    /// Calling fusionee.
    pub caller: FusionId,
    /// Integer argument.
    pub call_arg: i32,
    /// Caller's serial for this invocation.
    pub serial: u32,
    /// Context value registered with the call.
    pub ctx: u64,
    /// Reply capacity offered by the caller.
    pub max_reply: usize,
    /// Flags the call was executed with.
    pub flags: ExecFlags,
}

impl CallContext {
    /// Returns true if the caller does not wait for a reply.
    #[inline]
    #[must_use]
    pub const fn is_oneway(&self) -> bool {
        self.flags.contains(ExecFlags::ONEWAY)
    }

    /// Token for answering a retained call.
    #[inline]
    #[must_use]
    pub const fn token(&self) -> ReturnToken {
        ReturnToken {
            caller: self.caller,
            serial: self.serial,
            max_reply: self.max_reply,
        }
    }
}

/// Code run on the owner's behalf when a call is executed.
pub trait CallHandler: Send + Sync {
    /// Handles one invocation.
    fn handle(&self, ctx: &CallContext, request: &[u8]) -> CallOutcome;
}

impl<F> CallHandler for F
where
    F: Fn(&CallContext, &[u8]) -> CallOutcome + Send + Sync,
{
    fn handle(&self, ctx: &CallContext, request: &[u8]) -> CallOutcome {
        self(ctx, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_flags() {
        let flags = ExecFlags::ONEWAY | ExecFlags::QUEUE;
        assert!(flags.contains(ExecFlags::ONEWAY));
        assert!(flags.contains(ExecFlags::QUEUE));
        assert!(!ExecFlags::NONE.contains(ExecFlags::QUEUE));
        assert_eq!(ExecFlags::from_bits_truncate(0x83), flags);
    }

    #[test]
    fn test_call_id_raw() {
        let id = CallId::from_handle(Handle::new(3, 9));
        assert_eq!(CallId::from_raw(id.to_raw()), id);
    }
}
