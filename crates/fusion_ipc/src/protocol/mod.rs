//! # Wire Protocol
//!
//! Frames exchanged through fusionee mailboxes and listener queues.
//!
//! ## Frame Structure
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Type (4) │ type-specific fixed fields                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Payload (variable, length stored in the header)              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Headers are native endian: every fusionee of a world runs on the same
//! machine.

mod frames;
mod message;

pub use frames::{
    peek_type, CallFrame, CallReturnFrame, EnterFrame, LeaveFrame, MessageType, ReactorFrame, ReturnStatus,
    SendFrame,
};
pub use message::{check_payload, FusionMessage, MAX_PAYLOAD};
