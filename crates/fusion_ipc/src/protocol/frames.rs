//! # Frame Definitions
//!
//! Fixed headers of every frame exchanged between fusionees.
//!
//! All headers are `Copy`, `#[repr(C)]` and padding free, so they can be
//! read straight out of a byte buffer. The variable part (payload, request,
//! reply, message) follows the header; its length is stored in the header.

use bytemuck::{Pod, Zeroable};

use fusion_core::{FusionError, FusionResult};

/// Leading discriminant of every frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    /// User payload between fusionees.
    Send = 0,
    /// Join intent (slave to master) or answer (master to slave).
    Enter = 1,
    /// Leave notice (slave to master) or acknowledgement.
    Leave = 2,
    /// Call request.
    Call = 3,
    /// Call reply.
    CallRet = 4,
    /// Reactor message.
    Reactor = 5,
}

impl TryFrom<u32> for MessageType {
    type Error = FusionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Send),
            1 => Ok(Self::Enter),
            2 => Ok(Self::Leave),
            3 => Ok(Self::Call),
            4 => Ok(Self::CallRet),
            5 => Ok(Self::Reactor),
            other => Err(FusionError::InvalidArgument(format!("unknown frame type {other}"))),
        }
    }
}

/// Outcome carried by a CALLRET frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ReturnStatus {
    /// Reply follows.
    Ok = 0,
    /// Call or owner is gone.
    NoSuchInstance = 1,
    /// Reply did not fit, `detail` holds the needed size.
    BufferTooSmall = 2,
    /// Handler failed, `detail` holds its code.
    HandlerFailed = 3,
}

impl TryFrom<u32> for ReturnStatus {
    type Error = FusionError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ok),
            1 => Ok(Self::NoSuchInstance),
            2 => Ok(Self::BufferTooSmall),
            3 => Ok(Self::HandlerFailed),
            other => Err(FusionError::InvalidArgument(format!("unknown return status {other}"))),
        }
    }
}

/// ENTER frame.
///
/// Size: 24 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct EnterFrame {
    /// [`MessageType::Enter`].
    pub kind: u32,
    /// Padding for alignment.
    pub _padding: u32,
    /// Assigned id, 0 in the join intent.
    pub fusion_id: u64,
    /// Join ticket matching intent and answer.
    pub ticket: u64,
}

impl EnterFrame {
    /// Size in bytes.
    pub const SIZE: usize = 24;
}

/// LEAVE frame.
///
/// Size: 16 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct LeaveFrame {
    /// [`MessageType::Leave`].
    pub kind: u32,
    /// Padding for alignment.
    pub _padding: u32,
    /// Departing fusionee.
    pub fusion_id: u64,
}

impl LeaveFrame {
    /// Size in bytes.
    pub const SIZE: usize = 16;
}

/// SEND frame header, payload follows.
///
/// Size: 16 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct SendFrame {
    /// [`MessageType::Send`].
    pub kind: u32,
    /// Payload length.
    pub length: u32,
    /// Sending fusionee.
    pub sender: u64,
}

impl SendFrame {
    /// Size in bytes.
    pub const SIZE: usize = 16;
}

/// CALL frame header, request follows.
///
/// Size: 56 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CallFrame {
    /// [`MessageType::Call`].
    pub kind: u32,
    /// Per-caller serial, matched by the reply.
    pub serial: u32,
    /// Calling fusionee.
    pub caller: u64,
    /// Raw call handle.
    pub call_id: u64,
    /// Integer argument.
    pub call_arg: i32,
    /// Request length.
    pub call_length: u32,
    /// Reply capacity offered by the caller.
    pub ret_length: u32,
    /// Execution flags.
    pub flags: u32,
    /// Fusionee that owns the handler.
    pub handler: u64,
    /// Opaque context registered with the call.
    pub ctx: u64,
}

impl CallFrame {
    /// Size in bytes.
    pub const SIZE: usize = 56;
}

/// CALLRET frame header, reply follows.
///
/// Size: 24 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct CallReturnFrame {
    /// [`MessageType::CallRet`].
    pub kind: u32,
    /// Serial of the answered CALL.
    pub serial: u32,
    /// Reply length.
    pub length: u32,
    /// [`ReturnStatus`] value.
    pub status: u32,
    /// Needed size or handler code, depending on the status.
    pub detail: i32,
    /// Padding for alignment.
    pub _padding: u32,
}

impl CallReturnFrame {
    /// Size in bytes.
    pub const SIZE: usize = 24;
}

/// REACTOR frame header, message follows.
///
/// Size: 32 bytes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ReactorFrame {
    /// [`MessageType::Reactor`].
    pub kind: u32,
    /// Channel within the reactor.
    pub channel: u32,
    /// Raw reactor handle.
    pub reactor_id: u64,
    /// Entity the message is about (object id, or 0).
    pub reference: u64,
    /// Message length.
    pub length: u32,
    /// Padding for alignment.
    pub _padding: u32,
}

impl ReactorFrame {
    /// Size in bytes.
    pub const SIZE: usize = 32;
}

/// Reads the discriminant of a frame.
///
/// # Errors
///
/// [`FusionError::InvalidArgument`] for short buffers or unknown types.
pub fn peek_type(bytes: &[u8]) -> FusionResult<MessageType> {
    let raw = bytes
        .get(..4)
        .and_then(|b| bytemuck::try_pod_read_unaligned::<u32>(b).ok())
        .ok_or_else(|| FusionError::InvalidArgument(format!("frame of {} bytes has no type", bytes.len())))?;
    MessageType::try_from(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(std::mem::size_of::<EnterFrame>(), EnterFrame::SIZE);
        assert_eq!(std::mem::size_of::<LeaveFrame>(), LeaveFrame::SIZE);
        assert_eq!(std::mem::size_of::<SendFrame>(), SendFrame::SIZE);
        assert_eq!(std::mem::size_of::<CallFrame>(), CallFrame::SIZE);
        assert_eq!(std::mem::size_of::<CallReturnFrame>(), CallReturnFrame::SIZE);
        assert_eq!(std::mem::size_of::<ReactorFrame>(), ReactorFrame::SIZE);
    }

    #[test]
    fn test_peek_type() {
        let frame = LeaveFrame {
            kind: MessageType::Leave as u32,
            ..LeaveFrame::default()
        };
        assert_eq!(peek_type(bytemuck::bytes_of(&frame)).unwrap(), MessageType::Leave);
        assert!(peek_type(&[1, 0]).is_err());
        assert!(peek_type(&9u32.to_ne_bytes()).is_err());
    }
}
