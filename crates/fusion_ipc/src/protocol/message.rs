//! # Fusion Messages
//!
//! Decoded frames and their encoding.
//!
//! A mailbox item may hold several frames back to back (a flushed call
//! bin), so decoding works on prefixes and [`FusionMessage::decode_all`]
//! walks a whole batch.

use bytemuck::{bytes_of, Pod};

use fusion_core::{FusionError, FusionId, FusionResult};

use super::frames::{
    peek_type, CallFrame, CallReturnFrame, EnterFrame, LeaveFrame, MessageType, ReactorFrame, ReturnStatus,
    SendFrame,
};

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FusionMessage {
    /// User payload.
    Send {
        /// Sending fusionee.
        sender: FusionId,
        /// Payload bytes.
        payload: Vec<u8>,
    },
    /// Join intent or answer.
    Enter {
        /// Assigned id, [`FusionId::UNASSIGNED`] in the intent.
        fusion_id: FusionId,
        /// Join ticket.
        ticket: u64,
    },
    /// Leave notice or acknowledgement.
    Leave {
        /// Departing fusionee.
        fusion_id: FusionId,
    },
    /// Call request. `header.call_length` always equals `request.len()`.
    Call {
        /// Fixed fields.
        header: CallFrame,
        /// Request bytes.
        request: Vec<u8>,
    },
    /// Call reply.
    CallReturn {
        /// Serial of the answered call.
        serial: u32,
        /// Outcome.
        status: ReturnStatus,
        /// Needed size or handler code.
        detail: i32,
        /// Reply bytes (empty unless the status is `Ok`).
        reply: Vec<u8>,
    },
    /// Reactor message.
    Reactor {
        /// Raw reactor handle.
        reactor_id: u64,
        /// Channel.
        channel: u32,
        /// Entity the message is about.
        reference: u64,
        /// Message bytes.
        message: Vec<u8>,
    },
}

impl FusionMessage {
    /// Returns the frame type.
    #[must_use]
    pub const fn kind(&self) -> MessageType {
        match self {
            Self::Send { .. } => MessageType::Send,
            Self::Enter { .. } => MessageType::Enter,
            Self::Leave { .. } => MessageType::Leave,
            Self::Call { .. } => MessageType::Call,
            Self::CallReturn { .. } => MessageType::CallRet,
            Self::Reactor { .. } => MessageType::Reactor,
        }
    }

    /// Encodes the frame.
    ///
    /// # Panics
    ///
    /// Panics if a payload exceeds `u32::MAX` bytes.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Appends the encoded frame to `out`.
    ///
    /// # Panics
    ///
    /// Panics if a payload exceeds `u32::MAX` bytes.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        let kind = self.kind() as u32;
        match self {
            Self::Send { sender, payload } => {
                let header = SendFrame {
                    kind,
                    length: wire_len(payload),
                    sender: sender.raw(),
                };
                push(out, &header, payload);
            }
            Self::Enter { fusion_id, ticket } => {
                let header = EnterFrame {
                    kind,
                    _padding: 0,
                    fusion_id: fusion_id.raw(),
                    ticket: *ticket,
                };
                push(out, &header, &[]);
            }
            Self::Leave { fusion_id } => {
                let header = LeaveFrame {
                    kind,
                    _padding: 0,
                    fusion_id: fusion_id.raw(),
                };
                push(out, &header, &[]);
            }
            Self::Call { header, request } => {
                let header = CallFrame {
                    kind,
                    call_length: wire_len(request),
                    ..*header
                };
                push(out, &header, request);
            }
            Self::CallReturn {
                serial,
                status,
                detail,
                reply,
            } => {
                let header = CallReturnFrame {
                    kind,
                    serial: *serial,
                    length: wire_len(reply),
                    status: *status as u32,
                    detail: *detail,
                    _padding: 0,
                };
                push(out, &header, reply);
            }
            Self::Reactor {
                reactor_id,
                channel,
                reference,
                message,
            } => {
                let header = ReactorFrame {
                    kind,
                    channel: *channel,
                    reactor_id: *reactor_id,
                    reference: *reference,
                    length: wire_len(message),
                    _padding: 0,
                };
                push(out, &header, message);
            }
        }
    }

    /// Decodes exactly one frame.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] for malformed frames or trailing bytes.
    pub fn decode(bytes: &[u8]) -> FusionResult<Self> {
        let (message, used) = Self::decode_prefix(bytes)?;
        if used != bytes.len() {
            return Err(FusionError::InvalidArgument(format!(
                "{} trailing bytes after frame",
                bytes.len() - used
            )));
        }
        Ok(message)
    }

    /// Decodes the frame at the start of `bytes`.
    ///
    /// # Returns
    ///
    /// The frame and the number of bytes it occupied.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] for malformed frames.
    pub fn decode_prefix(bytes: &[u8]) -> FusionResult<(Self, usize)> {
        match peek_type(bytes)? {
            MessageType::Send => {
                let header: SendFrame = read_header(bytes, SendFrame::SIZE)?;
                let (payload, used) = read_body(bytes, SendFrame::SIZE, header.length)?;
                Ok((
                    Self::Send {
                        sender: FusionId::new(header.sender),
                        payload,
                    },
                    used,
                ))
            }
            MessageType::Enter => {
                let header: EnterFrame = read_header(bytes, EnterFrame::SIZE)?;
                Ok((
                    Self::Enter {
                        fusion_id: FusionId::new(header.fusion_id),
                        ticket: header.ticket,
                    },
                    EnterFrame::SIZE,
                ))
            }
            MessageType::Leave => {
                let header: LeaveFrame = read_header(bytes, LeaveFrame::SIZE)?;
                Ok((
                    Self::Leave {
                        fusion_id: FusionId::new(header.fusion_id),
                    },
                    LeaveFrame::SIZE,
                ))
            }
            MessageType::Call => {
                let header: CallFrame = read_header(bytes, CallFrame::SIZE)?;
                let (request, used) = read_body(bytes, CallFrame::SIZE, header.call_length)?;
                Ok((Self::Call { header, request }, used))
            }
            MessageType::CallRet => {
                let header: CallReturnFrame = read_header(bytes, CallReturnFrame::SIZE)?;
                let (reply, used) = read_body(bytes, CallReturnFrame::SIZE, header.length)?;
                Ok((
                    Self::CallReturn {
                        serial: header.serial,
                        status: ReturnStatus::try_from(header.status)?,
                        detail: header.detail,
                        reply,
                    },
                    used,
                ))
            }
            MessageType::Reactor => {
                let header: ReactorFrame = read_header(bytes, ReactorFrame::SIZE)?;
                let (message, used) = read_body(bytes, ReactorFrame::SIZE, header.length)?;
                Ok((
                    Self::Reactor {
                        reactor_id: header.reactor_id,
                        channel: header.channel,
                        reference: header.reference,
                        message,
                    },
                    used,
                ))
            }
        }
    }

    /// Decodes a batch of back to back frames.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] at the first malformed frame.
    pub fn decode_all(mut bytes: &[u8]) -> FusionResult<Vec<Self>> {
        let mut messages = Vec::new();
        while !bytes.is_empty() {
            let (message, used) = Self::decode_prefix(bytes)?;
            messages.push(message);
            bytes = &bytes[used..];
        }
        Ok(messages)
    }
}

/// Largest payload a frame can carry.
pub const MAX_PAYLOAD: usize = u32::MAX as usize;

/// Rejects payloads whose length does not fit a frame header.
///
/// # Errors
///
/// Returns [`FusionError::InvalidArgument`] above [`MAX_PAYLOAD`].
pub fn check_payload(len: usize) -> FusionResult<()> {
    if len > MAX_PAYLOAD {
        return Err(FusionError::InvalidArgument(format!(
            "payload of {len} bytes exceeds the frame limit of {MAX_PAYLOAD}"
        )));
    }
    Ok(())
}

// Callers run check_payload first
fn wire_len(bytes: &[u8]) -> u32 {
    u32::try_from(bytes.len()).expect("frame payload exceeds u32::MAX bytes")
}

fn push<H: Pod>(out: &mut Vec<u8>, header: &H, body: &[u8]) {
    out.reserve(std::mem::size_of::<H>() + body.len());
    out.extend_from_slice(bytes_of(header));
    out.extend_from_slice(body);
}

fn read_header<H: Pod>(bytes: &[u8], size: usize) -> FusionResult<H> {
    bytes
        .get(..size)
        .and_then(|b| bytemuck::try_pod_read_unaligned(b).ok())
        .ok_or_else(|| FusionError::InvalidArgument(format!("truncated frame header ({} of {size} bytes)", bytes.len())))
}

fn read_body(bytes: &[u8], header_size: usize, length: u32) -> FusionResult<(Vec<u8>, usize)> {
    let end = header_size + length as usize;
    let body = bytes.get(header_size..end).ok_or_else(|| {
        FusionError::InvalidArgument(format!(
            "truncated frame body ({} of {length} bytes)",
            bytes.len().saturating_sub(header_size)
        ))
    })?;
    Ok((body.to_vec(), end))
}
