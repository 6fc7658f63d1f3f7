//! Executing, serving and answering calls.

use std::time::{Duration, Instant};

use fusion_core::{deadline_after, FusionError, FusionId, FusionResult};

use super::pending::ReplySlot;
use super::registry::CallEntry;
use super::{CallContext, CallId, CallOutcome, ExecFlags, ReturnToken};
use crate::protocol::{CallFrame, FusionMessage, MessageType, ReturnStatus, MAX_PAYLOAD};
use crate::world::{Member, WorldShared};

/// One call execution request.
pub(crate) struct Invocation<'a> {
    pub(crate) call: CallId,
    pub(crate) flags: ExecFlags,
    pub(crate) call_arg: i32,
    pub(crate) request: &'a [u8],
    pub(crate) max_reply: usize,
    pub(crate) timeout: Duration,
}

/// Executes a call for `member`, resending on timeout as configured.
pub(crate) fn execute(world: &WorldShared, member: &Member, invocation: &Invocation<'_>) -> FusionResult<Vec<u8>> {
    let attempts = world.config.call_retry_attempts.saturating_add(1);
    let mut attempt = 1;
    loop {
        match execute_once(world, member, invocation) {
            Err(FusionError::Timeout) if attempt < attempts => {
                tracing::debug!(
                    "{} timed out for {}, retry {} of {}",
                    invocation.call,
                    member.id(),
                    attempt,
                    attempts - 1
                );
                std::thread::sleep(world.config.call_retry_backoff());
                attempt += 1;
            }
            result => return result,
        }
    }
}

fn execute_once(world: &WorldShared, member: &Member, invocation: &Invocation<'_>) -> FusionResult<Vec<u8>> {
    let caller = member.id();
    let entry = world.calls.get(invocation.call)?;
    let owner = world
        .member(entry.owner)
        .ok()
        .filter(|owner| owner.is_joined() && owner.is_alive())
        .ok_or_else(|| FusionError::NoSuchInstance(format!("owner {} of {} departed", entry.owner, invocation.call)))?;

    let flags = invocation.flags | entry.default_flags;
    let serial = member.next_serial();
    let direct = world.backend.direct_calls() || (entry.owner == caller && !flags.contains(ExecFlags::QUEUE));
    if direct {
        return invoke_direct(world, member, &owner, &entry, invocation, flags, serial);
    }

    let frame = FusionMessage::Call {
        header: CallFrame {
            kind: MessageType::Call as u32,
            serial,
            caller: caller.raw(),
            call_id: invocation.call.to_raw(),
            call_arg: invocation.call_arg,
            call_length: 0,
            ret_length: u32::try_from(invocation.max_reply).unwrap_or(u32::MAX),
            flags: flags.bits(),
            handler: entry.owner.raw(),
            ctx: entry.ctx,
        },
        request: invocation.request.to_vec(),
    }
    .encode();

    if flags.contains(ExecFlags::ONEWAY) {
        if world.config.call_bins_enabled() {
            member.bin.lock().push(entry.owner, &owner.mailbox, &frame)?;
        } else {
            owner.post(frame)?;
        }
        return Ok(Vec::new());
    }

    // Earlier one-way calls must reach their target first
    if let Err(e) = member.bin.lock().flush() {
        tracing::warn!("Call bin flush of {} failed: {}", caller, e);
    }

    let slot = member.pending.register(serial, entry.owner);
    if let Err(e) = owner.post(frame) {
        member.pending.cancel(serial);
        return Err(e);
    }
    wait_reply(world, member, &owner, &slot, serial, invocation)
}

fn invoke_direct(
    world: &WorldShared,
    member: &Member,
    owner: &Member,
    entry: &CallEntry,
    invocation: &Invocation<'_>,
    flags: ExecFlags,
    serial: u32,
) -> FusionResult<Vec<u8>> {
    let ctx = CallContext {
        call: invocation.call,
        caller: member.id(),
        call_arg: invocation.call_arg,
        serial,
        ctx: entry.ctx,
        max_reply: invocation.max_reply,
        flags,
    };

    if flags.contains(ExecFlags::ONEWAY) {
        if let CallOutcome::Fail(code) = entry.handler.handle(&ctx, invocation.request) {
            tracing::debug!("One-way {} failed with code {}", invocation.call, code);
        }
        return Ok(Vec::new());
    }

    // Registered first so a retained call can be answered from any thread
    let slot = member.pending.register(serial, entry.owner);
    match entry.handler.handle(&ctx, invocation.request) {
        CallOutcome::Return(reply) => {
            member.pending.cancel(serial);
            check_capacity(reply, invocation.max_reply)
        }
        CallOutcome::Fail(code) => {
            member.pending.cancel(serial);
            Err(FusionError::HandlerFailed { code })
        }
        CallOutcome::Retain => wait_reply(world, member, owner, &slot, serial, invocation),
    }
}

fn wait_reply(
    world: &WorldShared,
    member: &Member,
    owner: &Member,
    slot: &ReplySlot,
    serial: u32,
    invocation: &Invocation<'_>,
) -> FusionResult<Vec<u8>> {
    let deadline = deadline_after(invocation.timeout);
    let slice = world.config.liveness_interval();

    loop {
        if slot.wait(deadline_after(slice).min(deadline)) {
            let frame = slot
                .take()
                .ok_or_else(|| FusionError::InvalidState(format!("reply slot for serial {serial} is empty")))?;
            return parse_reply(&frame, serial, invocation.max_reply);
        }
        if Instant::now() >= deadline {
            member.pending.cancel(serial);
            tracing::debug!("{} serial {} timed out", invocation.call, serial);
            return Err(FusionError::Timeout);
        }
        if !owner.is_alive() {
            member.pending.cancel(serial);
            return Err(FusionError::NoSuchInstance(format!(
                "owner {} of {} died while serial {} was pending",
                owner.id(),
                invocation.call,
                serial
            )));
        }
    }
}

fn parse_reply(frame: &[u8], serial: u32, max_reply: usize) -> FusionResult<Vec<u8>> {
    match FusionMessage::decode(frame)? {
        FusionMessage::CallReturn {
            serial: answered,
            status,
            detail,
            reply,
        } if answered == serial => match status {
            ReturnStatus::Ok => check_capacity(reply, max_reply),
            ReturnStatus::NoSuchInstance => Err(FusionError::NoSuchInstance(format!(
                "call owner departed before answering serial {serial}"
            ))),
            ReturnStatus::BufferTooSmall => Err(FusionError::BufferTooSmall {
                needed: usize::try_from(detail).unwrap_or(0),
                capacity: max_reply,
            }),
            ReturnStatus::HandlerFailed => Err(FusionError::HandlerFailed { code: detail }),
        },
        other => Err(FusionError::InvalidState(format!(
            "expected CALLRET for serial {serial}, got {:?}",
            other.kind()
        ))),
    }
}

fn check_capacity(reply: Vec<u8>, max_reply: usize) -> FusionResult<Vec<u8>> {
    if reply.len() > max_reply {
        return Err(FusionError::BufferTooSmall {
            needed: reply.len(),
            capacity: max_reply,
        });
    }
    Ok(reply)
}

fn reply_message(serial: u32, reply: Vec<u8>, max_reply: usize) -> FusionMessage {
    if reply.len() > max_reply.min(MAX_PAYLOAD) {
        FusionMessage::CallReturn {
            serial,
            status: ReturnStatus::BufferTooSmall,
            detail: i32::try_from(reply.len()).unwrap_or(i32::MAX),
            reply: Vec::new(),
        }
    } else {
        FusionMessage::CallReturn {
            serial,
            status: ReturnStatus::Ok,
            detail: 0,
            reply,
        }
    }
}

/// Handles a CALL frame on the owner's dispatcher.
pub(crate) fn serve(world: &WorldShared, member: &Member, header: &CallFrame, request: &[u8]) {
    let caller = FusionId::new(header.caller);
    let call = CallId::from_raw(header.call_id);
    let flags = ExecFlags::from_bits_truncate(header.flags);
    let max_reply = header.ret_length as usize;

    let answer = |message: FusionMessage| {
        if flags.contains(ExecFlags::ONEWAY) {
            return;
        }
        if !world.deliver_call_return(caller, &message) {
            tracing::debug!("Reply to {} for serial {} discarded, nobody waits", caller, header.serial);
        }
    };
    let failure = |status: ReturnStatus, detail: i32| FusionMessage::CallReturn {
        serial: header.serial,
        status,
        detail,
        reply: Vec::new(),
    };

    if !member.is_joined() {
        answer(failure(ReturnStatus::NoSuchInstance, 0));
        return;
    }
    let entry = match world.calls.get(call) {
        Ok(entry) if entry.owner == member.id() => entry,
        _ => {
            tracing::debug!("{} from {} no longer exists", call, caller);
            answer(failure(ReturnStatus::NoSuchInstance, 0));
            return;
        }
    };

    let ctx = CallContext {
        call,
        caller,
        call_arg: header.call_arg,
        serial: header.serial,
        ctx: entry.ctx,
        max_reply,
        flags,
    };
    match entry.handler.handle(&ctx, request) {
        CallOutcome::Return(reply) => answer(reply_message(header.serial, reply, max_reply)),
        CallOutcome::Fail(code) => {
            if flags.contains(ExecFlags::ONEWAY) {
                tracing::debug!("One-way {} from {} failed with code {}", call, caller, code);
            }
            answer(failure(ReturnStatus::HandlerFailed, code));
        }
        CallOutcome::Retain => {}
    }
}

/// Answers a retained call.
pub(crate) fn deliver_reply(world: &WorldShared, token: ReturnToken, reply: Vec<u8>) -> FusionResult<()> {
    let message = reply_message(token.serial, reply, token.max_reply);
    if world.deliver_call_return(token.caller, &message) {
        Ok(())
    } else {
        Err(FusionError::NoSuchInstance(format!(
            "{} no longer waits for serial {}",
            token.caller, token.serial
        )))
    }
}
