//! The dispatcher thread of a fusionee.
//!
//! Each fusionee drains its mailbox on its own thread, handling frames in
//! arrival order. Between frames (at least every liveness interval) it
//! flushes its call bin, and the master sweeps for dead slaves.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use fusion_core::{FusionError, FusionId, FusionResult};

use super::{Member, WorldShared};
use crate::call;
use crate::protocol::FusionMessage;

/// A SEND payload with its sender.
pub(crate) type Letter = (FusionId, Vec<u8>);

pub(crate) struct Dispatcher {
    pub(crate) world: Arc<WorldShared>,
    pub(crate) member: Arc<Member>,
    pub(crate) mailbox: Receiver<Vec<u8>>,
    pub(crate) stop: Arc<AtomicBool>,
    pub(crate) letters: Sender<Letter>,
}

impl Dispatcher {
    /// Starts the thread. It hands the mailbox back when it stops.
    pub(crate) fn spawn(self) -> FusionResult<JoinHandle<Receiver<Vec<u8>>>> {
        let name = format!("fusion-dispatch-{}", self.member.id().raw());
        std::thread::Builder::new()
            .name(name)
            .spawn(move || self.run())
            .map_err(FusionError::from)
    }

    fn run(self) -> Receiver<Vec<u8>> {
        let interval = self.world.config.liveness_interval();
        tracing::debug!("Dispatcher of {} running", self.member.id());

        while !self.stop.load(Ordering::Acquire) {
            match self.mailbox.recv_timeout(interval) {
                Ok(bytes) => self.handle_batch(&bytes),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
            self.tick();
        }

        tracing::debug!("Dispatcher of {} stopped", self.member.id());
        self.mailbox
    }

    fn handle_batch(&self, bytes: &[u8]) {
        match FusionMessage::decode_all(bytes) {
            Ok(messages) => {
                for message in messages {
                    self.handle(message);
                }
            }
            Err(e) => tracing::warn!("Dispatcher of {} dropped a malformed batch: {}", self.member.id(), e),
        }
    }

    fn handle(&self, message: FusionMessage) {
        let me = self.member.id();
        match message {
            FusionMessage::Call { header, request } => call::serve(&self.world, &self.member, &header, &request),
            FusionMessage::Send { sender, payload } => {
                if self.letters.send((sender, payload)).is_err() {
                    tracing::debug!("{} dropped a message from {}", me, sender);
                }
            }
            FusionMessage::Enter { fusion_id, ticket } if me.is_master() && fusion_id == FusionId::UNASSIGNED => {
                self.admit(ticket);
            }
            FusionMessage::Leave { fusion_id } if me.is_master() => self.release(fusion_id),
            reply @ FusionMessage::CallReturn { .. } => {
                if !self.world.deliver_call_return(me, &reply) {
                    tracing::debug!("{} discarded a late reply", me);
                }
            }
            other => tracing::warn!("{} ignored unexpected {:?} frame", me, other.kind()),
        }
    }

    fn admit(&self, ticket: u64) {
        let Some((id, member)) = self.world.complete_join(ticket) else {
            tracing::warn!("ENTER with unknown or expired ticket {}", ticket);
            return;
        };
        let answer = FusionMessage::Enter { fusion_id: id, ticket }.encode();
        if member.post(answer).is_err() {
            tracing::warn!("Fusionee {} vanished while joining", id);
            self.world.member_left(id);
        }
    }

    fn release(&self, id: FusionId) {
        if id.is_master() {
            tracing::warn!("Ignoring LEAVE naming the master");
            return;
        }
        let Ok(member) = self.world.member(id) else {
            tracing::debug!("LEAVE from {} which is not a member", id);
            return;
        };
        self.world.member_left(id);
        if member.post(FusionMessage::Leave { fusion_id: id }.encode()).is_err() {
            tracing::debug!("Fusionee {} gone before LEAVE was acknowledged", id);
        }
    }

    fn tick(&self) {
        if let Err(e) = self.member.bin.lock().flush() {
            tracing::warn!("Call bin flush of {} failed: {}", self.member.id(), e);
        }
        if self.member.id().is_master() {
            self.world.sweep();
        }
    }
}
