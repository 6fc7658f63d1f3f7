//! Per-fusionee state shared with the rest of the world.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Weak;

use crossbeam_channel::Sender;
use parking_lot::Mutex;

use fusion_core::{FusionConfig, FusionError, FusionId, FusionResult};

use crate::call::{CallBin, PendingReplies};

/// Membership state of a fusionee.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MemberState {
    /// Not part of a world.
    Unjoined = 0,
    /// ENTER sent, waiting for the master's answer.
    Joining = 1,
    /// Full member.
    Joined = 2,
    /// LEAVE sent or cleanup running.
    Leaving = 3,
    /// Gone.
    Left = 4,
}

impl MemberState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Joining,
            2 => Self::Joined,
            3 => Self::Leaving,
            4 => Self::Left,
            _ => Self::Unjoined,
        }
    }
}

/// A fusionee as seen by the world.
pub(crate) struct Member {
    id: AtomicU64,
    state: AtomicU8,
    /// Frames for this fusionee's dispatcher.
    pub(crate) mailbox: Sender<Vec<u8>>,
    /// Dies with the owning `Fusionee`.
    liveness: Weak<()>,
    pub(crate) pending: PendingReplies,
    serial: AtomicU32,
    pub(crate) bin: Mutex<CallBin>,
}

impl Member {
    pub(crate) fn new(
        id: FusionId,
        state: MemberState,
        mailbox: Sender<Vec<u8>>,
        liveness: Weak<()>,
        config: &FusionConfig,
    ) -> Self {
        Self {
            id: AtomicU64::new(id.raw()),
            state: AtomicU8::new(state as u8),
            mailbox,
            liveness,
            pending: PendingReplies::default(),
            serial: AtomicU32::new(0),
            bin: Mutex::new(CallBin::new(config.call_bin_max_num, config.call_bin_max_data)),
        }
    }

    pub(crate) fn id(&self) -> FusionId {
        FusionId::new(self.id.load(Ordering::Acquire))
    }

    pub(crate) fn assign(&self, id: FusionId) {
        self.id.store(id.raw(), Ordering::Release);
    }

    pub(crate) fn state(&self) -> MemberState {
        MemberState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: MemberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves from `from` to `to`. Returns false if the state was different.
    pub(crate) fn transition(&self, from: MemberState, to: MemberState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns true while the owning fusionee exists and has not left.
    pub(crate) fn is_alive(&self) -> bool {
        self.liveness.strong_count() > 0 && self.state() != MemberState::Left
    }

    pub(crate) fn is_joined(&self) -> bool {
        self.state() == MemberState::Joined
    }

    /// Next call serial. Monotonic per fusionee, skipping zero.
    pub(crate) fn next_serial(&self) -> u32 {
        loop {
            let serial = self.serial.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// Queues a frame in this fusionee's mailbox.
    pub(crate) fn post(&self, frame: Vec<u8>) -> FusionResult<()> {
        self.mailbox
            .send(frame)
            .map_err(|_| FusionError::NoSuchInstance(format!("{} has no dispatcher", self.id())))
    }
}
