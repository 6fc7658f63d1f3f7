//! Reply slots of calls waiting for their CALLRET.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use fusion_core::{FusionId, WaitWord};

const EMPTY: u32 = 0;
const FILLED: u32 = 1;

/// Where one CALLRET frame lands.
pub(crate) struct ReplySlot {
    /// Fusionee expected to answer.
    target: FusionId,
    word: WaitWord,
    frame: Mutex<Option<Vec<u8>>>,
}

impl ReplySlot {
    /// Blocks until the slot is filled or the deadline passes.
    pub(crate) fn wait(&self, deadline: Instant) -> bool {
        self.word.wait_while(EMPTY, deadline).is_some()
    }

    pub(crate) fn take(&self) -> Option<Vec<u8>> {
        self.frame.lock().take()
    }

    fn fill(&self, frame: Vec<u8>) {
        *self.frame.lock() = Some(frame);
        self.word.store(FILLED);
    }
}

/// Outstanding synchronous calls of one fusionee, keyed by serial.
#[derive(Default)]
pub(crate) struct PendingReplies {
    slots: Mutex<HashMap<u32, Arc<ReplySlot>>>,
}

impl PendingReplies {
    pub(crate) fn register(&self, serial: u32, target: FusionId) -> Arc<ReplySlot> {
        let slot = Arc::new(ReplySlot {
            target,
            word: WaitWord::new(EMPTY),
            frame: Mutex::new(None),
        });
        self.slots.lock().insert(serial, Arc::clone(&slot));
        slot
    }

    /// Fills the slot waiting for `serial`.
    ///
    /// Returns false if nobody waits any more (abandoned or unknown serial).
    pub(crate) fn deliver(&self, serial: u32, frame: Vec<u8>) -> bool {
        let Some(slot) = self.slots.lock().remove(&serial) else {
            return false;
        };
        slot.fill(frame);
        true
    }

    /// Abandons a wait. A reply arriving later is discarded.
    pub(crate) fn cancel(&self, serial: u32) {
        self.slots.lock().remove(&serial);
    }

    /// Fails every wait on `target` with the frame built for its serial.
    pub(crate) fn fail_targeting(&self, target: FusionId, frame: impl Fn(u32) -> Vec<u8>) -> usize {
        let failed: Vec<_> = {
            let mut slots = self.slots.lock();
            let serials: Vec<u32> = slots
                .iter()
                .filter(|(_, slot)| slot.target == target)
                .map(|(&serial, _)| serial)
                .collect();
            serials
                .into_iter()
                .filter_map(|serial| slots.remove(&serial).map(|slot| (serial, slot)))
                .collect()
        };
        for (serial, slot) in &failed {
            slot.fill(frame(*serial));
        }
        failed.len()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.slots.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_deliver_wakes_waiter() {
        let pending = Arc::new(PendingReplies::default());
        let slot = pending.register(7, FusionId::MASTER);

        let sender = Arc::clone(&pending);
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            assert!(sender.deliver(7, vec![1, 2, 3]));
        });

        assert!(slot.wait(Instant::now() + Duration::from_secs(5)));
        assert_eq!(slot.take(), Some(vec![1, 2, 3]));
        t.join().unwrap();
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn test_late_reply_discarded() {
        let pending = PendingReplies::default();
        let slot = pending.register(1, FusionId::MASTER);
        assert!(!slot.wait(Instant::now() + Duration::from_millis(5)));
        pending.cancel(1);
        assert!(!pending.deliver(1, vec![9]));
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_fail_targeting() {
        let pending = PendingReplies::default();
        let dead = FusionId::new(3);
        let a = pending.register(1, dead);
        let _b = pending.register(2, FusionId::MASTER);
        let c = pending.register(3, dead);

        assert_eq!(pending.fail_targeting(dead, |serial| vec![serial as u8]), 2);
        assert_eq!(a.take(), Some(vec![1]));
        assert_eq!(c.take(), Some(vec![3]));
        assert_eq!(pending.len(), 1);
    }
}
