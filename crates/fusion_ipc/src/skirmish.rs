//! # Skirmishes
//!
//! Recursive locks shared by every fusionee of a world.
//!
//! A skirmish is held by one thread of one fusionee at a time and may be
//! re-entered by its holder. Waiting on a skirmish releases it completely
//! until another fusionee notifies, then takes it back with the same count.
//!
//! ```text
//!   lock word:   0 ──prevail──> HELD ──dismiss (count 0)──> 0
//!                                 └──destroy──> DESTROYED
//!   notify word: bumped by notify(), waited on by wait()
//! ```
//!
//! When the holding fusionee leaves or dies the lock is released on its
//! behalf.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use fusion_core::{deadline_after, FusionError, FusionId, FusionResult, WaitWord};

use crate::world::{Fusionee, MemberCleanup, WorldShared};

const FREE: u32 = 0;
const HELD: u32 = 1;
const DESTROYED: u32 = u32::MAX;

static NEXT_SKIRMISH_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Holder {
    fusion_id: FusionId,
    thread: ThreadId,
    count: u32,
}

/// Lock shared across the fusionees of a world.
pub struct Skirmish {
    id: u64,
    name: String,
    world: Weak<WorldShared>,
    word: WaitWord,
    notify: WaitWord,
    holder: Mutex<Option<Holder>>,
    destroyed: AtomicBool,
    slice: Duration,
}

impl fmt::Debug for Skirmish {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skirmish")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("holder", &*self.holder.lock())
            .finish_non_exhaustive()
    }
}

impl Skirmish {
    /// Creates a skirmish in the world of `fusionee`.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if `fusionee` is not joined.
    pub fn create(fusionee: &Fusionee, name: &str) -> FusionResult<Arc<Self>> {
        fusionee.ensure_joined()?;
        Ok(Self::in_world(fusionee.world(), name))
    }

    pub(crate) fn in_world(world: &Arc<WorldShared>, name: &str) -> Arc<Self> {
        let skirmish = Arc::new(Self {
            id: NEXT_SKIRMISH_ID.fetch_add(1, Ordering::Relaxed),
            name: name.to_owned(),
            world: Arc::downgrade(world),
            word: WaitWord::new(FREE),
            notify: WaitWord::new(0),
            holder: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            slice: world.config.liveness_interval(),
        });
        let cleanup: Weak<dyn MemberCleanup> = Arc::downgrade(&skirmish) as Weak<Self>;
        world.register_cleanup(cleanup);
        tracing::debug!("Skirmish '{}' ({}) created in world {}", name, skirmish.id, world.index);
        skirmish
    }

    /// Returns the name given at creation.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn check_member(&self, fusionee: &Fusionee) -> FusionResult<FusionId> {
        fusionee.ensure_joined()?;
        if std::ptr::eq(self.world.as_ptr(), Arc::as_ptr(fusionee.world())) {
            Ok(fusionee.id())
        } else {
            Err(FusionError::InvalidArgument(format!(
                "{} is not a member of the world of skirmish '{}'",
                fusionee.id(),
                self.name
            )))
        }
    }

    fn check_alive(&self) -> FusionResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            Err(FusionError::InvalidState(format!("skirmish '{}' was destroyed", self.name)))
        } else {
            Ok(())
        }
    }

    /// Re-enters if the calling thread of `fusion_id` already holds the lock.
    fn reenter(&self, fusion_id: FusionId) -> bool {
        let thread = std::thread::current().id();
        let mut holder = self.holder.lock();
        match holder.as_mut() {
            Some(held) if held.fusion_id == fusion_id && held.thread == thread => {
                held.count += 1;
                true
            }
            _ => false,
        }
    }

    fn try_take(&self, fusion_id: FusionId, count: u32) -> bool {
        if !self.word.compare_and_store(FREE, HELD) {
            return false;
        }
        *self.holder.lock() = Some(Holder {
            fusion_id,
            thread: std::thread::current().id(),
            count,
        });
        true
    }

    fn take(&self, fusion_id: FusionId, count: u32) -> FusionResult<()> {
        loop {
            self.check_alive()?;
            if self.try_take(fusion_id, count) {
                return Ok(());
            }
            // Sliced so a destroy or a departed holder is noticed
            self.word.wait_while(HELD, deadline_after(self.slice));
        }
    }

    pub(crate) fn prevail_as(&self, fusion_id: FusionId) -> FusionResult<()> {
        self.check_alive()?;
        if self.reenter(fusion_id) {
            return Ok(());
        }
        self.take(fusion_id, 1)
    }

    pub(crate) fn dismiss_as(&self, fusion_id: FusionId) -> FusionResult<()> {
        let thread = std::thread::current().id();
        let mut holder = self.holder.lock();
        let Some(held) = holder.as_mut().filter(|h| h.fusion_id == fusion_id && h.thread == thread) else {
            return Err(FusionError::InvalidState(format!(
                "skirmish '{}' is not held by {} on this thread",
                self.name, fusion_id
            )));
        };
        held.count -= 1;
        if held.count == 0 {
            *holder = None;
            drop(holder);
            if !self.destroyed.load(Ordering::Acquire) {
                self.word.store(FREE);
            }
        }
        Ok(())
    }

    /// Acquires the lock, waiting as long as it takes. Recursive.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the skirmish is destroyed, before or
    /// while waiting.
    pub fn prevail(&self, fusionee: &Fusionee) -> FusionResult<()> {
        let id = self.check_member(fusionee)?;
        self.prevail_as(id)
    }

    /// Acquires the lock only if nobody else holds it.
    ///
    /// # Errors
    ///
    /// [`FusionError::Busy`] if it is held elsewhere,
    /// [`FusionError::InvalidState`] if the skirmish is destroyed.
    pub fn swoop(&self, fusionee: &Fusionee) -> FusionResult<()> {
        let id = self.check_member(fusionee)?;
        self.check_alive()?;
        if self.reenter(id) || self.try_take(id, 1) {
            Ok(())
        } else {
            Err(FusionError::Busy(format!("skirmish '{}' is held", self.name)))
        }
    }

    /// Releases one level of the lock.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] unless the calling thread holds it.
    pub fn dismiss(&self, fusionee: &Fusionee) -> FusionResult<()> {
        let id = self.check_member(fusionee)?;
        self.dismiss_as(id)
    }

    /// Acquires the lock and returns a guard that dismisses it on drop.
    ///
    /// # Errors
    ///
    /// See [`prevail`](Self::prevail).
    pub fn lock<'a>(&'a self, fusionee: &Fusionee) -> FusionResult<SkirmishGuard<'a>> {
        let fusion_id = self.check_member(fusionee)?;
        self.prevail_as(fusion_id)?;
        Ok(SkirmishGuard {
            skirmish: self,
            fusion_id,
        })
    }

    /// Recursion depth of the current holder, 0 when free.
    #[must_use]
    pub fn lock_count(&self) -> u32 {
        self.holder.lock().map_or(0, |held| held.count)
    }

    /// Fusionee currently holding the lock.
    #[must_use]
    pub fn holder(&self) -> Option<FusionId> {
        self.holder.lock().map(|held| held.fusion_id)
    }

    /// Releases the lock, waits for a [`notify`](Self::notify), then takes
    /// the lock back at the same recursion depth.
    ///
    /// # Arguments
    ///
    /// * `fusionee` - Holder of the lock
    /// * `timeout` - Give up waiting after this long, `None` waits forever
    ///
    /// # Errors
    ///
    /// - [`FusionError::InvalidState`] unless the calling thread holds the
    ///   lock, or if the skirmish is destroyed meanwhile
    /// - [`FusionError::Timeout`] if nobody notified in time; the lock is
    ///   held again nonetheless
    pub fn wait(&self, fusionee: &Fusionee, timeout: Option<Duration>) -> FusionResult<()> {
        let fusion_id = self.check_member(fusionee)?;
        let thread = std::thread::current().id();

        // Read before releasing, a notify in between is not lost
        let seen = self.notify.load();
        let count = {
            let mut holder = self.holder.lock();
            match holder.take() {
                Some(held) if held.fusion_id == fusion_id && held.thread == thread => held.count,
                other => {
                    *holder = other;
                    return Err(FusionError::InvalidState(format!(
                        "waiting on skirmish '{}' requires holding it",
                        self.name
                    )));
                }
            }
        };
        if !self.destroyed.load(Ordering::Acquire) {
            self.word.store(FREE);
        }

        let deadline = timeout.map(deadline_after);
        let notified = loop {
            let until = deadline.map_or_else(|| deadline_after(self.slice), |d| d.min(deadline_after(self.slice)));
            if self.notify.wait_while(seen, until).is_some() {
                break true;
            }
            if self.destroyed.load(Ordering::Acquire) {
                return Err(FusionError::InvalidState(format!(
                    "skirmish '{}' was destroyed while waiting",
                    self.name
                )));
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                break false;
            }
        };

        self.take(fusion_id, count)?;
        if notified {
            Ok(())
        } else {
            Err(FusionError::Timeout)
        }
    }

    /// Wakes every fusionee in [`wait`](Self::wait).
    pub fn notify(&self) {
        loop {
            let seen = self.notify.load();
            if self.notify.compare_and_store(seen, seen.wrapping_add(1)) {
                return;
            }
        }
    }

    /// Destroys the skirmish. Waiters fail, further use fails.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if already destroyed.
    pub fn destroy(&self) -> FusionResult<()> {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(FusionError::InvalidState(format!("skirmish '{}' was destroyed", self.name)));
        }
        self.word.store(DESTROYED);
        self.notify();
        tracing::debug!("Skirmish '{}' destroyed", self.name);
        Ok(())
    }

    /// Acquires several skirmishes in a global order, so two fusionees
    /// locking overlapping sets cannot deadlock.
    ///
    /// # Errors
    ///
    /// See [`prevail`](Self::prevail). Locks taken before the failure are
    /// released again.
    pub fn prevail_multi(skirmishes: &[&Self], fusionee: &Fusionee) -> FusionResult<()> {
        let mut ordered: Vec<&Self> = skirmishes.to_vec();
        ordered.sort_by_key(|skirmish| skirmish.id);

        for (taken, skirmish) in ordered.iter().enumerate() {
            if let Err(e) = skirmish.prevail(fusionee) {
                for held in ordered[..taken].iter().rev() {
                    let _ = held.dismiss(fusionee);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Releases skirmishes taken with [`prevail_multi`](Self::prevail_multi),
    /// in reverse order.
    ///
    /// # Errors
    ///
    /// The first failure of [`dismiss`](Self::dismiss); the remaining locks
    /// are released anyway.
    pub fn dismiss_multi(skirmishes: &[&Self], fusionee: &Fusionee) -> FusionResult<()> {
        let mut ordered: Vec<&Self> = skirmishes.to_vec();
        ordered.sort_by_key(|skirmish| std::cmp::Reverse(skirmish.id));

        let mut result = Ok(());
        for skirmish in ordered {
            if let Err(e) = skirmish.dismiss(fusionee) {
                result = result.and(Err(e));
            }
        }
        result
    }
}

impl MemberCleanup for Skirmish {
    fn member_left(&self, id: FusionId) {
        let released = {
            let mut holder = self.holder.lock();
            if holder.is_some_and(|held| held.fusion_id == id) {
                *holder = None;
                true
            } else {
                false
            }
        };
        if released {
            tracing::warn!("Skirmish '{}' released on behalf of departed {}", self.name, id);
            if !self.destroyed.load(Ordering::Acquire) {
                self.word.store(FREE);
            }
        }
    }
}

/// Holds a skirmish until dropped.
#[derive(Debug)]
#[must_use = "the skirmish is dismissed when the guard is dropped"]
pub struct SkirmishGuard<'a> {
    skirmish: &'a Skirmish,
    fusion_id: FusionId,
}

impl Drop for SkirmishGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.skirmish.dismiss_as(self.fusion_id) {
            tracing::debug!("Dismissing '{}': {}", self.skirmish.name, e);
        }
    }
}
