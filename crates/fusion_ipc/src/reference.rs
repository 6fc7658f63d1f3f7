//! # Fusion References
//!
//! Reference counts shared by every fusionee of a world.
//!
//! Besides the global count each reference remembers how many of its
//! references every fusionee holds, so the references of a departed
//! fusionee can be released on its behalf.
//!
//! ## Counting Rules
//!
//! - A reference starts at 1, held by its creator
//! - `up` on a reference that already reached zero is refused
//! - exactly one `down` (or `release_all`) observes the transition to zero

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use fusion_core::{FusionError, FusionId, FusionResult, TraceRef};

static NEXT_REF_ID: AtomicU64 = AtomicU64::new(1);

/// Cross-fusionee reference count.
#[derive(Debug)]
pub struct FusionRef {
    id: u64,
    /// Total count, readable without the lock.
    global: AtomicU32,
    /// Count per holder. Writes to `global` happen under this lock.
    locals: Mutex<HashMap<FusionId, u32>>,
    destroyed: AtomicBool,
    trace: bool,
}

impl FusionRef {
    /// Creates a reference held once by `creator`.
    #[must_use]
    pub fn new(creator: FusionId, trace: TraceRef) -> Self {
        let id = NEXT_REF_ID.fetch_add(1, Ordering::Relaxed);
        let mut locals = HashMap::new();
        locals.insert(creator, 1);
        let trace = trace.matches(id);
        if trace {
            tracing::trace!("Ref 0x{:x} created by {}", id, creator);
        }
        Self {
            id,
            global: AtomicU32::new(1),
            locals: Mutex::new(locals),
            destroyed: AtomicBool::new(false),
            trace,
        }
    }

    /// Returns the reference id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Adds a reference held by `holder`.
    ///
    /// # Returns
    ///
    /// The new global count.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the count already reached zero or the
    /// reference was destroyed.
    pub fn up(&self, holder: FusionId) -> FusionResult<u32> {
        let mut locals = self.locals.lock();
        if self.destroyed.load(Ordering::Acquire) {
            return Err(FusionError::InvalidState(format!("ref 0x{:x} is destroyed", self.id)));
        }
        let count = self.global.load(Ordering::Acquire);
        if count == 0 {
            return Err(FusionError::InvalidState(format!("ref 0x{:x} already reached zero", self.id)));
        }
        self.global.store(count + 1, Ordering::Release);
        *locals.entry(holder).or_insert(0) += 1;

        if self.trace {
            tracing::trace!("Ref 0x{:x} up by {}: {} -> {}", self.id, holder, count, count + 1);
        }
        Ok(count + 1)
    }

    /// Drops a reference held by `holder`.
    ///
    /// # Returns
    ///
    /// The remaining global count. Zero means the caller must reclaim.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if `holder` holds no reference.
    pub fn down(&self, holder: FusionId) -> FusionResult<u32> {
        let mut locals = self.locals.lock();
        let Some(local) = locals.get_mut(&holder) else {
            return Err(FusionError::InvalidState(format!(
                "ref 0x{:x}: {} holds no reference",
                self.id, holder
            )));
        };
        *local -= 1;
        if *local == 0 {
            locals.remove(&holder);
        }
        let count = self.global.load(Ordering::Acquire) - 1;
        self.global.store(count, Ordering::Release);

        if self.trace {
            tracing::trace!("Ref 0x{:x} down by {}: {} -> {}", self.id, holder, count + 1, count);
        }
        Ok(count)
    }

    /// Drops every reference held by a departed fusionee.
    ///
    /// # Returns
    ///
    /// `(released, remaining)`. The caller reclaims when `released > 0` and
    /// `remaining == 0`.
    pub fn release_all(&self, holder: FusionId) -> (u32, u32) {
        let mut locals = self.locals.lock();
        let released = locals.remove(&holder).unwrap_or(0);
        let count = self.global.load(Ordering::Acquire) - released;
        self.global.store(count, Ordering::Release);

        if self.trace && released > 0 {
            tracing::trace!("Ref 0x{:x}: released {} held by {}, {} left", self.id, released, holder, count);
        }
        (released, count)
    }

    /// Returns the global count.
    #[inline]
    #[must_use]
    pub fn stat(&self) -> u32 {
        self.global.load(Ordering::Acquire)
    }

    /// Returns the count held by one fusionee.
    #[must_use]
    pub fn local(&self, holder: FusionId) -> u32 {
        self.locals.lock().get(&holder).copied().unwrap_or(0)
    }

    /// Returns the fusionees holding references.
    #[must_use]
    pub fn holders(&self) -> Vec<FusionId> {
        let mut holders: Vec<_> = self.locals.lock().keys().copied().collect();
        holders.sort_unstable();
        holders
    }

    /// Marks the reference destroyed. Further `up` calls are refused.
    pub fn destroy(&self) {
        let _locals = self.locals.lock();
        self.destroyed.store(true, Ordering::Release);
        if self.trace {
            tracing::trace!("Ref 0x{:x} destroyed", self.id);
        }
    }

    /// Returns true once [`destroy`](Self::destroy) was called.
    #[inline]
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const A: FusionId = FusionId::MASTER;
    const B: FusionId = FusionId::new(2);

    #[test]
    fn test_up_down() {
        let r = FusionRef::new(A, TraceRef::Off);
        assert_eq!(r.stat(), 1);
        assert_eq!(r.up(B).unwrap(), 2);
        assert_eq!(r.local(B), 1);
        assert_eq!(r.down(A).unwrap(), 1);
        assert_eq!(r.down(B).unwrap(), 0);
        assert!(r.holders().is_empty());
    }

    #[test]
    fn test_up_from_zero_refused() {
        let r = FusionRef::new(A, TraceRef::Off);
        r.down(A).unwrap();
        assert!(matches!(r.up(A), Err(FusionError::InvalidState(_))));
        assert_eq!(r.stat(), 0);
    }

    #[test]
    fn test_unbalanced_down_refused() {
        let r = FusionRef::new(A, TraceRef::Off);
        assert!(r.down(B).is_err());
        assert_eq!(r.stat(), 1);
    }

    #[test]
    fn test_release_all() {
        let r = FusionRef::new(A, TraceRef::Off);
        r.up(B).unwrap();
        r.up(B).unwrap();
        assert_eq!(r.release_all(B), (2, 1));
        assert_eq!(r.release_all(B), (0, 1));
        assert_eq!(r.release_all(A), (1, 0));
    }

    #[test]
    fn test_destroyed_refuses_up() {
        let r = FusionRef::new(A, TraceRef::All);
        r.destroy();
        assert!(r.is_destroyed());
        assert!(r.up(A).is_err());
    }

    #[test]
    fn test_concurrent_counting() {
        let r = Arc::new(FusionRef::new(A, TraceRef::Off));
        let threads: Vec<_> = (2..6)
            .map(|raw| {
                let r = Arc::clone(&r);
                std::thread::spawn(move || {
                    let me = FusionId::new(raw);
                    for _ in 0..1000 {
                        r.up(me).unwrap();
                        r.down(me).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        assert_eq!(r.stat(), 1);
        assert_eq!(r.holders(), vec![A]);
    }
}
