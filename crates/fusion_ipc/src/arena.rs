//! # Arenas
//!
//! Named meeting points inside a world. The first fusionee to enter an
//! arena initializes it, later ones join it, and the last one to exit
//! shuts it down. Entering fusionees exchange data through named shared
//! fields.
//!
//! Enter and exit run their callbacks under the arena's skirmish, so an
//! initializer is finished before anybody joins.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use fusion_core::{FusionError, FusionId, FusionResult};

use crate::reference::FusionRef;
use crate::skirmish::Skirmish;
use crate::world::{Fusionee, WorldShared};

/// Outcome of an arena callback; `Err` carries a code reported as
/// [`FusionError::HandlerFailed`].
pub type ArenaResult = Result<(), i32>;

/// A named arena of a world.
pub struct Arena {
    name: String,
    reference: FusionRef,
    lock: Arc<Skirmish>,
    fields: Mutex<HashMap<String, Vec<u8>>>,
    removed: AtomicBool,
}

impl fmt::Debug for Arena {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("name", &self.name)
            .field("refs", &self.reference.stat())
            .finish_non_exhaustive()
    }
}

impl Arena {
    /// Returns the arena name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of fusionees inside.
    #[must_use]
    pub fn refs(&self) -> u32 {
        self.reference.stat()
    }

    /// Stores a shared field, replacing an earlier value of that name.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the arena was shut down.
    pub fn add_shared_field(&self, fusionee: &Fusionee, name: &str, value: Vec<u8>) -> FusionResult<()> {
        let _guard = self.lock.lock(fusionee)?;
        self.check_open()?;
        self.fields.lock().insert(name.to_owned(), value);
        Ok(())
    }

    /// Returns a copy of a shared field.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if no field has that name.
    pub fn shared_field(&self, fusionee: &Fusionee, name: &str) -> FusionResult<Vec<u8>> {
        let _guard = self.lock.lock(fusionee)?;
        self.check_open()?;
        self.fields
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| FusionError::NoSuchInstance(format!("field '{name}' of arena '{}'", self.name)))
    }

    fn check_open(&self) -> FusionResult<()> {
        if self.removed.load(Ordering::Acquire) {
            Err(FusionError::InvalidState(format!("arena '{}' was shut down", self.name)))
        } else {
            Ok(())
        }
    }
}

/// Arenas of one world, by name.
#[derive(Default)]
pub(crate) struct ArenaTable {
    arenas: Mutex<HashMap<String, Arc<Arena>>>,
}

impl ArenaTable {
    fn unlink(&self, arena: &Arc<Arena>) {
        arena.removed.store(true, Ordering::Release);
        let mut arenas = self.arenas.lock();
        if arenas.get(&arena.name).is_some_and(|linked| Arc::ptr_eq(linked, arena)) {
            arenas.remove(&arena.name);
        }
    }

    /// Enters an arena, creating it if needed.
    pub(crate) fn enter(
        world: &Arc<WorldShared>,
        fusion_id: FusionId,
        name: &str,
        initialize: impl FnOnce(&Arena) -> ArenaResult,
        join: impl FnOnce(&Arena) -> ArenaResult,
    ) -> FusionResult<Arc<Arena>> {
        let table = &world.arenas;
        loop {
            let (arena, created) = {
                let mut arenas = table.arenas.lock();
                if let Some(arena) = arenas.get(name) {
                    (Arc::clone(arena), false)
                } else {
                    let arena = Arc::new(Arena {
                        name: name.to_owned(),
                        reference: FusionRef::new(fusion_id, world.config.trace_ref),
                        lock: Skirmish::in_world(world, name),
                        fields: Mutex::new(HashMap::new()),
                        removed: AtomicBool::new(false),
                    });
                    // Fresh, so this never blocks; joiners wait for the initializer
                    arena.lock.prevail_as(fusion_id)?;
                    arenas.insert(name.to_owned(), Arc::clone(&arena));
                    (arena, true)
                }
            };

            if !created {
                arena.lock.prevail_as(fusion_id)?;
                if arena.removed.load(Ordering::Acquire) {
                    // Shut down while we waited
                    arena.lock.dismiss_as(fusion_id)?;
                    continue;
                }
                if let Err(e) = arena.reference.up(fusion_id) {
                    arena.lock.dismiss_as(fusion_id)?;
                    return Err(e);
                }
            }

            let result = if created { initialize(&arena) } else { join(&arena) };
            if let Err(code) = result {
                if arena.reference.down(fusion_id)? == 0 {
                    table.unlink(&arena);
                    arena.reference.destroy();
                }
                arena.lock.dismiss_as(fusion_id)?;
                tracing::warn!(
                    "{} of arena '{}' by {} failed with code {}",
                    if created { "Initialization" } else { "Join" },
                    name,
                    fusion_id,
                    code
                );
                return Err(FusionError::HandlerFailed { code });
            }

            arena.lock.dismiss_as(fusion_id)?;
            tracing::debug!(
                "{} {} arena '{}' ({} inside)",
                fusion_id,
                if created { "initialized" } else { "joined" },
                name,
                arena.refs()
            );
            return Ok(arena);
        }
    }

    /// Exits an arena. The last one out runs `shutdown`, everybody else
    /// runs `leave`.
    pub(crate) fn exit(
        world: &WorldShared,
        fusion_id: FusionId,
        arena: &Arc<Arena>,
        shutdown: impl FnOnce(&Arena, bool) -> ArenaResult,
        leave: Option<&mut dyn FnMut(&Arena, bool) -> ArenaResult>,
        emergency: bool,
    ) -> FusionResult<()> {
        arena.lock.prevail_as(fusion_id)?;
        let result = Self::exit_locked(world, fusion_id, arena, shutdown, leave, emergency);
        arena.lock.dismiss_as(fusion_id)?;
        result
    }

    fn exit_locked(
        world: &WorldShared,
        fusion_id: FusionId,
        arena: &Arc<Arena>,
        shutdown: impl FnOnce(&Arena, bool) -> ArenaResult,
        leave: Option<&mut dyn FnMut(&Arena, bool) -> ArenaResult>,
        emergency: bool,
    ) -> FusionResult<()> {
        arena.check_open()?;
        let remaining = arena.reference.down(fusion_id)?;

        if remaining == 0 {
            let result = shutdown(arena, emergency);
            world.arenas.unlink(arena);
            arena.reference.destroy();
            arena.fields.lock().clear();
            tracing::debug!("Arena '{}' shut down by {}", arena.name, fusion_id);
            return result.map_err(|code| FusionError::HandlerFailed { code });
        }

        match leave {
            Some(leave) => leave(arena, emergency).map_err(|code| FusionError::HandlerFailed { code }),
            None => {
                arena.reference.up(fusion_id)?;
                Err(FusionError::Busy(format!(
                    "arena '{}' still has {} other fusionee(s)",
                    arena.name, remaining
                )))
            }
        }
    }

    /// Drops the references of a departed fusionee. Arenas nobody is in
    /// any more are unlinked without a shutdown callback.
    pub(crate) fn member_left(&self, id: FusionId) -> usize {
        let arenas: Vec<Arc<Arena>> = self.arenas.lock().values().cloned().collect();
        let mut abandoned = 0;
        for arena in arenas {
            let (released, remaining) = arena.reference.release_all(id);
            if released > 0 && remaining == 0 {
                tracing::warn!("Arena '{}' abandoned by departed {}", arena.name, id);
                self.unlink(&arena);
                arena.reference.destroy();
                abandoned += 1;
            }
        }
        abandoned
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, name: &str) -> bool {
        self.arenas.lock().contains_key(name)
    }
}
