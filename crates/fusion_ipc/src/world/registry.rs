//! Process-wide entry point: initialization and world lookup.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;

use fusion_core::{
    deadline_after, Backend, BackendKind, FakeBackend, FusionConfig, FusionError, FusionResult, InitSequence,
    SharedBackend,
};

use super::{Fusionee, WorldShared};

/// Owns the backend and the worlds of this process.
///
/// Initialization runs as an ordered sequence (config, fork handler, shared
/// memory, worlds) and is torn down in reverse on [`shutdown`](Self::shutdown)
/// or drop.
///
/// # Example
///
/// ```no_run
/// use fusion_core::FusionConfig;
/// use fusion_ipc::Registry;
///
/// let registry = Registry::shared(FusionConfig::default()).unwrap();
/// let master = registry.enter(0).unwrap();
/// let slave = registry.enter(0).unwrap();
/// assert!(master.is_master());
/// assert!(!slave.is_master());
/// ```
pub struct Registry {
    config: Arc<FusionConfig>,
    backend: Arc<dyn Backend>,
    worlds: Arc<Mutex<HashMap<u32, Weak<WorldShared>>>>,
    init: Mutex<InitSequence>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("backend", &self.backend.kind())
            .field("init", &*self.init.lock())
            .finish_non_exhaustive()
    }
}

impl Registry {
    /// Initializes Fusion on top of `backend`.
    ///
    /// # Errors
    ///
    /// - [`FusionError::Config`] for an invalid configuration
    /// - [`FusionError::Unimplemented`] if fork handlers are requested
    /// - whatever the backend reports while preparing shared memory
    pub fn new(config: FusionConfig, backend: Arc<dyn Backend>) -> FusionResult<Self> {
        let mut init = InitSequence::new();

        init.step("config", || config.validate(), || {})?;
        init.step(
            "fork-handler",
            || {
                if config.fork_handler {
                    Err(FusionError::Unimplemented("fork handlers"))
                } else {
                    Ok(())
                }
            },
            || {},
        )?;

        let cleanup = Arc::clone(&backend);
        init.step("shm", || backend.prepare(&config), move || cleanup.cleanup())?;

        let worlds: Arc<Mutex<HashMap<u32, Weak<WorldShared>>>> = Arc::new(Mutex::new(HashMap::new()));
        let table = Arc::clone(&worlds);
        init.step(
            "worlds",
            || Ok(()),
            move || {
                let alive = table.lock().drain().filter(|(_, world)| world.strong_count() > 0).count();
                if alive > 0 {
                    tracing::warn!("{} world(s) still in use at shutdown", alive);
                }
            },
        )?;

        tracing::info!("Fusion initialized ({} backend)", backend.kind());
        Ok(Self {
            config: Arc::new(config),
            backend,
            worlds,
            init: Mutex::new(init),
            closed: AtomicBool::new(false),
        })
    }

    /// Initializes Fusion with file-backed shared memory.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn shared(config: FusionConfig) -> FusionResult<Self> {
        Self::new(config, Arc::new(SharedBackend::new()))
    }

    /// Initializes the single-process fallback.
    ///
    /// # Errors
    ///
    /// See [`new`](Self::new).
    pub fn fake(config: FusionConfig) -> FusionResult<Self> {
        Self::new(config, Arc::new(FakeBackend::new()))
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Returns the backend flavour.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    /// Indices of worlds that are still in use.
    #[must_use]
    pub fn live_worlds(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self
            .worlds
            .lock()
            .iter()
            .filter(|(_, world)| world.strong_count() > 0)
            .map(|(index, _)| *index)
            .collect();
        indices.sort_unstable();
        indices
    }

    /// Enters world `index`.
    ///
    /// The first fusionee (or the first after the master died) becomes the
    /// master of a new world; everyone else joins as a slave. With
    /// `force_slave` the call waits for a master (see
    /// [`create_world`](Self::create_world)) instead.
    ///
    /// # Errors
    ///
    /// - [`FusionError::Timeout`] if no master answered within the join timeout
    /// - [`FusionError::InvalidState`] after [`shutdown`](Self::shutdown)
    pub fn enter(&self, index: u32) -> FusionResult<Fusionee> {
        let deadline = deadline_after(self.config.join_timeout());
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(FusionError::InvalidState("fusion is shut down".into()));
            }

            let existing = {
                let mut worlds = self.worlds.lock();
                match worlds.get(&index).and_then(Weak::upgrade) {
                    Some(world) if world.has_live_master() => Some(world),
                    _ if self.config.force_slave => None,
                    stale => {
                        if stale.is_some() {
                            tracing::warn!("World {} lost its master, starting over", index);
                        }
                        return self.start_world(&mut worlds, index);
                    }
                }
            };

            if let Some(world) = existing {
                return Fusionee::join(world, deadline);
            }
            if Instant::now() >= deadline {
                tracing::warn!("No master showed up in world {}", index);
                return Err(FusionError::Timeout);
            }
            std::thread::sleep(self.config.liveness_interval());
        }
    }

    /// Creates world `index` with the caller as master, even with
    /// `force_slave` set.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the world already has a live master
    /// or after [`shutdown`](Self::shutdown).
    pub fn create_world(&self, index: u32) -> FusionResult<Fusionee> {
        if self.closed.load(Ordering::Acquire) {
            return Err(FusionError::InvalidState("fusion is shut down".into()));
        }
        let mut worlds = self.worlds.lock();
        if worlds
            .get(&index)
            .and_then(Weak::upgrade)
            .is_some_and(|world| world.has_live_master())
        {
            return Err(FusionError::InvalidState(format!("world {index} already has a master")));
        }
        self.start_world(&mut worlds, index)
    }

    fn start_world(&self, worlds: &mut HashMap<u32, Weak<WorldShared>>, index: u32) -> FusionResult<Fusionee> {
        let world = Arc::new_cyclic(|this| {
            WorldShared::new(index, Arc::clone(&self.config), Arc::clone(&self.backend), this)
        });
        worlds.insert(index, Arc::downgrade(&world));
        tracing::info!("World {} created", index);
        Fusionee::master(world)
    }

    /// Tears initialization down. Further [`enter`](Self::enter) calls fail.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.init.lock().shutdown();
        tracing::info!("Fusion shut down");
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.shutdown();
    }
}
