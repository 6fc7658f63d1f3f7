//! # SHM Pools of a World
//!
//! Named pools, unique per world, with attach accounting per fusionee.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use fusion_core::{Backend, FusionConfig, FusionError, FusionId, FusionResult, PoolId, PoolOptions, ShmPool};

/// Pool table of one world.
pub(crate) struct ShmRegistry {
    world: u32,
    config: Arc<FusionConfig>,
    backend: Arc<dyn Backend>,
    pools: RwLock<HashMap<PoolId, Arc<ShmPool>>>,
    next_id: AtomicU32,
}

impl ShmRegistry {
    pub(crate) fn new(world: u32, config: Arc<FusionConfig>, backend: Arc<dyn Backend>) -> Self {
        Self {
            world,
            config,
            backend,
            pools: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn create(&self, owner: FusionId, name: &str, max_size: usize, debug: bool) -> FusionResult<Arc<ShmPool>> {
        if max_size == 0 {
            return Err(FusionError::InvalidArgument(format!("pool '{name}' needs a positive size")));
        }

        let mut pools = self.pools.write();
        if pools.values().any(|pool| pool.name() == name) {
            return Err(FusionError::InvalidArgument(format!(
                "pool '{name}' already exists in world {}",
                self.world
            )));
        }

        let id = PoolId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let storage = self.backend.create_storage(&self.config, self.world, id, max_size)?;
        let options = PoolOptions {
            debug: debug || self.config.debugshm,
            discard_on_free: self.config.madv_remove,
            secure: self.config.secure_fusion,
        };
        let pool = Arc::new(ShmPool::new(id, name, owner, storage, options)?);
        pools.insert(id, Arc::clone(&pool));

        tracing::info!(
            "Pool '{}' ({}, {} bytes) created by {} in world {}",
            name,
            id,
            max_size,
            owner,
            self.world
        );
        Ok(pool)
    }

    pub(crate) fn get(&self, id: PoolId) -> FusionResult<Arc<ShmPool>> {
        self.pools
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FusionError::NoSuchInstance(format!("{id} in world {}", self.world)))
    }

    pub(crate) fn find(&self, name: &str) -> FusionResult<Arc<ShmPool>> {
        self.pools
            .read()
            .values()
            .find(|pool| pool.name() == name)
            .cloned()
            .ok_or_else(|| FusionError::NoSuchInstance(format!("pool '{name}' in world {}", self.world)))
    }

    pub(crate) fn attach(&self, process: FusionId, id: PoolId) -> FusionResult<Arc<ShmPool>> {
        let pool = self.get(id)?;
        let count = pool.attach(process)?;
        tracing::debug!("{} attached '{}' ({} times)", process, pool.name(), count);
        Ok(pool)
    }

    pub(crate) fn detach(&self, process: FusionId, id: PoolId) -> FusionResult<u32> {
        let pool = self.get(id)?;
        let remaining = pool.detach(process)?;
        if remaining == 0 {
            tracing::debug!("{} unmapped '{}'", process, pool.name());
        }
        Ok(remaining)
    }

    pub(crate) fn grant(&self, by: FusionId, id: PoolId, to: FusionId) -> FusionResult<()> {
        let pool = self.get(id)?;
        if pool.owner() != by {
            return Err(FusionError::AccessDenied(format!(
                "only {} may grant access to '{}'",
                pool.owner(),
                pool.name()
            )));
        }
        pool.grant(to);
        Ok(())
    }

    pub(crate) fn destroy(&self, process: FusionId, id: PoolId) -> FusionResult<()> {
        let mut pools = self.pools.write();
        let pool = pools
            .get(&id)
            .ok_or_else(|| FusionError::NoSuchInstance(format!("{id} in world {}", self.world)))?;

        if pool.owner() != process {
            return Err(FusionError::AccessDenied(format!(
                "'{}' is owned by {}, not {}",
                pool.name(),
                pool.owner(),
                process
            )));
        }
        if let Err(err) = pool.destroy() {
            if self.config.shutdown_info && pool.stats().allocations > 0 {
                pool.print_leaks();
            }
            return Err(err);
        }

        let name = pool.name().to_owned();
        pools.remove(&id);
        tracing::info!("Pool '{}' destroyed in world {}", name, self.world);
        Ok(())
    }

    /// Drops every attachment of a departed fusionee.
    pub(crate) fn detach_all(&self, process: FusionId) -> usize {
        self.pools
            .read()
            .values()
            .filter(|pool| pool.detach_all(process) > 0)
            .count()
    }

    pub(crate) fn print_leaks(&self) {
        for pool in self.pools.read().values() {
            pool.print_leaks();
        }
    }
}
