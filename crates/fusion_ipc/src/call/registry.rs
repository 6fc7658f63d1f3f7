//! Registered calls of one world.

use std::sync::Arc;

use parking_lot::RwLock;

use fusion_core::{FusionError, FusionId, FusionResult, SlotTable};

use super::{CallHandler, CallId, ExecFlags};

/// One registered call.
pub(crate) struct CallEntry {
    pub(crate) owner: FusionId,
    pub(crate) handler: Arc<dyn CallHandler>,
    pub(crate) ctx: u64,
    pub(crate) default_flags: ExecFlags,
    name: RwLock<Option<String>>,
}

impl CallEntry {
    pub(crate) fn name(&self) -> Option<String> {
        self.name.read().clone()
    }
}

/// Call table. Destroyed calls advance their slot generation, so stale ids
/// resolve to `NoSuchInstance`.
#[derive(Default)]
pub(crate) struct CallRegistry {
    table: RwLock<SlotTable<Arc<CallEntry>>>,
}

impl CallRegistry {
    pub(crate) fn register(
        &self,
        owner: FusionId,
        handler: Arc<dyn CallHandler>,
        ctx: u64,
        default_flags: ExecFlags,
    ) -> CallId {
        let entry = Arc::new(CallEntry {
            owner,
            handler,
            ctx,
            default_flags,
            name: RwLock::new(None),
        });
        let id = CallId::from_handle(self.table.write().insert(entry));
        tracing::debug!("{} registered by {}", id, owner);
        id
    }

    pub(crate) fn get(&self, id: CallId) -> FusionResult<Arc<CallEntry>> {
        self.table
            .read()
            .get(id.handle())
            .cloned()
            .ok_or_else(|| FusionError::NoSuchInstance(id.to_string()))
    }

    /// Destroys a call on behalf of `by`, which must own it.
    pub(crate) fn destroy(&self, id: CallId, by: FusionId) -> FusionResult<()> {
        let mut table = self.table.write();
        let owner = table
            .get(id.handle())
            .map(|entry| entry.owner)
            .ok_or_else(|| FusionError::NoSuchInstance(id.to_string()))?;
        if owner != by {
            return Err(FusionError::AccessDenied(format!("{id} is owned by {owner}, not {by}")));
        }
        table.remove(id.handle());
        tracing::debug!("{} destroyed", id);
        Ok(())
    }

    /// Removes a call regardless of owner. Returns false if it was already gone.
    pub(crate) fn remove(&self, id: CallId) -> bool {
        self.table.write().remove(id.handle()).is_some()
    }

    pub(crate) fn destroy_owned_by(&self, owner: FusionId) -> usize {
        let mut table = self.table.write();
        let handles = table.handles_where(|entry| entry.owner == owner);
        for handle in &handles {
            table.remove(*handle);
        }
        handles.len()
    }

    pub(crate) fn set_name(&self, id: CallId, by: FusionId, name: &str) -> FusionResult<()> {
        let entry = self.get(id)?;
        if entry.owner != by {
            return Err(FusionError::AccessDenied(format!("{id} is owned by {}", entry.owner)));
        }
        *entry.name.write() = Some(name.to_owned());
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.table.read().len()
    }
}
