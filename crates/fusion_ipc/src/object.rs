//! # Object Pools
//!
//! Typed, reference-counted objects whose payload lives in an SHM pool.
//!
//! Every object occupies a slot of a generation-checked table. When its
//! count reaches zero the slot is freed and its generation advances, so an
//! old [`ObjectHandle`] can never reach a recycled object: every access
//! through it is reported as [`FusionError::InvalidState`].
//!
//! ## Lifecycle
//!
//! ```text
//! create ──> Active ──(last unref)──> Deinit ──> reclaimed
//!                                       │
//!                  defer_destructors ───┴──> queued until a batch is full or reap()
//! ```
//!
//! Reclamation runs the destructor, returns the payload to the SHM pool and
//! releases the object's reactor. It happens exactly once per object, even
//! when [`ObjectPool::destroy`] races with the last unref.
//!
//! ## Metadata
//!
//! Besides its payload an object carries named properties, a list of owning
//! fusionees and a list of executables allowed to access it. Patterns in the
//! access list ending in `*` match by prefix.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use bytemuck::Pod;
use parking_lot::{Mutex, RwLock};

use fusion_core::{FusionError, FusionId, FusionResult, Handle, ShmBlock, ShmPool, SlotTable};

use crate::call::CallId;
use crate::reactor::{DispatchReport, GlobalReaction, GlobalReactionId, Listener, ReactorId};
use crate::reference::FusionRef;
use crate::world::{Fusionee, MemberCleanup, WorldShared};

type Destructor<T> = Box<dyn Fn(&ObjectInfo, T) + Send + Sync>;

/// Lifecycle state of an object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ObjectState {
    /// Being constructed.
    Init = 0,
    /// Reachable.
    Active = 1,
    /// Count reached zero, awaiting or undergoing reclamation.
    Deinit = 2,
}

impl ObjectState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Init,
            1 => Self::Active,
            _ => Self::Deinit,
        }
    }
}

/// Typed handle to an object of an [`ObjectPool`].
pub struct ObjectHandle<T> {
    pool: u32,
    handle: Handle,
    _type: PhantomData<fn() -> T>,
}

impl<T> ObjectHandle<T> {
    /// Raw slot handle.
    #[inline]
    #[must_use]
    pub const fn handle(&self) -> Handle {
        self.handle
    }
}

impl<T> Clone for ObjectHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ObjectHandle<T> {}

impl<T> PartialEq for ObjectHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.pool == other.pool && self.handle == other.handle
    }
}

impl<T> Eq for ObjectHandle<T> {}

impl<T> Hash for ObjectHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pool.hash(state);
        self.handle.hash(state);
    }
}

impl<T> fmt::Debug for ObjectHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectHandle({}/{})", self.pool, self.handle)
    }
}

/// Snapshot of an object's bookkeeping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Id unique within the pool.
    pub id: u64,
    /// Fusionee that created it.
    pub creator: FusionId,
    /// Lifecycle state.
    pub state: ObjectState,
    /// Global reference count.
    pub refs: u32,
    /// The object's notification channel.
    pub reactor: ReactorId,
}

/// Object pool statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ObjectPoolStats {
    /// Reachable objects.
    pub live: usize,
    /// Objects waiting for deferred reclamation.
    pub pending: usize,
    /// Objects created so far.
    pub created: u64,
    /// Objects reclaimed so far.
    pub reclaimed: u64,
}

#[derive(Default)]
struct ObjectMeta {
    properties: HashMap<String, Vec<u8>>,
    owners: Vec<FusionId>,
    access: Vec<String>,
}

struct ObjectSlot {
    id: u64,
    creator: FusionId,
    block: ShmBlock,
    reference: FusionRef,
    reactor: ReactorId,
    state: AtomicU8,
    finalized: AtomicBool,
    calls: Mutex<Vec<CallId>>,
    meta: Mutex<ObjectMeta>,
}

impl ObjectSlot {
    fn state(&self) -> ObjectState {
        ObjectState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn info(&self) -> ObjectInfo {
        ObjectInfo {
            id: self.id,
            creator: self.creator,
            state: self.state(),
            refs: self.reference.stat(),
            reactor: self.reactor,
        }
    }
}

/// Factory and table of one object type, bound to one SHM pool.
pub struct ObjectPool<T: Pod> {
    serial: u32,
    name: String,
    world: Arc<WorldShared>,
    shm: Arc<ShmPool>,
    objects: RwLock<SlotTable<Arc<ObjectSlot>>>,
    /// Reached zero, not reclaimed yet.
    zombies: Mutex<Vec<Arc<ObjectSlot>>>,
    next_id: AtomicU64,
    created: AtomicU64,
    reclaimed: AtomicU64,
    destructor: Option<Destructor<T>>,
}

impl<T: Pod> fmt::Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectPool")
            .field("name", &self.name)
            .field("shm", &self.shm.name())
            .field("objects", &self.size())
            .finish_non_exhaustive()
    }
}

impl<T: Pod> ObjectPool<T> {
    /// Creates a pool of `T` objects stored in `shm`.
    ///
    /// # Arguments
    ///
    /// * `fusionee` - Joined fusionee creating the pool
    /// * `shm` - SHM pool holding the payloads
    /// * `name` - Name used in logs and dumps
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if `fusionee` is not joined,
    /// [`FusionError::InvalidArgument`] if `shm` belongs to another world.
    pub fn create(fusionee: &Fusionee, shm: &Arc<ShmPool>, name: &str) -> FusionResult<Arc<Self>> {
        Self::build(fusionee, shm, name, None)
    }

    /// Like [`create`](Self::create), with a destructor run on every
    /// reclaimed object.
    ///
    /// # Errors
    ///
    /// See [`create`](Self::create).
    pub fn create_with_destructor(
        fusionee: &Fusionee,
        shm: &Arc<ShmPool>,
        name: &str,
        destructor: impl Fn(&ObjectInfo, T) + Send + Sync + 'static,
    ) -> FusionResult<Arc<Self>> {
        Self::build(fusionee, shm, name, Some(Box::new(destructor)))
    }

    fn build(
        fusionee: &Fusionee,
        shm: &Arc<ShmPool>,
        name: &str,
        destructor: Option<Destructor<T>>,
    ) -> FusionResult<Arc<Self>> {
        fusionee.ensure_joined()?;
        let world = Arc::clone(fusionee.world());
        let registered = world.shm.get(shm.id())?;
        if !Arc::ptr_eq(&registered, shm) {
            return Err(FusionError::InvalidArgument(format!(
                "pool '{}' is not part of world {}",
                shm.name(),
                world.index
            )));
        }

        let pool = Arc::new(Self {
            serial: world.next_object_pool_id(),
            name: name.to_owned(),
            world: Arc::clone(&world),
            shm: Arc::clone(shm),
            objects: RwLock::new(SlotTable::new()),
            zombies: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            created: AtomicU64::new(0),
            reclaimed: AtomicU64::new(0),
            destructor,
        });
        let cleanup: Weak<dyn MemberCleanup> = Arc::downgrade(&pool) as Weak<Self>;
        world.register_cleanup(cleanup);

        tracing::debug!("Object pool '{}' created in '{}'", name, shm.name());
        Ok(pool)
    }

    /// Returns the pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the SHM pool holding the payloads.
    #[must_use]
    pub fn shm(&self) -> &Arc<ShmPool> {
        &self.shm
    }

    fn check_world(&self, fusionee: &Fusionee) -> FusionResult<()> {
        fusionee.ensure_joined()?;
        if Arc::ptr_eq(fusionee.world(), &self.world) {
            Ok(())
        } else {
            Err(FusionError::InvalidArgument(format!(
                "{} is not a member of the world of '{}'",
                fusionee.id(),
                self.name
            )))
        }
    }

    fn slot(&self, handle: ObjectHandle<T>) -> FusionResult<Arc<ObjectSlot>> {
        if handle.pool != self.serial {
            tracing::error!("'{}': {:?} belongs to another pool", self.name, handle);
            return Err(FusionError::InvalidState(format!("{handle:?} belongs to another pool")));
        }
        match self.objects.read().get(handle.handle) {
            Some(slot) => Ok(Arc::clone(slot)),
            None => {
                tracing::error!("'{}': access through stale {:?}", self.name, handle);
                Err(FusionError::InvalidState(format!("{handle:?} is stale")))
            }
        }
    }

    /// Creates an object holding `value`, referenced once by `fusionee`.
    ///
    /// # Errors
    ///
    /// - [`FusionError::OutOfMemory`] if the SHM pool is full
    /// - [`FusionError::InvalidState`] if `fusionee` is not joined or has
    ///   not attached the SHM pool
    pub fn create_object(&self, fusionee: &Fusionee, value: T) -> FusionResult<ObjectHandle<T>> {
        self.check_world(fusionee)?;
        let creator = fusionee.id();
        if !self.shm.is_attached(creator) {
            return Err(FusionError::InvalidState(format!(
                "{creator} has not attached '{}'",
                self.shm.name()
            )));
        }

        let block = self.shm.allocate(size_of::<T>().max(1), false)?;
        if let Err(e) = self.shm.write(block, 0, bytemuck::bytes_of(&value)) {
            let _ = self.shm.deallocate(block);
            return Err(e);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ObjectSlot {
            id,
            creator,
            block,
            reference: FusionRef::new(creator, self.world.config.trace_ref),
            reactor: self.world.reactors.create(creator),
            state: AtomicU8::new(ObjectState::Init as u8),
            finalized: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            meta: Mutex::new(ObjectMeta::default()),
        });
        let handle = self.objects.write().insert(Arc::clone(&slot));
        slot.state.store(ObjectState::Active as u8, Ordering::Release);
        self.created.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("'{}': object {} created by {}", self.name, id, creator);
        Ok(ObjectHandle {
            pool: self.serial,
            handle,
            _type: PhantomData,
        })
    }

    /// Copies the payload out.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn get(&self, handle: ObjectHandle<T>) -> FusionResult<T> {
        let slot = self.slot(handle)?;
        self.shm
            .with_bytes(slot.block, |bytes| bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()]))
    }

    /// Modifies the payload in place under the SHM pool lock.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn update<R>(&self, handle: ObjectHandle<T>, f: impl FnOnce(&mut T) -> R) -> FusionResult<R> {
        let slot = self.slot(handle)?;
        self.shm.with_bytes_mut(slot.block, |bytes| {
            let bytes = &mut bytes[..size_of::<T>()];
            let mut value: T = bytemuck::pod_read_unaligned(bytes);
            let result = f(&mut value);
            bytes.copy_from_slice(bytemuck::bytes_of(&value));
            result
        })
    }

    /// Adds a reference held by `fusionee`. Returns the new count.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles or objects whose
    /// count already reached zero.
    pub fn ref_object(&self, fusionee: &Fusionee, handle: ObjectHandle<T>) -> FusionResult<u32> {
        self.check_world(fusionee)?;
        self.slot(handle)?.reference.up(fusionee.id())
    }

    /// Drops a reference held by `fusionee`. Returns the remaining count;
    /// at zero the object is destroyed.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles or if `fusionee`
    /// holds no reference.
    pub fn unref_object(&self, fusionee: &Fusionee, handle: ObjectHandle<T>) -> FusionResult<u32> {
        self.check_world(fusionee)?;
        let slot = self.slot(handle)?;
        let remaining = slot.reference.down(fusionee.id())?;
        if remaining == 0 {
            self.retire(handle.handle, slot);
        }
        Ok(remaining)
    }

    /// Returns the bookkeeping of an object.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn info(&self, handle: ObjectHandle<T>) -> FusionResult<ObjectInfo> {
        Ok(self.slot(handle)?.info())
    }

    /// Listens to one channel of the object's reactor.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn attach(&self, fusionee: &Fusionee, handle: ObjectHandle<T>, channel: u32) -> FusionResult<Listener> {
        self.check_world(fusionee)?;
        let slot = self.slot(handle)?;
        self.world.reactors.attach(slot.reactor, fusionee.id(), channel)
    }

    /// Publishes a message on one channel of the object's reactor. The
    /// delivered messages carry the object id as reference.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn dispatch(
        &self,
        fusionee: &Fusionee,
        handle: ObjectHandle<T>,
        channel: u32,
        message: &[u8],
    ) -> FusionResult<DispatchReport> {
        self.dispatch_with_globals(fusionee, handle, channel, message, &[])
    }

    /// Like [`dispatch`](Self::dispatch), running the object's global
    /// reactions from `globals` on channel 0.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles,
    /// [`FusionError::InvalidArgument`] for oversized messages.
    pub fn dispatch_with_globals(
        &self,
        fusionee: &Fusionee,
        handle: ObjectHandle<T>,
        channel: u32,
        message: &[u8],
        globals: &[GlobalReaction],
    ) -> FusionResult<DispatchReport> {
        self.check_world(fusionee)?;
        let slot = self.slot(handle)?;
        self.world
            .reactors
            .dispatch(slot.reactor, fusionee.id(), channel, slot.id, message, globals)
    }

    /// Attaches entry `index` of the global reaction table to the object's
    /// reactor.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn attach_global(&self, handle: ObjectHandle<T>, index: usize, ctx: u64) -> FusionResult<GlobalReactionId> {
        let slot = self.slot(handle)?;
        self.world.reactors.attach_global(slot.reactor, index, ctx)
    }

    /// Ties a call to the object: the call is destroyed with it.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] unless `fusionee` owns the call,
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn bind_call(&self, fusionee: &Fusionee, handle: ObjectHandle<T>, call: CallId) -> FusionResult<()> {
        self.check_world(fusionee)?;
        let slot = self.slot(handle)?;
        let owner = self.world.calls.get(call)?.owner;
        if owner != fusionee.id() {
            return Err(FusionError::AccessDenied(format!("{call} is owned by {owner}")));
        }
        slot.calls.lock().push(call);
        Ok(())
    }

    /// Sets a property, returning the value it replaced.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn set_property(&self, handle: ObjectHandle<T>, key: &str, value: Vec<u8>) -> FusionResult<Option<Vec<u8>>> {
        let slot = self.slot(handle)?;
        let old = slot.meta.lock().properties.insert(key.to_owned(), value);
        Ok(old)
    }

    /// Returns a copy of a property.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn property(&self, handle: ObjectHandle<T>, key: &str) -> FusionResult<Option<Vec<u8>>> {
        let slot = self.slot(handle)?;
        let value = slot.meta.lock().properties.get(key).cloned();
        Ok(value)
    }

    /// Removes a property, returning its value.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn remove_property(&self, handle: ObjectHandle<T>, key: &str) -> FusionResult<Option<Vec<u8>>> {
        let slot = self.slot(handle)?;
        let old = slot.meta.lock().properties.remove(key);
        Ok(old)
    }

    /// Records `owner` as an owner of the object. Adding twice is a no-op.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn add_owner(&self, handle: ObjectHandle<T>, owner: FusionId) -> FusionResult<()> {
        let slot = self.slot(handle)?;
        let mut meta = slot.meta.lock();
        if !meta.owners.contains(&owner) {
            tracing::debug!("'{}': {} owns object {}", self.name, owner, slot.id);
            meta.owners.push(owner);
        }
        Ok(())
    }

    /// Owners of the object, in the order they were added.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn owners(&self, handle: ObjectHandle<T>) -> FusionResult<Vec<FusionId>> {
        Ok(self.slot(handle)?.meta.lock().owners.clone())
    }

    /// Checks that `owner` owns the object. An object without owners passes
    /// if `succeed_if_not_owned` is set.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] if `owner` is not an owner,
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn check_owner(&self, handle: ObjectHandle<T>, owner: FusionId, succeed_if_not_owned: bool) -> FusionResult<()> {
        let slot = self.slot(handle)?;
        let meta = slot.meta.lock();
        if (succeed_if_not_owned && meta.owners.is_empty()) || meta.owners.contains(&owner) {
            Ok(())
        } else {
            Err(FusionError::AccessDenied(format!(
                "{owner} does not own object {} of '{}'",
                slot.id, self.name
            )))
        }
    }

    /// Allows an executable to access the object. A trailing `*` turns the
    /// entry into a prefix.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] for an empty entry,
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn add_access(&self, handle: ObjectHandle<T>, executable: &str) -> FusionResult<()> {
        if executable.is_empty() {
            return Err(FusionError::InvalidArgument("empty access entry".into()));
        }
        let slot = self.slot(handle)?;
        slot.meta.lock().access.push(executable.to_owned());
        Ok(())
    }

    /// Checks `executable` against the access list.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] if no entry matches,
    /// [`FusionError::InvalidState`] for stale handles.
    pub fn has_access(&self, handle: ObjectHandle<T>, executable: &str) -> FusionResult<()> {
        let slot = self.slot(handle)?;
        let meta = slot.meta.lock();
        let granted = meta.access.iter().any(|entry| match entry.strip_suffix('*') {
            Some(prefix) => executable.starts_with(prefix),
            None => entry == executable,
        });
        if granted {
            Ok(())
        } else {
            Err(FusionError::AccessDenied(format!(
                "'{executable}' may not access object {} of '{}'",
                slot.id, self.name
            )))
        }
    }

    /// Finds a live object by id.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if no live object has that id.
    pub fn lookup(&self, id: u64) -> FusionResult<ObjectHandle<T>> {
        self.objects
            .read()
            .iter()
            .find(|(_, slot)| slot.id == id)
            .map(|(handle, _)| ObjectHandle {
                pool: self.serial,
                handle,
                _type: PhantomData,
            })
            .ok_or_else(|| FusionError::NoSuchInstance(format!("object {id} in '{}'", self.name)))
    }

    /// Bookkeeping of every live object, ordered by id.
    #[must_use]
    pub fn enumerate(&self) -> Vec<ObjectInfo> {
        let mut infos: Vec<_> = self.objects.read().iter().map(|(_, slot)| slot.info()).collect();
        infos.sort_unstable_by_key(|info| info.id);
        infos
    }

    /// Number of live objects.
    #[must_use]
    pub fn size(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns pool statistics.
    #[must_use]
    pub fn stats(&self) -> ObjectPoolStats {
        ObjectPoolStats {
            live: self.size(),
            pending: self.zombies.lock().len(),
            created: self.created.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }

    /// Reclaims every object awaiting deferred destruction. Returns how many.
    pub fn reap(&self) -> usize {
        let batch = std::mem::take(&mut *self.zombies.lock());
        let count = batch.len();
        for slot in batch {
            self.finalize(&slot);
        }
        count
    }

    /// Destroys every remaining object regardless of its count. Returns how
    /// many were still alive.
    pub fn destroy(&self) -> usize {
        let remaining: Vec<(Handle, Arc<ObjectSlot>)> = {
            let mut objects = self.objects.write();
            let handles: Vec<Handle> = objects.iter().map(|(handle, _)| handle).collect();
            handles
                .into_iter()
                .filter_map(|handle| objects.remove(handle).map(|slot| (handle, slot)))
                .collect()
        };

        let count = remaining.len();
        if count > 0 && self.world.config.shutdown_info {
            tracing::warn!("'{}': {} object(s) still alive at destruction", self.name, count);
            for (_, slot) in &remaining {
                let info = slot.info();
                tracing::warn!(
                    "  object {} created by {} ({:?}, {} refs, holders {:?})",
                    info.id,
                    info.creator,
                    info.state,
                    info.refs,
                    slot.reference.holders()
                );
            }
        }

        for (_, slot) in remaining {
            self.deinit(&slot);
            self.finalize(&slot);
        }
        self.reap();
        count
    }

    /// Count reached zero: unlink now, reclaim now or later.
    fn retire(&self, handle: Handle, slot: Arc<ObjectSlot>) {
        if self.objects.write().remove(handle).is_none() {
            // destroy() unlinked it first and reclaims it
            return;
        }
        self.deinit(&slot);

        if !self.world.config.defer_destructors {
            self.finalize(&slot);
            return;
        }

        let batch = {
            let mut zombies = self.zombies.lock();
            zombies.push(slot);
            if zombies.len() >= self.world.config.destructor_batch {
                std::mem::take(&mut *zombies)
            } else {
                Vec::new()
            }
        };
        for slot in batch {
            self.finalize(&slot);
        }
    }

    fn deinit(&self, slot: &ObjectSlot) {
        slot.state.store(ObjectState::Deinit as u8, Ordering::Release);
        slot.reference.destroy();
        for call in slot.calls.lock().drain(..) {
            self.world.calls.remove(call);
        }
        tracing::debug!("'{}': object {} deinitialized", self.name, slot.id);
    }

    fn finalize(&self, slot: &ObjectSlot) {
        if slot.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(destructor) = &self.destructor {
            match self.shm.read(slot.block) {
                Ok(bytes) => destructor(&slot.info(), bytemuck::pod_read_unaligned(&bytes[..size_of::<T>()])),
                Err(e) => tracing::error!("'{}': payload of object {} lost: {}", self.name, slot.id, e),
            }
        }
        if let Err(e) = self.shm.deallocate(slot.block) {
            tracing::error!("'{}': freeing object {} failed: {}", self.name, slot.id, e);
        }
        if let Err(e) = self.world.reactors.release(slot.reactor) {
            tracing::debug!("'{}': reactor of object {} already gone: {}", self.name, slot.id, e);
        }
        self.reclaimed.fetch_add(1, Ordering::Relaxed);
    }
}

impl<T: Pod> MemberCleanup for ObjectPool<T> {
    fn member_left(&self, id: FusionId) {
        let slots: Vec<(Handle, Arc<ObjectSlot>)> = self
            .objects
            .read()
            .iter()
            .map(|(handle, slot)| (handle, Arc::clone(slot)))
            .collect();

        let mut destroyed = 0;
        for (handle, slot) in slots {
            slot.meta.lock().owners.retain(|&owner| owner != id);
            let (released, remaining) = slot.reference.release_all(id);
            if released > 0 && remaining == 0 {
                self.retire(handle, slot);
                destroyed += 1;
            }
        }
        if destroyed > 0 {
            tracing::info!("'{}': {} object(s) destroyed after {} left", self.name, destroyed, id);
        }
    }
}

impl<T: Pod> Drop for ObjectPool<T> {
    fn drop(&mut self) {
        let remaining = self.destroy();
        if remaining > 0 {
            tracing::warn!("Object pool '{}' dropped with {} live object(s)", self.name, remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Registry;
    use bytemuck::Zeroable;
    use fusion_core::FusionConfig;
    use std::sync::atomic::AtomicUsize;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
    struct Counter {
        value: u64,
    }

    fn setup(config: FusionConfig) -> (Registry, Fusionee, Arc<ShmPool>) {
        let registry = Registry::fake(config).unwrap();
        let master = registry.enter(0).unwrap();
        let shm = master.pool_create("objects", 4096, false).unwrap();
        (registry, master, shm)
    }

    #[test]
    fn test_create_get_update() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();

        let handle = pool.create_object(&master, Counter { value: 7 }).unwrap();
        assert_eq!(pool.get(handle).unwrap().value, 7);
        pool.update(handle, |c| c.value += 1).unwrap();
        assert_eq!(pool.get(handle).unwrap().value, 8);

        let info = pool.info(handle).unwrap();
        assert_eq!(info.state, ObjectState::Active);
        assert_eq!(info.refs, 1);
        assert_eq!(pool.lookup(info.id).unwrap(), handle);
    }

    #[test]
    fn test_last_unref_reclaims() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();

        let handle = pool.create_object(&master, Counter::zeroed()).unwrap();
        assert_eq!(pool.ref_object(&master, handle).unwrap(), 2);
        assert_eq!(pool.unref_object(&master, handle).unwrap(), 1);
        assert_eq!(pool.unref_object(&master, handle).unwrap(), 0);

        assert!(matches!(pool.get(handle), Err(FusionError::InvalidState(_))));
        assert!(matches!(pool.ref_object(&master, handle), Err(FusionError::InvalidState(_))));
        assert_eq!(shm.stats().allocations, 0);
        assert_eq!(pool.stats().reclaimed, 1);
    }

    #[test]
    fn test_stale_handle_after_reuse() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();

        let old = pool.create_object(&master, Counter { value: 1 }).unwrap();
        pool.unref_object(&master, old).unwrap();
        let new = pool.create_object(&master, Counter { value: 2 }).unwrap();

        assert_eq!(old.handle().index(), new.handle().index());
        assert!(pool.get(old).is_err());
        assert_eq!(pool.get(new).unwrap().value, 2);
    }

    #[test]
    fn test_deferred_destruction_in_batches() {
        let config = FusionConfig {
            defer_destructors: true,
            destructor_batch: 3,
            ..FusionConfig::default()
        };
        let (_registry, master, shm) = setup(config);
        let destroyed = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&destroyed);
        let pool = ObjectPool::<Counter>::create_with_destructor(&master, &shm, "counters", move |_, _| {
            seen.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let handles: Vec<_> = (0..5)
            .map(|i| pool.create_object(&master, Counter { value: i }).unwrap())
            .collect();
        for handle in &handles[..2] {
            pool.unref_object(&master, *handle).unwrap();
        }
        // Unlinked right away, reclaimed later
        assert_eq!(pool.size(), 3);
        assert_eq!(destroyed.load(Ordering::SeqCst), 0);
        assert_eq!(pool.stats().pending, 2);

        pool.unref_object(&master, handles[2]).unwrap();
        assert_eq!(destroyed.load(Ordering::SeqCst), 3);

        pool.unref_object(&master, handles[3]).unwrap();
        assert_eq!(pool.reap(), 1);
        assert_eq!(destroyed.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_destroy_reclaims_zombies() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();
        let handle = pool.create_object(&master, Counter::zeroed()).unwrap();
        pool.ref_object(&master, handle).unwrap();

        assert_eq!(pool.destroy(), 1);
        assert_eq!(pool.size(), 0);
        assert_eq!(shm.stats().allocations, 0);
    }

    #[test]
    fn test_enumerate_in_id_order() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();
        for value in 0..4 {
            pool.create_object(&master, Counter { value }).unwrap();
        }
        let ids: Vec<u64> = pool.enumerate().iter().map(|info| info.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4]);
        assert!(pool.lookup(99).is_err());
    }

    #[test]
    fn test_properties_replace_and_remove() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();
        let handle = pool.create_object(&master, Counter::zeroed()).unwrap();

        assert_eq!(pool.property(handle, "name").unwrap(), None);
        assert_eq!(pool.set_property(handle, "name", b"first".to_vec()).unwrap(), None);
        assert_eq!(
            pool.set_property(handle, "name", b"second".to_vec()).unwrap().as_deref(),
            Some(&b"first"[..])
        );
        assert_eq!(pool.property(handle, "name").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(pool.remove_property(handle, "name").unwrap().as_deref(), Some(&b"second"[..]));
        assert_eq!(pool.remove_property(handle, "name").unwrap(), None);

        pool.unref_object(&master, handle).unwrap();
        assert!(matches!(pool.property(handle, "name"), Err(FusionError::InvalidState(_))));
    }

    #[test]
    fn test_owner_checks() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();
        let handle = pool.create_object(&master, Counter::zeroed()).unwrap();
        let other = FusionId::new(9);

        pool.check_owner(handle, other, true).unwrap();
        assert!(matches!(pool.check_owner(handle, other, false), Err(FusionError::AccessDenied(_))));

        pool.add_owner(handle, master.id()).unwrap();
        pool.add_owner(handle, master.id()).unwrap();
        assert_eq!(pool.owners(handle).unwrap(), vec![master.id()]);
        pool.check_owner(handle, master.id(), false).unwrap();
        assert!(pool.check_owner(handle, other, true).is_err());
    }

    #[test]
    fn test_access_patterns() {
        let (_registry, master, shm) = setup(FusionConfig::default());
        let pool = ObjectPool::<Counter>::create(&master, &shm, "counters").unwrap();
        let handle = pool.create_object(&master, Counter::zeroed()).unwrap();

        assert!(pool.has_access(handle, "/usr/bin/viewer").is_err());
        pool.add_access(handle, "/usr/bin/viewer").unwrap();
        pool.add_access(handle, "/opt/tools/*").unwrap();
        assert!(pool.add_access(handle, "").is_err());

        pool.has_access(handle, "/usr/bin/viewer").unwrap();
        pool.has_access(handle, "/opt/tools/paint").unwrap();
        assert!(matches!(
            pool.has_access(handle, "/usr/bin/viewer2"),
            Err(FusionError::AccessDenied(_))
        ));
        assert!(pool.has_access(handle, "/opt/other").is_err());
    }

    #[test]
    fn test_destroy_racing_unref_reclaims_once() {
        for _ in 0..20 {
            let (_registry, master, shm) = setup(FusionConfig::default());
            let destroyed = Arc::new(AtomicUsize::new(0));
            let seen = Arc::clone(&destroyed);
            let pool = ObjectPool::<Counter>::create_with_destructor(&master, &shm, "counters", move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            let handles: Vec<_> = (0..16)
                .map(|value| pool.create_object(&master, Counter { value }).unwrap())
                .collect();

            std::thread::scope(|s| {
                s.spawn(|| {
                    for handle in &handles {
                        // Fails once destroy() got there first
                        let _ = pool.unref_object(&master, *handle);
                    }
                });
                s.spawn(|| pool.destroy());
            });

            assert_eq!(destroyed.load(Ordering::SeqCst), 16);
            let stats = pool.stats();
            assert_eq!(stats.reclaimed, stats.created);
            assert_eq!(shm.stats().allocations, 0);
        }
    }
}
