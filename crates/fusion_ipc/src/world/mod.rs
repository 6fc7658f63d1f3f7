//! # Worlds
//!
//! Membership of fusionees in a world: one master, any number of slaves.
//!
//! ## Protocol
//!
//! ```text
//!   slave                          master dispatcher
//!     │ ENTER{id: 0, ticket} ───────>│ assigns the next id
//!     │<─────── ENTER{id, ticket}    │ member table: Joined
//!     │ ...                          │
//!     │ LEAVE{id} ──────────────────>│ cleanup, member table: removed
//!     │<────────────── LEAVE{id}     │
//! ```
//!
//! The master dispatcher is the only writer of the member table. It also
//! sweeps liveness: a fusionee dropped without leaving is treated as if it
//! had sent LEAVE.

mod dispatch;
mod fusionee;
mod member;
mod registry;

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use fusion_core::{Backend, FusionConfig, FusionError, FusionId, FusionResult};

use crate::arena::ArenaTable;
use crate::call::CallRegistry;
use crate::protocol::{FusionMessage, ReturnStatus};
use crate::reactor::ReactorRegistry;
use crate::shm::ShmRegistry;

pub use fusionee::Fusionee;
pub use member::MemberState;
pub use registry::Registry;

pub(crate) use member::Member;

/// Releases what a departed fusionee held.
pub(crate) trait MemberCleanup: Send + Sync {
    fn member_left(&self, id: FusionId);
}

/// State of one world shared by all of its fusionees.
pub(crate) struct WorldShared {
    pub(crate) index: u32,
    pub(crate) config: Arc<FusionConfig>,
    pub(crate) backend: Arc<dyn Backend>,
    next_id: AtomicU64,
    next_ticket: AtomicU64,
    next_object_pool: AtomicU32,
    members: RwLock<BTreeMap<FusionId, Arc<Member>>>,
    /// Slaves whose ENTER is in flight, by ticket.
    joining: Mutex<HashMap<u64, Arc<Member>>>,
    pub(crate) shm: ShmRegistry,
    pub(crate) calls: CallRegistry,
    pub(crate) reactors: Arc<ReactorRegistry>,
    pub(crate) arenas: ArenaTable,
    cleanups: Mutex<Vec<Weak<dyn MemberCleanup>>>,
}

impl WorldShared {
    /// `this` is the weak handle of the `Arc` being built, see [`Arc::new_cyclic`].
    pub(crate) fn new(index: u32, config: Arc<FusionConfig>, backend: Arc<dyn Backend>, this: &Weak<Self>) -> Self {
        Self {
            index,
            shm: ShmRegistry::new(index, Arc::clone(&config), Arc::clone(&backend)),
            calls: CallRegistry::default(),
            reactors: Arc::new(ReactorRegistry::new(
                config.reactor_queue_depth,
                config.trace_ref,
                Weak::clone(this),
            )),
            arenas: ArenaTable::default(),
            next_id: AtomicU64::new(FusionId::MASTER.raw() + 1),
            next_ticket: AtomicU64::new(1),
            next_object_pool: AtomicU32::new(1),
            members: RwLock::new(BTreeMap::new()),
            joining: Mutex::new(HashMap::new()),
            cleanups: Mutex::new(Vec::new()),
            config,
            backend,
        }
    }

    pub(crate) fn member(&self, id: FusionId) -> FusionResult<Arc<Member>> {
        self.members
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| FusionError::NoSuchInstance(format!("fusionee {id} in world {}", self.index)))
    }

    pub(crate) fn master(&self) -> Option<Arc<Member>> {
        self.members.read().get(&FusionId::MASTER).cloned()
    }

    pub(crate) fn has_live_master(&self) -> bool {
        self.master().is_some_and(|m| m.is_alive())
    }

    pub(crate) fn member_ids(&self) -> Vec<FusionId> {
        self.members.read().keys().copied().collect()
    }

    fn members_snapshot(&self) -> Vec<Arc<Member>> {
        self.members.read().values().cloned().collect()
    }

    pub(crate) fn insert_master(&self, member: Arc<Member>) {
        self.members.write().insert(FusionId::MASTER, member);
    }

    /// Parks a slave until the master answers its ENTER. Returns the ticket.
    pub(crate) fn begin_join(&self, member: Arc<Member>) -> u64 {
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.joining.lock().insert(ticket, member);
        ticket
    }

    pub(crate) fn abort_join(&self, ticket: u64) {
        self.joining.lock().remove(&ticket);
    }

    /// Master side of ENTER: assigns an id and admits the slave.
    pub(crate) fn complete_join(&self, ticket: u64) -> Option<(FusionId, Arc<Member>)> {
        let member = self.joining.lock().remove(&ticket)?;
        if !member.transition(MemberState::Joining, MemberState::Joined) {
            return None;
        }
        let id = FusionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        member.assign(id);
        self.members.write().insert(id, Arc::clone(&member));
        tracing::info!("Fusionee {} joined world {}", id, self.index);
        Some((id, member))
    }

    pub(crate) fn register_cleanup(&self, cleanup: Weak<dyn MemberCleanup>) {
        self.cleanups.lock().push(cleanup);
    }

    pub(crate) fn next_object_pool_id(&self) -> u32 {
        self.next_object_pool.fetch_add(1, Ordering::Relaxed)
    }

    /// Writes a CALLRET frame into the caller's reply slot.
    pub(crate) fn deliver_call_return(&self, caller: FusionId, message: &FusionMessage) -> bool {
        let FusionMessage::CallReturn { serial, .. } = message else {
            return false;
        };
        match self.member(caller) {
            Ok(member) => member.pending.deliver(*serial, message.encode()),
            Err(_) => false,
        }
    }

    /// Releases everything a departed fusionee held and removes it.
    pub(crate) fn member_left(&self, id: FusionId) {
        let Ok(member) = self.member(id) else {
            return;
        };
        member.set_state(MemberState::Leaving);

        let departed = |serial| {
            FusionMessage::CallReturn {
                serial,
                status: ReturnStatus::NoSuchInstance,
                detail: 0,
                reply: Vec::new(),
            }
            .encode()
        };
        let failed: usize = self
            .members_snapshot()
            .iter()
            .map(|other| other.pending.fail_targeting(id, departed))
            .sum();

        let calls = self.calls.destroy_owned_by(id);
        let pools = self.shm.detach_all(id);
        let listeners = self.reactors.detach_all(id);
        let arenas = self.arenas.member_left(id);

        let cleanups: Vec<_> = {
            let mut hooks = self.cleanups.lock();
            hooks.retain(|hook| hook.strong_count() > 0);
            hooks.iter().filter_map(Weak::upgrade).collect()
        };
        for hook in cleanups {
            hook.member_left(id);
        }

        self.members.write().remove(&id);
        member.set_state(MemberState::Left);

        tracing::info!(
            "Fusionee {} left world {} ({} pending calls failed, {} calls, {} pools, {} listeners released, {} arenas abandoned)",
            id,
            self.index,
            failed,
            calls,
            pools,
            listeners,
            arenas
        );
    }

    /// Turns dead slaves into implicit leaves. Returns their ids.
    pub(crate) fn sweep(&self) -> Vec<FusionId> {
        self.joining.lock().retain(|_, member| member.is_alive());

        let dead: Vec<FusionId> = self
            .members
            .read()
            .iter()
            .filter(|(id, member)| !id.is_master() && member.is_joined() && !member.is_alive())
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            tracing::warn!("Fusionee {} died, treating as LEAVE", id);
            self.member_left(*id);
        }
        dead
    }

    /// Slaves still in the member table.
    pub(crate) fn slave_count(&self) -> usize {
        self.members.read().keys().filter(|id| !id.is_master()).count()
    }
}

impl Drop for WorldShared {
    fn drop(&mut self) {
        if self.config.shutdown_info {
            self.shm.print_leaks();
        }
        tracing::info!("World {} destroyed", self.index);
    }
}
