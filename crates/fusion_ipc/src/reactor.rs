//! # Reactors
//!
//! Non-blocking notification channels.
//!
//! A reactor is owned by the fusionee that created it. Listeners attach to
//! one channel of a reactor and receive copies of every message dispatched
//! on that channel after they attached.
//!
//! ## Delivery
//!
//! Every listener has its own bounded queue. Dispatch never waits: when a
//! queue is full the message is dropped for that listener only, its loss
//! counter is incremented and the [`DispatchReport`] says so.
//!
//! ## Global reactions
//!
//! A global reaction is an index into a table of functions that every
//! dispatcher passes along. They run on the dispatching thread, channel 0
//! only, before any listener is served. A reaction answering
//! [`Reaction::Remove`] is detached.
//!
//! ## Dispatch callback
//!
//! With a dispatch callback set, every dispatch executes that call one-way
//! once each listener consumed or dropped its copy of the message.
//!
//! ## Lifetime
//!
//! The owner and every listener hold one reference on the reactor. The
//! channel disappears once the owner destroyed it and the last listener
//! detached.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};

use fusion_core::{FusionError, FusionId, FusionResult, Handle, SlotTable, TraceRef};

use crate::call::{self, CallId, ExecFlags, Invocation};
use crate::protocol::{check_payload, FusionMessage};
use crate::reference::FusionRef;
use crate::world::WorldShared;

/// Handle of a reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct ReactorId(Handle);

impl ReactorId {
    /// Packs the id for the wire.
    #[inline]
    #[must_use]
    pub const fn to_raw(self) -> u64 {
        self.0.to_raw()
    }

    /// Unpacks a wire value.
    #[inline]
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(Handle::from_raw(raw))
    }
}

impl fmt::Display for ReactorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactor {}", self.0)
    }
}

/// Result of one dispatch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Listeners that received the message.
    pub delivered: usize,
    /// Listeners whose queue was full.
    pub dropped: usize,
    /// Global reactions that ran.
    pub reactions: usize,
}

/// Answer of a global reaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reaction {
    /// Stay attached.
    Keep,
    /// Detach this reaction.
    Remove,
}

/// Function of a global reaction table. Receives the message and the
/// context given to [`Fusionee::reactor_attach_global`](crate::Fusionee::reactor_attach_global).
pub type GlobalReaction = fn(&ReactorMessage, u64) -> Reaction;

/// Handle of an attached global reaction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GlobalReactionId(u64);

/// A message received by a listener.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReactorMessage {
    /// Reactor it was dispatched on.
    pub reactor: ReactorId,
    /// Channel.
    pub channel: u32,
    /// Entity the message is about (object id, or 0).
    pub reference: u64,
    /// Message bytes.
    pub payload: Vec<u8>,
}

/// Executes the dispatch callback when the last copy of a message is gone.
struct DispatchReceipt {
    world: Weak<WorldShared>,
    dispatcher: FusionId,
    reactor: ReactorId,
    channel: u32,
    call: CallId,
    call_arg: i32,
}

impl Drop for DispatchReceipt {
    fn drop(&mut self) {
        let Some(world) = self.world.upgrade() else {
            return;
        };
        let member = match world.member(self.dispatcher) {
            Ok(member) => member,
            Err(e) => {
                tracing::debug!("Dispatch callback of {} skipped: {}", self.reactor, e);
                return;
            }
        };

        let mut request = self.reactor.to_raw().to_le_bytes().to_vec();
        request.extend_from_slice(&self.channel.to_le_bytes());
        let invocation = Invocation {
            call: self.call,
            flags: ExecFlags::ONEWAY,
            call_arg: self.call_arg,
            request: &request,
            max_reply: 0,
            timeout: world.config.call_timeout(),
        };
        let sent = call::execute(&world, &member, &invocation).and_then(|_| member.bin.lock().flush());
        if let Err(e) = sent {
            tracing::warn!("Dispatch callback {} of {} failed: {}", self.call, self.reactor, e);
        }
    }
}

/// One queued copy of a dispatched message.
struct Delivery {
    frame: Vec<u8>,
    _receipt: Option<Arc<DispatchReceipt>>,
}

struct ListenerSlot {
    id: u64,
    fusion_id: FusionId,
    channel: u32,
    queue: Sender<Delivery>,
    lost: Arc<AtomicU64>,
}

struct GlobalSlot {
    id: u64,
    index: usize,
    ctx: u64,
}

struct ReactorCore {
    owner: FusionId,
    reference: FusionRef,
    owner_released: AtomicBool,
    listeners: Mutex<Vec<ListenerSlot>>,
    globals: Mutex<Vec<GlobalSlot>>,
    callback: Mutex<Option<(CallId, i32)>>,
}

/// Reactors of one world.
pub(crate) struct ReactorRegistry {
    table: RwLock<SlotTable<Arc<ReactorCore>>>,
    queue_depth: usize,
    trace: TraceRef,
    next_listener: AtomicU64,
    world: Weak<WorldShared>,
}

impl ReactorRegistry {
    pub(crate) fn new(queue_depth: usize, trace: TraceRef, world: Weak<WorldShared>) -> Self {
        Self {
            table: RwLock::new(SlotTable::new()),
            queue_depth,
            trace,
            next_listener: AtomicU64::new(1),
            world,
        }
    }

    fn get(&self, id: ReactorId) -> FusionResult<Arc<ReactorCore>> {
        self.table
            .read()
            .get(id.0)
            .cloned()
            .ok_or_else(|| FusionError::NoSuchInstance(id.to_string()))
    }

    pub(crate) fn create(&self, owner: FusionId) -> ReactorId {
        let core = Arc::new(ReactorCore {
            owner,
            reference: FusionRef::new(owner, self.trace),
            owner_released: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            globals: Mutex::new(Vec::new()),
            callback: Mutex::new(None),
        });
        let id = ReactorId(self.table.write().insert(core));
        tracing::debug!("{} created by {}", id, owner);
        id
    }

    pub(crate) fn attach(self: &Arc<Self>, id: ReactorId, fusion_id: FusionId, channel: u32) -> FusionResult<Listener> {
        let core = self.get(id)?;
        core.reference.up(fusion_id)?;

        let (queue, receiver) = bounded(self.queue_depth);
        let lost = Arc::new(AtomicU64::new(0));
        let listener_id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        core.listeners.lock().push(ListenerSlot {
            id: listener_id,
            fusion_id,
            channel,
            queue,
            lost: Arc::clone(&lost),
        });

        tracing::debug!("{} attached to {} channel {}", fusion_id, id, channel);
        Ok(Listener {
            reactor: id,
            channel,
            fusion_id,
            id: listener_id,
            receiver,
            lost,
            registry: Arc::downgrade(self),
            detached: false,
        })
    }

    fn detach(&self, id: ReactorId, listener_id: u64) -> FusionResult<()> {
        let core = self.get(id)?;
        let slot = {
            let mut listeners = core.listeners.lock();
            let index = listeners
                .iter()
                .position(|slot| slot.id == listener_id)
                .ok_or_else(|| FusionError::InvalidState(format!("listener {listener_id} is not attached to {id}")))?;
            listeners.swap_remove(index)
        };
        self.unref(id, &core, slot.fusion_id)
    }

    /// Runs the global reactions, then queues a copy for every listener
    /// of `channel`.
    pub(crate) fn dispatch(
        &self,
        id: ReactorId,
        dispatcher: FusionId,
        channel: u32,
        reference: u64,
        message: &[u8],
        globals: &[GlobalReaction],
    ) -> FusionResult<DispatchReport> {
        check_payload(message.len())?;
        let core = self.get(id)?;
        let mut report = DispatchReport::default();
        if channel == 0 {
            report.reactions = Self::run_globals(id, &core, reference, message, globals);
        }

        let receipt = (*core.callback.lock()).map(|(call, call_arg)| {
            Arc::new(DispatchReceipt {
                world: Weak::clone(&self.world),
                dispatcher,
                reactor: id,
                channel,
                call,
                call_arg,
            })
        });
        let frame = FusionMessage::Reactor {
            reactor_id: id.to_raw(),
            channel,
            reference,
            message: message.to_vec(),
        }
        .encode();

        for slot in core.listeners.lock().iter().filter(|slot| slot.channel == channel) {
            let delivery = Delivery {
                frame: frame.clone(),
                _receipt: receipt.clone(),
            };
            match slot.queue.try_send(delivery) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    slot.lost.fetch_add(1, Ordering::Relaxed);
                    report.dropped += 1;
                }
                // Listener dropped its receiver; its detach is under way
                Err(TrySendError::Disconnected(_)) => {}
            }
        }

        if report.dropped > 0 {
            tracing::warn!(
                "{} channel {}: message dropped for {} slow listener(s)",
                id,
                channel,
                report.dropped
            );
        }
        Ok(report)
    }

    fn run_globals(id: ReactorId, core: &ReactorCore, reference: u64, message: &[u8], globals: &[GlobalReaction]) -> usize {
        // Reactions may attach or detach globals themselves
        let attached: Vec<(u64, usize, u64)> = core
            .globals
            .lock()
            .iter()
            .map(|slot| (slot.id, slot.index, slot.ctx))
            .collect();
        if attached.is_empty() {
            return 0;
        }
        if globals.is_empty() {
            tracing::error!("{} has global reactions but none were passed to dispatch", id);
            return 0;
        }

        let message = ReactorMessage {
            reactor: id,
            channel: 0,
            reference,
            payload: message.to_vec(),
        };
        let mut ran = 0;
        let mut removed = Vec::new();
        for (global_id, index, ctx) in attached {
            let Some(reaction) = globals.get(index) else {
                tracing::error!("{}: global reaction {} is out of range ({} passed)", id, index, globals.len());
                continue;
            };
            ran += 1;
            if reaction(&message, ctx) == Reaction::Remove {
                removed.push(global_id);
            }
        }
        if !removed.is_empty() {
            core.globals.lock().retain(|slot| !removed.contains(&slot.id));
            tracing::debug!("{}: {} global reaction(s) removed themselves", id, removed.len());
        }
        ran
    }

    pub(crate) fn attach_global(&self, id: ReactorId, index: usize, ctx: u64) -> FusionResult<GlobalReactionId> {
        let core = self.get(id)?;
        let global_id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        core.globals.lock().push(GlobalSlot {
            id: global_id,
            index,
            ctx,
        });
        tracing::debug!("Global reaction {} attached to {}", index, id);
        Ok(GlobalReactionId(global_id))
    }

    pub(crate) fn detach_global(&self, id: ReactorId, global: GlobalReactionId) -> FusionResult<()> {
        let core = self.get(id)?;
        let mut globals = core.globals.lock();
        let index = globals
            .iter()
            .position(|slot| slot.id == global.0)
            .ok_or_else(|| FusionError::InvalidState(format!("{global:?} is not attached to {id}")))?;
        globals.remove(index);
        Ok(())
    }

    /// Sets the call executed after each dispatch was consumed.
    pub(crate) fn set_dispatch_callback(&self, id: ReactorId, by: FusionId, call: CallId, call_arg: i32) -> FusionResult<()> {
        let core = self.get(id)?;
        if core.owner != by {
            return Err(FusionError::AccessDenied(format!("{id} is owned by {}", core.owner)));
        }
        if core.owner_released.load(Ordering::Acquire) {
            return Err(FusionError::InvalidState(format!("{id} was destroyed")));
        }
        *core.callback.lock() = Some((call, call_arg));
        Ok(())
    }

    /// Releases the owner's reference.
    pub(crate) fn destroy(&self, id: ReactorId, by: FusionId) -> FusionResult<()> {
        let core = self.get(id)?;
        if core.owner != by {
            return Err(FusionError::AccessDenied(format!("{id} is owned by {}", core.owner)));
        }
        self.release_owner(id, &core)
    }

    /// Releases the owner's reference without an ownership check.
    pub(crate) fn release(&self, id: ReactorId) -> FusionResult<()> {
        let core = self.get(id)?;
        self.release_owner(id, &core)
    }

    fn release_owner(&self, id: ReactorId, core: &ReactorCore) -> FusionResult<()> {
        if core.owner_released.swap(true, Ordering::AcqRel) {
            return Err(FusionError::InvalidState(format!("{id} already destroyed")));
        }
        self.unref(id, core, core.owner)
    }

    fn unref(&self, id: ReactorId, core: &ReactorCore, holder: FusionId) -> FusionResult<()> {
        if core.reference.down(holder)? == 0 {
            core.reference.destroy();
            self.table.write().remove(id.0);
            tracing::debug!("{} released", id);
        }
        Ok(())
    }

    /// Detaches every listener of a departed fusionee.
    pub(crate) fn detach_all(&self, fusion_id: FusionId) -> usize {
        let reactors: Vec<_> = self.table.read().iter().map(|(h, core)| (ReactorId(h), Arc::clone(core))).collect();

        let mut detached = 0;
        for (id, core) in reactors {
            let slots: Vec<ListenerSlot> = {
                let mut listeners = core.listeners.lock();
                let (gone, kept): (Vec<_>, Vec<_>) = listeners.drain(..).partition(|slot| slot.fusion_id == fusion_id);
                *listeners = kept;
                gone
            };
            for slot in slots {
                if let Err(e) = self.unref(id, &core, slot.fusion_id) {
                    tracing::warn!("Releasing listener of {} on {}: {}", fusion_id, id, e);
                }
                detached += 1;
            }
        }
        detached
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: ReactorId) -> bool {
        self.table.read().contains(id.0)
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self, id: ReactorId) -> usize {
        self.get(id).map_or(0, |core| core.listeners.lock().len())
    }
}

/// Receiving end of one reactor channel.
///
/// Detaches when dropped.
pub struct Listener {
    reactor: ReactorId,
    channel: u32,
    fusion_id: FusionId,
    id: u64,
    receiver: Receiver<Delivery>,
    lost: Arc<AtomicU64>,
    registry: Weak<ReactorRegistry>,
    detached: bool,
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listener")
            .field("reactor", &self.reactor)
            .field("channel", &self.channel)
            .field("fusion_id", &self.fusion_id)
            .finish_non_exhaustive()
    }
}

impl Listener {
    /// Reactor this listener is attached to.
    #[inline]
    #[must_use]
    pub const fn reactor(&self) -> ReactorId {
        self.reactor
    }

    /// Channel this listener receives.
    #[inline]
    #[must_use]
    pub const fn channel(&self) -> u32 {
        self.channel
    }

    /// Messages dropped because the queue was full.
    #[inline]
    #[must_use]
    pub fn lost(&self) -> u64 {
        self.lost.load(Ordering::Relaxed)
    }

    /// Waits for the next message.
    ///
    /// # Errors
    ///
    /// [`FusionError::Timeout`] if nothing arrives in time,
    /// [`FusionError::NoSuchInstance`] if the listener was detached.
    pub fn recv_timeout(&self, timeout: Duration) -> FusionResult<ReactorMessage> {
        match self.receiver.recv_timeout(timeout) {
            Ok(delivery) => self.decode(&delivery.frame),
            Err(RecvTimeoutError::Timeout) => Err(FusionError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(FusionError::NoSuchInstance(format!(
                "listener on {} was detached",
                self.reactor
            ))),
        }
    }

    /// Returns the next queued message, if any.
    #[must_use]
    pub fn try_recv(&self) -> Option<ReactorMessage> {
        let delivery = self.receiver.try_recv().ok()?;
        self.decode(&delivery.frame).ok()
    }

    /// Number of queued messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Detaches from the reactor.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the reactor or its world is gone,
    /// [`FusionError::InvalidState`] if the listener was already released
    /// (its fusionee left).
    pub fn detach(mut self) -> FusionResult<()> {
        self.detached = true;
        self.release()
    }

    fn release(&self) -> FusionResult<()> {
        let registry = self
            .registry
            .upgrade()
            .ok_or_else(|| FusionError::NoSuchInstance(format!("world of {} is gone", self.reactor)))?;
        registry.detach(self.reactor, self.id)
    }

    fn decode(&self, frame: &[u8]) -> FusionResult<ReactorMessage> {
        match FusionMessage::decode(frame)? {
            FusionMessage::Reactor {
                reactor_id,
                channel,
                reference,
                message,
            } => Ok(ReactorMessage {
                reactor: ReactorId::from_raw(reactor_id),
                channel,
                reference,
                payload: message,
            }),
            other => Err(FusionError::InvalidState(format!(
                "listener on {} received a {:?} frame",
                self.reactor,
                other.kind()
            ))),
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if !self.detached {
            if let Err(e) = self.release() {
                tracing::debug!("Implicit detach from {}: {}", self.reactor, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OWNER: FusionId = FusionId::MASTER;
    const OTHER: FusionId = FusionId::new(2);

    fn registry(depth: usize) -> Arc<ReactorRegistry> {
        Arc::new(ReactorRegistry::new(depth, TraceRef::Off, Weak::new()))
    }

    #[test]
    fn test_dispatch_to_matching_channel() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        let on_one = registry.attach(id, OTHER, 1).unwrap();
        let on_two = registry.attach(id, OTHER, 2).unwrap();

        let report = registry.dispatch(id, OWNER, 1, 7, b"hello", &[]).unwrap();
        assert_eq!(
            report,
            DispatchReport {
                delivered: 1,
                dropped: 0,
                reactions: 0
            }
        );

        let message = on_one.try_recv().unwrap();
        assert_eq!(message.payload, b"hello");
        assert_eq!(message.reference, 7);
        assert_eq!(message.reactor, id);
        assert!(on_two.try_recv().is_none());
    }

    #[test]
    fn test_full_queue_counts_loss() {
        let registry = registry(2);
        let id = registry.create(OWNER);
        let slow = registry.attach(id, OTHER, 0).unwrap();
        let fast = registry.attach(id, OWNER, 0).unwrap();

        for i in 0..3u8 {
            registry.dispatch(id, OWNER, 0, 0, &[i], &[]).unwrap();
            assert_eq!(fast.try_recv().unwrap().payload, vec![i]);
        }
        assert_eq!(slow.lost(), 1);
        assert_eq!(slow.pending(), 2);
    }

    #[test]
    fn test_channel_outlives_owner_while_listened() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        let listener = registry.attach(id, OTHER, 0).unwrap();

        registry.destroy(id, OWNER).unwrap();
        assert!(registry.contains(id));
        assert_eq!(registry.dispatch(id, OWNER, 0, 0, b"late", &[]).unwrap().delivered, 1);

        listener.detach().unwrap();
        assert!(!registry.contains(id));
        assert!(registry.dispatch(id, OWNER, 0, 0, b"x", &[]).is_err());
    }

    #[test]
    fn test_drop_detaches() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        {
            let _listener = registry.attach(id, OTHER, 0).unwrap();
            assert_eq!(registry.listener_count(id), 1);
        }
        assert_eq!(registry.listener_count(id), 0);
    }

    #[test]
    fn test_destroy_requires_owner() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        assert!(matches!(registry.destroy(id, OTHER), Err(FusionError::AccessDenied(_))));
        registry.destroy(id, OWNER).unwrap();
        assert!(!registry.contains(id));
    }

    #[test]
    fn test_detach_all_of_departed() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        let listener = registry.attach(id, OTHER, 0).unwrap();
        let _second = registry.attach(id, OTHER, 1).unwrap();

        assert_eq!(registry.detach_all(OTHER), 2);
        assert_eq!(registry.listener_count(id), 0);
        assert!(listener.detach().is_err());
    }

    fn count_payload(message: &ReactorMessage, ctx: u64) -> Reaction {
        assert_eq!(ctx, 42);
        if message.payload == b"last" {
            Reaction::Remove
        } else {
            Reaction::Keep
        }
    }

    fn keep(_: &ReactorMessage, _: u64) -> Reaction {
        Reaction::Keep
    }

    #[test]
    fn test_global_reactions_on_channel_zero() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        let globals: [GlobalReaction; 2] = [keep, count_payload];
        registry.attach_global(id, 1, 42).unwrap();
        let kept = registry.attach_global(id, 0, 0).unwrap();

        assert_eq!(registry.dispatch(id, OWNER, 0, 0, b"one", &globals).unwrap().reactions, 2);
        // Other channels never reach them
        assert_eq!(registry.dispatch(id, OWNER, 3, 0, b"one", &globals).unwrap().reactions, 0);

        assert_eq!(registry.dispatch(id, OWNER, 0, 0, b"last", &globals).unwrap().reactions, 2);
        assert_eq!(registry.dispatch(id, OWNER, 0, 0, b"again", &globals).unwrap().reactions, 1);

        registry.detach_global(id, kept).unwrap();
        assert!(registry.detach_global(id, kept).is_err());
        assert_eq!(registry.dispatch(id, OWNER, 0, 0, b"none", &globals).unwrap().reactions, 0);
    }

    #[test]
    fn test_globals_without_table_still_deliver() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        let listener = registry.attach(id, OTHER, 0).unwrap();
        registry.attach_global(id, 0, 0).unwrap();

        let report = registry.dispatch(id, OWNER, 0, 0, b"x", &[]).unwrap();
        assert_eq!(report.reactions, 0);
        assert_eq!(report.delivered, 1);
        assert_eq!(listener.try_recv().unwrap().payload, b"x");
    }

    #[test]
    fn test_dispatch_callback_owner_only() {
        let registry = registry(4);
        let id = registry.create(OWNER);
        let call = CallId::from_raw(7);
        assert!(matches!(
            registry.set_dispatch_callback(id, OTHER, call, 0),
            Err(FusionError::AccessDenied(_))
        ));
        registry.set_dispatch_callback(id, OWNER, call, 0).unwrap();

        // Without a world the receipt has nowhere to go
        let _listener = registry.attach(id, OTHER, 0).unwrap();
        assert_eq!(registry.dispatch(id, OWNER, 0, 0, b"x", &[]).unwrap().delivered, 1);

        registry.destroy(id, OWNER).unwrap();
        assert!(matches!(
            registry.set_dispatch_callback(id, OWNER, call, 0),
            Err(FusionError::InvalidState(_))
        ));
    }
}
