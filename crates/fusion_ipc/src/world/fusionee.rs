//! A joined participant of a world.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;

use fusion_core::{deadline_after, BackendKind, FusionConfig, FusionError, FusionId, FusionResult, PoolId, ShmPool};

use super::dispatch::{Dispatcher, Letter};
use super::{Member, MemberState, WorldShared};
use crate::arena::{Arena, ArenaResult, ArenaTable};
use crate::call::{self, CallHandler, CallId, ExecFlags, Invocation, ReturnToken};
use crate::protocol::{check_payload, FusionMessage};
use crate::reactor::{DispatchReport, GlobalReaction, GlobalReactionId, Listener, ReactorId};

/// A process joined to a world.
///
/// Created by [`Registry::enter`](crate::Registry::enter). Owns a mailbox and
/// a dispatcher thread that serves incoming calls and messages.
///
/// Dropping a fusionee without [`leave`](Self::leave) is treated as process
/// death: the master notices on its next liveness sweep and releases
/// everything the fusionee held.
pub struct Fusionee {
    world: Arc<WorldShared>,
    member: Arc<Member>,
    /// Dropped first on drop, making the death visible to others.
    liveness: Option<Arc<()>>,
    stop: Arc<AtomicBool>,
    dispatcher: Mutex<Option<JoinHandle<Receiver<Vec<u8>>>>>,
    letters: Receiver<Letter>,
}

impl std::fmt::Debug for Fusionee {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fusionee")
            .field("id", &self.member.id())
            .field("world", &self.world.index)
            .field("state", &self.member.state())
            .finish_non_exhaustive()
    }
}

impl Fusionee {
    /// Creates the master of a fresh world.
    pub(crate) fn master(world: Arc<WorldShared>) -> FusionResult<Self> {
        let liveness = Arc::new(());
        let (mailbox, receiver) = unbounded();
        let member = Arc::new(Member::new(
            FusionId::MASTER,
            MemberState::Joined,
            mailbox,
            Arc::downgrade(&liveness),
            &world.config,
        ));
        world.insert_master(Arc::clone(&member));
        tracing::info!("Fusionee {} is master of world {}", FusionId::MASTER, world.index);
        Self::start(world, member, liveness, receiver)
    }

    /// Joins an existing world through its master.
    pub(crate) fn join(world: Arc<WorldShared>, deadline: Instant) -> FusionResult<Self> {
        let liveness = Arc::new(());
        let (mailbox, receiver) = unbounded();
        let member = Arc::new(Member::new(
            FusionId::UNASSIGNED,
            MemberState::Joining,
            mailbox,
            Arc::downgrade(&liveness),
            &world.config,
        ));

        let ticket = world.begin_join(Arc::clone(&member));
        let posted = world
            .master()
            .filter(|master| master.is_alive())
            .ok_or_else(|| FusionError::NoSuchInstance(format!("world {} has no master", world.index)))
            .and_then(|master| {
                master.post(
                    FusionMessage::Enter {
                        fusion_id: FusionId::UNASSIGNED,
                        ticket,
                    }
                    .encode(),
                )
            });
        if let Err(e) = posted {
            world.abort_join(ticket);
            return Err(e);
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(remaining) {
                Ok(bytes) => match FusionMessage::decode(&bytes) {
                    Ok(FusionMessage::Enter { fusion_id, ticket: answered }) if answered == ticket => {
                        tracing::debug!("Joined world {} as {}", world.index, fusion_id);
                        return Self::start(world, member, liveness, receiver);
                    }
                    Ok(other) => tracing::warn!("Unexpected {:?} frame while joining", other.kind()),
                    Err(e) => tracing::warn!("Malformed frame while joining: {}", e),
                },
                Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => {
                    world.abort_join(ticket);
                    member.set_state(MemberState::Left);
                    tracing::warn!("No answer to ENTER in world {}", world.index);
                    return Err(FusionError::Timeout);
                }
            }
        }
    }

    fn start(
        world: Arc<WorldShared>,
        member: Arc<Member>,
        liveness: Arc<()>,
        mailbox: Receiver<Vec<u8>>,
    ) -> FusionResult<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let (letter_tx, letters) = unbounded();
        let handle = Dispatcher {
            world: Arc::clone(&world),
            member: Arc::clone(&member),
            mailbox,
            stop: Arc::clone(&stop),
            letters: letter_tx,
        }
        .spawn()?;

        Ok(Self {
            world,
            member,
            liveness: Some(liveness),
            stop,
            dispatcher: Mutex::new(Some(handle)),
            letters,
        })
    }

    pub(crate) fn world(&self) -> &Arc<WorldShared> {
        &self.world
    }

    /// Returns this fusionee's id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> FusionId {
        self.member.id()
    }

    /// Returns the index of the world.
    #[inline]
    #[must_use]
    pub fn world_index(&self) -> u32 {
        self.world.index
    }

    /// Returns true for the master of the world.
    #[inline]
    #[must_use]
    pub fn is_master(&self) -> bool {
        self.id().is_master()
    }

    /// Returns the membership state.
    #[must_use]
    pub fn state(&self) -> MemberState {
        self.member.state()
    }

    /// Ids of every current member, ascending.
    #[must_use]
    pub fn members(&self) -> Vec<FusionId> {
        self.world.member_ids()
    }

    /// Returns the configuration of the world.
    #[must_use]
    pub fn config(&self) -> &FusionConfig {
        &self.world.config
    }

    /// Returns the backend flavour.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.world.backend.kind()
    }

    pub(crate) fn ensure_joined(&self) -> FusionResult<()> {
        if self.member.is_joined() {
            Ok(())
        } else {
            Err(FusionError::InvalidState(format!(
                "{} is {:?}, not joined",
                self.id(),
                self.member.state()
            )))
        }
    }

    // =========================================================================
    // Membership
    // =========================================================================

    /// Leaves the world.
    ///
    /// A slave sends LEAVE to the master and waits for the acknowledgement.
    /// The master may only leave once every slave has left.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if not joined, or for a master that
    /// still has slaves.
    pub fn leave(&self) -> FusionResult<()> {
        let me = self.id();
        if !self.member.transition(MemberState::Joined, MemberState::Leaving) {
            return Err(FusionError::InvalidState(format!("{me} is not joined")));
        }

        if me.is_master() {
            self.world.sweep();
            let slaves = self.world.slave_count();
            if slaves > 0 {
                self.member.set_state(MemberState::Joined);
                return Err(FusionError::InvalidState(format!(
                    "master cannot leave world {} while {} slave(s) remain",
                    self.world.index, slaves
                )));
            }
            self.flush_quietly();
            self.stop_dispatcher();
            self.world.member_left(me);
            return Ok(());
        }

        self.flush_quietly();
        let mailbox = self.stop_dispatcher();
        match self.world.master().filter(|master| master.is_alive()) {
            Some(master) => {
                master.post(FusionMessage::Leave { fusion_id: me }.encode())?;
                if let Some(mailbox) = mailbox {
                    self.await_leave_ack(&mailbox);
                }
            }
            None => {
                tracing::warn!("Master of world {} is gone, leaving without it", self.world.index);
                self.world.member_left(me);
            }
        }
        self.member.set_state(MemberState::Left);
        Ok(())
    }

    fn await_leave_ack(&self, mailbox: &Receiver<Vec<u8>>) {
        let me = self.id();
        let deadline = deadline_after(self.world.config.join_timeout());
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Ok(bytes) = mailbox.recv_timeout(remaining) else {
                tracing::warn!("{} got no LEAVE acknowledgement", me);
                return;
            };
            for message in FusionMessage::decode_all(&bytes).unwrap_or_default() {
                match message {
                    FusionMessage::Leave { fusion_id } if fusion_id == me => return,
                    // Answered with NoSuchInstance, we are leaving
                    FusionMessage::Call { header, request } => {
                        call::serve(&self.world, &self.member, &header, &request);
                    }
                    _ => {}
                }
            }
        }
    }

    fn flush_quietly(&self) {
        if let Err(e) = self.member.bin.lock().flush() {
            tracing::warn!("Call bin flush of {} failed: {}", self.id(), e);
        }
    }

    /// Stops the dispatcher thread and takes back the mailbox.
    fn stop_dispatcher(&self) -> Option<Receiver<Vec<u8>>> {
        let handle = self.dispatcher.lock().take()?;
        self.stop.store(true, Ordering::Release);
        if handle.thread().id() == std::thread::current().id() {
            // Called from a handler on the dispatcher itself; it exits after this frame
            return None;
        }
        // Wake it up
        let _ = self.member.mailbox.send(Vec::new());
        match handle.join() {
            Ok(mailbox) => Some(mailbox),
            Err(_) => {
                tracing::error!("Dispatcher of {} panicked", self.id());
                None
            }
        }
    }

    /// Sends a message to another fusionee.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the target is not a member.
    pub fn send(&self, to: FusionId, payload: &[u8]) -> FusionResult<()> {
        self.ensure_joined()?;
        check_payload(payload.len())?;
        let target = self.world.member(to)?;
        target.post(
            FusionMessage::Send {
                sender: self.id(),
                payload: payload.to_vec(),
            }
            .encode(),
        )
    }

    /// Waits for a message sent with [`send`](Self::send).
    ///
    /// # Errors
    ///
    /// [`FusionError::Timeout`] if none arrives in time.
    pub fn recv_message(&self, timeout: Duration) -> FusionResult<(FusionId, Vec<u8>)> {
        self.letters.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => FusionError::Timeout,
            RecvTimeoutError::Disconnected => {
                FusionError::InvalidState(format!("dispatcher of {} stopped", self.id()))
            }
        })
    }

    // =========================================================================
    // SHM pools
    // =========================================================================

    /// Creates a named pool. The creator is attached.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidArgument`] for a zero size or a duplicate name,
    /// [`FusionError::OutOfMemory`] if the backend cannot provide the memory.
    pub fn pool_create(&self, name: &str, max_size: usize, debug: bool) -> FusionResult<Arc<ShmPool>> {
        self.ensure_joined()?;
        self.world.shm.create(self.id(), name, max_size, debug)
    }

    /// Looks a pool up by name without attaching it.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if no pool has that name.
    pub fn pool_find(&self, name: &str) -> FusionResult<Arc<ShmPool>> {
        self.world.shm.find(name)
    }

    /// Attaches a pool.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] in secure mode without a grant.
    pub fn pool_attach(&self, pool: PoolId) -> FusionResult<Arc<ShmPool>> {
        self.ensure_joined()?;
        self.world.shm.attach(self.id(), pool)
    }

    /// Detaches a pool. Returns the remaining attach count.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if the pool is not attached.
    pub fn pool_detach(&self, pool: PoolId) -> FusionResult<u32> {
        self.world.shm.detach(self.id(), pool)
    }

    /// Lets another fusionee attach a pool in secure mode.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] unless called by the pool owner.
    pub fn pool_grant(&self, pool: PoolId, to: FusionId) -> FusionResult<()> {
        self.ensure_joined()?;
        self.world.shm.grant(self.id(), pool, to)
    }

    /// Destroys a pool.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] unless called by the owner,
    /// [`FusionError::InvalidState`] while others are attached or
    /// allocations remain.
    pub fn pool_destroy(&self, pool: PoolId) -> FusionResult<()> {
        self.world.shm.destroy(self.id(), pool)
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Registers a call owned by this fusionee.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if not joined.
    pub fn call_register(&self, handler: impl CallHandler + 'static, ctx: u64) -> FusionResult<CallId> {
        self.call_register_with_flags(handler, ctx, ExecFlags::NONE)
    }

    /// Registers a call whose executions always carry `default_flags`.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if not joined.
    pub fn call_register_with_flags(
        &self,
        handler: impl CallHandler + 'static,
        ctx: u64,
        default_flags: ExecFlags,
    ) -> FusionResult<CallId> {
        self.ensure_joined()?;
        Ok(self.world.calls.register(self.id(), Arc::new(handler), ctx, default_flags))
    }

    /// Executes a call with the configured default timeout.
    ///
    /// # Arguments
    ///
    /// * `call` - Call to execute
    /// * `flags` - [`ExecFlags::ONEWAY`] and/or [`ExecFlags::QUEUE`]
    /// * `call_arg` - Integer argument passed to the handler
    /// * `request` - Request bytes
    /// * `max_reply` - Largest reply accepted
    ///
    /// # Returns
    ///
    /// The reply, empty for one-way calls.
    ///
    /// # Errors
    ///
    /// - [`FusionError::NoSuchInstance`] if the call or its owner is gone
    /// - [`FusionError::BufferTooSmall`] if the reply exceeds `max_reply`
    /// - [`FusionError::Timeout`] if no reply arrives in time
    /// - [`FusionError::HandlerFailed`] if the handler reported a failure
    /// - [`FusionError::InvalidArgument`] if `request` exceeds
    ///   [`MAX_PAYLOAD`](crate::protocol::MAX_PAYLOAD)
    pub fn call_execute(
        &self,
        call: CallId,
        flags: ExecFlags,
        call_arg: i32,
        request: &[u8],
        max_reply: usize,
    ) -> FusionResult<Vec<u8>> {
        self.call_execute_timeout(call, flags, call_arg, request, max_reply, self.world.config.call_timeout())
    }

    /// Executes a call with an explicit timeout.
    ///
    /// # Errors
    ///
    /// See [`call_execute`](Self::call_execute).
    pub fn call_execute_timeout(
        &self,
        call: CallId,
        flags: ExecFlags,
        call_arg: i32,
        request: &[u8],
        max_reply: usize,
        timeout: Duration,
    ) -> FusionResult<Vec<u8>> {
        self.ensure_joined()?;
        check_payload(request.len())?;
        let invocation = Invocation {
            call,
            flags,
            call_arg,
            request,
            max_reply,
            timeout,
        };
        call::execute(&self.world, &self.member, &invocation)
    }

    /// Answers a call whose handler returned [`CallOutcome::Retain`](crate::CallOutcome::Retain).
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the caller stopped waiting.
    pub fn call_return(&self, token: ReturnToken, reply: Vec<u8>) -> FusionResult<()> {
        call::deliver_reply(&self.world, token, reply)
    }

    /// Destroys a call owned by this fusionee.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] for calls owned by others.
    pub fn call_destroy(&self, call: CallId) -> FusionResult<()> {
        self.world.calls.destroy(call, self.id())
    }

    /// Names a call for diagnostics.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] for calls owned by others.
    pub fn call_set_name(&self, call: CallId, name: &str) -> FusionResult<()> {
        self.world.calls.set_name(call, self.id(), name)
    }

    /// Returns the name given with [`call_set_name`](Self::call_set_name).
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the call is gone.
    pub fn call_name(&self, call: CallId) -> FusionResult<Option<String>> {
        Ok(self.world.calls.get(call)?.name())
    }

    /// Returns the owner of a call.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the call is gone.
    pub fn call_owner(&self, call: CallId) -> FusionResult<FusionId> {
        Ok(self.world.calls.get(call)?.owner)
    }

    /// Sends queued one-way calls now. Returns how many were sent.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if their target left.
    pub fn flush_calls(&self) -> FusionResult<usize> {
        self.member.bin.lock().flush()
    }

    // =========================================================================
    // Reactors
    // =========================================================================

    /// Creates a reactor owned by this fusionee.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if not joined.
    pub fn reactor_create(&self) -> FusionResult<ReactorId> {
        self.ensure_joined()?;
        Ok(self.world.reactors.create(self.id()))
    }

    /// Listens to one channel of a reactor.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the reactor is gone.
    pub fn reactor_attach(&self, reactor: ReactorId, channel: u32) -> FusionResult<Listener> {
        self.ensure_joined()?;
        self.world.reactors.attach(reactor, self.id(), channel)
    }

    /// Publishes a message to every listener of a channel. Never blocks.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the reactor is gone,
    /// [`FusionError::InvalidArgument`] for oversized messages.
    pub fn reactor_dispatch(&self, reactor: ReactorId, channel: u32, message: &[u8]) -> FusionResult<DispatchReport> {
        self.reactor_dispatch_with_globals(reactor, channel, message, &[])
    }

    /// Like [`reactor_dispatch`](Self::reactor_dispatch), running the
    /// global reactions of channel 0 from `globals` first.
    ///
    /// # Errors
    ///
    /// See [`reactor_dispatch`](Self::reactor_dispatch).
    pub fn reactor_dispatch_with_globals(
        &self,
        reactor: ReactorId,
        channel: u32,
        message: &[u8],
        globals: &[GlobalReaction],
    ) -> FusionResult<DispatchReport> {
        self.ensure_joined()?;
        self.world.reactors.dispatch(reactor, self.id(), channel, 0, message, globals)
    }

    /// Attaches entry `index` of the global reaction table to a reactor.
    ///
    /// # Errors
    ///
    /// [`FusionError::NoSuchInstance`] if the reactor is gone.
    pub fn reactor_attach_global(&self, reactor: ReactorId, index: usize, ctx: u64) -> FusionResult<GlobalReactionId> {
        self.ensure_joined()?;
        self.world.reactors.attach_global(reactor, index, ctx)
    }

    /// Detaches a global reaction.
    ///
    /// # Errors
    ///
    /// [`FusionError::InvalidState`] if it is not attached.
    pub fn reactor_detach_global(&self, reactor: ReactorId, global: GlobalReactionId) -> FusionResult<()> {
        self.world.reactors.detach_global(reactor, global)
    }

    /// Executes `call` one-way after every dispatch on `reactor` was
    /// consumed by all of its listeners. The request carries the reactor
    /// id (8 bytes) and the channel (4 bytes), little endian.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] unless called by the owner,
    /// [`FusionError::InvalidState`] once the reactor was destroyed.
    pub fn reactor_set_dispatch_callback(&self, reactor: ReactorId, call: CallId, call_arg: i32) -> FusionResult<()> {
        self.ensure_joined()?;
        self.world.calls.get(call)?;
        self.world.reactors.set_dispatch_callback(reactor, self.id(), call, call_arg)
    }

    /// Releases the owner's reference on a reactor.
    ///
    /// # Errors
    ///
    /// [`FusionError::AccessDenied`] unless called by the owner.
    pub fn reactor_destroy(&self, reactor: ReactorId) -> FusionResult<()> {
        self.world.reactors.destroy(reactor, self.id())
    }

    // =========================================================================
    // Arenas
    // =========================================================================

    /// Enters the arena `name`, creating it if needed.
    ///
    /// The first fusionee in runs `initialize`, everybody after it runs
    /// `join`. Both run while the arena is locked.
    ///
    /// # Errors
    ///
    /// [`FusionError::HandlerFailed`] with the callback's code; a failed
    /// initializer leaves no arena behind.
    pub fn arena_enter(
        &self,
        name: &str,
        initialize: impl FnOnce(&Arena) -> ArenaResult,
        join: impl FnOnce(&Arena) -> ArenaResult,
    ) -> FusionResult<Arc<Arena>> {
        self.ensure_joined()?;
        ArenaTable::enter(&self.world, self.id(), name, initialize, join)
    }

    /// Exits an arena.
    ///
    /// # Arguments
    ///
    /// * `arena` - Arena entered before
    /// * `shutdown` - Run by the last fusionee out; the arena is gone afterwards
    /// * `leave` - Run by everybody else
    /// * `emergency` - Passed to the callbacks
    ///
    /// # Errors
    ///
    /// - [`FusionError::Busy`] if others are still inside and no `leave`
    ///   was given; the caller stays inside
    /// - [`FusionError::HandlerFailed`] with the callback's code
    /// - [`FusionError::InvalidState`] if the caller is not inside
    pub fn arena_exit(
        &self,
        arena: &Arc<Arena>,
        shutdown: impl FnOnce(&Arena, bool) -> ArenaResult,
        leave: Option<&mut dyn FnMut(&Arena, bool) -> ArenaResult>,
        emergency: bool,
    ) -> FusionResult<()> {
        ArenaTable::exit(&self.world, self.id(), arena, shutdown, leave, emergency)
    }
}

impl Drop for Fusionee {
    fn drop(&mut self) {
        if self.member.is_joined() {
            tracing::debug!("{} dropped without leaving world {}", self.id(), self.world.index);
        }
        self.liveness.take();
        self.stop_dispatcher();
    }
}
