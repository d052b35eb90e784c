//! Multiplexes the callbacks of one subsystem through the reactor.
//!
//! The reactor may deliver a wake-up after the callback it was meant for is
//! gone: a software event captured at trigger time survives unregistration,
//! and a poll result can race a concurrent unregister. The dispatcher makes
//! unregistration final anyway. Every entry is addressed by a slot index
//! paired with a sequence number; a wake-up whose sequence no longer
//! matches the slot is dropped, and a callback unregistered while it is
//! executing is destroyed only after it returns.
//!
//! Every wake-up is routed through a single entry point on the owning
//! object ([`DispatchSink`]), so the owner serializes all callback
//! execution behind its own lock. The closures installed at the reactor
//! hold a strong reference to the owner; it cannot be destroyed while one
//! of them is still reachable from the poll set.
use std::os::unix::io::RawFd;
use std::sync::Weak;

use thiserror::Error;
use tracing::trace;

use safeipc_reactor::{Handle, Interest, IoEvents, Token};

/// Callback owned by a dispatcher slot. Runs on the event thread with
/// exclusive access to the owning subsystem's state.
pub type Callback<C> = Box<dyn FnMut(&mut C, IoEvents) + Send>;

/// Owner side of the dispatch indirection: the single entry point every
/// reactor wake-up is routed through.
pub trait DispatchSink: Send + Sync {
    fn on_reactor_event(&self, id: DispatchId, events: IoEvents);
}

/// Addresses one registered callback. Stale ids are detected by their
/// sequence number and dropped at dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchId {
    index: u32,
    sequence: u32,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DispatchError {
    /// Every slot is either valid or still winding down.
    #[error("no free dispatcher slot")]
    Exhausted,

    /// The owning object is already being torn down.
    #[error("dispatch owner is gone")]
    OwnerGone,
}

/// Fires one registered software event from any thread, without the
/// owner's lock. Firing after the slot was reused or unregistered is
/// harmless: the dispatch entry point drops the stale wake-up.
#[derive(Clone)]
pub struct EventTrigger {
    handle: Handle,
    token: Token,
}

impl EventTrigger {
    pub fn fire(&self) {
        self.handle.trigger(self.token).ok();
    }
}

enum SlotKind {
    Fd,
    Software,
}

struct Slot<C> {
    callback: Option<Callback<C>>,
    token: Option<Token>,
    kind: SlotKind,
    valid: bool,
    executing: bool,
    destroy_deferred: bool,
    sequence: u32,
}

impl<C> Slot<C> {
    fn vacant() -> Self {
        Self {
            callback: None,
            token: None,
            kind: SlotKind::Software,
            valid: false,
            executing: false,
            destroy_deferred: false,
            sequence: 0,
        }
    }
}

/// Fixed-capacity table of reactor callbacks belonging to one owner.
pub struct ReactorDispatcher<C> {
    handle: Handle,
    sink: Weak<dyn DispatchSink>,
    slots: Vec<Slot<C>>,
}

impl<C> ReactorDispatcher<C> {
    /// Create a dispatcher with a fixed number of slots, routing wake-ups
    /// to `sink`.
    pub fn new(handle: Handle, capacity: usize, sink: Weak<dyn DispatchSink>) -> Self {
        Self {
            handle,
            sink,
            slots: (0..capacity).map(|_| Slot::vacant()).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots available for registration.
    pub fn free_slots(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !s.valid && !s.executing)
            .count()
    }

    /// Register a descriptor with the reactor. The caller keeps ownership
    /// of the descriptor and must unregister before closing it.
    pub fn register_fd(
        &mut self,
        fd: RawFd,
        interest: Interest,
        callback: Callback<C>,
    ) -> Result<DispatchId, DispatchError> {
        let (index, id) = self.claim()?;
        let sink = self.sink.upgrade().ok_or(DispatchError::OwnerGone)?;
        let token = self
            .handle
            .register_fd(fd, interest, move |events| sink.on_reactor_event(id, events));

        self.install(index, SlotKind::Fd, token, callback);
        Ok(id)
    }

    /// Register a coalescing software event.
    pub fn register_software_event(
        &mut self,
        callback: Callback<C>,
    ) -> Result<DispatchId, DispatchError> {
        let (index, id) = self.claim()?;
        let sink = self.sink.upgrade().ok_or(DispatchError::OwnerGone)?;
        let token = self
            .handle
            .register_software_event(move |events| sink.on_reactor_event(id, events));

        self.install(index, SlotKind::Software, token, callback);
        Ok(id)
    }

    /// Replace the reactor interest of a registered descriptor.
    ///
    /// A stale id is ignored; any reactor failure other than an unknown
    /// source is a programming error.
    pub fn set_events(&self, id: DispatchId, interest: Interest) {
        let Some(token) = self.token_of(id, SlotKind::Fd) else {
            return;
        };
        match self.handle.set_interest(token, interest) {
            Ok(()) | Err(safeipc_reactor::Error::UnknownToken) => {}
            Err(err) => panic!("reactor rejected interest change: {err}"),
        }
    }

    /// Add directions to the reactor interest of a registered descriptor.
    pub fn add_events(&self, id: DispatchId, interest: Interest) {
        let Some(token) = self.token_of(id, SlotKind::Fd) else {
            return;
        };
        match self.handle.add_interest(token, interest) {
            Ok(()) | Err(safeipc_reactor::Error::UnknownToken) => {}
            Err(err) => panic!("reactor rejected interest change: {err}"),
        }
    }

    /// Remove directions from the reactor interest of a registered
    /// descriptor.
    pub fn remove_events(&self, id: DispatchId, interest: Interest) {
        let Some(token) = self.token_of(id, SlotKind::Fd) else {
            return;
        };
        match self.handle.remove_interest(token, interest) {
            Ok(()) | Err(safeipc_reactor::Error::UnknownToken) => {}
            Err(err) => panic!("reactor rejected interest change: {err}"),
        }
    }

    /// Fire a registered software event. Idempotent while the event is
    /// still pending.
    pub fn trigger_software_event(&self, id: DispatchId) {
        if let Some(token) = self.token_of(id, SlotKind::Software) {
            self.handle.trigger(token).ok();
        }
    }

    /// A cross-thread trigger for a registered software event.
    pub fn event_trigger(&self, id: DispatchId) -> Option<EventTrigger> {
        Some(EventTrigger {
            handle: self.handle.clone(),
            token: self.token_of(id, SlotKind::Software)?,
        })
    }

    /// Unregister a callback.
    ///
    /// The reactor-side source goes first, then the slot is invalidated.
    /// If the callback is executing right now its destruction is deferred
    /// to the moment it returns; either way it is never invoked again.
    pub fn unregister(&mut self, id: DispatchId) {
        let Some(index) = self.position(id) else {
            return;
        };
        self.release(index);
    }

    /// Unregister every callback; used at teardown.
    pub fn unregister_all(&mut self) {
        for index in 0..self.slots.len() {
            if self.slots[index].valid {
                self.release(index);
            }
        }
    }

    /// The common entry point: route a wake-up to the callback it
    /// addresses, unless the id went stale since the reactor enqueued it.
    pub fn dispatch(owner: &mut C, dispatcher: fn(&mut C) -> &mut Self, id: DispatchId, events: IoEvents) {
        let Some(mut callback) = dispatcher(owner).begin(id) else {
            trace!(target: "ipc", "dropping stale wake-up for {id:?}");
            return;
        };
        callback(owner, events);
        dispatcher(owner).finish(id, callback);
    }

    fn begin(&mut self, id: DispatchId) -> Option<Callback<C>> {
        let index = self.position(id)?;
        let slot = &mut self.slots[index];
        let callback = slot.callback.take()?;

        slot.executing = true;
        Some(callback)
    }

    fn finish(&mut self, id: DispatchId, callback: Callback<C>) {
        let slot = &mut self.slots[id.index as usize];

        slot.executing = false;
        if slot.destroy_deferred {
            slot.destroy_deferred = false;
            drop(callback);
        } else {
            slot.callback = Some(callback);
        }
    }

    /// Find a reusable slot and stamp its next sequence number. The bump
    /// happens before the new id is handed out, so any id still floating
    /// around for this slot is detectably stale.
    fn claim(&mut self) -> Result<(usize, DispatchId), DispatchError> {
        let index = self
            .slots
            .iter()
            .position(|slot| !slot.valid && !slot.executing)
            .ok_or(DispatchError::Exhausted)?;
        let slot = &mut self.slots[index];

        slot.sequence = slot.sequence.wrapping_add(1);
        Ok((
            index,
            DispatchId {
                index: index as u32,
                sequence: slot.sequence,
            },
        ))
    }

    fn install(&mut self, index: usize, kind: SlotKind, token: Token, callback: Callback<C>) {
        let slot = &mut self.slots[index];

        slot.kind = kind;
        slot.token = Some(token);
        slot.callback = Some(callback);
        slot.valid = true;
        slot.destroy_deferred = false;
    }

    fn release(&mut self, index: usize) {
        let token = self.slots[index].token.take();
        if let Some(token) = token {
            self.handle.unregister(token).ok();
        }

        let slot = &mut self.slots[index];
        slot.valid = false;
        if slot.executing {
            slot.destroy_deferred = true;
        } else {
            slot.callback = None;
        }
    }

    fn position(&self, id: DispatchId) -> Option<usize> {
        let index = id.index as usize;
        let slot = self.slots.get(index)?;

        (slot.valid && slot.sequence == id.sequence).then_some(index)
    }

    fn token_of(&self, id: DispatchId, kind: SlotKind) -> Option<Token> {
        let slot = &self.slots[self.position(id)?];

        match (&slot.kind, kind) {
            (SlotKind::Fd, SlotKind::Fd) | (SlotKind::Software, SlotKind::Software) => slot.token,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use safeipc_reactor::{LocalDuration, Reactor};
    use std::sync::{Arc, Mutex};

    struct NullSink;

    impl DispatchSink for NullSink {
        fn on_reactor_event(&self, _id: DispatchId, _events: IoEvents) {}
    }

    struct TestCtx {
        dispatcher: Option<ReactorDispatcher<TestCtx>>,
        self_id: Option<DispatchId>,
        hits: Vec<&'static str>,
    }

    fn dispatcher_of(ctx: &mut TestCtx) -> &mut ReactorDispatcher<TestCtx> {
        ctx.dispatcher.as_mut().unwrap()
    }

    fn test_ctx(capacity: usize) -> (TestCtx, Reactor, Arc<dyn DispatchSink>) {
        let reactor = Reactor::new().unwrap();
        let sink: Arc<dyn DispatchSink> = Arc::new(NullSink);
        let ctx = TestCtx {
            dispatcher: Some(ReactorDispatcher::new(
                reactor.handle(),
                capacity,
                Arc::downgrade(&sink),
            )),
            self_id: None,
            hits: Vec::new(),
        };
        (ctx, reactor, sink)
    }

    fn hit(label: &'static str) -> Callback<TestCtx> {
        Box::new(move |ctx, _| ctx.hits.push(label))
    }

    #[test]
    fn test_dispatch_routes_to_registered_callback() {
        let (mut ctx, _reactor, _sink) = test_ctx(4);

        let id = dispatcher_of(&mut ctx)
            .register_software_event(hit("a"))
            .unwrap();

        ReactorDispatcher::dispatch(&mut ctx, dispatcher_of, id, IoEvents::default());
        ReactorDispatcher::dispatch(&mut ctx, dispatcher_of, id, IoEvents::default());
        assert_eq!(ctx.hits, vec!["a", "a"]);
    }

    #[test]
    fn test_stale_id_is_suppressed_after_slot_reuse() {
        let (mut ctx, _reactor, _sink) = test_ctx(1);

        let old = dispatcher_of(&mut ctx)
            .register_software_event(hit("old"))
            .unwrap();
        dispatcher_of(&mut ctx).unregister(old);

        // Same slot, next sequence.
        let new = dispatcher_of(&mut ctx)
            .register_software_event(hit("new"))
            .unwrap();
        assert_ne!(old, new);

        ReactorDispatcher::dispatch(&mut ctx, dispatcher_of, old, IoEvents::default());
        assert!(ctx.hits.is_empty());

        ReactorDispatcher::dispatch(&mut ctx, dispatcher_of, new, IoEvents::default());
        assert_eq!(ctx.hits, vec!["new"]);
    }

    #[test]
    fn test_unregister_from_inside_callback_defers_destruction() {
        let (mut ctx, _reactor, _sink) = test_ctx(1);

        let id = dispatcher_of(&mut ctx)
            .register_software_event(Box::new(|ctx: &mut TestCtx, _| {
                ctx.hits.push("ran");
                let id = ctx.self_id.unwrap();
                dispatcher_of(ctx).unregister(id);
            }))
            .unwrap();
        ctx.self_id = Some(id);

        ReactorDispatcher::dispatch(&mut ctx, dispatcher_of, id, IoEvents::default());
        assert_eq!(ctx.hits, vec!["ran"]);

        // The callback destroyed itself; a replay of the same id is dropped
        // and the slot is free again.
        ReactorDispatcher::dispatch(&mut ctx, dispatcher_of, id, IoEvents::default());
        assert_eq!(ctx.hits, vec!["ran"]);
        assert_eq!(dispatcher_of(&mut ctx).free_slots(), 1);
    }

    #[test]
    fn test_register_fails_when_table_is_full() {
        let (mut ctx, _reactor, _sink) = test_ctx(2);

        dispatcher_of(&mut ctx)
            .register_software_event(hit("a"))
            .unwrap();
        dispatcher_of(&mut ctx)
            .register_software_event(hit("b"))
            .unwrap();
        assert_eq!(
            dispatcher_of(&mut ctx)
                .register_software_event(hit("c"))
                .unwrap_err(),
            DispatchError::Exhausted
        );

        dispatcher_of(&mut ctx).unregister_all();
        assert_eq!(dispatcher_of(&mut ctx).free_slots(), 2);
        dispatcher_of(&mut ctx)
            .register_software_event(hit("d"))
            .unwrap();
    }

    /// Owner wired like the acceptor: the sink locks its state and funnels
    /// into `dispatch`.
    struct EchoOwner {
        core: Mutex<TestCtx>,
    }

    impl DispatchSink for EchoOwner {
        fn on_reactor_event(&self, id: DispatchId, events: IoEvents) {
            let mut ctx = self.core.lock().unwrap();
            if ctx.dispatcher.is_none() {
                return;
            }
            ReactorDispatcher::dispatch(&mut *ctx, dispatcher_of, id, events);
        }
    }

    #[test]
    fn test_triggered_event_unregistered_before_poll_is_dropped() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        let owner = Arc::new_cyclic(|weak: &Weak<EchoOwner>| {
            let sink: Weak<dyn DispatchSink> = weak.clone();
            EchoOwner {
                core: Mutex::new(TestCtx {
                    dispatcher: Some(ReactorDispatcher::new(handle, 1, sink)),
                    self_id: None,
                    hits: Vec::new(),
                }),
            }
        });

        // Trigger, then unregister before the reactor dispatches: the
        // reactor still delivers the wake-up, the dispatcher drops it.
        {
            let mut ctx = owner.core.lock().unwrap();
            let id = dispatcher_of(&mut ctx)
                .register_software_event(hit("stale"))
                .unwrap();
            dispatcher_of(&mut ctx).trigger_software_event(id);
            dispatcher_of(&mut ctx).unregister(id);
        }
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert!(owner.core.lock().unwrap().hits.is_empty());

        // The reused slot's new registration fires exactly once.
        {
            let mut ctx = owner.core.lock().unwrap();
            let id = dispatcher_of(&mut ctx)
                .register_software_event(hit("fresh"))
                .unwrap();
            dispatcher_of(&mut ctx).trigger_software_event(id);
        }
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(owner.core.lock().unwrap().hits, vec!["fresh"]);
    }
}
