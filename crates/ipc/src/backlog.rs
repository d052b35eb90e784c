//! Fixed-capacity table of in-flight handshakes.
use std::os::unix::net::UnixStream;

use tracing::trace;

use safeipc_reactor::{IoEvents, LocalDuration};

use crate::dispatch::{Callback, DispatchError, DispatchId, ReactorDispatcher};
use crate::incoming::{BufferLimits, IncomingConnection, Progress, TimerPolicy};

/// Factories for the per-slot callbacks, installed once at server start.
/// Each receives the slot index it will route back to.
pub(crate) struct SlotRoutes<C> {
    pub io: fn(usize) -> Callback<C>,
    pub expiry: fn(usize) -> Callback<C>,
}

impl<C> Clone for SlotRoutes<C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for SlotRoutes<C> {}

pub(crate) struct ConnectionBacklog<C> {
    slots: Vec<Option<IncomingConnection>>,
    free_slots: usize,
    established: usize,
    /// Index recorded by `take_next_established`, consumed by `pop_last`.
    last_taken: Option<usize>,
    routes: SlotRoutes<C>,
    /// Parent-level event fired when a slot establishes.
    established_event: DispatchId,
    /// Server-level event fired when a slot fails.
    failure_event: DispatchId,
}

impl<C> ConnectionBacklog<C> {
    pub(crate) fn new(
        capacity: usize,
        routes: SlotRoutes<C>,
        established_event: DispatchId,
        failure_event: DispatchId,
    ) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            free_slots: capacity,
            established: 0,
            last_taken: None,
            routes,
            established_event,
            failure_event,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn free_slots(&self) -> usize {
        self.free_slots
    }

    pub(crate) fn is_full(&self) -> bool {
        self.free_slots == 0
    }

    pub(crate) fn has_established(&self) -> bool {
        self.established > 0
    }

    /// Start a handshake in the first free slot.
    ///
    /// The caller checks `is_full` first; a full table is admission
    /// control's problem, a dispatcher without free entries is ours and
    /// unwinds here.
    pub(crate) fn add(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
        timeout: LocalDuration,
        socket: UnixStream,
    ) -> Result<(), DispatchError> {
        debug_assert!(!self.is_full());
        let index = self
            .slots
            .iter()
            .position(Option::is_none)
            .expect("backlog has a free slot");

        let slot = IncomingConnection::start(
            dispatcher,
            timers,
            timeout,
            socket,
            (self.routes.io)(index),
            (self.routes.expiry)(index),
        )?;
        self.slots[index] = Some(slot);
        self.free_slots -= 1;

        trace!(target: "ipc", "handshake started in slot {index}");
        Ok(())
    }

    /// Route socket readiness to a slot's state machine.
    pub(crate) fn on_socket_ready(
        &mut self,
        index: usize,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
        limits: BufferLimits,
        events: IoEvents,
    ) {
        let Some(slot) = self.slots.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        match slot.on_socket_ready(dispatcher, timers, limits, events) {
            Progress::Pending => {}
            Progress::Established => self.report_established(dispatcher),
            Progress::Failed => self.report_error(dispatcher),
        }
    }

    /// Route a deadline expiry to a slot's state machine.
    pub(crate) fn on_expiry(
        &mut self,
        index: usize,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
    ) {
        let Some(slot) = self.slots.get_mut(index).and_then(Option::as_mut) else {
            return;
        };
        match slot.on_expiry(dispatcher, timers) {
            Progress::Pending | Progress::Established => {}
            Progress::Failed => self.report_error(dispatcher),
        }
    }

    fn report_established(&mut self, dispatcher: &ReactorDispatcher<C>) {
        self.established += 1;
        dispatcher.trigger_software_event(self.established_event);
    }

    fn report_error(&mut self, dispatcher: &ReactorDispatcher<C>) {
        dispatcher.trigger_software_event(self.failure_event);
    }

    /// The first established slot. The returned reference is invalidated by
    /// the matching `pop_last`.
    pub(crate) fn take_next_established(&mut self) -> Option<&IncomingConnection> {
        let index = self
            .slots
            .iter()
            .position(|slot| slot.as_ref().map_or(false, IncomingConnection::is_established))?;

        self.last_taken = Some(index);
        self.slots[index].as_ref()
    }

    /// Remove and return the slot found by the preceding
    /// `take_next_established`. Legal exactly once per take.
    pub(crate) fn pop_last(&mut self) -> IncomingConnection {
        let index = self
            .last_taken
            .take()
            .expect("take_next_established precedes pop_last");
        let slot = self.slots[index].take().expect("taken slot is occupied");

        debug_assert!(slot.is_established());
        self.free_slots += 1;
        self.established -= 1;
        slot
    }

    /// Destroy every failed slot; returns how many were reaped.
    pub(crate) fn reap_failed(&mut self) -> usize {
        let mut reaped = 0;

        for slot in &mut self.slots {
            if slot.as_ref().map_or(false, IncomingConnection::is_failed) {
                *slot = None;
                self.free_slots += 1;
                reaped += 1;
            }
        }
        reaped
    }

    /// Cancel and destroy every slot; used at server teardown.
    pub(crate) fn shutdown(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
    ) {
        for slot in &mut self.slots {
            if let Some(conn) = slot.as_mut() {
                conn.cancel(dispatcher, timers);
            }
            *slot = None;
        }
        self.free_slots = self.capacity();
        self.established = 0;
        self.last_taken = None;
    }

    #[cfg(test)]
    fn census(&self) -> (usize, usize, usize) {
        use crate::incoming::HandshakeState;

        let mut established = 0;
        let mut pending = 0;
        let mut failed = 0;
        for slot in self.slots.iter().flatten() {
            match slot.state() {
                HandshakeState::Established => established += 1,
                HandshakeState::Failed => failed += 1,
                _ => pending += 1,
            }
        }
        (established, pending, failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchSink;
    use crate::incoming::{HandshakeError, HANDSHAKE_TIMEOUT, MIN_BUFFER_SIZE};
    use crate::shm::SharedMemory;
    use crate::wire::{ClientHello, ServerAccept, ACCEPT_LEN, PROTOCOL_VERSION};
    use safeipc_reactor::{IoEvents, Reactor, TimerManager};
    use std::io::{Read, Write};
    use std::sync::Arc;

    struct NullSink;

    impl DispatchSink for NullSink {
        fn on_reactor_event(&self, _id: crate::dispatch::DispatchId, _events: IoEvents) {}
    }

    const LIMITS: BufferLimits = BufferLimits {
        min_buffer: MIN_BUFFER_SIZE,
        server_hint: 65536,
    };

    fn routes() -> SlotRoutes<()> {
        SlotRoutes {
            io: |_| Box::new(|_, _| {}),
            expiry: |_| Box::new(|_, _| {}),
        }
    }

    struct Rig {
        dispatcher: ReactorDispatcher<()>,
        backlog: ConnectionBacklog<()>,
        timers: TimerPolicy,
        _reactor: Reactor,
        _sink: Arc<dyn DispatchSink>,
    }

    fn rig(capacity: usize, timers: TimerPolicy) -> Rig {
        let reactor = Reactor::new().unwrap();
        let sink: Arc<dyn DispatchSink> = Arc::new(NullSink);
        let mut dispatcher =
            ReactorDispatcher::new(reactor.handle(), 2 * capacity + 2, Arc::downgrade(&sink));

        let established_event = dispatcher
            .register_software_event(Box::new(|_, _| {}))
            .unwrap();
        let failure_event = dispatcher
            .register_software_event(Box::new(|_, _| {}))
            .unwrap();
        let backlog = ConnectionBacklog::new(capacity, routes(), established_event, failure_event);

        Rig {
            dispatcher,
            backlog,
            timers,
            _reactor: reactor,
            _sink: sink,
        }
    }

    fn connect(rig: &mut Rig) -> UnixStream {
        let (client, server) = UnixStream::pair().unwrap();
        server.set_nonblocking(true).unwrap();
        rig.backlog
            .add(&mut rig.dispatcher, &rig.timers, HANDSHAKE_TIMEOUT, server)
            .unwrap();
        client
    }

    const READABLE: IoEvents = IoEvents {
        readable: true,
        writable: false,
        error: false,
        hangup: false,
        invalid: false,
    };
    const WRITABLE: IoEvents = IoEvents {
        readable: false,
        writable: true,
        error: false,
        hangup: false,
        invalid: false,
    };

    #[test]
    fn test_full_handshake_produces_connection() {
        let mut rig = rig(4, TimerPolicy::NeverExpire);
        let mut client = connect(&mut rig);
        assert_eq!(rig.backlog.free_slots(), 3);

        let c2s = SharedMemory::create(1024).unwrap();
        let notify = SharedMemory::create(1024).unwrap();
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            c2s_shm: c2s.id(),
            notify_shm: notify.id(),
            s2c_capacity_hint: 32768,
        };
        client.write_all(&hello.encode()).unwrap();

        rig.backlog
            .on_socket_ready(0, &mut rig.dispatcher, &rig.timers, LIMITS, READABLE);
        rig.backlog
            .on_socket_ready(0, &mut rig.dispatcher, &rig.timers, LIMITS, WRITABLE);

        let mut accept = [0u8; ACCEPT_LEN];
        client.read_exact(&mut accept).unwrap();
        let accept = ServerAccept::decode(&accept);

        client.write_all(&[0]).unwrap();
        rig.backlog
            .on_socket_ready(0, &mut rig.dispatcher, &rig.timers, LIMITS, READABLE);

        assert!(rig.backlog.has_established());
        assert_eq!(rig.backlog.census(), (1, 0, 0));

        assert!(rig.backlog.take_next_established().is_some());
        let conn = rig.backlog.pop_last().into_connection();
        assert_eq!(conn.s2c().id(), accept.s2c_shm);
        assert_eq!(conn.s2c().len(), 32768);
        assert_eq!(rig.backlog.free_slots(), 4);
        assert!(!rig.backlog.has_established());
    }

    #[test]
    fn test_protocol_mismatch_fails_slot() {
        let mut rig = rig(2, TimerPolicy::NeverExpire);
        let mut client = connect(&mut rig);

        let hello = ClientHello {
            protocol_version: 99,
            c2s_shm: SharedMemory::create(64).unwrap().id(),
            notify_shm: SharedMemory::create(64).unwrap().id(),
            s2c_capacity_hint: 4096,
        };
        client.write_all(&hello.encode()).unwrap();
        rig.backlog
            .on_socket_ready(0, &mut rig.dispatcher, &rig.timers, LIMITS, READABLE);

        assert_eq!(rig.backlog.census(), (0, 0, 1));
        assert_eq!(rig.backlog.reap_failed(), 1);
        assert_eq!(rig.backlog.census(), (0, 0, 0));
        assert_eq!(rig.backlog.free_slots(), 2);
    }

    #[test]
    fn test_unmappable_segment_fails_slot() {
        let mut rig = rig(2, TimerPolicy::NeverExpire);
        let mut client = connect(&mut rig);

        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            c2s_shm: crate::shm::ShmId::from_u64(0x7),
            notify_shm: crate::shm::ShmId::from_u64(0x8),
            s2c_capacity_hint: 4096,
        };
        client.write_all(&hello.encode()).unwrap();
        rig.backlog
            .on_socket_ready(0, &mut rig.dispatcher, &rig.timers, LIMITS, READABLE);

        assert_eq!(rig.backlog.census(), (0, 0, 1));
    }

    #[test]
    fn test_expiry_fails_pending_slot() {
        let manager = Arc::new(TimerManager::new());
        let mut rig = rig(2, TimerPolicy::Managed(manager.clone()));
        let _client = connect(&mut rig);
        assert_eq!(manager.len(), 1);

        let timers = rig.timers.clone();
        rig.backlog.on_expiry(0, &mut rig.dispatcher, &timers);

        assert_eq!(rig.backlog.census(), (0, 0, 1));
        let slot = rig.backlog.slots[0].as_ref().unwrap();
        assert!(matches!(slot.failure(), Some(HandshakeError::TimedOut)));
        // The deadline was disarmed by the failure transition.
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_peer_close_fails_slot() {
        let mut rig = rig(2, TimerPolicy::NeverExpire);
        let client = connect(&mut rig);
        drop(client);

        rig.backlog
            .on_socket_ready(0, &mut rig.dispatcher, &rig.timers, LIMITS, READABLE);
        assert_eq!(rig.backlog.census(), (0, 0, 1));
    }

    #[test]
    fn test_shutdown_clears_every_slot() {
        let mut rig = rig(3, TimerPolicy::NeverExpire);
        let _a = connect(&mut rig);
        let _b = connect(&mut rig);
        assert_eq!(rig.backlog.free_slots(), 1);

        let timers = rig.timers.clone();
        rig.backlog.shutdown(&mut rig.dispatcher, &timers);
        assert_eq!(rig.backlog.free_slots(), 3);
        assert_eq!(rig.backlog.census(), (0, 0, 0));
        // Every dispatcher entry except the two backlog events is free again.
        assert_eq!(rig.dispatcher.free_slots(), rig.dispatcher.capacity() - 2);
    }

    #[test]
    fn test_counters_balance() {
        let mut rig = rig(4, TimerPolicy::NeverExpire);
        let _a = connect(&mut rig);
        let _b = connect(&mut rig);

        let (established, pending, failed) = rig.backlog.census();
        assert_eq!(
            established + pending + failed + rig.backlog.free_slots(),
            rig.backlog.capacity()
        );
    }
}
