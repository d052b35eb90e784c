//! Per-slot handshake state machine.
//!
//! One `IncomingConnection` drives a freshly accepted control socket
//! through the three-message exchange, owning every resource it acquires
//! along the way. All I/O is non-blocking and level-triggered: one read or
//! write per wake-up, with the reactor interest following the state.
use std::io;
use std::io::{Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, trace};

use safeipc_reactor::{interest, IoEvents, LocalDuration, LocalTime, TimerManager, TimerToken};

use crate::conn::Connection;
use crate::dispatch::{Callback, DispatchError, DispatchId, ReactorDispatcher};
use crate::shm::{Access, SharedMemory};
use crate::wire::{ClientHello, ServerAccept, ACCEPT_LEN, ACK_LEN, HELLO_LEN, PROTOCOL_VERSION};

/// Time budget for a client to complete the handshake.
pub const HANDSHAKE_TIMEOUT: LocalDuration = LocalDuration::from_secs(10);

/// Lower bound on the server-to-client stream capacity, in bytes.
pub const MIN_BUFFER_SIZE: u64 = 4096;

/// Establishment deadline policy, decided at acceptor construction.
#[derive(Clone)]
pub enum TimerPolicy {
    /// Handshakes never time out.
    NeverExpire,
    /// Each handshake arms a deadline with this manager. The manager is
    /// ticked by the host; an expired deadline fires the slot's expiry
    /// event through the reactor.
    Managed(Arc<TimerManager>),
}

/// Capacity bounds applied to the peer's buffer request.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BufferLimits {
    pub min_buffer: u64,
    pub server_hint: u64,
}

/// The server-to-client capacity actually allocated: the peer's hint capped
/// by the server-wide hint from above and the minimum from below.
pub(crate) fn effective_capacity(min_buffer: u64, server_hint: u64, client_hint: u64) -> u64 {
    min_buffer.max(client_hint.min(server_hint))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandshakeState {
    ReceivingHello,
    CreatingBuffers,
    SendingAccept,
    ReceivingAck,
    Established,
    Failed,
}

/// Why a slot went to `Failed`. Never surfaced to the acceptor caller;
/// counted through the establishment-error event and logged.
#[derive(Error, Debug)]
pub(crate) enum HandshakeError {
    #[error("peer speaks protocol version {0}")]
    ProtocolMismatch(u16),
    #[error("failed to map peer segment: {0}")]
    MapFailed(io::Error),
    #[error("failed to create stream segment: {0}")]
    CreateFailed(io::Error),
    #[error("handshake i/o failed: {0}")]
    Io(io::Error),
    #[error("peer closed during handshake")]
    PeerClosed,
    #[error("handshake timed out")]
    TimedOut,
    #[error("server shutting down")]
    Cancelled,
}

enum Step {
    Wait,
    Done,
}

pub(crate) enum Progress {
    Pending,
    Established,
    Failed,
}

pub(crate) struct IncomingConnection {
    socket: Option<UnixStream>,
    state: HandshakeState,
    io_id: DispatchId,
    expiry_id: DispatchId,
    timer: Option<TimerToken>,
    deadline: Option<LocalTime>,
    hello_buf: [u8; HELLO_LEN],
    hello_len: usize,
    accept_buf: [u8; ACCEPT_LEN],
    accept_sent: usize,
    hello: Option<ClientHello>,
    c2s: Option<SharedMemory>,
    notify: Option<SharedMemory>,
    s2c: Option<SharedMemory>,
    failure: Option<HandshakeError>,
}

impl IncomingConnection {
    /// Take ownership of an accepted socket and start the handshake:
    /// register the socket readable, register the expiry event, and arm the
    /// deadline. Unwinds the partial registration on failure.
    pub(crate) fn start<C>(
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
        timeout: LocalDuration,
        socket: UnixStream,
        io_cb: Callback<C>,
        expiry_cb: Callback<C>,
    ) -> Result<Self, DispatchError> {
        let io_id = dispatcher.register_fd(socket.as_raw_fd(), interest::READ, io_cb)?;
        let expiry_id = match dispatcher.register_software_event(expiry_cb) {
            Ok(id) => id,
            Err(err) => {
                dispatcher.unregister(io_id);
                return Err(err);
            }
        };

        let (timer, deadline) = match timers {
            TimerPolicy::NeverExpire => (None, None),
            TimerPolicy::Managed(manager) => {
                let deadline = LocalTime::now() + timeout;
                let trigger = dispatcher
                    .event_trigger(expiry_id)
                    .expect("freshly registered event has a trigger");
                (
                    Some(manager.arm(deadline, move || trigger.fire())),
                    Some(deadline),
                )
            }
        };

        Ok(Self {
            socket: Some(socket),
            state: HandshakeState::ReceivingHello,
            io_id,
            expiry_id,
            timer,
            deadline,
            hello_buf: [0; HELLO_LEN],
            hello_len: 0,
            accept_buf: [0; ACCEPT_LEN],
            accept_sent: 0,
            hello: None,
            c2s: None,
            notify: None,
            s2c: None,
            failure: None,
        })
    }

    pub(crate) fn state(&self) -> HandshakeState {
        self.state
    }

    pub(crate) fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.state == HandshakeState::Failed
    }

    #[cfg(test)]
    pub(crate) fn failure(&self) -> Option<&HandshakeError> {
        self.failure.as_ref()
    }

    /// Drive the state machine on socket readiness.
    pub(crate) fn on_socket_ready<C>(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
        limits: BufferLimits,
        events: IoEvents,
    ) -> Progress {
        if events.error || events.hangup {
            // Let the subsequent read or write fail.
            trace!(target: "ipc", "socket error reported: {events:?}");
        }

        let step = match self.state {
            HandshakeState::ReceivingHello if events.readable => {
                self.recv_hello(dispatcher, limits)
            }
            HandshakeState::SendingAccept if events.writable => self.send_accept(dispatcher),
            HandshakeState::ReceivingAck if events.readable => self.recv_ack(),
            _ => Ok(Step::Wait),
        };

        match step {
            Ok(Step::Wait) => Progress::Pending,
            Ok(Step::Done) => {
                self.establish(dispatcher, timers);
                Progress::Established
            }
            Err(err) => {
                self.fail(dispatcher, timers, err);
                Progress::Failed
            }
        }
    }

    /// The deadline fired while the handshake was still in flight.
    pub(crate) fn on_expiry<C>(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
    ) -> Progress {
        match self.state {
            HandshakeState::Established | HandshakeState::Failed => Progress::Pending,
            _ => {
                self.fail(dispatcher, timers, HandshakeError::TimedOut);
                Progress::Failed
            }
        }
    }

    /// Teardown of a slot that may still be mid-handshake; performs exactly
    /// the `Failed` cleanup.
    pub(crate) fn cancel<C>(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
    ) {
        match self.state {
            HandshakeState::Established | HandshakeState::Failed => {}
            _ => self.fail(dispatcher, timers, HandshakeError::Cancelled),
        }
    }

    /// Hand the slot's resources to the data plane.
    pub(crate) fn into_connection(mut self) -> Connection {
        debug_assert_eq!(self.state, HandshakeState::Established);

        Connection::new(
            self.socket.take().expect("established slot owns its socket"),
            self.s2c.take().expect("established slot owns its s2c segment"),
            self.c2s.take().expect("established slot owns its c2s segment"),
            self.notify
                .take()
                .expect("established slot owns its notify segment"),
        )
    }

    fn recv_hello<C>(
        &mut self,
        dispatcher: &ReactorDispatcher<C>,
        limits: BufferLimits,
    ) -> Result<Step, HandshakeError> {
        let socket = self.socket.as_mut().expect("non-terminal slot owns its socket");

        // Nb. poll is level-triggered; if more bytes are already buffered we
        // are woken again, so one read per wake-up is enough.
        match socket.read(&mut self.hello_buf[self.hello_len..]) {
            Ok(0) => return Err(HandshakeError::PeerClosed),
            Ok(n) => self.hello_len += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Wait),
            Err(err) => return Err(HandshakeError::Io(err)),
        }
        if self.hello_len < HELLO_LEN {
            return Ok(Step::Wait);
        }

        let hello = ClientHello::decode(&self.hello_buf);
        trace!(
            target: "ipc",
            "hello received: version={} c2s={} notify={} hint={}",
            hello.protocol_version,
            hello.c2s_shm,
            hello.notify_shm,
            hello.s2c_capacity_hint,
        );

        if hello.protocol_version != PROTOCOL_VERSION {
            return Err(HandshakeError::ProtocolMismatch(hello.protocol_version));
        }
        let c2s =
            SharedMemory::open(hello.c2s_shm, Access::ReadOnly).map_err(HandshakeError::MapFailed)?;
        let notify = SharedMemory::open(hello.notify_shm, Access::ReadWrite)
            .map_err(HandshakeError::MapFailed)?;
        self.state = HandshakeState::CreatingBuffers;

        // Synchronous continuation: size and create the outbound stream.
        let capacity =
            effective_capacity(limits.min_buffer, limits.server_hint, hello.s2c_capacity_hint);
        let s2c =
            SharedMemory::create(capacity as usize).map_err(HandshakeError::CreateFailed)?;
        self.accept_buf = ServerAccept { s2c_shm: s2c.id() }.encode();
        self.hello = Some(hello);
        self.c2s = Some(c2s);
        self.notify = Some(notify);
        self.s2c = Some(s2c);

        self.check_deadline()?;
        self.state = HandshakeState::SendingAccept;
        dispatcher.set_events(self.io_id, interest::WRITE);
        Ok(Step::Wait)
    }

    fn send_accept<C>(&mut self, dispatcher: &ReactorDispatcher<C>) -> Result<Step, HandshakeError> {
        let socket = self.socket.as_mut().expect("non-terminal slot owns its socket");

        match socket.write(&self.accept_buf[self.accept_sent..]) {
            Ok(0) => return Err(HandshakeError::PeerClosed),
            Ok(n) => self.accept_sent += n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(Step::Wait),
            Err(err) => return Err(HandshakeError::Io(err)),
        }
        if self.accept_sent < ACCEPT_LEN {
            // Write interest stays armed until the message is out.
            return Ok(Step::Wait);
        }

        self.check_deadline()?;
        self.state = HandshakeState::ReceivingAck;
        dispatcher.set_events(self.io_id, interest::READ);
        Ok(Step::Wait)
    }

    fn recv_ack(&mut self) -> Result<Step, HandshakeError> {
        let socket = self.socket.as_mut().expect("non-terminal slot owns its socket");
        let mut ack = [0u8; ACK_LEN];

        match socket.read(&mut ack) {
            // The acknowledgement byte's value is immaterial.
            Ok(0) => Err(HandshakeError::PeerClosed),
            Ok(_) => Ok(Step::Done),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(Step::Wait),
            Err(err) => Err(HandshakeError::Io(err)),
        }
    }

    fn establish<C>(&mut self, dispatcher: &mut ReactorDispatcher<C>, timers: &TimerPolicy) {
        dispatcher.unregister(self.io_id);
        dispatcher.unregister(self.expiry_id);
        self.disarm(timers);
        self.state = HandshakeState::Established;

        debug!(
            target: "ipc",
            "connection established, s2c capacity {}",
            self.s2c.as_ref().map(SharedMemory::len).unwrap_or(0),
        );
    }

    fn fail<C>(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        timers: &TimerPolicy,
        err: HandshakeError,
    ) {
        debug!(target: "ipc", "handshake failed in {:?}: {err}", self.state);

        dispatcher.unregister(self.io_id);
        dispatcher.unregister(self.expiry_id);
        self.disarm(timers);
        self.socket = None;
        self.c2s = None;
        self.notify = None;
        self.s2c = None;
        self.state = HandshakeState::Failed;
        self.failure = Some(err);
    }

    fn disarm(&mut self, timers: &TimerPolicy) {
        if let (Some(token), TimerPolicy::Managed(manager)) = (self.timer.take(), timers) {
            manager.disarm(token);
        }
    }

    /// Progress edges re-check the remaining budget; they never extend it.
    fn check_deadline(&self) -> Result<(), HandshakeError> {
        match self.deadline {
            Some(deadline) if LocalTime::now() >= deadline => Err(HandshakeError::TimedOut),
            _ => Ok(()),
        }
    }
}
