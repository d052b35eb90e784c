//! Listening-socket lifecycle and coalesced upward notification.
use std::fs;
use std::io;
use std::os::unix::io::AsRawFd;
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, error, trace};

use safeipc_reactor::{interest, IoEvents, LocalDuration};

use crate::backlog::{ConnectionBacklog, SlotRoutes};
use crate::conn::Connection;
use crate::dispatch::{Callback, DispatchId, ReactorDispatcher};
use crate::error::{classify_accept, classify_bind, AcceptError};
use crate::incoming::{BufferLimits, TimerPolicy};

/// Construction-time server parameters.
#[derive(Clone)]
pub(crate) struct ServerConfig {
    pub path: PathBuf,
    pub backlog_capacity: usize,
    pub min_buffer: u64,
    pub handshake_timeout: LocalDuration,
    pub timers: TimerPolicy,
}

pub(crate) struct Server<C> {
    config: ServerConfig,
    listener: UnixListener,
    listener_id: DispatchId,
    /// The backlog's establishment-error event; handled by reaping.
    failure_event: DispatchId,
    /// The parent's event, fired for "newly established" and "error
    /// latched" alike; the parent inspects `status` and `has_established`
    /// on every wake.
    parent_event: DispatchId,
    backlog: ConnectionBacklog<C>,
    /// Latched unrecoverable error. Once set, the listener is no longer
    /// monitored and no new connections are accepted.
    status: Option<AcceptError>,
    /// Server-wide cap on per-connection stream capacity.
    server_hint: u64,
}

impl<C> Server<C> {
    /// Dispatcher entries a running server can occupy: one descriptor and
    /// one expiry event per slot, the listener, and the failure event.
    pub(crate) const fn max_used_slots(backlog_capacity: usize) -> usize {
        2 * backlog_capacity + 2
    }

    /// Bind the listener and register everything the server needs. Partial
    /// failures unwind, leaving no registration and no socket file behind.
    pub(crate) fn start(
        dispatcher: &mut ReactorDispatcher<C>,
        config: ServerConfig,
        parent_event: DispatchId,
        s2c_capacity_hint: u64,
        on_listener: Callback<C>,
        on_failure: Callback<C>,
        routes: SlotRoutes<C>,
    ) -> Result<Self, AcceptError> {
        let listener = UnixListener::bind(&config.path).map_err(classify_bind)?;

        if let Err(err) = listener.set_nonblocking(true) {
            let _ = fs::remove_file(&config.path);
            return Err(AcceptError::Unexpected(Arc::new(err)));
        }

        let listener_id =
            match dispatcher.register_fd(listener.as_raw_fd(), interest::READ, on_listener) {
                Ok(id) => id,
                Err(_) => {
                    let _ = fs::remove_file(&config.path);
                    return Err(AcceptError::ResourceExhausted("dispatcher slots"));
                }
            };
        let failure_event = match dispatcher.register_software_event(on_failure) {
            Ok(id) => id,
            Err(_) => {
                dispatcher.unregister(listener_id);
                let _ = fs::remove_file(&config.path);
                return Err(AcceptError::ResourceExhausted("dispatcher slots"));
            }
        };

        let backlog =
            ConnectionBacklog::new(config.backlog_capacity, routes, parent_event, failure_event);

        debug!(target: "ipc", "listening on {}", config.path.display());
        Ok(Self {
            config,
            listener,
            listener_id,
            failure_event,
            parent_event,
            backlog,
            status: None,
            server_hint: s2c_capacity_hint,
        })
    }

    /// The latched unrecoverable error, if any. Reading does not consume.
    pub(crate) fn status(&self) -> Option<AcceptError> {
        self.status.clone()
    }

    pub(crate) fn has_established(&self) -> bool {
        self.backlog.has_established()
    }

    /// Extract one established connection.
    pub(crate) fn take_connection(&mut self) -> Result<Connection, AcceptError> {
        if self.backlog.take_next_established().is_none() {
            return Err(AcceptError::ResourceExhausted("no established connection"));
        }
        Ok(self.backlog.pop_last().into_connection())
    }

    /// The listening socket is readable: accept until it would block.
    pub(crate) fn on_listener_ready(
        &mut self,
        dispatcher: &mut ReactorDispatcher<C>,
        _events: IoEvents,
    ) {
        loop {
            let socket = match self.listener.accept() {
                Ok((socket, _)) => socket,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    self.latch(dispatcher, classify_accept(err));
                    break;
                }
            };

            if self.backlog.is_full() {
                // Admission control: the peer observes a close and retries.
                debug!(target: "ipc", "backlog full, refusing connection");
                drop(socket);
                continue;
            }
            if let Err(err) = socket.set_nonblocking(true) {
                debug!(target: "ipc", "failed to prepare accepted socket: {err}");
                continue;
            }

            trace!(target: "ipc", "accepting peer connection");
            if let Err(err) = self.backlog.add(
                dispatcher,
                &self.config.timers,
                self.config.handshake_timeout,
                socket,
            ) {
                debug!(target: "ipc", "no dispatcher slot for connection: {err}");
            }
        }
    }

    /// A slot reported a failed handshake: reap, and wake the parent if
    /// anything was actually reclaimed.
    pub(crate) fn on_establishment_error(&mut self, dispatcher: &ReactorDispatcher<C>) {
        let reaped = self.backlog.reap_failed();

        trace!(target: "ipc", "reaped {reaped} failed handshake(s)");
        if reaped > 0 {
            dispatcher.trigger_software_event(self.parent_event);
        }
    }

    /// Route socket readiness to a backlog slot.
    pub(crate) fn on_slot_ready(
        &mut self,
        index: usize,
        dispatcher: &mut ReactorDispatcher<C>,
        events: IoEvents,
    ) {
        let limits = BufferLimits {
            min_buffer: self.config.min_buffer,
            server_hint: self.server_hint,
        };
        self.backlog
            .on_socket_ready(index, dispatcher, &self.config.timers, limits, events);
    }

    /// Route a deadline expiry to a backlog slot.
    pub(crate) fn on_slot_expiry(&mut self, index: usize, dispatcher: &mut ReactorDispatcher<C>) {
        self.backlog
            .on_expiry(index, dispatcher, &self.config.timers);
    }

    /// Unregister everything, cancel in-flight handshakes, remove the
    /// socket file.
    pub(crate) fn stop(&mut self, dispatcher: &mut ReactorDispatcher<C>) {
        dispatcher.unregister(self.listener_id);
        self.backlog.shutdown(dispatcher, &self.config.timers);
        dispatcher.unregister(self.failure_event);

        if let Err(err) = fs::remove_file(&self.config.path) {
            debug!(
                target: "ipc",
                "failed to remove {}: {err}",
                self.config.path.display(),
            );
        }
        debug!(target: "ipc", "stopped listening on {}", self.config.path.display());
    }

    fn latch(&mut self, dispatcher: &ReactorDispatcher<C>, err: AcceptError) {
        error!(target: "ipc", "unrecoverable server error: {err}");

        self.status = Some(err);
        dispatcher.remove_events(self.listener_id, interest::READ);
        dispatcher.trigger_software_event(self.parent_event);
    }

    #[cfg(test)]
    pub(crate) fn latch_for_tests(&mut self, dispatcher: &ReactorDispatcher<C>, err: AcceptError) {
        self.latch(dispatcher, err);
    }
}
