//! The acceptor: outermost state machine and thread-safe public surface.
//!
//! All state lives behind one mutex. External threads serialize through it;
//! the event thread enters through [`DispatchSink::on_reactor_event`], which
//! funnels every wake-up into the dispatcher under the same lock. The one
//! place the lock is *not* held is the user-callback invocation: a
//! completion staged by the acceptor's software-event handler is delivered
//! after the lock is released, so the callback may re-enter the public API
//! freely.
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, error};

use safeipc_reactor::{Handle, IoEvents, LocalDuration};

use crate::backlog::SlotRoutes;
use crate::conn::Connection;
use crate::dispatch::{DispatchId, DispatchSink, ReactorDispatcher};
use crate::error::AcceptError;
use crate::incoming::{TimerPolicy, HANDSHAKE_TIMEOUT, MIN_BUFFER_SIZE};
use crate::server::{Server, ServerConfig};

/// Default number of parallel handshake slots.
pub const BACKLOG_CAPACITY: usize = 32;

/// Completion callback of [`Acceptor::accept_async`]. Invoked on the event
/// thread, outside the acceptor's lock, at most once per accept request.
pub type AcceptCallback = Box<dyn FnOnce(Result<Connection, AcceptError>) + Send>;

/// Acceptor configuration, passed by construction.
#[derive(Clone)]
pub struct AcceptorConfig {
    /// Filesystem path of the rendezvous socket.
    pub path: PathBuf,
    /// Registration handle of the reactor whose event thread serves this
    /// acceptor.
    pub reactor: Handle,
    /// Establishment deadline policy.
    pub timers: TimerPolicy,
    /// Number of parallel handshake slots.
    pub backlog_capacity: usize,
    /// Lower bound on per-connection stream capacity, in bytes.
    pub min_buffer: u64,
    /// Per-connection establishment budget.
    pub handshake_timeout: LocalDuration,
}

impl AcceptorConfig {
    /// Defaults for everything but the address, reactor and timer policy.
    pub fn new(path: impl Into<PathBuf>, reactor: Handle, timers: TimerPolicy) -> Self {
        Self {
            path: path.into(),
            reactor,
            timers,
            backlog_capacity: BACKLOG_CAPACITY,
            min_buffer: MIN_BUFFER_SIZE,
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptorState {
    Closed,
    OpenIdle,
    OpenAccepting,
}

pub(crate) struct Core {
    state: AcceptorState,
    config: AcceptorConfig,
    dispatcher: Option<ReactorDispatcher<Core>>,
    server: Option<Server<Core>>,
    /// The acceptor-level software event.
    event_id: Option<DispatchId>,
    /// At most one accept completion is pending.
    pending: Option<AcceptCallback>,
    /// Completion prepared by the event handler, delivered once the lock is
    /// released.
    staged: Option<(AcceptCallback, Result<Connection, AcceptError>)>,
    /// A user callback is executing on the event thread right now.
    callback_running: bool,
}

impl Core {
    fn dispatcher_mut(core: &mut Core) -> &mut ReactorDispatcher<Core> {
        core.dispatcher
            .as_mut()
            .expect("dispatcher present while dispatching")
    }

    fn on_listener_ready(&mut self, events: IoEvents) {
        let Core {
            server, dispatcher, ..
        } = self;
        if let (Some(server), Some(dispatcher)) = (server.as_mut(), dispatcher.as_mut()) {
            server.on_listener_ready(dispatcher, events);
        }
    }

    fn on_slot_ready(&mut self, index: usize, events: IoEvents) {
        let Core {
            server, dispatcher, ..
        } = self;
        if let (Some(server), Some(dispatcher)) = (server.as_mut(), dispatcher.as_mut()) {
            server.on_slot_ready(index, dispatcher, events);
        }
    }

    fn on_slot_expiry(&mut self, index: usize) {
        let Core {
            server, dispatcher, ..
        } = self;
        if let (Some(server), Some(dispatcher)) = (server.as_mut(), dispatcher.as_mut()) {
            server.on_slot_expiry(index, dispatcher);
        }
    }

    fn on_establishment_error(&mut self) {
        let Core {
            server, dispatcher, ..
        } = self;
        if let (Some(server), Some(dispatcher)) = (server.as_mut(), dispatcher.as_ref()) {
            server.on_establishment_error(dispatcher);
        }
    }

    /// The acceptor's own event: deliver a completion if one can be
    /// delivered. Establishment and error wake-ups coalesce into this one
    /// handler, which inspects the server state on every wake.
    fn on_acceptor_event(&mut self) {
        if self.pending.is_none() {
            return;
        }
        let Some(server) = self.server.as_mut() else {
            return;
        };

        if server.status().is_some() {
            let callback = self.pending.take().expect("pending checked above");
            self.state = AcceptorState::OpenIdle;
            self.staged = Some((callback, Err(AcceptError::Disconnected)));
        } else if server.has_established() {
            match server.take_connection() {
                Ok(conn) => {
                    let callback = self.pending.take().expect("pending checked above");
                    self.state = AcceptorState::OpenIdle;
                    self.staged = Some((callback, Ok(conn)));
                }
                Err(err) => debug!(target: "ipc", "established connection raced away: {err}"),
            }
        }
    }
}

pub(crate) struct Shared {
    core: Mutex<Core>,
}

impl DispatchSink for Shared {
    fn on_reactor_event(&self, id: DispatchId, events: IoEvents) {
        let mut core = self.core.lock().unwrap();
        if core.dispatcher.is_none() {
            // Closed since the wake-up was enqueued.
            return;
        }
        ReactorDispatcher::dispatch(&mut *core, Core::dispatcher_mut, id, events);

        if let Some((callback, result)) = core.staged.take() {
            core.callback_running = true;
            drop(core);

            callback(result);

            let mut core = self.core.lock().unwrap();
            core.callback_running = false;
        }
    }
}

/// Accepts SafeIPC peers on a named Unix-domain socket.
///
/// The closures installed at the reactor share ownership of the acceptor's
/// state, so the state outlives any wake-up still in flight; [`close`]
/// severs them. An acceptor must be closed, and [`is_in_use`] must report
/// `false`, before it is discarded.
///
/// [`close`]: Acceptor::close
/// [`is_in_use`]: Acceptor::is_in_use
pub struct Acceptor {
    shared: Arc<Shared>,
}

impl Acceptor {
    /// A closed acceptor. `init` makes it serve its configured address.
    pub fn new(config: AcceptorConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: AcceptorState::Closed,
                    config,
                    dispatcher: None,
                    server: None,
                    event_id: None,
                    pending: None,
                    staged: None,
                    callback_running: false,
                }),
            }),
        }
    }

    /// Bind and start serving. `s2c_capacity_hint` caps every connection's
    /// server-to-client stream from above.
    pub fn init(&self, s2c_capacity_hint: u64) -> Result<(), AcceptError> {
        let mut core = self.shared.core.lock().unwrap();
        if core.state != AcceptorState::Closed {
            return Err(AcceptError::AlreadyInitialized);
        }

        // One fd and one expiry event per slot, the listener, the failure
        // event, the acceptor event, and one spare absorbing a re-init that
        // races a closure still winding down.
        let capacity = Server::<Core>::max_used_slots(core.config.backlog_capacity) + 2;
        let shared_dyn: Arc<dyn DispatchSink> = self.shared.clone();
        let sink: Weak<dyn DispatchSink> = Arc::downgrade(&shared_dyn);
        let mut dispatcher =
            ReactorDispatcher::new(core.config.reactor.clone(), capacity, sink);

        let event_id = dispatcher
            .register_software_event(Box::new(|core: &mut Core, _| core.on_acceptor_event()))
            .map_err(|_| AcceptError::ResourceExhausted("dispatcher slots"))?;

        let server = Server::start(
            &mut dispatcher,
            ServerConfig {
                path: core.config.path.clone(),
                backlog_capacity: core.config.backlog_capacity,
                min_buffer: core.config.min_buffer,
                handshake_timeout: core.config.handshake_timeout,
                timers: core.config.timers.clone(),
            },
            event_id,
            s2c_capacity_hint,
            Box::new(|core: &mut Core, events| core.on_listener_ready(events)),
            Box::new(|core: &mut Core, _| core.on_establishment_error()),
            SlotRoutes {
                io: |index| Box::new(move |core: &mut Core, events| core.on_slot_ready(index, events)),
                expiry: |index| Box::new(move |core: &mut Core, _| core.on_slot_expiry(index)),
            },
        );
        let server = match server {
            Ok(server) => server,
            Err(err) => {
                dispatcher.unregister(event_id);
                return Err(err);
            }
        };

        core.dispatcher = Some(dispatcher);
        core.server = Some(server);
        core.event_id = Some(event_id);
        core.state = AcceptorState::OpenIdle;

        debug!(target: "ipc", "acceptor serving {}", core.config.path.display());
        Ok(())
    }

    /// Arrange for `callback` to receive the next established connection,
    /// or the sticky [`AcceptError::Disconnected`] once the server has
    /// latched an unrecoverable error.
    pub fn accept_async(
        &self,
        callback: impl FnOnce(Result<Connection, AcceptError>) + Send + 'static,
    ) -> Result<(), AcceptError> {
        let mut core = self.shared.core.lock().unwrap();

        if core.state == AcceptorState::Closed {
            return Err(AcceptError::NotInitialized);
        }
        if core.pending.is_some() {
            return Err(AcceptError::Busy);
        }
        if core.server.as_ref().and_then(Server::status).is_some() {
            return Err(AcceptError::Disconnected);
        }

        core.pending = Some(Box::new(callback));
        core.state = AcceptorState::OpenAccepting;

        // An already-established connection or latched error must be
        // delivered even without further reactor activity.
        if let (Some(dispatcher), Some(event_id)) = (&core.dispatcher, core.event_id) {
            dispatcher.trigger_software_event(event_id);
        }
        Ok(())
    }

    /// Stop serving and release every resource. Idempotent. A completion
    /// callback already executing runs to its end; no further callback is
    /// ever invoked.
    pub fn close(&self) {
        let mut core = self.shared.core.lock().unwrap();
        Self::close_locked(&mut core);
    }

    /// [`close`], then abort the process if a completion callback is
    /// executing; for deterministic shutdown paths.
    ///
    /// [`close`]: Acceptor::close
    pub fn close_and_assert_idle(&self) {
        let mut core = self.shared.core.lock().unwrap();
        Self::close_locked(&mut core);

        if core.callback_running {
            error!(target: "ipc", "acceptor discarded while its completion callback is executing");
            std::process::abort();
        }
    }

    fn close_locked(core: &mut Core) {
        if core.state == AcceptorState::Closed {
            return;
        }

        let mut dispatcher = core
            .dispatcher
            .take()
            .expect("open acceptor has a dispatcher");
        if let Some(server) = core.server.as_mut() {
            server.stop(&mut dispatcher);
        }
        core.server = None;
        dispatcher.unregister_all();

        core.event_id = None;
        core.pending = None;
        core.staged = None;
        core.state = AcceptorState::Closed;

        debug!(target: "ipc", "acceptor closed");
    }

    /// Whether `init` succeeded and `close` has not been called.
    pub fn is_open(&self) -> bool {
        self.shared.core.lock().unwrap().state != AcceptorState::Closed
    }

    /// Whether the acceptor is open or a completion callback is executing.
    /// Discarding the acceptor is legal only when this reports `false`.
    pub fn is_in_use(&self) -> bool {
        let core = self.shared.core.lock().unwrap();
        core.state != AcceptorState::Closed || core.callback_running
    }
}
