//! Poll-based reactor. This is a single-threaded reactor using a `poll` loop.
//!
//! Callbacks are registered against a [`Handle`], which may be cloned and used
//! from any thread; dispatch happens on the one thread driving
//! [`Reactor::run_once`]. Structural changes to the poll set are queued and
//! applied by the event thread at the edges of each iteration, so a
//! registration never blocks behind an in-flight poll.
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time;

use tracing::{error, trace};

use crate::error::Error;
use crate::time::LocalDuration;

/// Identifies one registered event source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Token(u64);

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Reserved for the waker that interrupts an in-flight poll.
const WAKER: Token = Token(0);

/// I/O interest on a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub read: bool,
    pub write: bool,
}

/// Interest constants.
pub mod interest {
    use super::Interest;

    pub const NONE: Interest = Interest {
        read: false,
        write: false,
    };
    pub const READ: Interest = Interest {
        read: true,
        write: false,
    };
    pub const WRITE: Interest = Interest {
        read: false,
        write: true,
    };
    pub const ALL: Interest = Interest {
        read: true,
        write: true,
    };
}

impl Interest {
    /// Check whether neither direction is of interest.
    pub fn is_empty(self) -> bool {
        !self.read && !self.write
    }

    /// Combine two interests.
    pub fn union(self, other: Interest) -> Interest {
        Interest {
            read: self.read || other.read,
            write: self.write || other.write,
        }
    }

    /// Remove `other` from this interest.
    pub fn minus(self, other: Interest) -> Interest {
        Interest {
            read: self.read && !other.read,
            write: self.write && !other.write,
        }
    }
}

/// Readiness reported to a callback.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoEvents {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
    pub hangup: bool,
    pub invalid: bool,
}

impl IoEvents {
    fn from_popol<K>(event: &popol::Event<K>) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            error: event.is_error(),
            hangup: event.is_hangup(),
            invalid: event.is_invalid(),
        }
    }
}

/// Callback invoked on the event thread when a source is ready.
pub type Handler = Arc<dyn Fn(IoEvents) + Send + Sync>;

enum EntryKind {
    Fd { fd: RawFd, interest: Interest },
    Software { pending: bool },
}

struct Entry {
    kind: EntryKind,
    handler: Handler,
}

enum SourceOp {
    Attach(RawFd, Interest),
    Detach,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<Token, Entry>,
    /// Poll-set mutations to be applied by the event thread.
    ops: VecDeque<(Token, SourceOp)>,
    /// Triggered software events, in trigger order. The handler is captured
    /// at trigger time, so a delivery already in flight survives a
    /// subsequent unregister; consumers needing stronger guarantees must
    /// detect staleness themselves.
    fired: Vec<(Token, Handler)>,
}

struct Shared {
    registry: Mutex<Registry>,
    waker: popol::Waker,
    next_token: AtomicU64,
}

/// Thread-safe registration surface of a [`Reactor`].
#[derive(Clone)]
pub struct Handle {
    shared: Arc<Shared>,
}

impl Handle {
    fn alloc(&self) -> Token {
        Token(self.shared.next_token.fetch_add(1, Ordering::SeqCst))
    }

    fn wake(&self) {
        if let Err(err) = self.shared.waker.wake() {
            error!(target: "reactor", "failed to wake poll loop: {err}");
        }
    }

    /// Register a descriptor for the given interest.
    ///
    /// The caller keeps ownership of the descriptor and must unregister the
    /// token before closing it.
    pub fn register_fd(
        &self,
        fd: RawFd,
        interest: Interest,
        handler: impl Fn(IoEvents) + Send + Sync + 'static,
    ) -> Token {
        let token = self.alloc();
        {
            let mut registry = self.shared.registry.lock().unwrap();

            registry.entries.insert(
                token,
                Entry {
                    kind: EntryKind::Fd { fd, interest },
                    handler: Arc::new(handler),
                },
            );
            registry.ops.push_back((token, SourceOp::Attach(fd, interest)));
        }
        self.wake();

        trace!(target: "reactor", "registered fd {fd} as {token}");
        token
    }

    /// Register a coalescing zero-payload event, fired with [`Handle::trigger`].
    pub fn register_software_event(
        &self,
        handler: impl Fn(IoEvents) + Send + Sync + 'static,
    ) -> Token {
        let token = self.alloc();
        let mut registry = self.shared.registry.lock().unwrap();

        registry.entries.insert(
            token,
            Entry {
                kind: EntryKind::Software { pending: false },
                handler: Arc::new(handler),
            },
        );

        trace!(target: "reactor", "registered software event {token}");
        token
    }

    /// Replace the interest of a registered descriptor.
    pub fn set_interest(&self, token: Token, interest: Interest) -> Result<(), Error> {
        let mut registry = self.shared.registry.lock().unwrap();

        match registry.entries.get_mut(&token) {
            Some(Entry {
                kind: EntryKind::Fd { fd, interest: cur },
                ..
            }) => {
                let fd = *fd;
                *cur = interest;
                registry.ops.push_back((token, SourceOp::Attach(fd, interest)));
                drop(registry);
                self.wake();
                Ok(())
            }
            _ => Err(Error::UnknownToken),
        }
    }

    /// Add directions to the interest of a registered descriptor.
    pub fn add_interest(&self, token: Token, interest: Interest) -> Result<(), Error> {
        let cur = self.current_interest(token)?;
        self.set_interest(token, cur.union(interest))
    }

    /// Remove directions from the interest of a registered descriptor.
    pub fn remove_interest(&self, token: Token, interest: Interest) -> Result<(), Error> {
        let cur = self.current_interest(token)?;
        self.set_interest(token, cur.minus(interest))
    }

    fn current_interest(&self, token: Token) -> Result<Interest, Error> {
        let registry = self.shared.registry.lock().unwrap();

        match registry.entries.get(&token) {
            Some(Entry {
                kind: EntryKind::Fd { interest, .. },
                ..
            }) => Ok(*interest),
            _ => Err(Error::UnknownToken),
        }
    }

    /// Fire a software event. Triggering an already-pending event is a no-op.
    pub fn trigger(&self, token: Token) -> Result<(), Error> {
        {
            let mut registry = self.shared.registry.lock().unwrap();
            let Registry { entries, fired, .. } = &mut *registry;

            match entries.get_mut(&token) {
                Some(Entry {
                    kind: EntryKind::Software { pending },
                    handler,
                }) => {
                    if *pending {
                        return Ok(());
                    }
                    *pending = true;
                    fired.push((token, handler.clone()));
                }
                _ => return Err(Error::UnknownToken),
            }
        }
        self.wake();
        Ok(())
    }

    /// Unregister a source. Its callback is dropped, except for a software
    /// event delivery already captured by a trigger.
    pub fn unregister(&self, token: Token) -> Result<(), Error> {
        let removed = {
            let mut registry = self.shared.registry.lock().unwrap();

            match registry.entries.remove(&token) {
                Some(entry) => {
                    if matches!(entry.kind, EntryKind::Fd { .. }) {
                        registry.ops.push_back((token, SourceOp::Detach));
                        true
                    } else {
                        false
                    }
                }
                None => return Err(Error::UnknownToken),
            }
        };
        if removed {
            self.wake();
        }

        trace!(target: "reactor", "unregistered {token}");
        Ok(())
    }
}

/// A single-threaded non-blocking reactor.
pub struct Reactor {
    sources: popol::Sources<Token>,
    events: Vec<popol::Event<Token>>,
    /// Tokens currently present in the poll set.
    attached: HashSet<Token>,
    handle: Handle,
}

struct Fd(RawFd);

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Reactor {
    /// Construct a new reactor and its waker.
    pub fn new() -> io::Result<Self> {
        let mut sources = popol::Sources::new();
        let waker = popol::Waker::new(&mut sources, WAKER)?;

        Ok(Self {
            sources,
            events: Vec::with_capacity(32),
            attached: HashSet::new(),
            handle: Handle {
                shared: Arc::new(Shared {
                    registry: Mutex::new(Registry::default()),
                    waker,
                    next_token: AtomicU64::new(1),
                }),
            },
        })
    }

    /// Return a registration handle for this reactor.
    pub fn handle(&self) -> Handle {
        self.handle.clone()
    }

    /// Wait for readiness and dispatch callbacks, once.
    ///
    /// Blocks for at most `max_wait`, or not at all while a software event is
    /// pending. Returns the number of callbacks invoked; waking up empty is
    /// not an error.
    pub fn run_once(&mut self, max_wait: LocalDuration) -> Result<usize, Error> {
        self.apply_ops();

        let wait: time::Duration = if self.has_pending() {
            time::Duration::ZERO
        } else {
            max_wait.into()
        };

        trace!(
            target: "reactor",
            "polling {} source(s), waking up in {:?}..",
            self.sources.len(),
            wait,
        );

        let result = self.sources.wait_timeout(&mut self.events, wait);
        let mut ready: Vec<(Handler, IoEvents)> = Vec::new();

        match result {
            Ok(n) => {
                trace!(target: "reactor", "woke up with {n} source(s) ready");

                let registry = self.handle.shared.registry.lock().unwrap();
                for event in self.events.drain(..) {
                    if event.key == WAKER {
                        popol::Waker::reset(event.source).ok();
                        continue;
                    }

                    let io = IoEvents::from_popol(&event);
                    if io.invalid {
                        // The descriptor was closed before it was
                        // unregistered. It must leave the poll set, or poll
                        // would report it forever.
                        error!(target: "reactor", "{}: source is invalid, removing", event.key);

                        self.sources.unregister(&event.key);
                        self.attached.remove(&event.key);
                    }
                    if let Some(entry) = registry.entries.get(&event.key) {
                        ready.push((entry.handler.clone(), io));
                    }
                }
            }
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
            Err(err) => return Err(err.into()),
        }

        // Deliver software events triggered up to this point. The pending
        // flag is cleared before the callback runs, so a re-trigger from
        // inside the callback lands in the next iteration.
        let fired = {
            let mut registry = self.handle.shared.registry.lock().unwrap();
            let fired: Vec<(Token, Handler)> = registry.fired.drain(..).collect();

            for (token, _) in &fired {
                if let Some(Entry {
                    kind: EntryKind::Software { pending },
                    ..
                }) = registry.entries.get_mut(token)
                {
                    *pending = false;
                }
            }
            fired
        };
        for (_, handler) in fired {
            ready.push((handler, IoEvents::default()));
        }

        let count = ready.len();
        for (handler, io) in ready {
            handler(io);
        }
        self.apply_ops();

        Ok(count)
    }

    fn has_pending(&self) -> bool {
        !self.handle.shared.registry.lock().unwrap().fired.is_empty()
    }

    fn apply_ops(&mut self) {
        let ops: Vec<(Token, SourceOp)> = {
            let mut registry = self.handle.shared.registry.lock().unwrap();
            registry.ops.drain(..).collect()
        };

        for (token, op) in ops {
            // popol keys must stay unique, so an interest change detaches
            // and re-attaches the descriptor.
            if self.attached.remove(&token) {
                self.sources.unregister(&token);
            }
            if let SourceOp::Attach(fd, interest) = op {
                match (interest.read, interest.write) {
                    (true, true) => self.sources.register(token, &Fd(fd), popol::interest::ALL),
                    (true, false) => self.sources.register(token, &Fd(fd), popol::interest::READ),
                    (false, true) => self.sources.register(token, &Fd(fd), popol::interest::WRITE),
                    (false, false) => continue,
                }
                self.attached.insert(token);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;

    fn counting_handler(counter: &Arc<AtomicUsize>) -> impl Fn(IoEvents) + Send + Sync + 'static {
        let counter = counter.clone();
        move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_readable_descriptor_is_dispatched() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let (mut tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let reads = Arc::new(AtomicUsize::new(0));
        let token = handle.register_fd(rx.as_raw_fd(), interest::READ, counting_handler(&reads));

        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 0);

        tx.write_all(b"x").unwrap();
        reactor.run_once(LocalDuration::from_secs(5)).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        handle.unregister(token).unwrap();
        tx.write_all(b"y").unwrap();
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_interest_change_switches_direction() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();
        let (tx, rx) = UnixStream::pair().unwrap();
        rx.set_nonblocking(true).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let token = handle.register_fd(rx.as_raw_fd(), interest::READ, move |io| {
            sink.lock().unwrap().push((io.readable, io.writable));
        });

        // A socket with nothing buffered is immediately writable.
        handle.set_interest(token, interest::WRITE).unwrap();
        reactor.run_once(LocalDuration::from_secs(5)).unwrap();
        assert_eq!(seen.lock().unwrap().as_slice(), &[(false, true)]);

        let mut tx = tx;
        tx.write_all(b"x").unwrap();
        handle.add_interest(token, interest::READ).unwrap();
        reactor.run_once(LocalDuration::from_secs(5)).unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&(true, true)));

        handle.remove_interest(token, interest::WRITE).unwrap();
        reactor.run_once(LocalDuration::from_secs(5)).unwrap();
        assert_eq!(seen.lock().unwrap().last(), Some(&(true, false)));

        drop(tx);
        handle.unregister(token).unwrap();
    }

    #[test]
    fn test_software_event_coalesces() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        let fires = Arc::new(AtomicUsize::new(0));
        let token = handle.register_software_event(counting_handler(&fires));

        handle.trigger(token).unwrap();
        handle.trigger(token).unwrap();
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 1);

        handle.trigger(token).unwrap();
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_triggered_event_survives_unregister() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        let fires = Arc::new(AtomicUsize::new(0));
        let token = handle.register_software_event(counting_handler(&fires));

        handle.trigger(token).unwrap();
        handle.unregister(token).unwrap();
        assert!(matches!(handle.trigger(token), Err(Error::UnknownToken)));

        // The delivery captured at trigger time still goes out; suppressing
        // it is the dispatcher layer's job.
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_trigger_wakes_poll_from_another_thread() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        let fires = Arc::new(AtomicUsize::new(0));
        let token = handle.register_software_event(counting_handler(&fires));

        let trigger = handle.clone();
        let thread = std::thread::spawn(move || {
            std::thread::sleep(time::Duration::from_millis(50));
            trigger.trigger(token).unwrap();
        });

        let started = time::Instant::now();
        while fires.load(Ordering::SeqCst) == 0 {
            reactor.run_once(LocalDuration::from_secs(30)).unwrap();
            assert!(started.elapsed() < time::Duration::from_secs(10));
        }
        thread.join().unwrap();
    }

    #[test]
    fn test_handler_may_reenter_handle() {
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.handle();

        let fires = Arc::new(AtomicUsize::new(0));
        let counter = fires.clone();
        let inner_handle = handle.clone();
        let token = Arc::new(Mutex::new(None));
        let token_slot = token.clone();

        let registered = handle.register_software_event(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            // Unregistering ourselves from inside the callback must not
            // deadlock.
            let taken = token_slot.lock().unwrap().take();
            if let Some(token) = taken {
                inner_handle.unregister(token).unwrap();
            }
        });
        *token.lock().unwrap() = Some(registered);

        handle.trigger(registered).unwrap();
        reactor.run_once(LocalDuration::from_millis(10)).unwrap();
        assert_eq!(fires.load(Ordering::SeqCst), 1);
        assert!(matches!(
            handle.trigger(registered),
            Err(Error::UnknownToken)
        ));
    }
}
