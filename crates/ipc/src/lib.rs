//! SafeIPC server-side connection establishment.
//!
//! Clients and the server rendezvous on a named Unix-domain socket. For
//! each accepted peer the server drives a three-message handshake that
//! exchanges shared-memory segment ids, then hands the caller a fully
//! wired [`Connection`]; from that point the control socket carries only
//! out-of-band sentinel bytes and all data traffic lives in the segments.
//!
//! The entry point is [`Acceptor`], driven by the event thread of a
//! [`safeipc_reactor::Reactor`].
pub mod acceptor;
pub mod conn;
pub mod dispatch;
pub mod error;
pub mod shm;
pub mod wire;

mod backlog;
mod incoming;
mod server;

pub use acceptor::{AcceptCallback, Acceptor, AcceptorConfig, BACKLOG_CAPACITY};
pub use conn::Connection;
pub use error::AcceptError;
pub use incoming::{TimerPolicy, HANDSHAKE_TIMEOUT, MIN_BUFFER_SIZE};
pub use shm::{Access, SharedMemory, ShmId};
