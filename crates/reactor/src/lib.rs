//! Event-loop facility shared by the SafeIPC subsystems.
//!
//! File descriptors and coalescing software events are registered against a
//! cloneable [`Handle`]; one designated thread drives [`Reactor::run_once`]
//! and is the only context in which callbacks execute. Establishment
//! deadlines live in the user-ticked [`TimerManager`].
pub mod error;
pub mod reactor;
pub mod time;

pub use error::Error;
pub use reactor::{interest, Handle, Handler, Interest, IoEvents, Reactor, Token};
pub use time::{LocalDuration, LocalTime, TimerManager, TimerToken};
