//! Reactor errors.
use std::io;

use thiserror::Error;

/// An error occuring in the event-loop facility.
#[derive(Error, Debug)]
pub enum Error {
    /// An I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The token does not name a registered source.
    #[error("unknown reactor token")]
    UnknownToken,
}
