//! Connection-establishment errors.
use std::io;
use std::sync::Arc;

use thiserror::Error;

/// An error surfaced by the acceptor API or its completion callback.
///
/// Clonable so a latched server error can be handed to every subsequent
/// accept attempt.
#[derive(Error, Debug, Clone)]
pub enum AcceptError {
    /// A slot table, the backlog or a kernel limit is exhausted. Retryable.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The caller may not bind or accept at the configured address.
    #[error("insufficient privileges: {0}")]
    InsufficientPrivileges(Arc<io::Error>),

    /// The configured address is already bound or not available.
    #[error("address not available: {0}")]
    AddressNotAvailable(Arc<io::Error>),

    /// The filesystem does not support an operation required for the
    /// control socket or the shared-memory objects.
    #[error("filesystem error: {0}")]
    Filesystem(Arc<io::Error>),

    /// Classified as a programming error; not recoverable by the caller.
    #[error("unexpected error: {0}")]
    Unexpected(Arc<io::Error>),

    /// An accept completion is already pending.
    #[error("an accept completion is already pending")]
    Busy,

    /// The acceptor has not been initialized, or was closed.
    #[error("acceptor is not initialized")]
    NotInitialized,

    /// The acceptor is already initialized.
    #[error("acceptor is already initialized")]
    AlreadyInitialized,

    /// The server latched an unrecoverable error; sticky until the
    /// acceptor is closed and re-initialized.
    #[error("acceptor lost its listening endpoint")]
    Disconnected,
}

/// Classify a failure to create or bind the listening socket.
pub(crate) fn classify_bind(err: io::Error) -> AcceptError {
    match err.kind() {
        io::ErrorKind::PermissionDenied => AcceptError::InsufficientPrivileges(Arc::new(err)),
        io::ErrorKind::AddrInUse | io::ErrorKind::AddrNotAvailable => {
            AcceptError::AddressNotAvailable(Arc::new(err))
        }
        io::ErrorKind::Unsupported => AcceptError::Filesystem(Arc::new(err)),
        _ => match err.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                AcceptError::ResourceExhausted("file descriptors")
            }
            Some(libc::ENOTSUP) | Some(libc::EROFS) | Some(libc::ENODEV) => {
                AcceptError::Filesystem(Arc::new(err))
            }
            _ => AcceptError::Unexpected(Arc::new(err)),
        },
    }
}

/// Classify a fatal `accept(2)` failure.
pub(crate) fn classify_accept(err: io::Error) -> AcceptError {
    match err.raw_os_error() {
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM) => {
            AcceptError::ResourceExhausted("file descriptors")
        }
        _ => AcceptError::Unexpected(Arc::new(err)),
    }
}
