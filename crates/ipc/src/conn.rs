//! An established connection, ready for hand-off to the data plane.
use std::os::unix::net::UnixStream;

use crate::shm::SharedMemory;

/// The resources of one established peer: the control socket and the three
/// mapped segments. The control socket stays non-blocking and carries only
/// out-of-band sentinel bytes from here on (see [`crate::wire`]); the
/// segment contents belong to the data plane and are never interpreted
/// here.
#[derive(Debug)]
pub struct Connection {
    socket: UnixStream,
    s2c: SharedMemory,
    c2s: SharedMemory,
    notify: SharedMemory,
}

impl Connection {
    pub(crate) fn new(
        socket: UnixStream,
        s2c: SharedMemory,
        c2s: SharedMemory,
        notify: SharedMemory,
    ) -> Self {
        Self {
            socket,
            s2c,
            c2s,
            notify,
        }
    }

    /// The control socket.
    pub fn socket(&self) -> &UnixStream {
        &self.socket
    }

    /// Server-to-client stream, created by this side.
    pub fn s2c(&self) -> &SharedMemory {
        &self.s2c
    }

    /// Client-to-server stream, mapped read-only from the peer.
    pub fn c2s(&self) -> &SharedMemory {
        &self.c2s
    }

    /// Notification segment, mapped read-write from the peer.
    pub fn notify(&self) -> &SharedMemory {
        &self.notify
    }

    /// Decompose into `(socket, s2c, c2s, notify)`.
    pub fn into_parts(self) -> (UnixStream, SharedMemory, SharedMemory, SharedMemory) {
        (self.socket, self.s2c, self.c2s, self.notify)
    }
}
