//! Handshake wire format of the control socket.
//!
//! All multi-byte integers are little-endian; messages are positional with
//! no framing delimiters. The exchange is three messages long: the client's
//! hello, the server's accept, and a one-byte acknowledgement from the
//! client.
use crate::shm::ShmId;

/// Handshake protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u16 = 1;

/// Size of the serialized [`ClientHello`].
pub const HELLO_LEN: usize = 26;
/// Size of the serialized [`ServerAccept`].
pub const ACCEPT_LEN: usize = 8;
/// Size of the client acknowledgement.
pub const ACK_LEN: usize = 1;

/// Sent on the control socket when a peer shuts down cleanly.
pub const PEER_CLOSED: u8 = 0xFD;
/// Announces that an ancillary message carries a file descriptor
/// (`SCM_RIGHTS`).
pub const FD_TRANSFER: u8 = 0xFE;
/// Signals that a shared-memory buffer became readable or writable.
pub const BUFFER_NOTIFY: u8 = 0xFF;

/// First handshake message, client to server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientHello {
    /// Handshake protocol version spoken by the client.
    pub protocol_version: u16,
    /// Client-created segment carrying client-to-server data.
    pub c2s_shm: ShmId,
    /// Client-created notification segment.
    pub notify_shm: ShmId,
    /// Requested capacity of the server-to-client segment, in bytes.
    pub s2c_capacity_hint: u64,
}

impl ClientHello {
    pub fn encode(&self) -> [u8; HELLO_LEN] {
        let mut buf = [0; HELLO_LEN];

        buf[0..2].copy_from_slice(&self.protocol_version.to_le_bytes());
        buf[2..10].copy_from_slice(&self.c2s_shm.to_u64().to_le_bytes());
        buf[10..18].copy_from_slice(&self.notify_shm.to_u64().to_le_bytes());
        buf[18..26].copy_from_slice(&self.s2c_capacity_hint.to_le_bytes());
        buf
    }

    /// Decode a complete hello. Structural only; semantic validation (the
    /// version check, mapping the named segments) happens in the handshake.
    pub fn decode(buf: &[u8; HELLO_LEN]) -> Self {
        Self {
            protocol_version: u16::from_le_bytes(buf[0..2].try_into().expect("2-byte field")),
            c2s_shm: ShmId::from_u64(read_u64(&buf[2..10])),
            notify_shm: ShmId::from_u64(read_u64(&buf[10..18])),
            s2c_capacity_hint: read_u64(&buf[18..26]),
        }
    }
}

/// Second handshake message, server to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerAccept {
    /// Server-created segment carrying server-to-client data.
    pub s2c_shm: ShmId,
}

impl ServerAccept {
    pub fn encode(&self) -> [u8; ACCEPT_LEN] {
        self.s2c_shm.to_u64().to_le_bytes()
    }

    pub fn decode(buf: &[u8; ACCEPT_LEN]) -> Self {
        Self {
            s2c_shm: ShmId::from_u64(u64::from_le_bytes(*buf)),
        }
    }
}

fn read_u64(buf: &[u8]) -> u64 {
    u64::from_le_bytes(buf.try_into().expect("8-byte field"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hello_roundtrip() {
        let hello = ClientHello {
            protocol_version: PROTOCOL_VERSION,
            c2s_shm: ShmId::from_u64(0x10),
            notify_shm: ShmId::from_u64(0x20),
            s2c_capacity_hint: 32768,
        };

        assert_eq!(ClientHello::decode(&hello.encode()), hello);
    }

    #[test]
    fn test_hello_layout() {
        let hello = ClientHello {
            protocol_version: 0x0102,
            c2s_shm: ShmId::from_u64(0x1122334455667788),
            notify_shm: ShmId::from_u64(0x99),
            s2c_capacity_hint: 0x4000,
        };
        let buf = hello.encode();

        assert_eq!(buf.len(), 26);
        assert_eq!(&buf[0..2], &[0x02, 0x01]);
        assert_eq!(&buf[2..10], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[10..18], &[0x99, 0, 0, 0, 0, 0, 0, 0]);
        assert_eq!(&buf[18..26], &[0x00, 0x40, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_accept_roundtrip() {
        let accept = ServerAccept {
            s2c_shm: ShmId::from_u64(0xdeadbeef),
        };

        assert_eq!(ServerAccept::decode(&accept.encode()), accept);
        assert_eq!(accept.encode()[0..4], [0xef, 0xbe, 0xad, 0xde]);
    }
}
