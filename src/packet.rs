use std::{fmt, net::SocketAddr, time::Instant};

use bytes::Bytes;

use crate::{frame::Frame, version::Version, EncryptionLevel, SpaceId};

/// Maximum number of bytes in a connection ID
pub const MAX_CID_SIZE: usize = 18;

/// An opaque connection identifier of up to [`MAX_CID_SIZE`] bytes
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    len: u8,
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct from a byte slice
    ///
    /// Panics if `bytes` exceeds [`MAX_CID_SIZE`].
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }
}

impl std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Stateless reset token learned from the peer's transport parameters
///
/// An unauthenticated datagram ending in this token tears the connection
/// down immediately.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ResetToken(pub u128);

/// A decoded packet header, as produced by the framer after header protection
/// has been removed and the packet number decoded from its truncated wire form
#[derive(Debug, Clone)]
pub struct PacketHeader {
    /// Destination connection ID from the wire
    pub dst_cid: ConnectionId,
    /// Source connection ID; only present in long-form headers
    pub src_cid: Option<ConnectionId>,
    /// Full packet number, reconstructed against the largest received
    pub packet_number: u64,
    /// Version from a long-form header
    pub version: Option<Version>,
    /// Whether this was a long-form (handshake-era) header
    pub is_long_header: bool,
}

impl PacketHeader {
    /// Whether a client may take this header's source connection ID as a
    /// replacement server connection ID (initial/retry long headers only)
    pub fn can_replace_server_cid(&self) -> bool {
        self.is_long_header && self.src_cid.is_some()
    }
}

/// How a packet relates to earlier transmissions
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum TransmissionType {
    /// First transmission of its frames
    NotRetransmission,
    /// Handshake data retransmitted on the handshake timer
    Handshake,
    /// Tail loss probe
    Tlp,
    /// Retransmission timeout fired
    Rto,
    /// Bandwidth probing retransmission
    Probing,
    /// All unacked packets retransmitted, e.g. after a version change
    AllUnacked,
}

/// An encrypted packet produced by the packet generator, ready for the wire
///
/// Either written immediately, appended to the queued-packet list when the
/// writer is blocked (the buffer is owned, so queueing is a cheap handle
/// clone), or stashed on the termination list when it carries a
/// CONNECTION_CLOSE.
#[derive(Debug, Clone)]
pub struct SerializedPacket {
    /// Encrypted bytes; length is the encrypted length
    pub buffer: Bytes,
    pub packet_number: u64,
    pub encryption_level: EncryptionLevel,
    pub transmission_type: TransmissionType,
    /// Frames requiring retransmission if this packet is lost; empty for
    /// ack-only and padding-only packets
    pub retransmittable_frames: Vec<Frame>,
    /// Largest acknowledged packet in an ACK frame bundled into this packet
    pub largest_acked: Option<u64>,
    /// For retransmissions, the packet number of the antecedent
    pub original_packet_number: Option<u64>,
}

impl SerializedPacket {
    pub fn space(&self) -> SpaceId {
        self.encryption_level.space()
    }

    /// Whether an acknowledgement is expected in response
    pub fn has_retransmittable_frames(&self) -> bool {
        self.transmission_type != TransmissionType::NotRetransmission
            || !self.retransmittable_frames.is_empty()
    }

    /// Termination packets are stashed rather than dropped under write block
    /// so they can be replayed for late peer packets after close.
    pub fn is_termination_packet(&self) -> bool {
        self.retransmittable_frames
            .iter()
            .any(|f| matches!(f, Frame::Close(_)))
    }
}

/// A datagram as handed to the connection by the demultiplexer
#[derive(Debug, Clone)]
pub struct ReceivedPacket {
    pub data: Bytes,
    /// When the kernel reported receiving the datagram
    pub receipt_time: Instant,
    /// Address the datagram was received on
    pub destination: SocketAddr,
    /// Address the datagram was received from
    pub source: SocketAddr,
}
