use bytes::Bytes;

use crate::{
    frame::Frame,
    packet::{ConnectionId, PacketHeader, ReceivedPacket, ResetToken},
    version::Version,
    EncryptionLevel,
};

/// A fully parsed and decrypted packet
#[derive(Debug, Clone)]
pub struct DecodedPacket {
    pub header: PacketHeader,
    /// Level whose keys decrypted the payload
    pub level: EncryptionLevel,
    pub frames: Vec<Frame>,
    /// Remainder of a coalesced datagram, to be processed as its own packet
    pub remaining: Option<Bytes>,
}

/// What the framer made of a datagram
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Packet(DecodedPacket),
    /// A version negotiation packet (long header, version zero) listing the
    /// peer's supported versions
    VersionNegotiation {
        connection_id: ConnectionId,
        versions: Vec<Version>,
    },
    /// A retry packet replacing the server connection ID
    Retry {
        original_cid: ConnectionId,
        new_cid: ConnectionId,
        token: Bytes,
    },
    /// A long-header packet carrying a version we did not negotiate
    VersionMismatch { version: Version },
}

/// Why a datagram could not be turned into frames
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FramerError {
    /// No installed key could decrypt the packet; it may become readable
    /// once further keys arrive
    DecryptionFailure,
    /// The packet was structurally invalid and must be dropped
    Malformed,
}

/// Largest packet number received per encryption level, used by the framer to
/// reconstruct truncated packet numbers
pub trait LargestReceived {
    fn largest_received(&self, level: EncryptionLevel) -> Option<u64>;
}

/// Wire-format parser and packet protection boundary
///
/// Owns the per-level decrypters. Key handles are opaque: the connection only
/// ever asks whether a level is usable and tells the framer when to derive or
/// drop keys. Frames come back fully decoded; no wire-format knowledge leaks
/// into the connection.
pub trait Framer {
    /// Parse and decrypt one packet, decoding packet numbers against the
    /// largest received in the corresponding space
    fn process_packet(
        &mut self,
        packet: &ReceivedPacket,
        largest_received: &dyn LargestReceived,
    ) -> Result<ProcessOutcome, FramerError>;

    /// If `data` has the shape of an IETF stateless reset, its trailing token
    fn stateless_reset_token(&self, data: &[u8]) -> Option<ResetToken>;

    /// Whether keys for `level` are installed
    fn has_keys(&self, level: EncryptionLevel) -> bool;

    /// Derive initial keys bound to `cid`; called at construction and again
    /// after a retry replaces the server connection ID
    fn install_initial_keys(&mut self, cid: &ConnectionId);

    /// Drop keys below `level` once they can no longer be needed
    fn discard_keys_below(&mut self, level: EncryptionLevel);

    /// Change the version whose wire format is parsed
    fn set_version(&mut self, version: Version);
}
