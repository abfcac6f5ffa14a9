use bytes::Bytes;

use crate::{
    frame::{AckFrame, Frame},
    packet::{ConnectionId, SerializedPacket, TransmissionType},
    version::Version,
    EncryptionLevel,
};

/// Shapes of dedicated probe packets the generator can serialize
#[derive(Debug, Clone)]
pub enum ProbePacket {
    /// Pre-IETF connectivity probe: a PING followed by full padding
    PaddedPing,
    /// IETF path validation request carrying a random payload
    PathChallenge([u8; 8]),
    /// Response echoing previously received challenge payloads; padded when
    /// answering a padded challenge
    PathResponse {
        payloads: Vec<[u8; 8]>,
        padded: bool,
    },
}

/// Frame batching and packet serialization, behind one interface
///
/// The generator accumulates frames queued by the connection and the session
/// and turns them into encrypted [`SerializedPacket`]s when flushed. Packet
/// numbers are assigned here, strictly increasing per space. The connection
/// decides *when* to flush (the scoped flusher discipline) and what happens
/// to each produced packet (write, queue, or stash).
pub trait PacketGenerator {
    fn set_encryption_level(&mut self, level: EncryptionLevel);
    fn encryption_level(&self) -> EncryptionLevel;
    fn set_transmission_type(&mut self, ty: TransmissionType);

    /// Whether any frames are queued but not yet serialized
    fn has_queued_frames(&self) -> bool;
    /// Whether any queued frame would require retransmission on loss
    fn has_retransmittable_frames(&self) -> bool;

    /// Queue a retransmittable control frame
    fn queue_control_frame(&mut self, frame: Frame);

    /// Serialize an ACK frame (bundling any queued frames with it) at the
    /// current encryption level
    fn flush_ack_frame(&mut self, ack: AckFrame) -> Option<SerializedPacket>;

    /// Serialize all queued frames into packets
    fn flush(&mut self) -> Vec<SerializedPacket>;

    /// Serialize a dedicated connectivity probe
    fn serialize_probe(&mut self, probe: ProbePacket) -> Option<SerializedPacket>;

    /// Serialize a padded probe of exactly `target` bytes for MTU discovery
    fn serialize_mtu_probe(&mut self, target: u16) -> Option<SerializedPacket>;

    /// Serialize a version negotiation packet listing `versions`
    fn serialize_version_negotiation(&mut self, versions: &[Version]) -> Bytes;

    /// Replace the server connection ID after a retry or negotiation
    fn set_server_connection_id(&mut self, cid: ConnectionId);
    /// Install the retry token carried on subsequent initial packets
    fn set_retry_token(&mut self, token: Bytes);
    fn set_version(&mut self, version: Version);

    /// Shrink the packet number encoding once the peer's least-unacked allows
    fn update_packet_number_length(&mut self, least_unacked: u64, max_packets_in_flight: u64);

    fn set_max_packet_length(&mut self, length: u16);
    fn current_max_packet_length(&self) -> u16;
}
