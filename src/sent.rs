use std::time::{Duration, Instant};

use crate::{
    config::CachedNetworkParameters, connection::AddressChangeType, packet::SerializedPacket,
    packet::TransmissionType, EncryptionLevel, SpaceId,
};

/// Verdict of a completed ACK frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AckResult {
    /// At least one previously unacked packet was newly acknowledged
    PacketsNewlyAcked,
    /// The frame was valid but acknowledged nothing new
    NoPacketsNewlyAcked,
    /// The frame acknowledged packets in the wrong packet number space
    UnsentPacketsAcked,
}

/// Why unacked packets are being retransmitted wholesale
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RetransmissionReason {
    /// The negotiated version changed; everything must be reserialized
    VersionChange,
    /// Encryption advanced; unencrypted packets are abandoned instead
    EncryptionChange,
}

/// Read-only snapshot of the path's RTT estimation
#[derive(Debug, Copy, Clone)]
pub struct RttStats {
    pub smoothed_rtt: Option<Duration>,
    pub latest_rtt: Duration,
    pub min_rtt: Duration,
}

impl RttStats {
    /// Smoothed RTT, falling back to the initial estimate before a sample
    pub fn smoothed_or_initial(&self) -> Duration {
        self.smoothed_rtt.unwrap_or(self.latest_rtt)
    }
}

/// Loss recovery, congestion control and pacing, behind one interface
///
/// The connection feeds it every sent packet and every decoded ACK frame
/// (streamed as start / range* / timestamp* / end) and reads back deadlines:
/// the retransmission time arms the retransmission alarm, `time_until_send`
/// gates the send path. Internals (loss algorithms, congestion windows,
/// pacing rate) are entirely this collaborator's business.
pub trait SentPacketManager {
    /// Record a sent packet. Returns true when the retransmission alarm must
    /// be re-armed (the packet changed the recovery deadline).
    fn on_packet_sent(
        &mut self,
        packet: &SerializedPacket,
        original_packet_number: Option<u64>,
        send_time: Instant,
        transmission_type: TransmissionType,
        has_retransmittable: bool,
    ) -> bool;

    fn on_ack_frame_start(
        &mut self,
        largest_acked: u64,
        ack_delay: Duration,
        receipt_time: Instant,
    );
    fn on_ack_range(&mut self, start: u64, end: u64);
    fn on_ack_timestamp(&mut self, packet_number: u64, timestamp: Instant);
    fn on_ack_frame_end(&mut self, receipt_time: Instant, level: EncryptionLevel) -> AckResult;

    /// Deadline of the loss/probe timer, if any packets are outstanding
    fn retransmission_time(&self) -> Option<Instant>;
    /// Pacing delay before the next packet may be sent; `None` means sending
    /// is blocked indefinitely (congestion window full)
    fn time_until_send(&self, now: Instant) -> Option<Duration>;
    /// How long without forward progress before the path is considered
    /// degrading
    fn path_degrading_delay(&self) -> Duration;
    /// Earliest time the next packet should leave the kernel, for release
    /// time offload
    fn next_release_time(&self) -> Option<Instant>;

    fn largest_sent_packet(&self, space: SpaceId) -> Option<u64>;
    fn largest_acked_packet(&self, space: SpaceId) -> Option<u64>;
    /// Largest packet number the peer is known to have seen acked
    fn largest_packet_peer_knows_is_acked(&self, space: SpaceId) -> Option<u64>;
    /// Largest `largest_acked` carried in any ACK frame this endpoint sent
    fn largest_sent_largest_acked(&self, space: SpaceId) -> Option<u64>;
    fn least_unacked(&self) -> u64;
    /// Rough bound on packets concurrently in flight, for packet number
    /// length selection
    fn estimate_max_packets_in_flight(&self, max_packet_length: u16) -> u64;
    fn unacked_packet_count(&self) -> u64;
    fn has_in_flight_packets(&self) -> bool;
    fn has_pending_retransmissions(&self) -> bool;

    fn consecutive_tlp_count(&self) -> u32;
    fn consecutive_rto_count(&self) -> u32;
    /// Number of probe/retransmission sends the timer has requested that have
    /// not yet gone out; forces the send gate open
    fn pending_timer_transmission_count(&self) -> u32;

    /// The retransmission alarm fired
    fn on_retransmission_timeout(&mut self);
    /// Give the manager a chance to queue a tail loss probe; true if one was
    /// queued
    fn maybe_retransmit_tail_loss_probe(&mut self) -> bool;
    fn retransmit_unacked_packets(&mut self, reason: RetransmissionReason);
    /// Abandon unencrypted packets once initial keys are discarded
    fn neuter_unencrypted_packets(&mut self);

    fn on_connection_migration(&mut self, change: AddressChangeType);
    fn on_application_limited(&mut self);

    fn set_handshake_confirmed(&mut self);
    fn handshake_confirmed(&self) -> bool;

    /// Whether an ACK whose largest acknowledged shrinks is tolerated
    fn tolerate_reneging(&self) -> bool;

    fn rtt_stats(&self) -> RttStats;
    /// The peer's advertised delayed-ack timer
    fn delayed_ack_time(&self) -> Duration;

    fn resume_connection_state(&mut self, cached: &CachedNetworkParameters);
}
