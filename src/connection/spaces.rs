use std::{
    cmp,
    ops::{Index, IndexMut},
    time::{Duration, Instant},
};

use crate::{
    frame::AckFrame, range_set::RangeSet, sent::RttStats, SpaceId, TIMER_GRANULARITY,
};

/// Retransmittable packets received before an ack outside decimation
pub(crate) const DEFAULT_RETRANSMITTABLE_PACKETS_BEFORE_ACK: u64 = 2;
/// Packets received before ack decimation activates, to stay responsive
/// during the peer's slow start
pub(crate) const MIN_RECEIVED_BEFORE_ACK_DECIMATION: u64 = 100;
/// Retransmittable packets tolerated without an ack under decimation
pub(crate) const MAX_RETRANSMITTABLE_PACKETS_BEFORE_ACK: u64 = 10;
/// Fraction of min RTT to delay a decimated ack
pub(crate) const ACK_DECIMATION_DELAY: f32 = 0.25;
/// Short variant of the decimation delay
pub(crate) const SHORT_ACK_DECIMATION_DELAY: f32 = 0.125;
/// Lowest packet number a peer may use for its first packet
pub(crate) const PEER_FIRST_SENDING_PACKET_NUMBER: u64 = 1;

/// When acknowledgements are scheduled
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum AckMode {
    /// Ack every second retransmittable packet
    TcpAcking,
    /// After a warmup, ack every tenth retransmittable packet or after a
    /// fraction of min RTT
    AckDecimation,
    /// As decimation, but newly detected gaps pull the deadline earlier
    AckDecimationWithReordering,
}

/// Tunable acknowledgement policy, shared by all packet number spaces
#[derive(Debug, Clone)]
pub(crate) struct AckPolicy {
    pub(crate) mode: AckMode,
    pub(crate) decimation_delay: f32,
    /// Never force an ack on packet count alone
    pub(crate) unlimited_decimation: bool,
    /// Ack the first packet after an inter-arrival gap exceeding the
    /// smoothed RTT within 1 ms
    pub(crate) fast_ack_after_quiescence: bool,
    pub(crate) min_received_before_decimation: u64,
    pub(crate) ack_frequency_before_decimation: u64,
    /// Record per-packet receipt times for ack timestamps
    pub(crate) save_timestamps: bool,
}

impl Default for AckPolicy {
    fn default() -> Self {
        Self {
            mode: AckMode::TcpAcking,
            decimation_delay: ACK_DECIMATION_DELAY,
            unlimited_decimation: false,
            fast_ack_after_quiescence: false,
            min_received_before_decimation: MIN_RECEIVED_BEFORE_ACK_DECIMATION,
            ack_frequency_before_decimation: DEFAULT_RETRANSMITTABLE_PACKETS_BEFORE_ACK,
            save_timestamps: false,
        }
    }
}

/// Receive-side state of one packet number space
///
/// Tracks which packets arrived, maintains the pending ACK frame, and decides
/// when that frame must go out. One exists per space; the ack timer is armed
/// from the earliest `ack_timeout` across spaces.
#[derive(Debug, Default)]
pub(crate) struct ReceivedPacketSpace {
    /// Received packet numbers not yet retired by the peer's progress
    ranges: RangeSet,
    /// Largest packet number seen in this space
    largest_received: Option<u64>,
    largest_received_time: Option<Instant>,
    /// Everything below this is no longer awaited (duplicate window floor)
    ignore_below: u64,
    /// Largest least-unacked accepted from a STOP_WAITING frame
    peer_least_packet_awaiting_ack: Option<u64>,
    /// Receipt times for the timestamp section of the next ACK
    timestamps: Vec<(u64, Instant)>,
    /// Deadline by which the pending ACK must be flushed
    ack_timeout: Option<Instant>,
    /// Whether packets were recorded since the last ack went out
    ack_frame_updated: bool,
    retransmittable_since_last_ack: u64,
    packets_since_last_ack: u64,
    /// Receipt time of the packet before the current one, for the
    /// quiescence check
    time_of_previous_received_packet: Option<Instant>,
    /// A received packet opened a new gap since the last ack
    new_missing_since_last_ack: bool,
}

impl ReceivedPacketSpace {
    /// Whether `packet_number` has not been seen and is still within the
    /// window of packets we would accept
    pub(crate) fn is_awaiting(&self, packet_number: u64) -> bool {
        packet_number >= self.ignore_below && !self.ranges.contains(packet_number)
    }

    /// Whether `packet_number` lies in a gap below the largest received
    pub(crate) fn is_missing(&self, packet_number: u64) -> bool {
        packet_number >= self.ignore_below
            && self
                .largest_received
                .map_or(false, |largest| packet_number < largest)
            && !self.ranges.contains(packet_number)
    }

    pub(crate) fn largest_received(&self) -> Option<u64> {
        self.largest_received
    }

    pub(crate) fn peer_least_packet_awaiting_ack(&self) -> Option<u64> {
        self.peer_least_packet_awaiting_ack
    }

    pub(crate) fn ack_timeout(&self) -> Option<Instant> {
        self.ack_timeout
    }

    pub(crate) fn ack_frame_updated(&self) -> bool {
        self.ack_frame_updated
    }

    /// Record receipt of a validated packet
    pub(crate) fn record_packet_received(
        &mut self,
        packet_number: u64,
        receipt_time: Instant,
        save_timestamps: bool,
    ) {
        if let Some(largest) = self.largest_received {
            // A jump past largest + 1 opens a gap the peer may want to hear
            // about promptly
            if packet_number > largest + 1 {
                self.new_missing_since_last_ack = true;
            }
        }
        self.ranges.insert_one(packet_number);
        if self.largest_received.map_or(true, |x| packet_number > x) {
            self.largest_received = Some(packet_number);
            self.largest_received_time = Some(receipt_time);
        }
        if save_timestamps {
            self.timestamps.push((packet_number, receipt_time));
        }
        self.ack_frame_updated = true;
    }

    /// Stop acknowledging packets below `least_unacked`; the peer has moved
    /// its resend floor past them
    pub(crate) fn dont_wait_for_packets_before(&mut self, least_unacked: u64) {
        if least_unacked <= self.ignore_below {
            return;
        }
        self.ignore_below = least_unacked;
        self.ranges.remove_below(least_unacked);
        self.timestamps.retain(|&(pn, _)| pn >= least_unacked);
        if self
            .peer_least_packet_awaiting_ack
            .map_or(true, |x| least_unacked > x)
        {
            self.peer_least_packet_awaiting_ack = Some(least_unacked);
        }
    }

    /// Update the deadline for flushing this space's pending ACK
    ///
    /// `largest_sent_largest_acked` is the largest acknowledged packet the
    /// peer has seen us confirm, used for the filled-gap immediate trigger.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn maybe_update_ack_timeout(
        &mut self,
        instigates_ack: bool,
        packet_number: u64,
        was_missing: bool,
        largest_sent_largest_acked: Option<u64>,
        receipt_time: Instant,
        now: Instant,
        rtt: &RttStats,
        delayed_ack_time: Duration,
        policy: &AckPolicy,
    ) {
        self.packets_since_last_ack += 1;

        if !instigates_ack {
            return;
        }

        // A previously missing packet filled a gap the peer already saw us
        // ack past; tell it immediately so it can stop retransmitting.
        if was_missing
            && largest_sent_largest_acked.map_or(false, |largest| packet_number < largest)
        {
            self.schedule_ack_no_later_than(now);
        }

        self.retransmittable_since_last_ack += 1;
        let decimation_active = policy.mode != AckMode::TcpAcking
            && packet_number
                >= PEER_FIRST_SENDING_PACKET_NUMBER + policy.min_received_before_decimation;
        if decimation_active {
            if !policy.unlimited_decimation
                && self.retransmittable_since_last_ack >= MAX_RETRANSMITTABLE_PACKETS_BEFORE_ACK
            {
                self.schedule_ack_no_later_than(now);
            } else if self.ack_timeout.is_none() {
                let mut delay = cmp::min(
                    delayed_ack_time,
                    rtt.min_rtt.mul_f32(policy.decimation_delay),
                );
                if self.just_left_quiescence(policy, now, rtt) {
                    delay = TIMER_GRANULARITY;
                }
                self.ack_timeout = Some(now + delay);
            }
        } else if self.retransmittable_since_last_ack >= policy.ack_frequency_before_decimation {
            self.schedule_ack_no_later_than(now);
        } else if self.ack_timeout.is_none() {
            let delay = if self.just_left_quiescence(policy, now, rtt) {
                TIMER_GRANULARITY
            } else {
                delayed_ack_time
            };
            self.ack_timeout = Some(now + delay);
        }

        if self.new_missing_since_last_ack {
            if policy.mode == AckMode::AckDecimationWithReordering {
                // The reordering delay is a floor, never a push-out
                self.schedule_ack_no_later_than(
                    now + rtt.min_rtt.mul_f32(SHORT_ACK_DECIMATION_DELAY),
                );
            } else {
                self.schedule_ack_no_later_than(now);
            }
        }

        if policy.fast_ack_after_quiescence {
            self.time_of_previous_received_packet = Some(receipt_time);
        }
    }

    fn just_left_quiescence(&self, policy: &AckPolicy, now: Instant, rtt: &RttStats) -> bool {
        policy.fast_ack_after_quiescence
            && self
                .time_of_previous_received_packet
                .map_or(false, |prev| now - prev > rtt.smoothed_or_initial())
    }

    fn schedule_ack_no_later_than(&mut self, deadline: Instant) {
        self.ack_timeout = Some(match self.ack_timeout {
            Some(existing) => cmp::min(existing, deadline),
            None => deadline,
        });
    }

    /// Build the ACK frame to send right now
    ///
    /// Returns `None` when nothing has been received in this space.
    pub(crate) fn updated_ack_frame(&self, now: Instant) -> Option<AckFrame> {
        let largest_acked = self.largest_received?;
        let ack_delay = self
            .largest_received_time
            .map_or(Duration::ZERO, |t| now.saturating_duration_since(t));
        Some(AckFrame {
            largest_acked,
            ack_delay,
            ranges: self.ranges.iter().collect(),
            timestamps: self.timestamps.clone(),
        })
    }

    /// Reset pending-ack state after an ACK for this space was flushed
    pub(crate) fn on_ack_sent(&mut self) {
        self.ack_timeout = None;
        self.ack_frame_updated = false;
        self.retransmittable_since_last_ack = 0;
        self.packets_since_last_ack = 0;
        self.new_missing_since_last_ack = false;
        self.timestamps.clear();
    }
}

impl Index<SpaceId> for [ReceivedPacketSpace; 3] {
    type Output = ReceivedPacketSpace;
    fn index(&self, space: SpaceId) -> &ReceivedPacketSpace {
        &self.as_ref()[space as usize]
    }
}

impl IndexMut<SpaceId> for [ReceivedPacketSpace; 3] {
    fn index_mut(&mut self, space: SpaceId) -> &mut ReceivedPacketSpace {
        &mut self.as_mut()[space as usize]
    }
}
