//! Connection statistics

use std::time::Instant;

/// Counters maintained by a connection over its lifetime
///
/// Purely observational; nothing in the state machine reads these back
/// except the creation time (handshake timeout) and the drop counters used
/// by tests to confirm idempotent packet handling.
#[derive(Debug, Copy, Clone)]
#[non_exhaustive]
pub struct ConnectionStats {
    /// When the connection object was created
    pub connection_creation_time: Instant,
    /// Datagrams handed to the connection
    pub packets_received: u64,
    /// Packets the framer fully parsed and the connection accepted
    pub packets_processed: u64,
    /// Packets rejected by validation (duplicates, stale acks aside)
    pub packets_dropped: u64,
    /// Packets that failed decryption
    pub undecryptable_packets_received: u64,
    /// Packets written to the wire
    pub packets_sent: u64,
    /// Retransmission packets written to the wire
    pub packets_retransmitted: u64,
    /// Packets discarded before the write (closed or level mismatch)
    pub packets_discarded: u64,
    /// Connectivity probes received
    pub num_connectivity_probing_received: u64,
    /// MTU probes sent
    pub mtu_probes_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub bytes_retransmitted: u64,
    /// Stream payload bytes delivered to the session
    pub stream_bytes_received: u64,
    /// Largest datagram observed from the peer
    pub largest_received_packet_size: u64,
}

impl ConnectionStats {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            connection_creation_time: now,
            packets_received: 0,
            packets_processed: 0,
            packets_dropped: 0,
            undecryptable_packets_received: 0,
            packets_sent: 0,
            packets_retransmitted: 0,
            packets_discarded: 0,
            num_connectivity_probing_received: 0,
            mtu_probes_sent: 0,
            bytes_received: 0,
            bytes_sent: 0,
            bytes_retransmitted: 0,
            stream_bytes_received: 0,
            largest_received_packet_size: 0,
        }
    }
}
