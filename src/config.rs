use std::{fmt, time::Duration};

use crate::{packet::ResetToken, Side};

/// A four-character connection option tag, as negotiated during the handshake
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Tag(pub [u8; 4]);

impl fmt::Debug for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match std::str::from_utf8(&self.0) {
            Ok(s) => f.write_str(s),
            Err(_) => write!(f, "{:02x?}", self.0),
        }
    }
}

/// Probe for the high MTU discovery target
pub const MTUH: Tag = Tag(*b"MTUH");
/// Probe for the low MTU discovery target
pub const MTUL: Tag = Tag(*b"MTUL");
/// Ack every second retransmittable packet (disable decimation)
pub const ACD0: Tag = Tag(*b"ACD0");
/// Enable ack decimation
pub const ACKD: Tag = Tag(*b"ACKD");
/// Ack decimation with reordering-triggered early acks
pub const AKD2: Tag = Tag(*b"AKD2");
/// Ack decimation with the short (1/8 rtt) delay
pub const AKD3: Tag = Tag(*b"AKD3");
/// Reordering-aware decimation with the short delay
pub const AKD4: Tag = Tag(*b"AKD4");
/// Unlimited decimation: never force an ack on packet count alone
pub const AKDU: Tag = Tag(*b"AKDU");
/// Fast ack after quiescence
pub const ACKQ: Tag = Tag(*b"ACKQ");
/// Close the connection on the fifth consecutive RTO
pub const FIVE_RTO: Tag = Tag(*b"5RTO");
/// Do not send STOP_WAITING frames
pub const NSTP: Tag = Tag(*b"NSTP");
/// Record per-packet receive timestamps in acks
pub const STMP: Tag = Tag(*b"STMP");
/// Disable pacing offload (release time)
pub const NPCO: Tag = Tag(*b"NPCO");

/// Negotiated and local configuration consumed by the connection
///
/// Two consecutive applications of an equal `Config` produce identical
/// observable behavior; the connection keeps no hidden derivation state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Whether the handshake has negotiated final values
    pub negotiated: bool,
    /// Idle timeout once negotiated; the connection pads this by +3s on the
    /// server and -1s (floor zero) on the client
    pub idle_network_timeout: Duration,
    /// Time allowed for the handshake before the connection is abandoned
    pub max_time_before_crypto_handshake: Duration,
    /// Idle timeout in force until the handshake completes
    pub max_idle_time_before_crypto_handshake: Duration,
    /// Close without a CONNECTION_CLOSE packet on idle timeout
    pub silent_close_on_idle_timeout: bool,
    /// Undecryptable packets buffered while waiting for keys
    pub max_undecryptable_packets: usize,
    /// Outstanding sent packets tolerated before closing the connection
    pub max_tracked_packets: u64,
    /// Stateless reset token received in the peer's transport parameters
    pub stateless_reset_token: Option<ResetToken>,
    /// Shorter keepalive used when streams are open but nothing is in
    /// flight; must be below the regular ping interval
    pub retransmittable_on_wire_timeout: Option<Duration>,
    /// Send probing data instead of going application-limited once the
    /// handshake completes
    pub fill_up_link_during_probing: bool,
    /// Connection options requested by the client
    pub client_connection_options: Vec<Tag>,
    /// Connection options in force for both endpoints
    pub connection_options: Vec<Tag>,
}

impl Config {
    /// Whether `tag` was requested by the client (as seen from `perspective`)
    /// or negotiated bilaterally
    pub fn has_client_sent_connection_option(&self, tag: Tag, perspective: Side) -> bool {
        if perspective == Side::Server && self.client_connection_options.contains(&tag) {
            return true;
        }
        self.connection_options.contains(&tag)
    }

    /// Mark the handshake as complete and install the negotiated idle timeout
    pub fn set_negotiated(&mut self, idle_network_timeout: Duration) {
        self.negotiated = true;
        self.idle_network_timeout = idle_network_timeout;
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            negotiated: false,
            idle_network_timeout: Duration::from_secs(600),
            max_time_before_crypto_handshake: Duration::from_secs(10),
            max_idle_time_before_crypto_handshake: Duration::from_secs(5),
            silent_close_on_idle_timeout: false,
            max_undecryptable_packets: 10,
            max_tracked_packets: 10_000,
            stateless_reset_token: None,
            retransmittable_on_wire_timeout: None,
            fill_up_link_during_probing: false,
            client_connection_options: Vec::new(),
            connection_options: Vec::new(),
        }
    }
}

/// Network characteristics cached from a previous connection to the same
/// peer, replayed into the sent-packet manager on resumption
///
/// Owned by the caller; the connection only forwards it.
#[derive(Debug, Copy, Clone, Default)]
pub struct CachedNetworkParameters {
    pub bandwidth_estimate_bytes_per_second: u64,
    pub min_rtt: Duration,
    pub previous_connection_state_expiry: Option<Duration>,
}
