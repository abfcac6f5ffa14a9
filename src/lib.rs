//! Protocol logic for a single QUIC connection
//!
//! This crate contains the per-connection state machine of a QUIC endpoint:
//! the object that owns the peer association, sequences packets on the wire,
//! drives acknowledgement scheduling, performs version negotiation and path
//! validation, and arms the timers governing loss recovery and liveness.
//!
//! Wire-format serialization, packet protection, congestion control and
//! stream multiplexing are collaborators injected at construction time; see
//! [`Framer`], [`PacketGenerator`], [`SentPacketManager`], [`PacketWriter`]
//! and [`Visitor`].
//!
//! The [`Connection`] never performs I/O itself beyond calling into the
//! injected writer, and never blocks: every entry point runs to completion,
//! and the only wait primitive is arming a timer and returning. A reactor
//! drives the connection by delivering datagrams, write-unblock signals and
//! timer expirations.

use std::{fmt, ops};

pub mod config;
pub use crate::config::{CachedNetworkParameters, Config, Tag};

mod connection;
pub use crate::connection::{AddressChangeType, Connection, ConnectionStats, Timer};

mod error;
pub use crate::error::{
    CloseBehavior, CloseSource, ConnectionError, ErrorCode, TransportError,
};

mod frame;
pub use crate::frame::{AckFrame, CloseFrame, CloseType, Frame, StreamFrame};

mod framer;
pub use crate::framer::{DecodedPacket, Framer, FramerError, LargestReceived, ProcessOutcome};

mod generator;
pub use crate::generator::{PacketGenerator, ProbePacket};

mod io;
pub use crate::io::{Clock, PacketOptions, PacketWriter, WriteResult, WriteStatus};

mod packet;
pub use crate::packet::{
    ConnectionId, PacketHeader, ReceivedPacket, ResetToken, SerializedPacket, TransmissionType,
};

mod range_set;
pub use crate::range_set::RangeSet;

mod sent;
pub use crate::sent::{AckResult, RetransmissionReason, RttStats, SentPacketManager};

mod session;
pub use crate::session::Visitor;


mod version;
pub use crate::version::{HandshakeProtocol, Version, VersionNegotiationState};

/// Whether an endpoint initiated a connection or accepted it
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client,
    /// The acceptor of a connection
    Server,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Client => f.write_str("client"),
            Self::Server => f.write_str("server"),
        }
    }
}

/// Independent packet number sequences
///
/// Initial and handshake packets each live in their own space; everything
/// else (0-RTT and 1-RTT) shares the application data space. Each space
/// carries its own largest-received state and acknowledgement ranges.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    /// Application data space, used for 0-RTT and 1-RTT packets
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].into_iter()
    }

    /// The encryption level at which acknowledgements for this space are sent
    pub fn ack_level(self) -> EncryptionLevel {
        match self {
            Self::Initial => EncryptionLevel::Initial,
            Self::Handshake => EncryptionLevel::Handshake,
            Self::Data => EncryptionLevel::ForwardSecure,
        }
    }
}

/// Level of packet protection applied to a packet
///
/// Levels only ever advance over the life of a connection.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    ForwardSecure,
}

impl EncryptionLevel {
    /// The packet number space packets at this level belong to
    pub fn space(self) -> SpaceId {
        match self {
            Self::Initial => SpaceId::Initial,
            Self::Handshake => SpaceId::Handshake,
            Self::ZeroRtt | Self::ForwardSecure => SpaceId::Data,
        }
    }
}

impl fmt::Display for EncryptionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Initial => f.write_str("initial"),
            Self::ZeroRtt => f.write_str("0-rtt"),
            Self::Handshake => f.write_str("handshake"),
            Self::ForwardSecure => f.write_str("forward-secure"),
        }
    }
}

//
// Useful internal constants
//

/// Maximum distance an accepted packet number may lie from the previously
/// accepted one in the same space.
pub(crate) const MAX_PACKET_GAP: u64 = 5000;
/// Largest value a peer choosing a random initial packet number may pick.
pub(crate) const MAX_RANDOM_INITIAL_PACKET_NUMBER: u64 = (1 << 31) - 1;
/// Granularity used when rescheduling most alarms; avoids timer churn.
pub(crate) const TIMER_GRANULARITY: std::time::Duration = std::time::Duration::from_millis(1);
/// Consecutive packets without retransmittable frames before the session is
/// asked to bundle one.
pub(crate) const MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS: u64 = 19;
/// Keepalive interval for client connections.
pub(crate) const PING_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15);
