use std::fmt;

use thiserror::Error;

/// Protocol-level error codes carried in CONNECTION_CLOSE frames and used to
/// classify local close decisions
///
/// Codes are grouped by the failure model: protocol violations close with a
/// connection close packet, I/O and internal errors close silently (except
/// message-too-big, which can still be signalled), and timeouts follow the
/// configured close behavior.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum ErrorCode {
    /// Graceful shutdown requested by the application
    NoError,
    /// Version negotiation failed to find a mutually supported version
    InvalidVersion,
    /// A version negotiation packet listed the version already in use
    InvalidVersionNegotiationPacket,
    /// An ACK frame acknowledged data never sent, or regressed
    InvalidAckData,
    /// A STOP_WAITING frame carried an out-of-range least-unacked
    InvalidStopWaitingData,
    /// A packet number fell outside the acceptance window
    InvalidPacketHeader,
    /// A stream frame at the initial encryption level began with a handshake
    /// tag, suggesting a corrupted buffer rather than a hostile peer
    MaybeCorruptedMemory,
    /// Stream data arrived without packet protection
    UnencryptedStreamData,
    /// The local address changed and the session forbade it
    ErrorMigratingAddress,
    /// The sent-packet manager is tracking too many outstanding packets
    TooManyOutstandingSentPackets,
    /// Too many consecutive retransmission timeouts
    TooManyRtos,
    /// The writer failed with a non-blocking error
    PacketWriteError,
    /// A datagram exceeded the path MTU
    MsgTooBig,
    /// A stateless reset matching the peer's token was received
    PublicReset,
    /// No network activity within the idle timeout
    NetworkIdleTimeout,
    /// The handshake did not complete in time
    HandshakeTimeout,
    /// The peer closed the connection
    PeerGoingAway,
    /// Local invariant violation; never the peer's fault
    InternalError,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match *self {
            Self::NoError => "no error",
            Self::InvalidVersion => "no common protocol version",
            Self::InvalidVersionNegotiationPacket => "invalid version negotiation packet",
            Self::InvalidAckData => "invalid ack data",
            Self::InvalidStopWaitingData => "invalid stop waiting data",
            Self::InvalidPacketHeader => "invalid packet header",
            Self::MaybeCorruptedMemory => "possibly corrupted memory",
            Self::UnencryptedStreamData => "unencrypted stream data",
            Self::ErrorMigratingAddress => "migrating address not allowed",
            Self::TooManyOutstandingSentPackets => "too many outstanding sent packets",
            Self::TooManyRtos => "too many consecutive retransmission timeouts",
            Self::PacketWriteError => "packet write error",
            Self::MsgTooBig => "datagram too big for path",
            Self::PublicReset => "stateless reset received",
            Self::NetworkIdleTimeout => "no recent network activity",
            Self::HandshakeTimeout => "handshake timed out",
            Self::PeerGoingAway => "peer going away",
            Self::InternalError => "internal error",
        };
        f.write_str(s)
    }
}

/// A typed protocol error: the code that will go on the wire plus a static
/// human-readable detail string
///
/// Frame handlers return `Result<(), TransportError>`; the connection driver
/// translates an `Err` into a single close, so constructing one of these is
/// always terminal for the connection.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("{code}: {reason}")]
pub struct TransportError {
    /// Error code to include in the CONNECTION_CLOSE frame
    pub code: ErrorCode,
    /// Diagnostic detail, not sent to the peer verbatim
    pub reason: &'static str,
    /// How to close: some errors must not generate a close packet
    pub behavior: CloseBehavior,
}

impl TransportError {
    pub fn new(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            behavior: CloseBehavior::SendConnectionClose,
        }
    }

    /// An error that tears down local state without emitting a close packet
    pub fn silent(code: ErrorCode, reason: &'static str) -> Self {
        Self {
            code,
            reason,
            behavior: CloseBehavior::SilentClose,
        }
    }
}

/// Whether closing emits a CONNECTION_CLOSE packet
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CloseBehavior {
    SendConnectionClose,
    SilentClose,
}

/// Which endpoint initiated the teardown, as reported to the session
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum CloseSource {
    FromSelf,
    FromPeer,
}

/// Reasons a connection terminated, as surfaced to the application
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ConnectionError {
    /// The peer sent a CONNECTION_CLOSE frame
    #[error("closed by peer: {code}")]
    ClosedByPeer { code: ErrorCode },
    /// A stateless reset or public reset terminated the connection
    #[error("reset by peer")]
    Reset,
    /// The local endpoint detected an error
    #[error("local error: {0}")]
    Local(TransportError),
    /// The idle or handshake timeout expired
    #[error("timed out: {code}")]
    TimedOut { code: ErrorCode },
}
