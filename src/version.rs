use std::fmt;

/// Cryptographic handshake carried by a protocol version
///
/// In-connection version negotiation may only move between versions sharing
/// a handshake protocol; anything else would invalidate handshake state
/// already on the wire.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum HandshakeProtocol {
    QuicCrypto,
    Tls13,
}

/// A parsed protocol version: wire number plus the handshake protocol it
/// implies
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Version {
    pub protocol: HandshakeProtocol,
    pub number: u32,
}

impl Version {
    pub const fn new(protocol: HandshakeProtocol, number: u32) -> Self {
        Self { protocol, number }
    }

    /// Whether this version uses IETF invariant headers, which retire the
    /// STOP_WAITING frame and enable multiple packet number spaces
    pub fn has_ietf_invariant_header(&self) -> bool {
        self.protocol == HandshakeProtocol::Tls13
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocol = match self.protocol {
            HandshakeProtocol::QuicCrypto => "Q",
            HandshakeProtocol::Tls13 => "T",
        };
        write!(f, "{}{:03}", protocol, self.number)
    }
}

/// Progress of version negotiation for a connection
///
/// Servers advance `Start -> InProgress` when they reply to an unsupported
/// version and to `Negotiated` when they accept one; clients move to
/// `InProgress` after choosing from a version negotiation packet and to
/// `Negotiated` on the first packet that proves the server accepted.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum VersionNegotiationState {
    StartNegotiation,
    NegotiationInProgress,
    NegotiatedVersion,
}

/// Select the highest mutually supported version, iterating the local list
/// in preference order
pub(crate) fn select_mutual_version(local: &[Version], peer: &[Version]) -> Option<Version> {
    local.iter().find(|v| peer.contains(v)).copied()
}
