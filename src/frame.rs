use std::{fmt, ops::Range, time::Duration, time::Instant};

use bytes::Bytes;

use crate::{error::ErrorCode, packet::ConnectionId, packet::ResetToken};

/// Stream ID carrying handshake data in pre-TLS versions
const CRYPTO_STREAM_ID: u64 = 1;

/// Handshake message tags whose appearance at the start of an unencrypted
/// stream frame suggests a corrupted buffer rather than a hostile peer
pub(crate) const TAG_CHLO: &[u8; 4] = b"CHLO";
pub(crate) const TAG_REJ: &[u8; 4] = b"REJ\0";

/// A decoded frame, as produced by the framer
///
/// Wire encoding and decoding live behind the [`Framer`](crate::Framer)
/// boundary; the connection only ever sees this decoded form.
#[derive(Debug, Clone)]
pub enum Frame {
    Padding,
    Ping,
    Ack(AckFrame),
    Stream(StreamFrame),
    Close(CloseFrame),
    StopWaiting {
        least_unacked: u64,
    },
    GoAway {
        error_code: ErrorCode,
        last_good_stream_id: u64,
        reason: String,
    },
    WindowUpdate {
        stream_id: u64,
        byte_offset: u64,
    },
    Blocked {
        stream_id: u64,
    },
    RstStream {
        stream_id: u64,
        error_code: u64,
        final_offset: u64,
    },
    StopSending {
        stream_id: u64,
        error_code: u64,
    },
    PathChallenge([u8; 8]),
    PathResponse([u8; 8]),
    MaxStreams {
        bidirectional: bool,
        count: u64,
    },
    StreamsBlocked {
        bidirectional: bool,
        limit: u64,
    },
    NewConnectionId {
        sequence: u64,
        id: ConnectionId,
        reset_token: ResetToken,
    },
    RetireConnectionId {
        sequence: u64,
    },
    NewToken {
        token: Bytes,
    },
    Message {
        data: Bytes,
    },
}

impl Frame {
    /// Whether receipt of this frame makes the enclosing packet instigate an
    /// acknowledgement
    pub fn instigates_ack(&self) -> bool {
        !matches!(
            *self,
            Self::Padding | Self::Ack(_) | Self::Close(_) | Self::StopWaiting { .. }
        )
    }

    /// Short name for logging
    pub fn ty(&self) -> &'static str {
        match *self {
            Self::Padding => "PADDING",
            Self::Ping => "PING",
            Self::Ack(_) => "ACK",
            Self::Stream(_) => "STREAM",
            Self::Close(_) => "CONNECTION_CLOSE",
            Self::StopWaiting { .. } => "STOP_WAITING",
            Self::GoAway { .. } => "GOAWAY",
            Self::WindowUpdate { .. } => "WINDOW_UPDATE",
            Self::Blocked { .. } => "BLOCKED",
            Self::RstStream { .. } => "RST_STREAM",
            Self::StopSending { .. } => "STOP_SENDING",
            Self::PathChallenge(_) => "PATH_CHALLENGE",
            Self::PathResponse(_) => "PATH_RESPONSE",
            Self::MaxStreams { .. } => "MAX_STREAMS",
            Self::StreamsBlocked { .. } => "STREAMS_BLOCKED",
            Self::NewConnectionId { .. } => "NEW_CONNECTION_ID",
            Self::RetireConnectionId { .. } => "RETIRE_CONNECTION_ID",
            Self::NewToken { .. } => "NEW_TOKEN",
            Self::Message { .. } => "MESSAGE",
        }
    }
}

/// Application or handshake data scoped to a stream
#[derive(Clone)]
pub struct StreamFrame {
    pub stream_id: u64,
    pub offset: u64,
    pub fin: bool,
    pub data: Bytes,
}

impl StreamFrame {
    /// Whether this frame carries handshake data and is therefore legal at
    /// the initial encryption level
    pub fn is_crypto_stream(&self) -> bool {
        self.stream_id == CRYPTO_STREAM_ID
    }
}

impl fmt::Debug for StreamFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamFrame")
            .field("stream_id", &self.stream_id)
            .field("offset", &self.offset)
            .field("fin", &self.fin)
            .field("len", &self.data.len())
            .finish()
    }
}

/// A complete acknowledgement frame
///
/// `ranges` are disjoint, ascending, half-open ranges of received packet
/// numbers; the end of the last range is `largest_acked + 1`.
#[derive(Debug, Clone, Default)]
pub struct AckFrame {
    pub largest_acked: u64,
    pub ack_delay: Duration,
    pub ranges: Vec<Range<u64>>,
    /// Optional per-packet receipt timestamps, ascending by packet number
    pub timestamps: Vec<(u64, Instant)>,
}

impl AckFrame {
    pub fn smallest_acked(&self) -> u64 {
        self.ranges.first().map_or(self.largest_acked, |r| r.start)
    }
}

/// Wire flavor of a CONNECTION_CLOSE frame
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CloseType {
    /// Pre-IETF close frame layout
    Google,
    /// IETF transport-layer close
    IetfTransport,
}

/// A CONNECTION_CLOSE frame in either flavor
#[derive(Debug, Clone)]
pub struct CloseFrame {
    pub code: ErrorCode,
    pub reason: String,
    pub close_type: CloseType,
}
