use std::{
    net::{IpAddr, SocketAddr},
    time::{Duration, Instant},
};

/// Outcome of handing a datagram to the writer
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum WriteStatus {
    /// The datagram was accepted
    Ok,
    /// The socket would block and the datagram was dropped; resend it after
    /// the writer signals writability
    Blocked,
    /// The socket would block but the writer buffered the datagram; do not
    /// resend it
    BlockedDataBuffered,
    /// The datagram exceeded the path MTU
    MsgTooBig,
    /// A non-recoverable socket error
    Error(i32),
}

impl WriteStatus {
    pub fn is_blocked(self) -> bool {
        matches!(self, Self::Blocked | Self::BlockedDataBuffered)
    }

    pub fn is_error(self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Result of a single write call
#[derive(Debug, Copy, Clone)]
pub struct WriteResult {
    pub status: WriteStatus,
    pub bytes_written: usize,
}

impl WriteResult {
    pub fn ok(bytes_written: usize) -> Self {
        Self {
            status: WriteStatus::Ok,
            bytes_written,
        }
    }
}

/// Per-write options passed through to the socket layer
#[derive(Debug, Copy, Clone, Default)]
pub struct PacketOptions {
    /// Earliest time the kernel should release the datagram, for pacing
    /// offload; `None` when the writer does not support release time
    pub release_time_delay: Option<Duration>,
}

/// The UDP socket abstraction the connection writes through
///
/// The connection never calls [`write_packet`](Self::write_packet) while the
/// writer reports itself blocked; a blocked writer must call back into the
/// connection via `on_blocked_writer_can_write` once writable.
pub trait PacketWriter {
    fn write_packet(
        &mut self,
        buf: &[u8],
        self_ip: IpAddr,
        peer: SocketAddr,
        options: &PacketOptions,
    ) -> WriteResult;

    fn is_write_blocked(&self) -> bool;

    /// Clear the blocked state after the reactor reports writability
    fn set_writable(&mut self);

    /// Whether writes are batched and need an explicit flush
    fn is_batch_mode(&self) -> bool;

    /// Flush batched writes; meaningful only in batch mode
    fn flush(&mut self) -> WriteResult;

    /// Largest datagram the writer will accept for this peer
    fn max_packet_size(&self, peer: SocketAddr) -> usize;

    /// Whether the kernel honors per-packet release times
    fn supports_release_time(&self) -> bool;
}

/// Time source injected into the connection
///
/// Single-threaded access only; the connection never caches `now` across
/// entry points.
pub trait Clock {
    fn now(&self) -> Instant;
}
