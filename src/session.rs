use std::net::SocketAddr;

use crate::{
    connection::AddressChangeType,
    error::{CloseSource, ErrorCode},
    frame::{Frame, StreamFrame},
    version::Version,
};

/// The session (stream multiplexer) sitting above the connection
///
/// The connection forwards decoded frames up and asks the session for write
/// intent; the session calls back down through the public `Connection` API.
/// All methods run on the connection's single thread and must not block.
pub trait Visitor {
    /// A stream frame passed encryption-level checks
    fn on_stream_frame(&mut self, frame: &StreamFrame);
    /// A control frame addressed to the session (GOAWAY, WINDOW_UPDATE,
    /// BLOCKED, RST_STREAM, STOP_SENDING, MAX_STREAMS, STREAMS_BLOCKED,
    /// NEW_CONNECTION_ID, RETIRE_CONNECTION_ID, NEW_TOKEN, MESSAGE)
    fn on_control_frame(&mut self, frame: &Frame);

    /// The connection can accept more data from the session
    fn on_can_write(&mut self);
    /// The writer reported blocked; the session should register for
    /// writability with the reactor
    fn on_write_blocked(&mut self);
    /// Terminal notification; fired exactly once
    fn on_connection_closed(&mut self, code: ErrorCode, reason: &str, source: CloseSource);
    /// The effective peer address changed and migration started
    fn on_connection_migration(&mut self, change: AddressChangeType);
    fn on_successful_version_negotiation(&mut self, version: Version);
    /// A connectivity probe (padded PING / padded PATH_CHALLENGE) arrived
    fn on_connectivity_probe_received(&mut self, self_addr: SocketAddr, peer_addr: SocketAddr);
    /// An ACK advanced the largest-acked packet
    fn on_forward_progress_confirmed(&mut self);
    /// Too many consecutive packets carried no retransmittable frames; the
    /// session should bundle one with the next write
    fn on_ack_needs_retransmittable_frame(&mut self);
    /// The path has gone too long without an acknowledgement
    fn on_path_degrading(&mut self);

    /// Whether handshake data is waiting to be sent
    fn has_pending_handshake(&self) -> bool;
    /// Whether the session has data it could write right now
    fn willing_and_able_to_write(&self) -> bool;
    /// Queue probing data; true if any was produced
    fn send_probing_data(&mut self) -> bool;
    /// Produce a PING for keepalive
    fn send_ping(&mut self);
    /// Whether the keepalive timer should run
    fn should_keep_connection_alive(&self) -> bool;
    /// Whether a server may accept a change of its own address
    fn allow_self_address_change(&self) -> bool;
}
