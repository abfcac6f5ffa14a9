//! Mock collaborators and a connection harness for end-to-end tests

use std::{
    cell::RefCell,
    collections::VecDeque,
    net::SocketAddr,
    rc::Rc,
    time::{Duration, Instant},
};

use bytes::Bytes;

use crate::{
    config::CachedNetworkParameters,
    connection::AddressChangeType,
    error::{CloseSource, ErrorCode},
    frame::{AckFrame, Frame, StreamFrame},
    framer::{DecodedPacket, Framer, FramerError, LargestReceived, ProcessOutcome},
    generator::{PacketGenerator, ProbePacket},
    io::{Clock, PacketOptions, PacketWriter, WriteResult, WriteStatus},
    packet::{ConnectionId, PacketHeader, ReceivedPacket, ResetToken, SerializedPacket,
             TransmissionType},
    sent::{AckResult, RetransmissionReason, RttStats, SentPacketManager},
    session::Visitor,
    version::{HandshakeProtocol, Version},
    Connection, EncryptionLevel, Side, SpaceId,
};

pub(super) const Q43: Version = Version::new(HandshakeProtocol::QuicCrypto, 43);
pub(super) const Q46: Version = Version::new(HandshakeProtocol::QuicCrypto, 46);
pub(super) const T99: Version = Version::new(HandshakeProtocol::Tls13, 99);

pub(super) fn client_addr() -> SocketAddr {
    "10.0.0.1:1000".parse().unwrap()
}

pub(super) fn server_addr() -> SocketAddr {
    "10.0.0.2:443".parse().unwrap()
}

pub(super) fn cid(bytes: &[u8]) -> ConnectionId {
    ConnectionId::new(bytes)
}

//
// Clock
//

#[derive(Clone)]
pub(super) struct TestClock(Rc<RefCell<Instant>>);

impl TestClock {
    pub(super) fn start() -> Self {
        Self(Rc::new(RefCell::new(Instant::now())))
    }

    pub(super) fn advance(&self, by: Duration) {
        let mut now = self.0.borrow_mut();
        *now += by;
    }

    pub(super) fn now(&self) -> Instant {
        *self.0.borrow()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        *self.0.borrow()
    }
}

//
// Writer
//

#[derive(Default)]
pub(super) struct WriterState {
    pub(super) blocked: bool,
    /// Become blocked on the next write attempt, dropping that datagram
    pub(super) block_on_write: bool,
    /// Report `BlockedDataBuffered` instead of `Blocked`
    pub(super) buffers_when_blocked: bool,
    /// Datagram sizes rejected with `MsgTooBig`
    pub(super) msg_too_big_over: Option<usize>,
    pub(super) fail_with: Option<i32>,
    pub(super) batch_mode: bool,
    pub(super) flush_count: usize,
    pub(super) sent: Vec<Vec<u8>>,
    pub(super) write_attempts: usize,
}

#[derive(Clone)]
pub(super) struct TestWriter(pub(super) Rc<RefCell<WriterState>>);

impl TestWriter {
    pub(super) fn new() -> Self {
        Self(Rc::new(RefCell::new(WriterState::default())))
    }

    pub(super) fn set_blocked(&self, blocked: bool) {
        self.0.borrow_mut().blocked = blocked;
    }

    pub(super) fn sent_count(&self) -> usize {
        self.0.borrow().sent.len()
    }
}

impl PacketWriter for TestWriter {
    fn write_packet(
        &mut self,
        buf: &[u8],
        _self_ip: std::net::IpAddr,
        _peer: SocketAddr,
        _options: &PacketOptions,
    ) -> WriteResult {
        let mut state = self.0.borrow_mut();
        state.write_attempts += 1;
        if state.block_on_write {
            state.block_on_write = false;
            state.blocked = true;
            return WriteResult {
                status: WriteStatus::Blocked,
                bytes_written: 0,
            };
        }
        if state.blocked {
            return WriteResult {
                status: if state.buffers_when_blocked {
                    state.sent.push(buf.to_vec());
                    WriteStatus::BlockedDataBuffered
                } else {
                    WriteStatus::Blocked
                },
                bytes_written: 0,
            };
        }
        if let Some(limit) = state.msg_too_big_over {
            if buf.len() > limit {
                return WriteResult {
                    status: WriteStatus::MsgTooBig,
                    bytes_written: 0,
                };
            }
        }
        if let Some(code) = state.fail_with {
            return WriteResult {
                status: WriteStatus::Error(code),
                bytes_written: 0,
            };
        }
        state.sent.push(buf.to_vec());
        WriteResult::ok(buf.len())
    }

    fn is_write_blocked(&self) -> bool {
        self.0.borrow().blocked
    }

    fn set_writable(&mut self) {
        self.0.borrow_mut().blocked = false;
    }

    fn is_batch_mode(&self) -> bool {
        self.0.borrow().batch_mode
    }

    fn flush(&mut self) -> WriteResult {
        self.0.borrow_mut().flush_count += 1;
        WriteResult::ok(0)
    }

    fn max_packet_size(&self, _peer: SocketAddr) -> usize {
        1500
    }

    fn supports_release_time(&self) -> bool {
        false
    }
}

//
// Framer
//

#[derive(Default)]
pub(super) struct FramerState {
    /// Scripted results, popped per `process_packet` call
    pub(super) outcomes: VecDeque<Result<ProcessOutcome, FramerError>>,
    /// Levels without usable keys
    pub(super) missing_keys: Vec<EncryptionLevel>,
    /// Connection IDs initial keys were derived for
    pub(super) initial_key_cids: Vec<ConnectionId>,
    pub(super) discarded_below: Vec<EncryptionLevel>,
    pub(super) versions_set: Vec<Version>,
    /// Token reported for any packet when set
    pub(super) reset_token: Option<ResetToken>,
}

#[derive(Clone)]
pub(super) struct TestFramer(pub(super) Rc<RefCell<FramerState>>);

impl TestFramer {
    pub(super) fn new() -> Self {
        Self(Rc::new(RefCell::new(FramerState::default())))
    }

    pub(super) fn push(&self, outcome: Result<ProcessOutcome, FramerError>) {
        self.0.borrow_mut().outcomes.push_back(outcome);
    }
}

impl Framer for TestFramer {
    fn process_packet(
        &mut self,
        _packet: &ReceivedPacket,
        _largest_received: &dyn LargestReceived,
    ) -> Result<ProcessOutcome, FramerError> {
        self.0
            .borrow_mut()
            .outcomes
            .pop_front()
            .expect("unscripted packet handed to framer")
    }

    fn stateless_reset_token(&self, _data: &[u8]) -> Option<ResetToken> {
        self.0.borrow().reset_token
    }

    fn has_keys(&self, level: EncryptionLevel) -> bool {
        !self.0.borrow().missing_keys.contains(&level)
    }

    fn install_initial_keys(&mut self, cid: &ConnectionId) {
        self.0.borrow_mut().initial_key_cids.push(*cid);
    }

    fn discard_keys_below(&mut self, level: EncryptionLevel) {
        self.0.borrow_mut().discarded_below.push(level);
    }

    fn set_version(&mut self, version: Version) {
        self.0.borrow_mut().versions_set.push(version);
    }
}

//
// Generator
//

pub(super) struct GeneratorState {
    pub(super) level: EncryptionLevel,
    pub(super) transmission_type: TransmissionType,
    pub(super) queued: Vec<Frame>,
    pub(super) next_packet_number: [u64; 3],
    pub(super) max_packet_length: u16,
    pub(super) server_cid: Option<ConnectionId>,
    pub(super) retry_token: Option<Bytes>,
    pub(super) versions_set: Vec<Version>,
    /// Every ack flushed, with the level it went out at
    pub(super) acks_flushed: Vec<(EncryptionLevel, AckFrame)>,
    /// Every packet serialized, in order
    pub(super) packets: Vec<SerializedPacket>,
    pub(super) probes: Vec<ProbePacket>,
}

impl Default for GeneratorState {
    fn default() -> Self {
        Self {
            level: EncryptionLevel::Initial,
            transmission_type: TransmissionType::NotRetransmission,
            queued: Vec::new(),
            next_packet_number: [1; 3],
            max_packet_length: 1350,
            server_cid: None,
            retry_token: None,
            versions_set: Vec::new(),
            acks_flushed: Vec::new(),
            packets: Vec::new(),
            probes: Vec::new(),
        }
    }
}

#[derive(Clone)]
pub(super) struct TestGenerator(pub(super) Rc<RefCell<GeneratorState>>);

impl TestGenerator {
    pub(super) fn new() -> Self {
        Self(Rc::new(RefCell::new(GeneratorState::default())))
    }

    pub(super) fn acks_flushed(&self) -> Vec<(EncryptionLevel, AckFrame)> {
        self.0.borrow().acks_flushed.clone()
    }

    fn serialize(
        state: &mut GeneratorState,
        frames: Vec<Frame>,
        size: usize,
    ) -> SerializedPacket {
        let space = state.level.space();
        let packet_number = state.next_packet_number[space as usize];
        state.next_packet_number[space as usize] += 1;
        let largest_acked = frames.iter().find_map(|f| match f {
            Frame::Ack(ack) => Some(ack.largest_acked),
            _ => None,
        });
        let retransmittable_frames = frames
            .iter()
            .filter(|f| f.instigates_ack() || matches!(f, Frame::Close(_)))
            .cloned()
            .collect();
        let packet = SerializedPacket {
            buffer: Bytes::from(vec![0u8; size]),
            packet_number,
            encryption_level: state.level,
            transmission_type: state.transmission_type,
            retransmittable_frames,
            largest_acked,
            original_packet_number: None,
        };
        state.packets.push(packet.clone());
        packet
    }
}

impl PacketGenerator for TestGenerator {
    fn set_encryption_level(&mut self, level: EncryptionLevel) {
        self.0.borrow_mut().level = level;
    }

    fn encryption_level(&self) -> EncryptionLevel {
        self.0.borrow().level
    }

    fn set_transmission_type(&mut self, ty: TransmissionType) {
        self.0.borrow_mut().transmission_type = ty;
    }

    fn has_queued_frames(&self) -> bool {
        !self.0.borrow().queued.is_empty()
    }

    fn has_retransmittable_frames(&self) -> bool {
        self.0.borrow().queued.iter().any(|f| f.instigates_ack())
    }

    fn queue_control_frame(&mut self, frame: Frame) {
        self.0.borrow_mut().queued.push(frame);
    }

    fn flush_ack_frame(&mut self, ack: AckFrame) -> Option<SerializedPacket> {
        let mut state = self.0.borrow_mut();
        let level = state.level;
        state.acks_flushed.push((level, ack.clone()));
        let mut frames = vec![Frame::Ack(ack)];
        frames.append(&mut state.queued);
        Some(Self::serialize(&mut state, frames, 64))
    }

    fn flush(&mut self) -> Vec<SerializedPacket> {
        let mut state = self.0.borrow_mut();
        if state.queued.is_empty() {
            return Vec::new();
        }
        let frames = std::mem::take(&mut state.queued);
        vec![Self::serialize(&mut state, frames, 128)]
    }

    fn serialize_probe(&mut self, probe: ProbePacket) -> Option<SerializedPacket> {
        let mut state = self.0.borrow_mut();
        state.probes.push(probe);
        let space = state.level.space();
        let packet_number = state.next_packet_number[space as usize];
        state.next_packet_number[space as usize] += 1;
        let packet = SerializedPacket {
            buffer: Bytes::from(vec![0u8; 1200]),
            packet_number,
            encryption_level: state.level,
            transmission_type: TransmissionType::NotRetransmission,
            // Probes are never retransmitted
            retransmittable_frames: Vec::new(),
            largest_acked: None,
            original_packet_number: None,
        };
        state.packets.push(packet.clone());
        Some(packet)
    }

    fn serialize_mtu_probe(&mut self, target: u16) -> Option<SerializedPacket> {
        let mut state = self.0.borrow_mut();
        let space = state.level.space();
        let packet_number = state.next_packet_number[space as usize];
        state.next_packet_number[space as usize] += 1;
        let packet = SerializedPacket {
            buffer: Bytes::from(vec![0u8; usize::from(target)]),
            packet_number,
            encryption_level: state.level,
            transmission_type: TransmissionType::NotRetransmission,
            retransmittable_frames: Vec::new(),
            largest_acked: None,
            original_packet_number: None,
        };
        state.packets.push(packet.clone());
        Some(packet)
    }

    fn serialize_version_negotiation(&mut self, versions: &[Version]) -> Bytes {
        Bytes::from(vec![0xEA; versions.len() + 16])
    }

    fn set_server_connection_id(&mut self, cid: ConnectionId) {
        self.0.borrow_mut().server_cid = Some(cid);
    }

    fn set_retry_token(&mut self, token: Bytes) {
        self.0.borrow_mut().retry_token = Some(token);
    }

    fn set_version(&mut self, version: Version) {
        self.0.borrow_mut().versions_set.push(version);
    }

    fn update_packet_number_length(&mut self, _least_unacked: u64, _max_packets_in_flight: u64) {}

    fn set_max_packet_length(&mut self, length: u16) {
        self.0.borrow_mut().max_packet_length = length;
    }

    fn current_max_packet_length(&self) -> u16 {
        self.0.borrow().max_packet_length
    }
}

//
// Sent-packet manager
//

pub(super) struct SentState {
    pub(super) sent: Vec<(SpaceId, u64, bool)>,
    pub(super) largest_sent: [Option<u64>; 3],
    pub(super) largest_acked: [Option<u64>; 3],
    pub(super) largest_sent_largest_acked: [Option<u64>; 3],
    pub(super) retransmission_time: Option<Instant>,
    pub(super) time_until_send: Option<Duration>,
    pub(super) pending_timer_transmissions: u32,
    pub(super) in_flight: u64,
    pub(super) unacked: u64,
    pub(super) consecutive_tlp: u32,
    pub(super) consecutive_rto: u32,
    pub(super) handshake_confirmed: bool,
    pub(super) tolerate_reneging: bool,
    pub(super) rtt: RttStats,
    pub(super) migrations: Vec<AddressChangeType>,
    pub(super) retransmissions_requested: Vec<RetransmissionReason>,
    pub(super) neutered: bool,
    pub(super) rto_fired: u32,
    pub(super) application_limited: u32,
    pub(super) resumed: u32,
    /// In-progress ack frame state
    ack_largest: Option<u64>,
}

impl Default for SentState {
    fn default() -> Self {
        Self {
            sent: Vec::new(),
            largest_sent: [None; 3],
            largest_acked: [None; 3],
            largest_sent_largest_acked: [None; 3],
            retransmission_time: None,
            time_until_send: Some(Duration::ZERO),
            pending_timer_transmissions: 0,
            in_flight: 0,
            unacked: 0,
            consecutive_tlp: 0,
            consecutive_rto: 0,
            handshake_confirmed: false,
            tolerate_reneging: false,
            rtt: RttStats {
                smoothed_rtt: Some(Duration::from_millis(100)),
                latest_rtt: Duration::from_millis(100),
                min_rtt: Duration::from_millis(80),
            },
            migrations: Vec::new(),
            retransmissions_requested: Vec::new(),
            neutered: false,
            rto_fired: 0,
            application_limited: 0,
            resumed: 0,
            ack_largest: None,
        }
    }
}

#[derive(Clone)]
pub(super) struct TestSentPacketManager(pub(super) Rc<RefCell<SentState>>);

impl TestSentPacketManager {
    pub(super) fn new() -> Self {
        Self(Rc::new(RefCell::new(SentState::default())))
    }
}

impl SentPacketManager for TestSentPacketManager {
    fn on_packet_sent(
        &mut self,
        packet: &SerializedPacket,
        _original_packet_number: Option<u64>,
        _send_time: Instant,
        _transmission_type: TransmissionType,
        has_retransmittable: bool,
    ) -> bool {
        let mut state = self.0.borrow_mut();
        let space = packet.space();
        state
            .sent
            .push((space, packet.packet_number, has_retransmittable));
        state.largest_sent[space as usize] = Some(
            state.largest_sent[space as usize]
                .map_or(packet.packet_number, |x| x.max(packet.packet_number)),
        );
        if has_retransmittable {
            state.in_flight += 1;
            state.unacked += 1;
        }
        if let Some(largest_acked) = packet.largest_acked {
            state.largest_sent_largest_acked[space as usize] = Some(
                state.largest_sent_largest_acked[space as usize]
                    .map_or(largest_acked, |x| x.max(largest_acked)),
            );
        }
        false
    }

    fn on_ack_frame_start(
        &mut self,
        largest_acked: u64,
        _ack_delay: Duration,
        _receipt_time: Instant,
    ) {
        self.0.borrow_mut().ack_largest = Some(largest_acked);
    }

    fn on_ack_range(&mut self, _start: u64, _end: u64) {}

    fn on_ack_timestamp(&mut self, _packet_number: u64, _timestamp: Instant) {}

    fn on_ack_frame_end(&mut self, _receipt_time: Instant, level: EncryptionLevel) -> AckResult {
        let mut state = self.0.borrow_mut();
        let space = level.space();
        let largest = state.ack_largest.take().unwrap();
        let previous = state.largest_acked[space as usize];
        if previous.map_or(true, |prev| largest > prev) {
            state.largest_acked[space as usize] = Some(largest);
            state.in_flight = state.in_flight.saturating_sub(1);
            AckResult::PacketsNewlyAcked
        } else {
            AckResult::NoPacketsNewlyAcked
        }
    }

    fn retransmission_time(&self) -> Option<Instant> {
        self.0.borrow().retransmission_time
    }

    fn time_until_send(&self, _now: Instant) -> Option<Duration> {
        self.0.borrow().time_until_send
    }

    fn path_degrading_delay(&self) -> Duration {
        Duration::from_millis(500)
    }

    fn next_release_time(&self) -> Option<Instant> {
        None
    }

    fn largest_sent_packet(&self, space: SpaceId) -> Option<u64> {
        self.0.borrow().largest_sent[space as usize]
    }

    fn largest_acked_packet(&self, space: SpaceId) -> Option<u64> {
        self.0.borrow().largest_acked[space as usize]
    }

    fn largest_packet_peer_knows_is_acked(&self, _space: SpaceId) -> Option<u64> {
        None
    }

    fn largest_sent_largest_acked(&self, space: SpaceId) -> Option<u64> {
        self.0.borrow().largest_sent_largest_acked[space as usize]
    }

    fn least_unacked(&self) -> u64 {
        0
    }

    fn estimate_max_packets_in_flight(&self, _max_packet_length: u16) -> u64 {
        10
    }

    fn unacked_packet_count(&self) -> u64 {
        self.0.borrow().unacked
    }

    fn has_in_flight_packets(&self) -> bool {
        self.0.borrow().in_flight > 0
    }

    fn has_pending_retransmissions(&self) -> bool {
        false
    }

    fn consecutive_tlp_count(&self) -> u32 {
        self.0.borrow().consecutive_tlp
    }

    fn consecutive_rto_count(&self) -> u32 {
        self.0.borrow().consecutive_rto
    }

    fn pending_timer_transmission_count(&self) -> u32 {
        self.0.borrow().pending_timer_transmissions
    }

    fn on_retransmission_timeout(&mut self) {
        let mut state = self.0.borrow_mut();
        state.rto_fired += 1;
        state.consecutive_rto += 1;
    }

    fn maybe_retransmit_tail_loss_probe(&mut self) -> bool {
        false
    }

    fn retransmit_unacked_packets(&mut self, reason: RetransmissionReason) {
        self.0.borrow_mut().retransmissions_requested.push(reason);
    }

    fn neuter_unencrypted_packets(&mut self) {
        self.0.borrow_mut().neutered = true;
    }

    fn on_connection_migration(&mut self, change: AddressChangeType) {
        self.0.borrow_mut().migrations.push(change);
    }

    fn on_application_limited(&mut self) {
        self.0.borrow_mut().application_limited += 1;
    }

    fn set_handshake_confirmed(&mut self) {
        self.0.borrow_mut().handshake_confirmed = true;
    }

    fn handshake_confirmed(&self) -> bool {
        self.0.borrow().handshake_confirmed
    }

    fn tolerate_reneging(&self) -> bool {
        self.0.borrow().tolerate_reneging
    }

    fn rtt_stats(&self) -> RttStats {
        self.0.borrow().rtt
    }

    fn delayed_ack_time(&self) -> Duration {
        Duration::from_millis(25)
    }

    fn resume_connection_state(&mut self, _cached: &CachedNetworkParameters) {
        self.0.borrow_mut().resumed += 1;
    }
}

//
// Visitor
//

#[derive(Default)]
pub(super) struct VisitorState {
    pub(super) stream_frames: Vec<StreamFrame>,
    pub(super) control_frames: Vec<Frame>,
    pub(super) closed: Option<(ErrorCode, String, CloseSource)>,
    pub(super) migrations: Vec<AddressChangeType>,
    pub(super) negotiated_versions: Vec<Version>,
    pub(super) probes_received: Vec<(SocketAddr, SocketAddr)>,
    pub(super) forward_progress: u32,
    pub(super) can_write_calls: u32,
    pub(super) write_blocked_calls: u32,
    pub(super) ack_needs_retransmittable: u32,
    pub(super) pings_requested: u32,
    pub(super) path_degrading: u32,
    pub(super) should_keep_alive: bool,
    pub(super) willing_to_write: bool,
    pub(super) allow_self_address_change: bool,
}

#[derive(Clone)]
pub(super) struct TestVisitor(pub(super) Rc<RefCell<VisitorState>>);

impl TestVisitor {
    pub(super) fn new() -> Self {
        Self(Rc::new(RefCell::new(VisitorState::default())))
    }

    pub(super) fn closed_code(&self) -> Option<ErrorCode> {
        self.0.borrow().closed.as_ref().map(|(code, _, _)| *code)
    }
}

impl Visitor for TestVisitor {
    fn on_stream_frame(&mut self, frame: &StreamFrame) {
        self.0.borrow_mut().stream_frames.push(frame.clone());
    }

    fn on_control_frame(&mut self, frame: &Frame) {
        self.0.borrow_mut().control_frames.push(frame.clone());
    }

    fn on_can_write(&mut self) {
        self.0.borrow_mut().can_write_calls += 1;
    }

    fn on_write_blocked(&mut self) {
        self.0.borrow_mut().write_blocked_calls += 1;
    }

    fn on_connection_closed(&mut self, code: ErrorCode, reason: &str, source: CloseSource) {
        let mut state = self.0.borrow_mut();
        assert!(state.closed.is_none(), "close notified twice");
        state.closed = Some((code, reason.to_owned(), source));
    }

    fn on_connection_migration(&mut self, change: AddressChangeType) {
        self.0.borrow_mut().migrations.push(change);
    }

    fn on_successful_version_negotiation(&mut self, version: Version) {
        self.0.borrow_mut().negotiated_versions.push(version);
    }

    fn on_connectivity_probe_received(&mut self, self_addr: SocketAddr, peer_addr: SocketAddr) {
        self.0.borrow_mut().probes_received.push((self_addr, peer_addr));
    }

    fn on_forward_progress_confirmed(&mut self) {
        self.0.borrow_mut().forward_progress += 1;
    }

    fn on_ack_needs_retransmittable_frame(&mut self) {
        self.0.borrow_mut().ack_needs_retransmittable += 1;
    }

    fn on_path_degrading(&mut self) {
        self.0.borrow_mut().path_degrading += 1;
    }

    fn has_pending_handshake(&self) -> bool {
        false
    }

    fn willing_and_able_to_write(&self) -> bool {
        self.0.borrow().willing_to_write
    }

    fn send_probing_data(&mut self) -> bool {
        false
    }

    fn send_ping(&mut self) {
        self.0.borrow_mut().pings_requested += 1;
    }

    fn should_keep_connection_alive(&self) -> bool {
        self.0.borrow().should_keep_alive
    }

    fn allow_self_address_change(&self) -> bool {
        self.0.borrow().allow_self_address_change
    }
}

//
// Harness
//

/// A connection wired to mock collaborators, with handles kept for
/// scripting and inspection
pub(super) struct TestConnection {
    pub(super) conn: Connection,
    pub(super) clock: TestClock,
    pub(super) writer: TestWriter,
    pub(super) framer: TestFramer,
    pub(super) generator: TestGenerator,
    pub(super) sent: TestSentPacketManager,
    pub(super) visitor: TestVisitor,
}

impl TestConnection {
    pub(super) fn new(side: Side, versions: Vec<Version>) -> Self {
        let clock = TestClock::start();
        let writer = TestWriter::new();
        let framer = TestFramer::new();
        let generator = TestGenerator::new();
        let sent = TestSentPacketManager::new();
        let visitor = TestVisitor::new();
        let conn = Connection::new(
            cid(&[0xc0; 8]),
            match side {
                Side::Client => server_addr(),
                Side::Server => client_addr(),
            },
            side,
            versions,
            Box::new(writer.clone()),
            Box::new(clock.clone()),
            Box::new(framer.clone()),
            Box::new(generator.clone()),
            Box::new(sent.clone()),
            Box::new(visitor.clone()),
        );
        Self {
            conn,
            clock,
            writer,
            framer,
            generator,
            sent,
            visitor,
        }
    }

    pub(super) fn client() -> Self {
        Self::new(Side::Client, vec![Q46, Q43])
    }

    pub(super) fn server() -> Self {
        Self::new(Side::Server, vec![Q46, Q43])
    }

    fn local_addr(&self) -> SocketAddr {
        match self.conn.side() {
            Side::Client => client_addr(),
            Side::Server => server_addr(),
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        match self.conn.side() {
            Side::Client => server_addr(),
            Side::Server => client_addr(),
        }
    }

    pub(super) fn received_packet(&self, len: usize) -> ReceivedPacket {
        ReceivedPacket {
            data: Bytes::from(vec![0u8; len]),
            receipt_time: self.clock.now(),
            destination: self.local_addr(),
            source: self.remote_addr(),
        }
    }

    /// Script a decoded packet and deliver it from the default peer address
    pub(super) fn deliver(&mut self, packet_number: u64, level: EncryptionLevel, frames: Vec<Frame>) {
        self.deliver_from(self.remote_addr(), packet_number, level, frames);
    }

    /// Script a decoded packet and deliver it from `source`
    pub(super) fn deliver_from(
        &mut self,
        source: SocketAddr,
        packet_number: u64,
        level: EncryptionLevel,
        frames: Vec<Frame>,
    ) {
        self.framer.push(Ok(ProcessOutcome::Packet(DecodedPacket {
            header: PacketHeader {
                dst_cid: self.conn.server_connection_id(),
                src_cid: None,
                packet_number,
                version: None,
                is_long_header: level != EncryptionLevel::ForwardSecure,
            },
            level,
            frames,
            remaining: None,
        })));
        let packet = ReceivedPacket {
            data: Bytes::from(vec![0u8; 1200]),
            receipt_time: self.clock.now(),
            destination: self.local_addr(),
            source,
        };
        self.conn.process_udp_packet(self.local_addr(), source, packet);
    }

    pub(super) fn stream_frame(&self, stream_id: u64) -> Frame {
        Frame::Stream(StreamFrame {
            stream_id,
            offset: 0,
            fin: false,
            data: Bytes::from_static(b"some data"),
        })
    }

    /// Fire every timer currently due
    pub(super) fn run_timers(&mut self) {
        let now = self.clock.now();
        self.conn.on_timeout(now);
    }
}
