use std::{
    cmp,
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    time::{Duration, Instant},
};

use bytes::Bytes;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, trace, trace_span, warn};

use crate::{
    config::{
        CachedNetworkParameters, Config, ACD0, ACKD, ACKQ, AKD2, AKD3, AKD4, AKDU, FIVE_RTO,
        MTUH, MTUL, NPCO, NSTP, STMP,
    },
    error::{CloseBehavior, CloseSource, ConnectionError, ErrorCode, TransportError},
    frame::{AckFrame, CloseFrame, CloseType, Frame, StreamFrame, TAG_CHLO, TAG_REJ},
    framer::{DecodedPacket, Framer, FramerError, LargestReceived, ProcessOutcome},
    generator::{PacketGenerator, ProbePacket},
    io::{Clock, PacketOptions, PacketWriter, WriteStatus},
    packet::{ConnectionId, PacketHeader, ReceivedPacket, SerializedPacket, TransmissionType},
    sent::{AckResult, RetransmissionReason, SentPacketManager},
    session::Visitor,
    version::{select_mutual_version, Version, VersionNegotiationState},
    EncryptionLevel, Side, SpaceId, MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS, MAX_PACKET_GAP,
    MAX_RANDOM_INITIAL_PACKET_NUMBER, PING_TIMEOUT, TIMER_GRANULARITY,
};

mod migration;
pub use migration::AddressChangeType;
use migration::{addresses_equivalent, determine_address_change_type, PacketContent};

mod mtud;
use mtud::{MtuDiscovery, MTU_DISCOVERY_TARGET_HIGH, MTU_DISCOVERY_TARGET_LOW};

mod spaces;
use spaces::{AckMode, AckPolicy, ReceivedPacketSpace, SHORT_ACK_DECIMATION_DELAY};

mod stats;
pub use stats::ConnectionStats;

mod timer;
pub use timer::Timer;
use timer::TimerTable;

/// Largest datagram ever sent, regardless of probing
const MAX_OUTGOING_PACKET_SIZE: u16 = 1452;
/// Packet size assumed safe without discovery
const DEFAULT_MAX_PACKET_SIZE: u16 = 1350;
/// Hard floor on the release-time pacing offset
const MIN_RELEASE_TIME_INTO_FUTURE: Duration = Duration::from_millis(1);
/// Ceiling on the release-time pacing offset
const MAX_PACE_TIME_INTO_FUTURE: Duration = Duration::from_millis(10);
/// Fraction of smoothed RTT used for the release-time offset
const PACE_TIME_INTO_FUTURE_SRTT_FRACTION: f32 = 0.125;
/// Receipt times further than this from the local clock are suspect
const RECEIPT_TIME_SANITY_WINDOW: Duration = Duration::from_secs(2 * 60);

/// Protocol state and logic for a single QUIC connection
///
/// A `Connection` is driven by exactly one reactor: it receives demultiplexed
/// datagrams through [`process_udp_packet`](Self::process_udp_packet),
/// write-unblock signals through
/// [`on_blocked_writer_can_write`](Self::on_blocked_writer_can_write), and
/// timer expirations through [`on_timeout`](Self::on_timeout). After any of
/// these the reactor should read [`next_timeout`](Self::next_timeout) and
/// reschedule its wakeup. No method blocks; the only wait primitive is an
/// armed timer.
///
/// All I/O flows through the injected [`PacketWriter`]; all serialization and
/// packet protection through the injected [`Framer`] and [`PacketGenerator`];
/// loss recovery and congestion control through the injected
/// [`SentPacketManager`]; streams and application policy through the injected
/// [`Visitor`].
pub struct Connection {
    side: Side,
    connected: bool,
    error: Option<ConnectionError>,

    //
    // Version state
    //
    version: Version,
    supported_versions: Vec<Version>,
    version_negotiation_state: VersionNegotiationState,
    server_supported_versions: Vec<Version>,
    /// IETF invariant headers retire STOP_WAITING
    no_stop_waiting_frames: bool,

    //
    // Connection IDs
    //
    server_connection_id: ConnectionId,
    client_connection_id: Option<ConnectionId>,
    retry_has_been_parsed: bool,

    //
    // Addresses
    //
    self_address: Option<SocketAddr>,
    direct_peer_address: SocketAddr,
    effective_peer_address: SocketAddr,

    //
    // Collaborators
    //
    writer: Box<dyn PacketWriter>,
    clock: Box<dyn Clock>,
    framer: Box<dyn Framer>,
    generator: Box<dyn PacketGenerator>,
    sent_packet_manager: Box<dyn SentPacketManager>,
    visitor: Box<dyn Visitor>,
    rng: StdRng,

    //
    // State of the packet currently being dispatched
    //
    last_header: Option<PacketHeader>,
    last_decrypted_packet_level: EncryptionLevel,
    last_size: usize,
    last_packet_destination_address: Option<SocketAddr>,
    last_packet_source_address: Option<SocketAddr>,
    should_last_packet_instigate_acks: bool,
    was_last_packet_missing: bool,
    current_packet_content: PacketContent,
    is_current_packet_connectivity_probing: bool,
    current_effective_peer_migration_type: AddressChangeType,

    //
    // Migration
    //
    active_effective_peer_migration_type: AddressChangeType,
    highest_packet_sent_before_effective_peer_migration: Option<u64>,
    received_path_challenge_payloads: Vec<[u8; 8]>,
    transmitted_connectivity_probe_payload: Option<[u8; 8]>,

    //
    // Receive side
    //
    received_packets: [ReceivedPacketSpace; 3],
    ack_policy: AckPolicy,
    largest_seen_packets_with_ack: [Option<u64>; 3],
    largest_seen_packet_with_stop_waiting: Option<u64>,
    time_of_last_received_packet: Option<Instant>,
    undecryptable_packets: VecDeque<ReceivedPacket>,
    max_undecryptable_packets: usize,
    coalesced_packets: VecDeque<ReceivedPacket>,
    stateless_reset_token: Option<crate::packet::ResetToken>,

    //
    // Send side
    //
    encryption_level: EncryptionLevel,
    queued_packets: VecDeque<SerializedPacket>,
    /// Encrypted CONNECTION_CLOSE packets kept for the time-wait period
    termination_packets: Vec<Bytes>,
    pending_version_negotiation_packet: bool,
    flusher_depth: u32,
    pending_retransmission_alarm: bool,
    consecutive_packets_with_no_retransmittable_frames: u64,
    supports_release_time: bool,
    release_time_into_future: Duration,
    mtu_discovery: MtuDiscovery,
    /// Max packet length not counting probes; EMSGSIZE above this cancels
    /// probing rather than the connection
    long_term_mtu: u16,

    //
    // Liveness
    //
    timers: TimerTable,
    idle_network_timeout: Duration,
    handshake_timeout: Option<Duration>,
    idle_timeout_connection_close_behavior: CloseBehavior,
    time_of_first_packet_sent_after_receiving: Option<Instant>,
    close_connection_after_five_rtos: bool,
    max_tracked_packets: u64,
    ping_timeout: Duration,
    retransmittable_on_wire_timeout: Option<Duration>,
    fill_up_link_during_probing: bool,
    is_path_degrading: bool,

    stats: ConnectionStats,
}

impl Connection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        server_connection_id: ConnectionId,
        peer_address: SocketAddr,
        side: Side,
        supported_versions: Vec<Version>,
        writer: Box<dyn PacketWriter>,
        clock: Box<dyn Clock>,
        mut framer: Box<dyn Framer>,
        generator: Box<dyn PacketGenerator>,
        sent_packet_manager: Box<dyn SentPacketManager>,
        visitor: Box<dyn Visitor>,
    ) -> Self {
        assert!(!supported_versions.is_empty());
        let version = supported_versions[0];
        let now = clock.now();
        framer.install_initial_keys(&server_connection_id);
        let mut this = Self {
            side,
            connected: true,
            error: None,

            version,
            supported_versions,
            version_negotiation_state: VersionNegotiationState::StartNegotiation,
            server_supported_versions: Vec::new(),
            no_stop_waiting_frames: version.has_ietf_invariant_header(),

            server_connection_id,
            client_connection_id: None,
            retry_has_been_parsed: false,

            self_address: None,
            direct_peer_address: peer_address,
            effective_peer_address: peer_address,

            writer,
            clock,
            framer,
            generator,
            sent_packet_manager,
            visitor,
            rng: StdRng::from_entropy(),

            last_header: None,
            last_decrypted_packet_level: EncryptionLevel::Initial,
            last_size: 0,
            last_packet_destination_address: None,
            last_packet_source_address: None,
            should_last_packet_instigate_acks: false,
            was_last_packet_missing: false,
            current_packet_content: PacketContent::NoFramesReceived,
            is_current_packet_connectivity_probing: false,
            current_effective_peer_migration_type: AddressChangeType::NoChange,

            active_effective_peer_migration_type: AddressChangeType::NoChange,
            highest_packet_sent_before_effective_peer_migration: None,
            received_path_challenge_payloads: Vec::new(),
            transmitted_connectivity_probe_payload: None,

            received_packets: Default::default(),
            ack_policy: AckPolicy::default(),
            largest_seen_packets_with_ack: [None; 3],
            largest_seen_packet_with_stop_waiting: None,
            time_of_last_received_packet: None,
            undecryptable_packets: VecDeque::new(),
            max_undecryptable_packets: Config::default().max_undecryptable_packets,
            coalesced_packets: VecDeque::new(),
            stateless_reset_token: None,

            encryption_level: EncryptionLevel::Initial,
            queued_packets: VecDeque::new(),
            termination_packets: Vec::new(),
            pending_version_negotiation_packet: false,
            flusher_depth: 0,
            pending_retransmission_alarm: false,
            consecutive_packets_with_no_retransmittable_frames: 0,
            supports_release_time: false,
            release_time_into_future: Duration::ZERO,
            mtu_discovery: MtuDiscovery::default(),
            long_term_mtu: DEFAULT_MAX_PACKET_SIZE,

            timers: TimerTable::default(),
            idle_network_timeout: Duration::ZERO,
            handshake_timeout: None,
            idle_timeout_connection_close_behavior: CloseBehavior::SendConnectionClose,
            time_of_first_packet_sent_after_receiving: None,
            close_connection_after_five_rtos: false,
            max_tracked_packets: Config::default().max_tracked_packets,
            ping_timeout: PING_TIMEOUT,
            retransmittable_on_wire_timeout: None,
            fill_up_link_during_probing: false,
            is_path_degrading: false,

            stats: ConnectionStats::new(now),
        };
        let defaults = Config::default();
        this.set_network_timeouts(
            Some(defaults.max_time_before_crypto_handshake),
            defaults.max_idle_time_before_crypto_handshake,
        );
        this
    }

    /// Apply negotiated or local configuration
    ///
    /// Applying the same configuration twice is a no-op.
    pub fn set_from_config(&mut self, config: &Config) {
        if config.negotiated {
            self.set_network_timeouts(None, config.idle_network_timeout);
            if config.silent_close_on_idle_timeout {
                self.idle_timeout_connection_close_behavior = CloseBehavior::SilentClose;
            }
        } else {
            self.set_network_timeouts(
                Some(config.max_time_before_crypto_handshake),
                config.max_idle_time_before_crypto_handshake,
            );
        }

        self.max_undecryptable_packets = config.max_undecryptable_packets;
        self.max_tracked_packets = config.max_tracked_packets;

        if config.has_client_sent_connection_option(MTUH, self.side) {
            let target = self.limited_max_packet_size(MTU_DISCOVERY_TARGET_HIGH);
            self.mtu_discovery.set_target(target);
        }
        if config.has_client_sent_connection_option(MTUL, self.side) {
            let target = self.limited_max_packet_size(MTU_DISCOVERY_TARGET_LOW);
            self.mtu_discovery.set_target(target);
        }

        if config.has_client_sent_connection_option(ACD0, self.side) {
            self.ack_policy.mode = AckMode::TcpAcking;
        }
        if config.has_client_sent_connection_option(ACKD, self.side) {
            self.ack_policy.mode = AckMode::AckDecimation;
        }
        if config.has_client_sent_connection_option(AKD2, self.side) {
            self.ack_policy.mode = AckMode::AckDecimationWithReordering;
        }
        if config.has_client_sent_connection_option(AKD3, self.side) {
            self.ack_policy.mode = AckMode::AckDecimation;
            self.ack_policy.decimation_delay = SHORT_ACK_DECIMATION_DELAY;
        }
        if config.has_client_sent_connection_option(AKD4, self.side) {
            self.ack_policy.mode = AckMode::AckDecimationWithReordering;
            self.ack_policy.decimation_delay = SHORT_ACK_DECIMATION_DELAY;
        }
        if config.has_client_sent_connection_option(AKDU, self.side) {
            self.ack_policy.unlimited_decimation = true;
        }
        if config.has_client_sent_connection_option(ACKQ, self.side) {
            self.ack_policy.fast_ack_after_quiescence = true;
        }
        if config.has_client_sent_connection_option(STMP, self.side) {
            self.ack_policy.save_timestamps = true;
        }
        if config.has_client_sent_connection_option(FIVE_RTO, self.side) {
            self.close_connection_after_five_rtos = true;
        }
        if config.has_client_sent_connection_option(NSTP, self.side) {
            self.no_stop_waiting_frames = true;
        }
        if let Some(token) = config.stateless_reset_token {
            self.stateless_reset_token = Some(token);
        }
        self.retransmittable_on_wire_timeout = config.retransmittable_on_wire_timeout;
        self.fill_up_link_during_probing = config.fill_up_link_during_probing;

        self.supports_release_time = self.writer.supports_release_time()
            && !config.has_client_sent_connection_option(NPCO, self.side);
        if self.supports_release_time {
            self.update_release_time_into_future();
        }
    }

    /// Replay cached network characteristics into the sent-packet manager
    pub fn resume_connection_state(&mut self, cached: &CachedNetworkParameters) {
        self.sent_packet_manager.resume_connection_state(cached);
    }

    //
    // Getters
    //

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn version_negotiation_state(&self) -> VersionNegotiationState {
        self.version_negotiation_state
    }

    /// Versions the server listed in its negotiation packet, if any arrived
    pub fn server_supported_versions(&self) -> &[Version] {
        &self.server_supported_versions
    }

    pub fn server_connection_id(&self) -> ConnectionId {
        self.server_connection_id
    }

    pub fn client_connection_id(&self) -> Option<ConnectionId> {
        self.client_connection_id
    }

    pub fn self_address(&self) -> Option<SocketAddr> {
        self.self_address
    }

    pub fn peer_address(&self) -> SocketAddr {
        self.direct_peer_address
    }

    pub fn effective_peer_address(&self) -> SocketAddr {
        self.effective_peer_address
    }

    pub fn encryption_level(&self) -> EncryptionLevel {
        self.encryption_level
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    /// Why the connection terminated, once it has
    pub fn error(&self) -> Option<&ConnectionError> {
        self.error.as_ref()
    }

    /// Close packets retained for replay to a peer that missed them
    pub fn termination_packets(&self) -> &[Bytes] {
        &self.termination_packets
    }

    pub fn has_queued_packets(&self) -> bool {
        !self.queued_packets.is_empty()
    }

    fn has_queued_data(&self) -> bool {
        self.pending_version_negotiation_packet
            || !self.queued_packets.is_empty()
            || self.generator.has_queued_frames()
    }

    //
    // Datagram intake
    //

    /// Process one demultiplexed datagram
    pub fn process_udp_packet(
        &mut self,
        self_address: SocketAddr,
        peer_address: SocketAddr,
        packet: ReceivedPacket,
    ) {
        if !self.connected {
            return;
        }
        self.stats.packets_received += 1;
        self.stats.bytes_received += packet.data.len() as u64;
        self.last_size = packet.data.len();
        self.last_packet_destination_address = Some(self_address);
        self.last_packet_source_address = Some(peer_address);
        if self.self_address.is_none() {
            self.self_address = Some(self_address);
        }

        let now = self.clock.now();
        let skew = if packet.receipt_time > now {
            packet.receipt_time - now
        } else {
            now - packet.receipt_time
        };
        if skew > RECEIPT_TIME_SANITY_WINDOW {
            warn!(?skew, "packet receipt time far from current time");
        }
        self.time_of_last_received_packet = Some(packet.receipt_time);

        self.with_packet_flusher(|this| {
            this.process_packet_data(&packet, true);

            if this.active_effective_peer_migration_type.is_change() {
                let largest_acked = this.sent_packet_manager.largest_acked_packet(SpaceId::Data);
                let validated = match (
                    largest_acked,
                    this.highest_packet_sent_before_effective_peer_migration,
                ) {
                    (Some(acked), Some(highest)) => acked > highest,
                    (Some(_), None) => true,
                    _ => false,
                };
                if validated && this.side.is_server() {
                    this.on_effective_peer_migration_validated();
                }
            }

            this.maybe_process_coalesced_packets();
            this.maybe_process_undecryptable_packets();
            this.maybe_send_in_response_to_packet();
            this.set_ping_alarm();
        });
        self.last_packet_destination_address = None;
        self.last_packet_source_address = None;
        self.is_current_packet_connectivity_probing = false;
    }

    /// Run one packet's bytes through the framer and dispatch the result
    ///
    /// Returns true if the packet could not be decrypted. When
    /// `queue_undecryptable` is set, such packets are buffered for retry
    /// once further keys arrive.
    fn process_packet_data(&mut self, packet: &ReceivedPacket, queue_undecryptable: bool) -> bool {
        struct Snapshot([Option<u64>; 3]);
        impl LargestReceived for Snapshot {
            fn largest_received(&self, level: EncryptionLevel) -> Option<u64> {
                self.0[level.space() as usize]
            }
        }
        let snapshot = Snapshot([
            self.received_packets[SpaceId::Initial].largest_received(),
            self.received_packets[SpaceId::Handshake].largest_received(),
            self.received_packets[SpaceId::Data].largest_received(),
        ]);

        match self.framer.process_packet(packet, &snapshot) {
            Ok(outcome) => {
                self.dispatch_framer_outcome(packet, outcome);
                false
            }
            Err(FramerError::DecryptionFailure) => {
                self.stats.undecryptable_packets_received += 1;
                if let (Some(seen), Some(expected)) = (
                    self.framer.stateless_reset_token(&packet.data),
                    self.stateless_reset_token,
                ) {
                    if seen == expected {
                        debug!("stateless reset received");
                        self.tear_down(
                            ErrorCode::PublicReset,
                            "stateless reset received",
                            CloseSource::FromPeer,
                            ConnectionError::Reset,
                        );
                        return true;
                    }
                }
                if queue_undecryptable
                    && self.encryption_level != EncryptionLevel::ForwardSecure
                    && self.undecryptable_packets.len() < self.max_undecryptable_packets
                {
                    trace!("queueing undecryptable packet");
                    self.undecryptable_packets.push_back(packet.clone());
                }
                true
            }
            Err(FramerError::Malformed) => {
                trace!("dropping malformed packet");
                self.stats.packets_dropped += 1;
                false
            }
        }
    }

    fn dispatch_framer_outcome(&mut self, packet: &ReceivedPacket, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Packet(decoded) => {
                if let Some(remaining) = decoded.remaining.clone() {
                    trace!("queueing coalesced packet");
                    self.coalesced_packets.push_back(ReceivedPacket {
                        data: remaining,
                        ..packet.clone()
                    });
                }
                self.process_decoded_packet(decoded);
            }
            ProcessOutcome::VersionNegotiation { versions, .. } => {
                self.on_version_negotiation_packet(versions);
            }
            ProcessOutcome::Retry {
                original_cid,
                new_cid,
                token,
            } => {
                self.on_retry_packet(original_cid, new_cid, token);
            }
            ProcessOutcome::VersionMismatch { version } => {
                self.on_protocol_version_mismatch(version);
            }
        }
    }

    fn process_decoded_packet(&mut self, decoded: DecodedPacket) {
        let header = decoded.header.clone();
        let packet_number = header.packet_number;
        let level = decoded.level;
        let space_id = level.space();
        self.last_decrypted_packet_level = level;
        self.on_decrypted_packet(level);

        if !self.process_validated_packet(&header) {
            return;
        }

        // Initialize the per-packet classification state
        self.current_packet_content = PacketContent::NoFramesReceived;
        self.is_current_packet_connectivity_probing = false;
        self.current_effective_peer_migration_type = AddressChangeType::NoChange;
        self.should_last_packet_instigate_acks = false;

        let source = self
            .last_packet_source_address
            .unwrap_or(self.direct_peer_address);
        if self.side.is_client() {
            if self.received_packets[space_id]
                .largest_received()
                .map_or(true, |largest| packet_number > largest)
            {
                self.direct_peer_address = source;
                self.effective_peer_address = source;
            }
        } else {
            // Remember the change type; migration only starts once the
            // packet is known to be largest-received and not a probe.
            self.current_effective_peer_migration_type =
                determine_address_change_type(self.effective_peer_address, source);
            if self.current_effective_peer_migration_type.is_change() {
                debug!(
                    old = %self.effective_peer_address,
                    new = %source,
                    change = ?self.current_effective_peer_migration_type,
                    "effective peer address changed"
                );
            }
        }

        if self.side.is_server() && self.client_connection_id.is_none() {
            self.client_connection_id = header.src_cid;
        }

        self.was_last_packet_missing =
            self.received_packets[space_id].is_missing(packet_number);
        let receipt_time = self
            .time_of_last_received_packet
            .unwrap_or_else(|| self.clock.now());
        self.received_packets[space_id].record_packet_received(
            packet_number,
            receipt_time,
            self.ack_policy.save_timestamps,
        );
        self.last_header = Some(header);

        for frame in decoded.frames {
            if !self.connected {
                break;
            }
            let span = trace_span!("frame", ty = frame.ty());
            let _guard = span.enter();
            if let Err(err) = self.dispatch_frame(frame, packet_number, space_id, receipt_time) {
                self.close_with(err);
                return;
            }
        }

        if self.connected {
            self.stats.packets_processed += 1;
            self.on_packet_complete(packet_number, space_id);
        }
    }

    fn on_decrypted_packet(&mut self, level: EncryptionLevel) {
        // A forward-secure packet proves the peer completed the handshake;
        // initial keys are dead weight from here on.
        if level == EncryptionLevel::ForwardSecure
            && self.side.is_server()
            && !self.sent_packet_manager.handshake_confirmed()
        {
            self.sent_packet_manager.set_handshake_confirmed();
            self.framer.discard_keys_below(EncryptionLevel::Handshake);
            self.sent_packet_manager.neuter_unencrypted_packets();
            self.set_retransmission_alarm();
        }
    }

    /// Address, connection ID and packet number checks that gate all frame
    /// processing
    fn process_validated_packet(&mut self, header: &PacketHeader) -> bool {
        let destination = self.last_packet_destination_address;
        if let (true, Some(current), Some(new)) =
            (self.side.is_server(), self.self_address, destination)
        {
            if current != new && !addresses_equivalent(current, new) {
                if !self.visitor.allow_self_address_change() {
                    self.close_connection(
                        ErrorCode::ErrorMigratingAddress,
                        "self address migration is not supported at the server",
                        CloseBehavior::SendConnectionClose,
                    );
                    return false;
                }
            }
            self.self_address = destination;
        }

        if self.side.is_client()
            && header.can_replace_server_cid()
            && header.src_cid != Some(self.server_connection_id)
        {
            let new_cid = header.src_cid.unwrap();
            debug!(old = %self.server_connection_id, new = %new_cid, "replacing server connection id");
            self.server_connection_id = new_cid;
            self.generator.set_server_connection_id(new_cid);
        }

        if !self.validate_received_packet_number(header.packet_number) {
            return false;
        }

        if self.version_negotiation_state != VersionNegotiationState::NegotiatedVersion
            && self.side.is_client()
        {
            // Any processable packet from the server proves it accepted our
            // version.
            self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
            self.visitor.on_successful_version_negotiation(self.version);
        }

        if self.last_size as u64 > self.stats.largest_received_packet_size {
            self.stats.largest_received_packet_size = self.last_size as u64;
        }
        if self.side.is_server()
            && self.encryption_level == EncryptionLevel::Initial
            && self.last_size > usize::from(self.generator.current_max_packet_length())
        {
            self.set_max_packet_length(self.last_size as u16);
        }
        true
    }

    fn validate_received_packet_number(&mut self, packet_number: u64) -> bool {
        let space = &self.received_packets[self.last_decrypted_packet_level.space()];
        if !space.is_awaiting(packet_number) {
            trace!(packet_number, "packet no longer awaited, discarding");
            self.stats.packets_dropped += 1;
            return false;
        }
        let out_of_bound = match space.largest_received() {
            Some(largest) => {
                let delta = largest.abs_diff(packet_number);
                delta > MAX_PACKET_GAP
            }
            None => packet_number == 0 || packet_number > MAX_RANDOM_INITIAL_PACKET_NUMBER,
        };
        if out_of_bound {
            debug!(packet_number, "packet number out of bounds, closing");
            self.close_connection(
                ErrorCode::InvalidPacketHeader,
                "packet number out of bounds",
                CloseBehavior::SendConnectionClose,
            );
            return false;
        }
        true
    }

    //
    // Frame dispatch
    //

    fn dispatch_frame(
        &mut self,
        frame: Frame,
        packet_number: u64,
        space_id: SpaceId,
        receipt_time: Instant,
    ) -> Result<(), TransportError> {
        trace!("got frame {:?}", frame);
        if frame.instigates_ack() {
            self.should_last_packet_instigate_acks = true;
        }
        match frame {
            Frame::Padding => {
                self.update_packet_content(PacketContent::SecondFrameIsPadding);
            }
            Frame::Ping => {
                self.update_packet_content(PacketContent::FirstFrameIsPing);
            }
            Frame::Stream(frame) => {
                self.update_packet_content(PacketContent::NotPaddedPing);
                self.on_stream_frame(frame)?;
            }
            Frame::Ack(ack) => {
                self.update_packet_content(PacketContent::NotPaddedPing);
                self.on_ack_frame(&ack, packet_number, space_id, receipt_time)?;
            }
            Frame::StopWaiting { least_unacked } => {
                self.update_packet_content(PacketContent::NotPaddedPing);
                self.on_stop_waiting_frame(least_unacked, packet_number, space_id)?;
            }
            Frame::Close(frame) => {
                debug!(code = %frame.code, reason = %frame.reason, "peer closed connection");
                self.tear_down(
                    frame.code,
                    "peer sent CONNECTION_CLOSE",
                    CloseSource::FromPeer,
                    ConnectionError::ClosedByPeer { code: frame.code },
                );
            }
            Frame::PathChallenge(payload) => {
                // A padded PATH_CHALLENGE is a connectivity probe, same as a
                // padded PING.
                self.received_path_challenge_payloads.push(payload);
                self.update_packet_content(PacketContent::FirstFrameIsPing);
            }
            Frame::PathResponse(payload) => {
                self.update_packet_content(PacketContent::NotPaddedPing);
                if self.transmitted_connectivity_probe_payload == Some(payload) {
                    trace!("path validated");
                    self.transmitted_connectivity_probe_payload = None;
                } else {
                    debug!("ignoring unexpected PATH_RESPONSE");
                }
            }
            frame @ (Frame::GoAway { .. }
            | Frame::WindowUpdate { .. }
            | Frame::Blocked { .. }
            | Frame::RstStream { .. }
            | Frame::StopSending { .. }
            | Frame::MaxStreams { .. }
            | Frame::StreamsBlocked { .. }
            | Frame::NewConnectionId { .. }
            | Frame::RetireConnectionId { .. }
            | Frame::NewToken { .. }
            | Frame::Message { .. }) => {
                self.update_packet_content(PacketContent::NotPaddedPing);
                self.visitor.on_control_frame(&frame);
            }
        }
        Ok(())
    }

    fn on_stream_frame(&mut self, frame: StreamFrame) -> Result<(), TransportError> {
        if !frame.is_crypto_stream()
            && self.last_decrypted_packet_level == EncryptionLevel::Initial
        {
            if self.maybe_consider_as_memory_corruption(&frame) {
                return Err(TransportError::new(
                    ErrorCode::MaybeCorruptedMemory,
                    "received crypto frame on non crypto stream",
                ));
            }
            warn!(
                stream_id = frame.stream_id,
                "received unencrypted data frame, closing"
            );
            return Err(TransportError::new(
                ErrorCode::UnencryptedStreamData,
                "unencrypted stream data seen",
            ));
        }
        self.stats.stream_bytes_received += frame.data.len() as u64;
        self.visitor.on_stream_frame(&frame);
        Ok(())
    }

    /// Stream frames at the initial level whose payload starts with a
    /// handshake tag are more plausibly a corrupted buffer than an attack.
    fn maybe_consider_as_memory_corruption(&self, frame: &StreamFrame) -> bool {
        if frame.is_crypto_stream()
            || self.last_decrypted_packet_level != EncryptionLevel::Initial
        {
            return false;
        }
        let tag: &[u8] = match self.side {
            Side::Server => TAG_CHLO,
            Side::Client => TAG_REJ,
        };
        frame.data.len() >= tag.len() && &frame.data[..tag.len()] == tag
    }

    fn on_ack_frame(
        &mut self,
        ack: &AckFrame,
        packet_number: u64,
        space_id: SpaceId,
        receipt_time: Instant,
    ) -> Result<(), TransportError> {
        if let Some(largest_seen) = self.largest_seen_packets_with_ack[space_id as usize] {
            if packet_number <= largest_seen {
                trace!("received an old ack frame, ignoring");
                return Ok(());
            }
        }

        let largest_sent = self.sent_packet_manager.largest_sent_packet(space_id);
        if largest_sent.map_or(true, |sent| ack.largest_acked > sent) {
            warn!(
                largest_acked = ack.largest_acked,
                ?largest_sent,
                "peer acked unsent packet"
            );
            return Err(TransportError::new(
                ErrorCode::InvalidAckData,
                "largest observed too high",
            ));
        }
        let largest_acked_before = self.sent_packet_manager.largest_acked_packet(space_id);
        match largest_acked_before {
            Some(prev) if ack.largest_acked < prev => {
                if !self.sent_packet_manager.tolerate_reneging() {
                    return Err(TransportError::new(
                        ErrorCode::InvalidAckData,
                        "largest observed too low",
                    ));
                }
            }
            Some(prev) if ack.largest_acked == prev => {}
            _ => self.visitor.on_forward_progress_confirmed(),
        }

        self.sent_packet_manager
            .on_ack_frame_start(ack.largest_acked, ack.ack_delay, receipt_time);
        for range in &ack.ranges {
            self.sent_packet_manager.on_ack_range(range.start, range.end);
        }
        for &(pn, timestamp) in &ack.timestamps {
            self.sent_packet_manager.on_ack_timestamp(pn, timestamp);
        }
        let result = self
            .sent_packet_manager
            .on_ack_frame_end(receipt_time, self.last_decrypted_packet_level);
        let newly_acked = match result {
            AckResult::PacketsNewlyAcked => true,
            AckResult::NoPacketsNewlyAcked => false,
            AckResult::UnsentPacketsAcked => {
                return Err(TransportError::new(
                    ErrorCode::InvalidAckData,
                    "ack acknowledged packets in the wrong space",
                ));
            }
        };

        // New acks likely changed the congestion window and pacing rate;
        // make the send gate recompute.
        self.timers.cancel(Timer::Send);
        if self.supports_release_time {
            self.update_release_time_into_future();
        }
        self.largest_seen_packets_with_ack[space_id as usize] = Some(packet_number);

        if let Some(floor) = self
            .sent_packet_manager
            .largest_packet_peer_knows_is_acked(space_id)
        {
            self.received_packets[space_id].dont_wait_for_packets_before(floor);
        }
        // An ack gives a fresh rtt sample; the recovery deadline moved.
        self.set_retransmission_alarm();
        self.maybe_set_path_degrading_alarm(newly_acked);
        Ok(())
    }

    fn on_stop_waiting_frame(
        &mut self,
        least_unacked: u64,
        packet_number: u64,
        space_id: SpaceId,
    ) -> Result<(), TransportError> {
        if self.no_stop_waiting_frames {
            return Ok(());
        }
        if let Some(largest_seen) = self.largest_seen_packet_with_stop_waiting {
            if packet_number <= largest_seen {
                trace!("received an old stop waiting frame, ignoring");
                return Ok(());
            }
        }
        if least_unacked > packet_number {
            return Err(TransportError::new(
                ErrorCode::InvalidStopWaitingData,
                "least unacked too large",
            ));
        }
        if let Some(peer_least) = self.received_packets[space_id].peer_least_packet_awaiting_ack()
        {
            if least_unacked < peer_least {
                return Err(TransportError::new(
                    ErrorCode::InvalidStopWaitingData,
                    "least unacked too small",
                ));
            }
        }
        self.largest_seen_packet_with_stop_waiting = Some(packet_number);
        self.received_packets[space_id].dont_wait_for_packets_before(least_unacked);
        Ok(())
    }

    fn update_packet_content(&mut self, content: PacketContent) {
        if self.current_packet_content == PacketContent::NotPaddedPing {
            // Already known not to be a probe; any migration already started.
            return;
        }
        if content == PacketContent::FirstFrameIsPing
            && self.current_packet_content == PacketContent::NoFramesReceived
        {
            self.current_packet_content = PacketContent::FirstFrameIsPing;
            return;
        }
        if content == PacketContent::SecondFrameIsPadding
            && self.current_packet_content == PacketContent::FirstFrameIsPing
        {
            self.current_packet_content = PacketContent::SecondFrameIsPadding;
            if self.side.is_server() {
                self.is_current_packet_connectivity_probing =
                    self.current_effective_peer_migration_type.is_change();
            } else {
                self.is_current_packet_connectivity_probing = self
                    .last_packet_source_address
                    .map_or(false, |src| src != self.direct_peer_address)
                    || self
                        .last_packet_destination_address
                        .zip(self.self_address)
                        .map_or(false, |(dst, own)| dst != own);
            }
            return;
        }

        self.current_packet_content = PacketContent::NotPaddedPing;
        let (Some(header), Some(source)) = (
            self.last_header.as_ref(),
            self.last_packet_source_address,
        ) else {
            return;
        };
        let packet_number = header.packet_number;
        let space_id = self.last_decrypted_packet_level.space();
        if self.received_packets[space_id].largest_received() == Some(packet_number) {
            self.direct_peer_address = source;
            if self.current_effective_peer_migration_type.is_change() {
                // The packet is confirmed not to be a connectivity probe;
                // migrate now rather than waiting for packet completion.
                let change = self.current_effective_peer_migration_type;
                self.start_effective_peer_migration(change);
            }
        }
        self.current_effective_peer_migration_type = AddressChangeType::NoChange;
    }

    fn on_packet_complete(&mut self, packet_number: u64, space_id: SpaceId) {
        if self.is_current_packet_connectivity_probing {
            self.stats.num_connectivity_probing_received += 1;
        }
        let source = self
            .last_packet_source_address
            .unwrap_or(self.direct_peer_address);
        let destination = self
            .last_packet_destination_address
            .or(self.self_address)
            .unwrap_or(source);

        if self.side.is_client() {
            self.visitor
                .on_connectivity_probe_received(destination, source);
        } else if self.is_current_packet_connectivity_probing {
            self.visitor
                .on_connectivity_probe_received(destination, source);
            self.send_connectivity_probe_response(true);
        } else {
            // A PATH_CHALLENGE may ride in an ordinary packet; it still
            // deserves a response, unpadded.
            if self.version.has_ietf_invariant_header()
                && !self.received_path_challenge_payloads.is_empty()
            {
                self.send_connectivity_probe_response(false);
            }
            if self.received_packets[space_id].largest_received() == Some(packet_number) {
                self.direct_peer_address = source;
                if self.current_effective_peer_migration_type.is_change() {
                    let change = self.current_effective_peer_migration_type;
                    self.start_effective_peer_migration(change);
                }
            }
        }
        self.current_effective_peer_migration_type = AddressChangeType::NoChange;

        let was_missing =
            self.should_last_packet_instigate_acks && self.was_last_packet_missing;
        // Spaces whose ack level has no keys yet (0-RTT before 1-RTT keys)
        // cannot schedule acks; their timeout stays unset.
        if self.framer.has_keys(space_id.ack_level()) {
            let largest_sent_largest_acked = self
                .sent_packet_manager
                .largest_sent_largest_acked(space_id);
            let rtt = self.sent_packet_manager.rtt_stats();
            let delayed_ack_time = self.sent_packet_manager.delayed_ack_time();
            let receipt_time = self
                .time_of_last_received_packet
                .unwrap_or_else(|| self.clock.now());
            let now = self.clock.now();
            let policy = self.ack_policy.clone();
            self.received_packets[space_id].maybe_update_ack_timeout(
                self.should_last_packet_instigate_acks,
                packet_number,
                was_missing,
                largest_sent_largest_acked,
                receipt_time,
                now,
                &rtt,
                delayed_ack_time,
                &policy,
            );
        } else {
            debug!(space = ?space_id, "not updating ack timeout without keys");
        }

        self.should_last_packet_instigate_acks = false;
        self.was_last_packet_missing = false;
        self.received_path_challenge_payloads.clear();
        self.last_header = None;

        if self.sent_packet_manager.unacked_packet_count() > self.max_tracked_packets {
            self.close_connection(
                ErrorCode::TooManyOutstandingSentPackets,
                "more outstanding packets than the limit",
                CloseBehavior::SendConnectionClose,
            );
        }
    }

    //
    // Version negotiation and retry
    //

    /// The framer saw a long-header packet carrying an unnegotiated version
    fn on_protocol_version_mismatch(&mut self, received: Version) {
        debug!(%received, "received packet with mismatched version");
        if self.side.is_client() {
            // Servers do not change versions mid-flight; this datagram was
            // either corrupted or hostile.
            error!("client received mismatched version packet");
            self.close_connection(
                ErrorCode::InternalError,
                "protocol version mismatch at client",
                CloseBehavior::SilentClose,
            );
            return;
        }

        let supported = self.supported_versions.contains(&received);
        match self.version_negotiation_state {
            VersionNegotiationState::StartNegotiation => {
                if !supported {
                    self.send_version_negotiation_packet();
                    self.version_negotiation_state =
                        VersionNegotiationState::NegotiationInProgress;
                    return;
                }
                self.accept_negotiated_version(received);
                self.version_negotiation_state = VersionNegotiationState::NegotiatedVersion;
            }
            VersionNegotiationState::NegotiationInProgress => {
                if !supported {
                    self.send_version_negotiation_packet();
                    return;
                }
                self.accept_negotiated_version(received);
            }
            VersionNegotiationState::NegotiatedVersion => {
                // Stale packets from before negotiation finished.
                trace!("dropping pre-negotiation packet");
            }
        }
    }

    fn accept_negotiated_version(&mut self, version: Version) {
        debug!(%version, "version negotiated");
        self.version = version;
        self.framer.set_version(version);
        self.generator.set_version(version);
        self.no_stop_waiting_frames = version.has_ietf_invariant_header();
        self.visitor.on_successful_version_negotiation(version);
    }

    /// A version negotiation packet arrived (client only)
    fn on_version_negotiation_packet(&mut self, versions: Vec<Version>) {
        if self.side.is_server() {
            error!("server received version negotiation packet");
            self.close_connection(
                ErrorCode::InternalError,
                "server received version negotiation packet",
                CloseBehavior::SilentClose,
            );
            return;
        }
        if self.version_negotiation_state != VersionNegotiationState::StartNegotiation {
            // Possibly a duplicate.
            return;
        }
        if versions.contains(&self.version) {
            warn!(
                "peer listed our version in a version negotiation packet; \
                 it should have accepted the connection"
            );
            self.close_connection(
                ErrorCode::InvalidVersionNegotiationPacket,
                "server already supports our version",
                CloseBehavior::SilentClose,
            );
            return;
        }
        self.server_supported_versions = versions.clone();

        let original = self.version;
        let Some(selected) = select_mutual_version(&self.supported_versions, &versions) else {
            self.close_connection(
                ErrorCode::InvalidVersion,
                "no common version found",
                CloseBehavior::SendConnectionClose,
            );
            return;
        };
        if selected.protocol != original.protocol {
            self.close_connection(
                ErrorCode::InvalidVersion,
                "version negotiation between mismatched handshake protocols",
                CloseBehavior::SilentClose,
            );
            return;
        }
        debug!(version = %selected, "negotiated version");
        self.version = selected;
        self.framer.set_version(selected);
        self.generator.set_version(selected);
        self.no_stop_waiting_frames = selected.has_ietf_invariant_header();
        self.version_negotiation_state = VersionNegotiationState::NegotiationInProgress;

        // Everything in flight was serialized under the old version.
        self.sent_packet_manager
            .retransmit_unacked_packets(RetransmissionReason::VersionChange);
    }

    /// A retry packet arrived (client only); at most one is honored
    fn on_retry_packet(&mut self, original_cid: ConnectionId, new_cid: ConnectionId, token: Bytes) {
        debug_assert!(self.side.is_client());
        if original_cid != self.server_connection_id {
            debug!(
                %original_cid,
                expected = %self.server_connection_id,
                "ignoring retry with non-matching original connection id"
            );
            return;
        }
        if self.retry_has_been_parsed {
            debug!("ignoring non-first retry");
            return;
        }
        self.retry_has_been_parsed = true;
        debug!(old = %self.server_connection_id, new = %new_cid, "received retry");
        self.server_connection_id = new_cid;
        self.generator.set_server_connection_id(new_cid);
        self.generator.set_retry_token(token);
        // Initial keys are bound to the destination connection id.
        self.framer.install_initial_keys(&new_cid);
    }

    fn send_version_negotiation_packet(&mut self) {
        self.pending_version_negotiation_packet = true;
        if self.handle_write_blocked() {
            return;
        }
        trace!("sending version negotiation packet");
        let buf = self
            .generator
            .serialize_version_negotiation(&self.supported_versions);
        let result = self.write_raw(&buf);
        if result.status.is_blocked() {
            self.visitor.on_write_blocked();
            if result.status == WriteStatus::Blocked {
                return;
            }
        }
        self.pending_version_negotiation_packet = false;
    }

    //
    // Migration
    //

    fn start_effective_peer_migration(&mut self, change: AddressChangeType) {
        if !change.is_change() {
            error!("effective peer migration started without address change");
            return;
        }
        let new_address = self
            .last_packet_source_address
            .unwrap_or(self.direct_peer_address);
        debug!(
            old = %self.effective_peer_address,
            new = %new_address,
            ?change,
            "migrating connection"
        );
        self.highest_packet_sent_before_effective_peer_migration =
            self.sent_packet_manager.largest_sent_packet(SpaceId::Data);
        self.effective_peer_address = new_address;
        self.active_effective_peer_migration_type = change;

        self.visitor.on_connection_migration(change);
        self.sent_packet_manager.on_connection_migration(change);
    }

    fn on_effective_peer_migration_validated(&mut self) {
        if !self.active_effective_peer_migration_type.is_change() {
            error!("no migration underway");
            return;
        }
        self.highest_packet_sent_before_effective_peer_migration = None;
        self.active_effective_peer_migration_type = AddressChangeType::NoChange;
    }

    /// Send a connectivity probe to validate the current path (client) or an
    /// alternative path
    pub fn send_connectivity_probe(&mut self) -> bool {
        if !self.connected {
            error!("not sending connectivity probe on disconnected connection");
            return false;
        }
        if self.handle_write_blocked() {
            return true;
        }
        let probe = if self.version.has_ietf_invariant_header() {
            let payload: [u8; 8] = self.rng.gen();
            self.transmitted_connectivity_probe_payload = Some(payload);
            ProbePacket::PathChallenge(payload)
        } else {
            ProbePacket::PaddedPing
        };
        self.write_probe_packet(probe, self.direct_peer_address)
    }

    fn send_connectivity_probe_response(&mut self, padded: bool) {
        if self.handle_write_blocked() {
            return;
        }
        let probe = if self.version.has_ietf_invariant_header() {
            let payloads = std::mem::take(&mut self.received_path_challenge_payloads);
            if payloads.is_empty() {
                return;
            }
            ProbePacket::PathResponse { payloads, padded }
        } else {
            ProbePacket::PaddedPing
        };
        // Answer toward whoever probed, which may not be the active path.
        let peer = self
            .last_packet_source_address
            .unwrap_or(self.direct_peer_address);
        self.write_probe_packet(probe, peer);
    }

    /// Probes bypass the queue: they validate a path, not deliver data, and
    /// a stale probe is worthless.
    fn write_probe_packet(&mut self, probe: ProbePacket, peer: SocketAddr) -> bool {
        let Some(packet) = self.generator.serialize_probe(probe) else {
            self.transmitted_connectivity_probe_payload = None;
            return false;
        };
        let send_time = self.clock.now();
        let mut result = self.write_raw_to(&packet.buffer, peer);
        if self.writer.is_batch_mode()
            && result.status == WriteStatus::Ok
            && result.bytes_written == 0
        {
            result = self.writer.flush();
        }
        if result.status.is_error() {
            // A failed probe must not take down the path in active use.
            debug!("probe write failed");
            return false;
        }
        self.sent_packet_manager.on_packet_sent(
            &packet,
            None,
            send_time,
            TransmissionType::NotRetransmission,
            false,
        );
        if result.status.is_blocked() {
            self.visitor.on_write_blocked();
        }
        true
    }

    //
    // Send path
    //

    /// Whether a packet with (or without) retransmittable data may be sent
    /// right now
    fn can_write(&mut self, has_retransmittable: bool) -> bool {
        if !self.connected {
            return false;
        }
        if self.sent_packet_manager.pending_timer_transmission_count() > 0 {
            // Probe and loss transmissions bypass pacing.
            return true;
        }
        if self.handle_write_blocked() {
            return false;
        }
        if !has_retransmittable {
            return true;
        }
        if self.timers.is_set(Timer::Send) {
            return false;
        }
        let now = self.clock.now();
        let Some(delay) = self.sent_packet_manager.time_until_send(now) else {
            self.timers.cancel(Timer::Send);
            return false;
        };
        if delay.is_zero() {
            return true;
        }
        if delay <= self.release_time_into_future {
            // Within the pace-into-future window; the kernel will hold it.
            return true;
        }
        self.timers
            .update(Timer::Send, now + delay, TIMER_GRANULARITY);
        trace!(?delay, "delaying send");
        false
    }

    fn handle_write_blocked(&mut self) -> bool {
        if !self.writer.is_write_blocked() {
            return false;
        }
        self.visitor.on_write_blocked();
        true
    }

    /// Queue the packet if anything is already queued, preserving packet
    /// number order; otherwise write it now
    fn send_or_queue_packet(&mut self, packet: SerializedPacket) {
        if packet.buffer.is_empty() {
            error!("empty buffer handed to send_or_queue_packet");
            return;
        }
        if packet.retransmittable_frames.is_empty() {
            self.consecutive_packets_with_no_retransmittable_frames += 1;
        } else {
            self.consecutive_packets_with_no_retransmittable_frames = 0;
        }
        if !self.queued_packets.is_empty() || !self.write_packet(&packet) {
            self.queued_packets.push_back(packet);
        }
    }

    fn write_queued_packets(&mut self) {
        debug_assert!(!self.writer.is_write_blocked());
        if self.pending_version_negotiation_packet {
            self.send_version_negotiation_packet();
        }
        while let Some(packet) = self.queued_packets.pop_front() {
            let written = self.write_packet(&packet);
            if self.connected && !written {
                // Still blocked; retry later from the head.
                self.queued_packets.push_front(packet);
                break;
            }
            if !self.connected {
                debug_assert!(
                    self.queued_packets.is_empty(),
                    "queued packets should have been cleared while closing"
                );
                break;
            }
        }
    }

    /// Write one serialized packet
    ///
    /// Returns false only if the caller should keep the packet queued for a
    /// later attempt.
    fn write_packet(&mut self, packet: &SerializedPacket) -> bool {
        if self.should_discard_packet(packet) {
            self.stats.packets_discarded += 1;
            return true;
        }
        if let Some(largest_sent) = self
            .sent_packet_manager
            .largest_sent_packet(packet.space())
        {
            if packet.packet_number < largest_sent {
                error!(
                    packet_number = packet.packet_number,
                    largest_sent, "attempt to write packet out of order"
                );
                self.close_connection(
                    ErrorCode::InternalError,
                    "packet written out of order",
                    CloseBehavior::SilentClose,
                );
                return true;
            }
        }

        let is_termination_packet = packet.is_termination_packet();
        if self.handle_write_blocked() && !is_termination_packet {
            return false;
        }
        if is_termination_packet {
            // The time-wait machinery replays these to late peer packets.
            self.termination_packets.push(packet.buffer.clone());
            if self.handle_write_blocked() {
                return true;
            }
        }

        // Take the send time before the syscall so a stall inside it cannot
        // deflate the rtt sample.
        let mut packet_send_time = self.clock.now();
        let mut options = PacketOptions::default();
        if self.supports_release_time {
            let mut delay = Duration::ZERO;
            if let Some(release) = self.sent_packet_manager.next_release_time() {
                if release > packet_send_time {
                    delay = release - packet_send_time;
                    packet_send_time = release;
                }
            }
            options.release_time_delay = Some(delay);
        }
        trace!(
            packet_number = packet.packet_number,
            level = %packet.encryption_level,
            len = packet.buffer.len(),
            "sending packet"
        );
        let self_ip = self
            .self_address
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        let result = self.writer.write_packet(
            &packet.buffer,
            self_ip,
            self.direct_peer_address,
            &options,
        );

        if result.status.is_blocked() {
            debug_assert!(self.writer.is_write_blocked());
            self.visitor.on_write_blocked();
            // A buffering writer owns the bytes now; only a dropping writer
            // needs the packet queued.
            if result.status == WriteStatus::Blocked {
                return false;
            }
        }

        let has_retransmittable = packet.has_retransmittable_frames();
        if result.status == WriteStatus::MsgTooBig {
            if !has_retransmittable && packet.buffer.len() > usize::from(self.long_term_mtu) {
                // An oversized probe bounced; the path will never carry the
                // target size.
                debug!("mtu probe rejected by socket, disabling discovery");
                self.mtu_discovery.disable();
                self.timers.cancel(Timer::MtuDiscovery);
                return true;
            }
            self.close_connection(
                ErrorCode::MsgTooBig,
                "datagram too big for path",
                CloseBehavior::SendConnectionClose,
            );
            return false;
        }
        if let WriteStatus::Error(code) = result.status {
            error!(code, len = packet.buffer.len(), "packet write failed");
            self.close_connection(
                ErrorCode::PacketWriteError,
                "packet write error",
                CloseBehavior::SilentClose,
            );
            return false;
        }

        if has_retransmittable {
            if !self.is_path_degrading && !self.timers.is_set(Timer::PathDegrading) {
                // First retransmittable packet on the working path.
                self.set_path_degrading_alarm();
            }
            // Track only the first retransmittable packet after a receive;
            // updating every send would let a black hole defeat the idle
            // timeout.
            if self.time_of_first_packet_sent_after_receiving
                < self.time_of_last_received_packet
            {
                self.time_of_first_packet_sent_after_receiving = Some(packet_send_time);
            }
        }

        self.maybe_set_mtu_alarm(packet.packet_number);

        let rearm = self.sent_packet_manager.on_packet_sent(
            packet,
            packet.original_packet_number,
            packet_send_time,
            packet.transmission_type,
            has_retransmittable,
        );
        if rearm || !self.timers.is_set(Timer::Retransmission) {
            self.set_retransmission_alarm();
        }
        self.set_ping_alarm();

        // Must come after the manager records the send; least-unacked may
        // have moved.
        let max_in_flight = self
            .sent_packet_manager
            .estimate_max_packets_in_flight(self.generator.current_max_packet_length());
        self.generator
            .update_packet_number_length(self.sent_packet_manager.least_unacked(), max_in_flight);

        self.stats.packets_sent += 1;
        self.stats.bytes_sent += result.bytes_written as u64;
        if packet.transmission_type != TransmissionType::NotRetransmission {
            self.stats.packets_retransmitted += 1;
            self.stats.bytes_retransmitted += result.bytes_written as u64;
        }
        true
    }

    fn should_discard_packet(&self, packet: &SerializedPacket) -> bool {
        if !self.connected {
            return true;
        }
        // Initial packets are useless once the connection is forward secure.
        packet.encryption_level == EncryptionLevel::Initial
            && self.encryption_level == EncryptionLevel::ForwardSecure
    }

    fn write_raw(&mut self, buf: &[u8]) -> crate::io::WriteResult {
        self.write_raw_to(buf, self.direct_peer_address)
    }

    fn write_raw_to(&mut self, buf: &[u8], peer: SocketAddr) -> crate::io::WriteResult {
        let self_ip = self
            .self_address
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        self.writer
            .write_packet(buf, self_ip, peer, &PacketOptions::default())
    }

    fn flush_generator(&mut self) {
        let packets = self.generator.flush();
        for packet in packets {
            self.send_or_queue_packet(packet);
        }
    }

    fn flush_packets(&mut self) {
        if !self.connected || !self.writer.is_batch_mode() {
            return;
        }
        if self.handle_write_blocked() {
            debug!("flush called while blocked");
            return;
        }
        let result = self.writer.flush();
        if result.status.is_blocked() {
            self.visitor.on_write_blocked();
        }
        if let WriteStatus::Error(code) = result.status {
            error!(code, "batch flush failed");
            self.close_connection(
                ErrorCode::PacketWriteError,
                "packet write error",
                CloseBehavior::SilentClose,
            );
        }
    }

    /// The reactor reports the previously blocked writer is writable again
    pub fn on_blocked_writer_can_write(&mut self) {
        self.writer.set_writable();
        self.on_can_write();
    }

    /// Drain queued work now that writing is possible
    pub fn on_can_write(&mut self) {
        if !self.connected {
            return;
        }
        debug_assert!(!self.writer.is_write_blocked());
        self.with_packet_flusher(|this| {
            this.write_queued_packets();
            // An ack may have been due while we were blocked.
            let now = this.clock.now();
            if this
                .earliest_ack_timeout()
                .map_or(false, |deadline| deadline <= now)
            {
                this.send_all_pending_acks();
            }
            this.write_new_data();
        });
    }

    fn write_new_data(&mut self) {
        if !self.can_write(true) {
            return;
        }
        self.with_packet_flusher(|this| {
            this.visitor.on_can_write();
        });
        // The session may not have written everything it wanted; resume
        // after other connections get a turn.
        if self.visitor.willing_and_able_to_write()
            && !self.timers.is_set(Timer::Send)
            && self.can_write(true)
        {
            let now = self.clock.now();
            self.timers.set(Timer::Send, now);
        }
    }

    fn write_if_not_blocked(&mut self) {
        if !self.handle_write_blocked() {
            self.on_can_write();
        }
    }

    fn maybe_send_in_response_to_packet(&mut self) {
        if !self.connected {
            return;
        }
        self.write_if_not_blocked();
    }

    /// Queue a retransmittable control frame for the next flush
    pub fn send_control_frame(&mut self, frame: Frame) -> bool {
        if !self.connected {
            debug!("not sending control frame on disconnected connection");
            return false;
        }
        if self.flusher_depth == 0 && !self.can_write(true) {
            return false;
        }
        self.with_packet_flusher(|this| {
            this.generator.queue_control_frame(frame);
        });
        true
    }

    /// Mark subsequent generator output as a retransmission
    pub fn set_transmission_type(&mut self, ty: TransmissionType) {
        self.generator.set_transmission_type(ty);
    }

    //
    // Acks
    //

    fn earliest_ack_timeout(&self) -> Option<Instant> {
        SpaceId::iter()
            .filter_map(|space| self.received_packets[space].ack_timeout())
            .min()
    }

    fn maybe_set_ack_alarm_to(&mut self, deadline: Instant) {
        if self
            .timers
            .get(Timer::Ack)
            .map_or(true, |existing| existing > deadline)
        {
            self.timers.set(Timer::Ack, deadline);
        }
    }

    /// Flush due acks for every packet number space, oldest space first,
    /// switching the encryption level to match each space
    fn send_all_pending_acks(&mut self) {
        trace!("sending all pending acks");
        let now = self.clock.now();
        let restore_level = self.encryption_level;
        for space_id in SpaceId::iter() {
            let Some(deadline) = self.received_packets[space_id].ack_timeout() else {
                continue;
            };
            if deadline > now {
                continue;
            }
            if !self.framer.has_keys(space_id.ack_level()) {
                error!(space = ?space_id, "cannot ack space without keys");
                continue;
            }
            if !self.can_write(false) {
                // Write blocked: the unblock path re-enters here.
                break;
            }
            let Some(ack) = self.received_packets[space_id].updated_ack_frame(now) else {
                continue;
            };
            trace!(space = ?space_id, largest = ack.largest_acked, "flushing ack");
            self.set_default_encryption_level(space_id.ack_level());
            match self.generator.flush_ack_frame(ack) {
                Some(packet) => {
                    self.send_or_queue_packet(packet);
                    self.received_packets[space_id].on_ack_sent();
                    self.timers.cancel(Timer::Ack);
                }
                None => break,
            }
        }
        self.set_default_encryption_level(restore_level);

        if let Some(deadline) = self.earliest_ack_timeout() {
            // Some spaces still owe an ack.
            self.timers.set(Timer::Ack, deadline);
        }

        // Periodically make sure something retransmittable is on the wire,
        // so pure-ack flows still detect a dead peer.
        if self.encryption_level != EncryptionLevel::ForwardSecure
            || self.consecutive_packets_with_no_retransmittable_frames
                < MAX_CONSECUTIVE_NON_RETRANSMITTABLE_PACKETS
        {
            return;
        }
        self.consecutive_packets_with_no_retransmittable_frames = 0;
        if self.generator.has_retransmittable_frames() || self.visitor.willing_and_able_to_write()
        {
            return;
        }
        self.visitor.on_ack_needs_retransmittable_frame();
    }

    //
    // Scoped flusher
    //

    /// Run `f` inside a packet flusher scope
    ///
    /// Scopes nest; generator flushes and deferred alarm arming happen when
    /// the outermost scope exits. Within a scope,
    /// [`set_retransmission_alarm`](Self::set_retransmission_alarm) only
    /// records that a re-arm is wanted.
    fn with_packet_flusher<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.flusher_depth += 1;
        let result = f(self);
        if self.flusher_depth > 1 {
            self.flusher_depth -= 1;
            return result;
        }
        // Outermost exit: the batch commits. The depth stays nonzero while
        // the exit work runs so any re-entered send path keeps deferring the
        // retransmission alarm.
        if self.connected {
            self.on_outermost_flusher_exit();
        }
        self.flusher_depth = 0;
        if self.pending_retransmission_alarm {
            self.pending_retransmission_alarm = false;
            if self.connected {
                self.arm_retransmission_alarm();
            }
        }
        result
    }

    fn on_outermost_flusher_exit(&mut self) {
        let now = self.clock.now();
        if let Some(ack_timeout) = self.earliest_ack_timeout() {
            if ack_timeout <= now && !self.can_write(false) {
                // Blocked; the ack goes out when the writer unblocks.
                self.timers.cancel(Timer::Ack);
            } else {
                self.maybe_set_ack_alarm_to(ack_timeout);
            }
        }
        if self.timers.is_expired(Timer::Ack, now) {
            // The ack did not get bundled with data this batch.
            if self.timers.is_expired(Timer::Send, now) {
                // The imminent send will carry it instead.
                self.timers.cancel(Timer::Ack);
            } else {
                self.send_all_pending_acks();
            }
        }

        self.flush_generator();
        self.flush_packets();
        self.generator
            .set_transmission_type(TransmissionType::NotRetransmission);
        self.check_if_application_limited();
    }

    fn check_if_application_limited(&mut self) {
        let application_limited = self.queued_packets.is_empty()
            && !self.sent_packet_manager.has_pending_retransmissions()
            && !self.visitor.willing_and_able_to_write();
        if !application_limited {
            return;
        }
        if self.fill_up_link_during_probing
            && self.sent_packet_manager.handshake_confirmed()
            && self.visitor.send_probing_data()
        {
            // Probing data was queued; the link is not idle after all.
            return;
        }
        self.sent_packet_manager.on_application_limited();
    }

    /// Whether the session may produce new stream data right now
    pub fn can_write_stream_data(&mut self) -> bool {
        // Stream data never jumps the queue or a pending negotiation packet.
        if self.pending_version_negotiation_packet || !self.queued_packets.is_empty() {
            return false;
        }
        if self.visitor.has_pending_handshake() {
            // Handshake data is exempt from pacing; only blocking stops it.
            return self.connected && !self.handle_write_blocked();
        }
        self.can_write(true)
    }

    //
    // Alarms
    //

    /// Earliest armed deadline; the reactor should call
    /// [`on_timeout`](Self::on_timeout) once it passes
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.next_timeout()
    }

    /// Dispatch every expired timer
    pub fn on_timeout(&mut self, now: Instant) {
        for timer in Timer::VALUES {
            if !self.connected {
                return;
            }
            if !self.timers.is_expired(timer, now) {
                continue;
            }
            self.timers.cancel(timer);
            trace!(?timer, "timeout");
            match timer {
                Timer::Ack => {
                    self.with_packet_flusher(|this| this.send_all_pending_acks());
                }
                Timer::Retransmission => self.on_retransmission_timeout(),
                Timer::Send => {
                    if !self.handle_write_blocked() {
                        self.on_can_write();
                    }
                }
                Timer::Timeout => self.check_for_timeout(now),
                Timer::Ping => self.on_ping_timeout(),
                Timer::MtuDiscovery => {
                    self.with_packet_flusher(|this| this.discover_mtu());
                }
                Timer::PathDegrading => {
                    debug!("path degrading");
                    self.is_path_degrading = true;
                    self.visitor.on_path_degrading();
                }
                Timer::ProcessUndecryptable => {
                    self.with_packet_flusher(|this| this.maybe_process_undecryptable_packets());
                }
            }
        }
    }

    /// Defer while a flusher is attached, otherwise arm from the
    /// sent-packet manager's deadline
    fn set_retransmission_alarm(&mut self) {
        if self.flusher_depth > 0 {
            self.pending_retransmission_alarm = true;
            return;
        }
        self.arm_retransmission_alarm();
    }

    fn arm_retransmission_alarm(&mut self) {
        match self.sent_packet_manager.retransmission_time() {
            Some(deadline) => {
                self.timers
                    .update(Timer::Retransmission, deadline, TIMER_GRANULARITY)
            }
            None => self.timers.cancel(Timer::Retransmission),
        }
    }

    fn on_retransmission_timeout(&mut self) {
        if self.close_connection_after_five_rtos
            && self.sent_packet_manager.consecutive_rto_count() >= 4
        {
            // Fifth consecutive RTO.
            self.close_connection(
                ErrorCode::TooManyRtos,
                "5 consecutive retransmission timeouts",
                CloseBehavior::SendConnectionClose,
            );
            return;
        }
        self.sent_packet_manager.on_retransmission_timeout();
        self.write_if_not_blocked();
        if !self.connected {
            // A write failure can close the connection.
            return;
        }
        if self.sent_packet_manager.maybe_retransmit_tail_loss_probe() {
            self.write_if_not_blocked();
        }
        // A timer-based loss may not have queued anything; keep the alarm
        // armed while packets remain unacked.
        if !self.has_queued_data() && !self.timers.is_set(Timer::Retransmission) {
            self.set_retransmission_alarm();
        }
    }

    fn set_ping_alarm(&mut self) {
        if self.side.is_server() {
            // Only clients ping, to keep NATs from timing out.
            return;
        }
        if !self.visitor.should_keep_connection_alive() {
            self.timers.cancel(Timer::Ping);
            return;
        }
        let now = self.clock.now();
        let retransmittable_on_wire = match self.retransmittable_on_wire_timeout {
            Some(timeout) if !self.sent_packet_manager.has_in_flight_packets() => timeout,
            _ => {
                self.timers
                    .update(Timer::Ping, now + self.ping_timeout, Duration::from_secs(1));
                return;
            }
        };
        debug_assert!(retransmittable_on_wire < self.ping_timeout);
        if self
            .timers
            .get(Timer::Ping)
            .map_or(false, |deadline| deadline < now + retransmittable_on_wire)
        {
            return;
        }
        // Nothing on the wire but open streams: ping sooner.
        self.timers.update(
            Timer::Ping,
            now + retransmittable_on_wire,
            TIMER_GRANULARITY,
        );
    }

    fn on_ping_timeout(&mut self) {
        if !self.timers.is_set(Timer::Retransmission) {
            self.visitor.send_ping();
        }
    }

    fn set_path_degrading_alarm(&mut self) {
        if self.side.is_server() {
            return;
        }
        let delay = self.sent_packet_manager.path_degrading_delay();
        let now = self.clock.now();
        self.timers
            .update(Timer::PathDegrading, now + delay, TIMER_GRANULARITY);
    }

    fn maybe_set_path_degrading_alarm(&mut self, acked_new_packet: bool) {
        if !self.sent_packet_manager.has_in_flight_packets() {
            // Nothing on the wire; degradation is unobservable.
            self.timers.cancel(Timer::PathDegrading);
        } else if acked_new_packet {
            self.is_path_degrading = false;
            self.set_path_degrading_alarm();
        }
    }

    //
    // Network timeouts
    //

    fn set_network_timeouts(
        &mut self,
        handshake_timeout: Option<Duration>,
        idle_timeout: Duration,
    ) {
        // Pad so a client gives up before the server forgets it, never the
        // other way around.
        let idle_timeout = match self.side {
            Side::Server => idle_timeout + Duration::from_secs(3),
            Side::Client => idle_timeout.saturating_sub(Duration::from_secs(1)),
        };
        self.handshake_timeout = handshake_timeout;
        self.idle_network_timeout = idle_timeout;
        self.set_timeout_alarm();
    }

    fn time_of_last_packet(&self) -> Instant {
        let baseline = self.stats.connection_creation_time;
        cmp::max(
            self.time_of_last_received_packet.unwrap_or(baseline),
            self.time_of_first_packet_sent_after_receiving
                .unwrap_or(baseline),
        )
    }

    fn set_timeout_alarm(&mut self) {
        let mut deadline = self.time_of_last_packet() + self.idle_network_timeout;
        if let Some(handshake_timeout) = self.handshake_timeout {
            deadline = cmp::min(
                deadline,
                self.stats.connection_creation_time + handshake_timeout,
            );
        }
        self.timers.update(Timer::Timeout, deadline, Duration::ZERO);
    }

    fn check_for_timeout(&mut self, now: Instant) {
        let idle_duration = now.saturating_duration_since(self.time_of_last_packet());
        if idle_duration >= self.idle_network_timeout {
            debug!(?idle_duration, "no recent network activity");
            self.error = Some(ConnectionError::TimedOut {
                code: ErrorCode::NetworkIdleTimeout,
            });
            let behavior = if self.sent_packet_manager.consecutive_tlp_count() > 0
                || self.sent_packet_manager.consecutive_rto_count() > 0
                || self.visitor.should_keep_connection_alive()
            {
                // The peer may be gone without knowing it; tell it anyway.
                CloseBehavior::SendConnectionClose
            } else {
                self.idle_timeout_connection_close_behavior
            };
            self.close_connection(
                ErrorCode::NetworkIdleTimeout,
                "no recent network activity",
                behavior,
            );
            return;
        }

        if let Some(handshake_timeout) = self.handshake_timeout {
            let connected_duration =
                now.saturating_duration_since(self.stats.connection_creation_time);
            if connected_duration >= handshake_timeout {
                debug!("handshake timeout expired");
                self.error = Some(ConnectionError::TimedOut {
                    code: ErrorCode::HandshakeTimeout,
                });
                self.close_connection(
                    ErrorCode::HandshakeTimeout,
                    "handshake timeout expired",
                    CloseBehavior::SendConnectionClose,
                );
                return;
            }
        }
        self.set_timeout_alarm();
    }

    //
    // MTU discovery
    //

    fn maybe_set_mtu_alarm(&mut self, sent_packet_number: u64) {
        if self.timers.is_set(Timer::MtuDiscovery) {
            return;
        }
        if self
            .mtu_discovery
            .should_probe(sent_packet_number, self.generator.current_max_packet_length())
        {
            // An alarm keeps the probe outside any active flusher scope.
            let now = self.clock.now();
            self.timers.set(Timer::MtuDiscovery, now);
        }
    }

    fn discover_mtu(&mut self) {
        debug_assert!(!self.timers.is_set(Timer::MtuDiscovery));
        if self.mtu_discovery.target() <= self.generator.current_max_packet_length() {
            return;
        }
        let largest_sent = self
            .sent_packet_manager
            .largest_sent_packet(SpaceId::Data)
            .unwrap_or(0);
        let target = self.mtu_discovery.on_probe_sent(largest_sent);
        if let Some(packet) = self.generator.serialize_mtu_probe(target) {
            self.stats.mtu_probes_sent += 1;
            self.send_or_queue_packet(packet);
        }
    }

    fn set_max_packet_length(&mut self, length: u16) {
        self.long_term_mtu = length;
        let limited = self.limited_max_packet_size(length);
        self.generator.set_max_packet_length(limited);
    }

    fn limited_max_packet_size(&self, suggested: u16) -> u16 {
        let writer_limit = self.writer.max_packet_size(self.direct_peer_address);
        let mut max = suggested;
        if usize::from(max) > writer_limit {
            max = writer_limit as u16;
        }
        cmp::min(max, MAX_OUTGOING_PACKET_SIZE)
    }

    //
    // Encryption levels and key-dependent queues
    //

    /// Switch the level applied to subsequently generated packets
    pub fn set_default_encryption_level(&mut self, level: EncryptionLevel) {
        if level != self.encryption_level && self.generator.has_queued_frames() {
            // Flush at the old level before anything is built at the new one.
            self.with_packet_flusher(|this| this.flush_generator());
        }
        self.encryption_level = level;
        self.generator.set_encryption_level(level);
    }

    /// The session installed new keys in the framer; buffered packets may
    /// now be readable
    pub fn on_keys_available(&mut self) {
        if !self.undecryptable_packets.is_empty() && !self.timers.is_set(Timer::ProcessUndecryptable)
        {
            let now = self.clock.now();
            self.timers.set(Timer::ProcessUndecryptable, now);
        }
    }

    /// The session reports the cryptographic handshake finished
    pub fn on_handshake_complete(&mut self) {
        self.sent_packet_manager.set_handshake_confirmed();
        // The recovery deadline may have changed shape.
        self.set_retransmission_alarm();
        // Ack promptly so the peer confirms completion too.
        if self.side.is_client() {
            if let Some(deadline) = self.earliest_ack_timeout() {
                let now = self.clock.now();
                self.maybe_set_ack_alarm_to(cmp::min(deadline, now));
            }
        }
    }

    fn maybe_process_undecryptable_packets(&mut self) {
        self.timers.cancel(Timer::ProcessUndecryptable);
        if self.undecryptable_packets.is_empty()
            || self.encryption_level == EncryptionLevel::Initial
        {
            return;
        }
        while self.connected {
            let Some(packet) = self.undecryptable_packets.pop_front() else {
                break;
            };
            // The queued ack frame may change while processing; keep the
            // generator empty across packets.
            self.flush_generator();
            if !self.connected {
                return;
            }
            trace!("attempting to process undecryptable packet");
            self.last_packet_destination_address = Some(packet.destination);
            self.last_packet_source_address = Some(packet.source);
            self.last_size = packet.data.len();
            if self.process_packet_data(&packet, false) {
                // Still undecryptable; put it back and wait for more keys.
                self.undecryptable_packets.push_front(packet);
                break;
            }
        }
        // No further keys will ever arrive once forward secure.
        if self.encryption_level == EncryptionLevel::ForwardSecure {
            self.undecryptable_packets.clear();
        }
    }

    fn maybe_process_coalesced_packets(&mut self) {
        while self.connected {
            let Some(packet) = self.coalesced_packets.pop_front() else {
                break;
            };
            self.last_packet_destination_address = Some(packet.destination);
            self.last_packet_source_address = Some(packet.source);
            self.last_size = packet.data.len();
            self.process_packet_data(&packet, true);
        }
    }

    //
    // Close path
    //

    /// Close the connection, optionally emitting a CONNECTION_CLOSE packet
    pub fn close_connection(
        &mut self,
        code: ErrorCode,
        reason: &'static str,
        behavior: CloseBehavior,
    ) {
        if !self.connected {
            debug!("connection is already closed");
            return;
        }
        debug!(%code, reason, ?behavior, "closing connection");
        if behavior == CloseBehavior::SendConnectionClose {
            self.send_connection_close_packet(code, reason);
        }
        let error = ConnectionError::Local(TransportError {
            code,
            reason,
            behavior,
        });
        self.tear_down(code, reason, CloseSource::FromSelf, error);
    }

    fn close_with(&mut self, err: TransportError) {
        self.close_connection(err.code, err.reason, err.behavior);
    }

    fn send_connection_close_packet(&mut self, code: ErrorCode, reason: &'static str) {
        trace!("sending connection close packet");
        let level = self.connection_close_encryption_level();
        self.set_default_encryption_level(level);
        self.queued_packets.clear();
        self.with_packet_flusher(|this| {
            // Bundle a final ack unless the writer itself is the problem.
            if code != ErrorCode::PacketWriteError && this.earliest_ack_timeout().is_some() {
                this.send_all_pending_acks();
            }
            let close_type = if this.version.has_ietf_invariant_header() {
                CloseType::IetfTransport
            } else {
                CloseType::Google
            };
            this.generator.queue_control_frame(Frame::Close(CloseFrame {
                code,
                reason: reason.to_owned(),
                close_type,
            }));
            this.flush_generator();
        });
    }

    /// The level a close packet must use: high enough for the peer to read,
    /// never higher than what it provably has keys for
    fn connection_close_encryption_level(&self) -> EncryptionLevel {
        if self.side.is_client() {
            return self.encryption_level;
        }
        if self.sent_packet_manager.handshake_confirmed() {
            return EncryptionLevel::ForwardSecure;
        }
        if self.framer.has_keys(EncryptionLevel::ZeroRtt) {
            return EncryptionLevel::ZeroRtt;
        }
        EncryptionLevel::Initial
    }

    fn tear_down(
        &mut self,
        code: ErrorCode,
        reason: &'static str,
        source: CloseSource,
        error: ConnectionError,
    ) {
        if !self.connected {
            debug!("connection is already closed");
            return;
        }
        self.flush_packets();
        self.connected = false;
        if self.error.is_none() {
            self.error = Some(error);
        }
        self.queued_packets.clear();
        self.visitor.on_connection_closed(code, reason, source);
        self.timers.cancel_all();
    }

    //
    // Release time
    //

    fn update_release_time_into_future(&mut self) {
        debug_assert!(self.supports_release_time);
        let srtt = self.sent_packet_manager.rtt_stats().smoothed_or_initial();
        self.release_time_into_future = cmp::max(
            MIN_RELEASE_TIME_INTO_FUTURE,
            cmp::min(
                MAX_PACE_TIME_INTO_FUTURE,
                srtt.mul_f32(PACE_TIME_INTO_FUTURE_SRTT_FRACTION),
            ),
        );
    }

    #[cfg(test)]
    pub(crate) fn timers(&self) -> &TimerTable {
        &self.timers
    }

    #[cfg(test)]
    pub(crate) fn queued_packet_count(&self) -> usize {
        self.queued_packets.len()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.queued_packets.clear();
        self.timers.cancel_all();
    }
}
