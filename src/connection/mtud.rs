use tracing::trace;

/// High MTU probe target, for paths expected to carry near-Ethernet frames
pub(crate) const MTU_DISCOVERY_TARGET_HIGH: u16 = 1450;
/// Conservative MTU probe target
pub(crate) const MTU_DISCOVERY_TARGET_LOW: u16 = 1430;
/// Probes attempted before giving up on a target
pub(crate) const MTU_DISCOVERY_ATTEMPTS: u32 = 3;
/// Packets between the connection start and the first probe; doubles on
/// every subsequent probe
pub(crate) const PACKETS_BETWEEN_MTU_PROBES_BASE: u64 = 100;

/// Schedule of path MTU probing
///
/// Probing is driven off sent packet numbers: once the connection has sent
/// `next_probe_at` packets, a single padded probe of `target` bytes goes out
/// and the inter-probe spacing doubles. An EMSGSIZE on a probe-sized packet
/// disables probing permanently.
#[derive(Debug, Clone)]
pub(crate) struct MtuDiscovery {
    /// Probe size being validated; zero when probing is disabled
    target: u16,
    probe_count: u32,
    packets_between_probes: u64,
    /// Packet number after which the next probe may be scheduled
    next_probe_at: u64,
}

impl Default for MtuDiscovery {
    fn default() -> Self {
        Self {
            target: 0,
            probe_count: 0,
            packets_between_probes: PACKETS_BETWEEN_MTU_PROBES_BASE,
            next_probe_at: PACKETS_BETWEEN_MTU_PROBES_BASE,
        }
    }
}

impl MtuDiscovery {
    pub(crate) fn set_target(&mut self, target: u16) {
        trace!(target, "mtu discovery target set");
        self.target = target;
    }

    pub(crate) fn target(&self) -> u16 {
        self.target
    }

    /// Whether sending packet `sent_packet_number` should schedule a probe,
    /// given the current max packet length
    pub(crate) fn should_probe(&self, sent_packet_number: u64, max_packet_length: u16) -> bool {
        self.target > max_packet_length
            && self.probe_count < MTU_DISCOVERY_ATTEMPTS
            && sent_packet_number >= self.next_probe_at
    }

    /// Commit to sending a probe now; returns the probe size
    ///
    /// The next probe point is computed before the probe goes out so that
    /// the probe's own packet number does not immediately reschedule it.
    pub(crate) fn on_probe_sent(&mut self, largest_sent: u64) -> u16 {
        self.packets_between_probes *= 2;
        self.next_probe_at = largest_sent + self.packets_between_probes + 1;
        self.probe_count += 1;
        trace!(
            probe = self.probe_count,
            next_at = self.next_probe_at,
            "sending mtu discovery probe"
        );
        self.target
    }

    /// Probing failed at the socket layer (EMSGSIZE); never probe again
    pub(crate) fn disable(&mut self) {
        self.target = 0;
    }
}
