use std::time::{Duration, Instant};

/// The eight alarms a connection arms
///
/// Alarms carry no state of their own; when one expires the connection
/// dispatches on the kind. There are no delegate objects and no
/// back-references.
#[derive(Debug, Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash)]
pub enum Timer {
    /// When a delayed acknowledgement must be sent
    Ack = 0,
    /// Loss/probe deadline from the sent-packet manager
    Retransmission = 1,
    /// When pacing next allows a send
    Send = 2,
    /// Idle or handshake deadline
    Timeout = 3,
    /// Keepalive ping (clients only)
    Ping = 4,
    /// Scheduled MTU probe
    MtuDiscovery = 5,
    /// No acknowledgement for too long (clients only)
    PathDegrading = 6,
    /// New keys arrived; drain the undecryptable queue
    ProcessUndecryptable = 7,
}

impl Timer {
    pub(crate) const VALUES: [Self; 8] = [
        Self::Ack,
        Self::Retransmission,
        Self::Send,
        Self::Timeout,
        Self::Ping,
        Self::MtuDiscovery,
        Self::PathDegrading,
        Self::ProcessUndecryptable,
    ];
}

/// Deadlines for every [`Timer`]
///
/// The reactor reads [`next_timeout`](Self::next_timeout) after each entry
/// point and calls back into the connection when the deadline passes; the
/// connection then expires timers one at a time.
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerTable {
    deadlines: [Option<Instant>; 8],
}

impl TimerTable {
    /// Arm `timer` unconditionally
    pub(crate) fn set(&mut self, timer: Timer, time: Instant) {
        self.deadlines[timer as usize] = Some(time);
    }

    /// Arm `timer`, but skip the update when the new deadline is within
    /// `granularity` of the existing one
    ///
    /// Coarse granularity keeps frequently recomputed deadlines (ping,
    /// retransmission) from churning the reactor's timer wheel.
    pub(crate) fn update(&mut self, timer: Timer, time: Instant, granularity: Duration) {
        if let Some(existing) = self.deadlines[timer as usize] {
            let close_enough = if existing > time {
                existing - time <= granularity
            } else {
                time - existing <= granularity
            };
            if close_enough {
                return;
            }
        }
        self.deadlines[timer as usize] = Some(time);
    }

    pub(crate) fn get(&self, timer: Timer) -> Option<Instant> {
        self.deadlines[timer as usize]
    }

    pub(crate) fn is_set(&self, timer: Timer) -> bool {
        self.deadlines[timer as usize].is_some()
    }

    pub(crate) fn cancel(&mut self, timer: Timer) {
        self.deadlines[timer as usize] = None;
    }

    pub(crate) fn is_expired(&self, timer: Timer, now: Instant) -> bool {
        self.deadlines[timer as usize].map_or(false, |deadline| deadline <= now)
    }

    /// Earliest armed deadline across all timers
    pub(crate) fn next_timeout(&self) -> Option<Instant> {
        self.deadlines.iter().filter_map(|&x| x).min()
    }

    pub(crate) fn cancel_all(&mut self) {
        self.deadlines = [None; 8];
    }
}
