use std::net::{IpAddr, SocketAddr};

/// Classification of a peer (or self) address change
///
/// The subset of changes a server accepts without validation is policy held
/// by the sent-packet manager and session; the connection only classifies
/// and reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum AddressChangeType {
    NoChange,
    /// Same IP, different port: usually a NAT rebinding
    PortChange,
    /// IPv4 address changed within the same /24
    Ipv4SubnetChange,
    /// IPv4 address changed beyond the /24
    Ipv4ToIpv4Change,
    Ipv4ToIpv6Change,
    Ipv6ToIpv4Change,
    Ipv6ToIpv6Change,
}

impl AddressChangeType {
    pub fn is_change(self) -> bool {
        self != Self::NoChange
    }
}

/// Classify how `new` differs from `old`
///
/// IPv4-mapped IPv6 addresses compare as their IPv4 forms, so a dual-stack
/// socket reporting `::ffff:a.b.c.d` is not a migration from `a.b.c.d`.
pub(crate) fn determine_address_change_type(
    old: SocketAddr,
    new: SocketAddr,
) -> AddressChangeType {
    if old == new {
        return AddressChangeType::NoChange;
    }
    let old_ip = normalize(old.ip());
    let new_ip = normalize(new.ip());
    if old_ip == new_ip {
        return if old.port() == new.port() {
            AddressChangeType::NoChange
        } else {
            AddressChangeType::PortChange
        };
    }
    match (old_ip, new_ip) {
        (IpAddr::V4(old_v4), IpAddr::V4(new_v4)) => {
            if old_v4.octets()[..3] == new_v4.octets()[..3] {
                AddressChangeType::Ipv4SubnetChange
            } else {
                AddressChangeType::Ipv4ToIpv4Change
            }
        }
        (IpAddr::V4(_), IpAddr::V6(_)) => AddressChangeType::Ipv4ToIpv6Change,
        (IpAddr::V6(_), IpAddr::V4(_)) => AddressChangeType::Ipv6ToIpv4Change,
        (IpAddr::V6(_), IpAddr::V6(_)) => AddressChangeType::Ipv6ToIpv6Change,
    }
}

/// Whether two addresses are the same endpoint modulo IPv4 mapping
pub(crate) fn addresses_equivalent(a: SocketAddr, b: SocketAddr) -> bool {
    a.port() == b.port() && normalize(a.ip()) == normalize(b.ip())
}

fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        IpAddr::V4(_) => ip,
    }
}

/// Running classification of the packet currently being dispatched
///
/// A connectivity probe is exactly a PING (or PATH_CHALLENGE) followed by
/// padding; anything else demotes the packet to ordinary content, at which
/// point a pending peer migration may start.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketContent {
    NoFramesReceived,
    FirstFrameIsPing,
    SecondFrameIsPadding,
    NotPaddedPing,
}
