use std::{collections::BTreeSet, fmt, net::IpAddr, time::Duration};

/// Latency reported by [`DetectionResult::latency_millis`] for an unreachable host.
pub const NOT_REACHABLE: f64 = -1.0;

/// The way a host proved to be present.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum PresenceKind {
    TcpConnection,
    ArpPing,
    IcmpPing,
    DhcpRequest,
}

impl fmt::Display for PresenceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PresenceKind::TcpConnection => "TCP",
            PresenceKind::ArpPing => "ARP",
            PresenceKind::IcmpPing => "ICMP",
            PresenceKind::DhcpRequest => "DHCP",
        };
        f.write_str(name)
    }
}

/// A single successful observation, recorded into a [`DetectionResult`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) struct Evidence {
    pub(crate) kind: PresenceKind,
    pub(crate) latency: Duration,
    pub(crate) port: Option<u16>,
}

impl Evidence {
    pub(crate) fn tcp(port: u16, latency: Duration) -> Self {
        Self {
            kind: PresenceKind::TcpConnection,
            latency,
            port: Some(port),
        }
    }

    pub(crate) fn arp(latency: Duration) -> Self {
        Self {
            kind: PresenceKind::ArpPing,
            latency,
            port: None,
        }
    }

    pub(crate) fn icmp(latency: Duration) -> Self {
        Self {
            kind: PresenceKind::IcmpPing,
            latency,
            port: None,
        }
    }

    /// DHCP requests carry no round trip, they count as an immediate answer.
    pub(crate) fn dhcp() -> Self {
        Self {
            kind: PresenceKind::DhcpRequest,
            latency: Duration::ZERO,
            port: None,
        }
    }
}

/// Reachability evidence gathered for one host during one detection cycle.
///
/// A result with at least one [`PresenceKind`] is reachable and always carries
/// the best latency seen so far. A result without evidence is unreachable and
/// reports [`NOT_REACHABLE`] as its latency.
#[derive(Clone, Eq, PartialEq, Debug)]
pub struct DetectionResult {
    address: IpAddr,
    latency: Option<Duration>,
    evidence: BTreeSet<PresenceKind>,
    reachable_ports: BTreeSet<u16>,
}

impl DetectionResult {
    /// Creates a result for `address` without any evidence.
    pub fn not_reachable(address: IpAddr) -> Self {
        Self {
            address,
            latency: None,
            evidence: BTreeSet::new(),
            reachable_ports: BTreeSet::new(),
        }
    }

    pub fn address(&self) -> IpAddr {
        self.address
    }

    /// Lowest round trip observed, `None` while unreachable.
    pub fn latency(&self) -> Option<Duration> {
        self.latency
    }

    /// Lowest round trip in milliseconds, or [`NOT_REACHABLE`].
    pub fn latency_millis(&self) -> f64 {
        self.latency
            .map(|latency| latency.as_secs_f64() * 1000.0)
            .unwrap_or(NOT_REACHABLE)
    }

    pub fn evidence(&self) -> &BTreeSet<PresenceKind> {
        &self.evidence
    }

    pub fn has_evidence(&self, kind: PresenceKind) -> bool {
        self.evidence.contains(&kind)
    }

    pub fn reachable_ports(&self) -> &BTreeSet<u16> {
        &self.reachable_ports
    }

    pub fn is_reachable(&self) -> bool {
        !self.evidence.is_empty()
    }

    pub(crate) fn record(&mut self, evidence: &Evidence) {
        self.evidence.insert(evidence.kind);
        if let Some(port) = evidence.port {
            self.reachable_ports.insert(port);
        }
        self.latency = Some(match self.latency {
            Some(best) => best.min(evidence.latency),
            None => evidence.latency,
        });
    }
}

impl fmt::Display for DetectionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_reachable() {
            return write!(f, "{} not reachable", self.address);
        }
        let kinds: Vec<String> = self.evidence.iter().map(ToString::to_string).collect();
        write!(
            f,
            "{} reachable via {} in {:.1}ms",
            self.address,
            kinds.join("+"),
            self.latency_millis()
        )
    }
}
