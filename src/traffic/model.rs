use serde::Serialize;
use std::fmt;
use std::net::SocketAddr;

/// Network layer family of a flow, rendered as the `network_layer` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum IpVersion {
    #[serde(rename = "ip4")]
    Ip4,
    #[serde(rename = "ip6")]
    Ip6,
}

/// Transport protocol of a flow, rendered as the `transport_layer` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Transport {
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "udp")]
    Udp,
}

impl IpVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            IpVersion::Ip4 => "ip4",
            IpVersion::Ip6 => "ip6",
        }
    }

    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => IpVersion::Ip4,
            SocketAddr::V6(_) => IpVersion::Ip6,
        }
    }
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Directional identity of a flow.
///
/// A key and its [`FlowKey::reversed`] counterpart describe the same logical
/// connection seen from opposite ends. The correlator stores keys oriented
/// initiator -> responder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FlowKey {
    pub ip_version: IpVersion,
    pub transport: Transport,
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl FlowKey {
    pub fn new(transport: Transport, source: SocketAddr, destination: SocketAddr) -> Self {
        Self {
            ip_version: IpVersion::of(&source),
            transport,
            source,
            destination,
        }
    }

    pub fn reversed(&self) -> Self {
        Self {
            source: self.destination,
            destination: self.source,
            ..*self
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} {} -> {}",
            self.ip_version, self.transport, self.source, self.destination
        )
    }
}

/// One observed or synthesized traffic event.
///
/// `length == 0` never describes a packet: it is the retraction sentinel that
/// tells the metrics sink to drop everything it recorded for `flow`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Traffic {
    pub flow: FlowKey,
    pub length: u64,
}

impl Traffic {
    pub fn observed(flow: FlowKey, length: u64) -> Self {
        Self { flow, length }
    }

    pub fn retraction(flow: FlowKey) -> Self {
        Self { flow, length: 0 }
    }

    pub fn is_retraction(&self) -> bool {
        self.length == 0
    }

    /// Same event with source and destination swapped.
    pub fn swapped(&self) -> Self {
        Self {
            flow: self.flow.reversed(),
            length: self.length,
        }
    }
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_retraction() {
            write!(f, "{} (retract)", self.flow)
        } else {
            write!(f, "{} len={}", self.flow, self.length)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FlowKey {
        FlowKey::new(
            Transport::Tcp,
            "10.0.0.1:1234".parse().unwrap(),
            "10.0.0.2:80".parse().unwrap(),
        )
    }

    #[test]
    fn test_reversed_is_involution() {
        let k = key();
        assert_ne!(k, k.reversed());
        assert_eq!(k, k.reversed().reversed());
        assert_eq!(k.reversed().source, k.destination);
        assert_eq!(k.reversed().transport, Transport::Tcp);
    }

    #[test]
    fn test_ip_version_follows_address_family() {
        assert_eq!(key().ip_version, IpVersion::Ip4);
        let v6 = FlowKey::new(
            Transport::Udp,
            "[fe80::1]:53".parse().unwrap(),
            "[fe80::2]:5353".parse().unwrap(),
        );
        assert_eq!(v6.ip_version, IpVersion::Ip6);
        assert_eq!(v6.ip_version.as_str(), "ip6");
    }

    #[test]
    fn test_retraction_sentinel() {
        let t = Traffic::observed(key(), 60);
        assert!(!t.is_retraction());
        let r = Traffic::retraction(t.flow);
        assert!(r.is_retraction());
        assert_eq!(r.flow, t.flow);
        assert_eq!(t.swapped().flow, key().reversed());
        assert_eq!(t.swapped().length, 60);
    }
}
