use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::ipv6::Ipv6Packet;
use pnet::packet::tcp::TcpPacket;
use pnet::packet::udp::UdpPacket;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

use crate::traffic::{FlowKey, Transport};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("{layer} header truncated: {available} bytes available")]
    Truncated { layer: &'static str, available: usize },

    #[error("malformed {layer} header: {reason}")]
    Malformed { layer: &'static str, reason: String },
}

/// Link layer framing of the captured bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkLayer {
    Ethernet,
    /// Bare IPv4/IPv6 datagrams, version taken from the first nibble.
    RawIp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkLayer {
    Unset,
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr },
    Ipv6 { src: Ipv6Addr, dst: Ipv6Addr },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn syn(&self) -> bool {
        self.0 & Self::SYN != 0
    }

    pub fn ack(&self) -> bool {
        self.0 & Self::ACK != 0
    }

    pub fn fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    /// A connection-initiating segment: SYN without ACK.
    pub fn is_initial_syn(&self) -> bool {
        self.syn() && !self.ack()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpSegment {
    pub src_port: u16,
    pub dst_port: u16,
    pub sequence: u32,
    pub flags: TcpFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpDatagram {
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportLayer {
    Unset,
    Tcp(TcpSegment),
    Udp(UdpDatagram),
}

/// Fields extracted from one packet. `payload` is the transport payload, empty
/// when no transport layer was decoded.
#[derive(Debug, Clone, Copy)]
pub struct DecodedPacket<'a> {
    pub link: LinkLayer,
    pub network: NetworkLayer,
    pub transport: TransportLayer,
    pub payload: &'a [u8],
    pub frame_len: usize,
}

impl<'a> DecodedPacket<'a> {
    fn new(link: LinkLayer, frame_len: usize) -> Self {
        Self {
            link,
            network: NetworkLayer::Unset,
            transport: TransportLayer::Unset,
            payload: &[],
            frame_len,
        }
    }

    pub fn addresses(&self) -> Option<(IpAddr, IpAddr)> {
        match self.network {
            NetworkLayer::Unset => None,
            NetworkLayer::Ipv4 { src, dst } => Some((IpAddr::V4(src), IpAddr::V4(dst))),
            NetworkLayer::Ipv6 { src, dst } => Some((IpAddr::V6(src), IpAddr::V6(dst))),
        }
    }

    pub fn tcp(&self) -> Option<&TcpSegment> {
        match &self.transport {
            TransportLayer::Tcp(segment) => Some(segment),
            TransportLayer::Udp(_) | TransportLayer::Unset => None,
        }
    }

    /// Flow identity as observed on the wire, if both layers were decoded.
    pub fn flow_key(&self) -> Option<FlowKey> {
        let (src, dst) = self.addresses()?;
        let (transport, src_port, dst_port) = match self.transport {
            TransportLayer::Unset => return None,
            TransportLayer::Tcp(seg) => (Transport::Tcp, seg.src_port, seg.dst_port),
            TransportLayer::Udp(dgram) => (Transport::Udp, dgram.src_port, dgram.dst_port),
        };
        Some(FlowKey::new(
            transport,
            SocketAddr::new(src, src_port),
            SocketAddr::new(dst, dst_port),
        ))
    }
}

/// Stateless decoder turning raw frames into [`DecodedPacket`]s.
///
/// Ethernet, TCP and UDP are always decoded; IPv4 and IPv6 can be switched
/// off, in which case packets of that family come back with
/// [`NetworkLayer::Unset`].
#[derive(Debug, Clone)]
pub struct FieldExtractor {
    link: LinkLayer,
    ipv4: bool,
    ipv6: bool,
}

impl FieldExtractor {
    pub fn new(link: LinkLayer, ipv4: bool, ipv6: bool) -> Self {
        Self { link, ipv4, ipv6 }
    }

    pub fn decode<'a>(&self, data: &'a [u8]) -> Result<DecodedPacket<'a>, DecodeError> {
        let mut decoded = DecodedPacket::new(self.link, data.len());

        match self.link {
            LinkLayer::Ethernet => {
                let ethernet = EthernetPacket::new(data).ok_or(DecodeError::Truncated {
                    layer: "ethernet",
                    available: data.len(),
                })?;
                let offset = EthernetPacket::minimum_packet_size();
                let body = &data[offset..];
                match ethernet.get_ethertype() {
                    EtherTypes::Ipv4 => self.decode_ipv4(body, &mut decoded)?,
                    EtherTypes::Ipv6 => self.decode_ipv6(body, &mut decoded)?,
                    _ => {}
                }
            }
            LinkLayer::RawIp => match data.first().map(|b| b >> 4) {
                Some(4) => self.decode_ipv4(data, &mut decoded)?,
                Some(6) => self.decode_ipv6(data, &mut decoded)?,
                Some(version) => {
                    return Err(DecodeError::Malformed {
                        layer: "ip",
                        reason: format!("unknown version {}", version),
                    })
                }
                None => return Err(DecodeError::Truncated { layer: "ip", available: 0 }),
            },
        }

        Ok(decoded)
    }

    fn decode_ipv4<'a>(&self, data: &'a [u8], decoded: &mut DecodedPacket<'a>) -> Result<(), DecodeError> {
        if !self.ipv4 {
            return Ok(());
        }
        let ip = Ipv4Packet::new(data).ok_or(DecodeError::Truncated {
            layer: "ipv4",
            available: data.len(),
        })?;

        let header_len = ip.get_header_length() as usize * 4;
        if header_len < Ipv4Packet::minimum_packet_size() || header_len > data.len() {
            return Err(DecodeError::Malformed {
                layer: "ipv4",
                reason: format!("header length {} with {} bytes available", header_len, data.len()),
            });
        }
        // total length may exceed the capture when the snaplen cut the frame
        let total_len = (ip.get_total_length() as usize).clamp(header_len, data.len());

        decoded.network = NetworkLayer::Ipv4 {
            src: ip.get_source(),
            dst: ip.get_destination(),
        };
        self.decode_transport(ip.get_next_level_protocol(), &data[header_len..total_len], decoded)
    }

    fn decode_ipv6<'a>(&self, data: &'a [u8], decoded: &mut DecodedPacket<'a>) -> Result<(), DecodeError> {
        if !self.ipv6 {
            return Ok(());
        }
        let ip = Ipv6Packet::new(data).ok_or(DecodeError::Truncated {
            layer: "ipv6",
            available: data.len(),
        })?;

        let header_len = Ipv6Packet::minimum_packet_size();
        let end = (header_len + ip.get_payload_length() as usize).min(data.len());

        decoded.network = NetworkLayer::Ipv6 {
            src: ip.get_source(),
            dst: ip.get_destination(),
        };
        self.decode_transport(ip.get_next_header(), &data[header_len..end], decoded)
    }

    fn decode_transport<'a>(
        &self,
        protocol: IpNextHeaderProtocol,
        data: &'a [u8],
        decoded: &mut DecodedPacket<'a>,
    ) -> Result<(), DecodeError> {
        match protocol {
            IpNextHeaderProtocols::Tcp => {
                let tcp = TcpPacket::new(data).ok_or(DecodeError::Truncated {
                    layer: "tcp",
                    available: data.len(),
                })?;
                let offset = tcp.get_data_offset() as usize * 4;
                if offset < TcpPacket::minimum_packet_size() || offset > data.len() {
                    return Err(DecodeError::Malformed {
                        layer: "tcp",
                        reason: format!("data offset {} with {} bytes available", offset, data.len()),
                    });
                }
                decoded.transport = TransportLayer::Tcp(TcpSegment {
                    src_port: tcp.get_source(),
                    dst_port: tcp.get_destination(),
                    sequence: tcp.get_sequence(),
                    // NS lives above the low byte on older header layouts
                    flags: TcpFlags::from_bits((tcp.get_flags() & 0xff) as u8),
                });
                decoded.payload = &data[offset..];
            }
            IpNextHeaderProtocols::Udp => {
                let udp = UdpPacket::new(data).ok_or(DecodeError::Truncated {
                    layer: "udp",
                    available: data.len(),
                })?;
                decoded.transport = TransportLayer::Udp(UdpDatagram {
                    src_port: udp.get_source(),
                    dst_port: udp.get_destination(),
                });
                let header = UdpPacket::minimum_packet_size();
                let end = (udp.get_length() as usize).clamp(header, data.len());
                decoded.payload = &data[header..end];
            }
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::fixtures::{frame, FrameSpec};

    fn extractor() -> FieldExtractor {
        FieldExtractor::new(LinkLayer::Ethernet, true, true)
    }

    #[test]
    fn test_decode_tcp_syn() {
        let bytes = frame(FrameSpec::tcp("10.0.0.1:5000", "10.0.0.2:443").flags(TcpFlags::SYN).seq(100));
        let decoded = extractor().decode(&bytes).unwrap();

        assert_eq!(
            decoded.network,
            NetworkLayer::Ipv4 {
                src: "10.0.0.1".parse().unwrap(),
                dst: "10.0.0.2".parse().unwrap()
            }
        );
        let tcp = decoded.tcp().unwrap();
        assert!(tcp.flags.is_initial_syn());
        assert_eq!(tcp.sequence, 100);
        assert_eq!(decoded.frame_len, bytes.len());
        assert!(decoded.payload.is_empty());

        let key = decoded.flow_key().unwrap();
        assert_eq!(key.transport, Transport::Tcp);
        assert_eq!(key.source, "10.0.0.1:5000".parse().unwrap());
    }

    #[test]
    fn test_decode_udp_ipv6_payload() {
        let bytes = frame(FrameSpec::udp("[2001:db8::1]:5353", "[2001:db8::2]:53").payload(&[7u8; 12]));
        let decoded = extractor().decode(&bytes).unwrap();

        assert!(matches!(decoded.network, NetworkLayer::Ipv6 { .. }));
        assert!(matches!(decoded.transport, TransportLayer::Udp(UdpDatagram { dst_port: 53, .. })));
        assert_eq!(decoded.payload.len(), 12);
    }

    #[test]
    fn test_disabled_family_yields_no_flow_key() {
        let bytes = frame(FrameSpec::tcp("10.0.0.1:5000", "10.0.0.2:443"));
        let decoded = FieldExtractor::new(LinkLayer::Ethernet, false, true).decode(&bytes).unwrap();
        assert_eq!(decoded.network, NetworkLayer::Unset);
        assert_eq!(decoded.transport, TransportLayer::Unset);
        assert!(decoded.flow_key().is_none());
        assert_eq!(decoded.frame_len, bytes.len());
    }

    #[test]
    fn test_truncated_frames_are_errors() {
        let bytes = frame(FrameSpec::tcp("10.0.0.1:5000", "10.0.0.2:443").payload(b"hello"));
        let extractor = extractor();

        assert!(matches!(extractor.decode(&bytes[..6]), Err(DecodeError::Truncated { layer: "ethernet", .. })));
        assert!(matches!(extractor.decode(&bytes[..20]), Err(DecodeError::Truncated { layer: "ipv4", .. })));
        assert!(matches!(extractor.decode(&bytes[..40]), Err(DecodeError::Truncated { layer: "tcp", .. })));
    }

    #[test]
    fn test_bad_tcp_offset_is_malformed() {
        let mut bytes = frame(FrameSpec::tcp("10.0.0.1:5000", "10.0.0.2:443"));
        // data offset nibble of the tcp header: 15 words overruns the frame
        bytes[14 + 20 + 12] = 0xf0;
        assert!(matches!(extractor().decode(&bytes), Err(DecodeError::Malformed { layer: "tcp", .. })));
    }

    #[test]
    fn test_raw_ip_link() {
        let bytes = frame(FrameSpec::tcp("10.0.0.1:5000", "10.0.0.2:443").payload(b"abc"));
        let decoded = FieldExtractor::new(LinkLayer::RawIp, true, true).decode(&bytes[14..]).unwrap();
        assert_eq!(decoded.payload, b"abc");
        assert!(FieldExtractor::new(LinkLayer::RawIp, true, true).decode(&[0x10, 0, 0]).is_err());
    }

    #[test]
    fn test_non_ip_ethertype_is_not_an_error() {
        let mut bytes = frame(FrameSpec::tcp("10.0.0.1:5000", "10.0.0.2:443"));
        bytes[12] = 0x08;
        bytes[13] = 0x06; // ARP
        let decoded = extractor().decode(&bytes).unwrap();
        assert_eq!(decoded.network, NetworkLayer::Unset);
    }
}
