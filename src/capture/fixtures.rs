//! Synthetic Ethernet frames for unit tests.

use pnet::packet::ethernet::{EtherTypes, MutableEthernetPacket};
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::MutableIpv4Packet;
use pnet::packet::ipv6::MutableIpv6Packet;
use pnet::packet::tcp::MutableTcpPacket;
use pnet::packet::udp::MutableUdpPacket;
use pnet::util::MacAddr;
use std::net::{IpAddr, SocketAddr};

use crate::traffic::Transport;

const ETHERNET_LEN: usize = 14;
const IPV4_LEN: usize = 20;
const IPV6_LEN: usize = 40;
const TCP_LEN: usize = 20;
const UDP_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct FrameSpec {
    transport: Transport,
    src: SocketAddr,
    dst: SocketAddr,
    flags: u8,
    seq: u32,
    payload: Vec<u8>,
}

impl FrameSpec {
    pub fn tcp(src: &str, dst: &str) -> Self {
        Self::new(Transport::Tcp, src, dst)
    }

    pub fn udp(src: &str, dst: &str) -> Self {
        Self::new(Transport::Udp, src, dst)
    }

    fn new(transport: Transport, src: &str, dst: &str) -> Self {
        Self {
            transport,
            src: src.parse().expect("fixture source address"),
            dst: dst.parse().expect("fixture destination address"),
            flags: 0,
            seq: 0,
            payload: Vec::new(),
        }
    }

    pub fn flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    pub fn seq(mut self, seq: u32) -> Self {
        self.seq = seq;
        self
    }

    pub fn payload(mut self, payload: &[u8]) -> Self {
        self.payload = payload.to_vec();
        self
    }
}

/// Builds a complete Ethernet frame for `spec`.
pub fn frame(spec: FrameSpec) -> Vec<u8> {
    let transport_len = match spec.transport {
        Transport::Tcp => TCP_LEN,
        Transport::Udp => UDP_LEN,
    } + spec.payload.len();
    let ip_len = match spec.src.ip() {
        IpAddr::V4(_) => IPV4_LEN,
        IpAddr::V6(_) => IPV6_LEN,
    };

    let mut buf = vec![0u8; ETHERNET_LEN + ip_len + transport_len];

    {
        let mut ethernet = MutableEthernetPacket::new(&mut buf).expect("ethernet buffer");
        ethernet.set_source(MacAddr::new(0x02, 0, 0, 0, 0, 1));
        ethernet.set_destination(MacAddr::new(0x02, 0, 0, 0, 0, 2));
        ethernet.set_ethertype(match spec.src.ip() {
            IpAddr::V4(_) => EtherTypes::Ipv4,
            IpAddr::V6(_) => EtherTypes::Ipv6,
        });
    }

    let next_header = match spec.transport {
        Transport::Tcp => IpNextHeaderProtocols::Tcp,
        Transport::Udp => IpNextHeaderProtocols::Udp,
    };

    match (spec.src.ip(), spec.dst.ip()) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let mut ip = MutableIpv4Packet::new(&mut buf[ETHERNET_LEN..]).expect("ipv4 buffer");
            ip.set_version(4);
            ip.set_header_length(5);
            ip.set_total_length((IPV4_LEN + transport_len) as u16);
            ip.set_ttl(64);
            ip.set_next_level_protocol(next_header);
            ip.set_source(src);
            ip.set_destination(dst);
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let mut ip = MutableIpv6Packet::new(&mut buf[ETHERNET_LEN..]).expect("ipv6 buffer");
            ip.set_version(6);
            ip.set_payload_length(transport_len as u16);
            ip.set_next_header(next_header);
            ip.set_hop_limit(64);
            ip.set_source(src);
            ip.set_destination(dst);
        }
        _ => panic!("fixture endpoints must share an address family"),
    }

    let offset = ETHERNET_LEN + ip_len;
    match spec.transport {
        Transport::Tcp => {
            let mut tcp = MutableTcpPacket::new(&mut buf[offset..]).expect("tcp buffer");
            tcp.set_source(spec.src.port());
            tcp.set_destination(spec.dst.port());
            tcp.set_sequence(spec.seq);
            tcp.set_data_offset(5);
            tcp.set_flags(spec.flags.into());
            tcp.set_window(65535);
            tcp.set_payload(&spec.payload);
        }
        Transport::Udp => {
            let mut udp = MutableUdpPacket::new(&mut buf[offset..]).expect("udp buffer");
            udp.set_source(spec.src.port());
            udp.set_destination(spec.dst.port());
            udp.set_length(transport_len as u16);
            udp.set_payload(&spec.payload);
        }
    }

    buf
}
