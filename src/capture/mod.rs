pub mod decoder;
pub mod pcap_engine;

#[cfg(test)]
pub(crate) mod fixtures;

pub use decoder::{
    DecodeError, DecodedPacket, FieldExtractor, LinkLayer, NetworkLayer, TcpFlags, TcpSegment,
    TransportLayer, UdpDatagram,
};
pub use pcap_engine::{CaptureError, NetworkStats, NextPacket, PacketSource, PcapEngine, RawPacket};
