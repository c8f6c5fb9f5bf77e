use log::{debug, info, warn};
use pcap::{Capture, Device, Linktype};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

use crate::capture::decoder::LinkLayer;
use crate::config::CaptureConfig;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Insufficient privileges to open '{0}'. Try: sudo setcap cap_net_raw,cap_net_admin=eip ./traffic-monitor")]
    InsufficientPrivileges(String),

    #[error("Network interface '{0}' not found. Available interfaces: {1:?}")]
    InterfaceNotFound(String, Vec<String>),

    #[error("Invalid BPF filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Unsupported link type {0}")]
    UnsupportedLinkType(i32),

    #[error("Packet capture failed: {0}")]
    CaptureError(String),

    #[error("Device error: {0}")]
    DeviceError(String),
}

/// A captured frame with its capture timestamp.
#[derive(Debug, Clone)]
pub struct RawPacket {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
    /// Length on the wire; larger than `data.len()` when the snaplen truncated it.
    pub wire_len: usize,
}

impl RawPacket {
    pub fn new(data: Vec<u8>, timestamp: SystemTime) -> Self {
        let wire_len = data.len();
        Self { data, timestamp, wire_len }
    }
}

#[derive(Debug)]
pub enum NextPacket {
    Packet(RawPacket),
    /// The read timeout elapsed with nothing captured.
    Timeout,
    /// The source has no more packets.
    Closed,
}

/// Anything the capture loop can pull frames from.
pub trait PacketSource {
    fn link_layer(&self) -> LinkLayer;

    fn next_packet(&mut self) -> Result<NextPacket, CaptureError>;
}

#[derive(Debug, Default, Clone)]
pub struct NetworkStats {
    pub packets_captured: u64,
    pub bytes_captured: u64,
    pub packets_dropped: u64,
}

pub struct PcapEngine {
    capture: Capture<pcap::Active>,
    interface: String,
    link: LinkLayer,
    stats: NetworkStats,
}

impl PcapEngine {
    pub fn open(config: &CaptureConfig) -> Result<Self, CaptureError> {
        let available_devices = Self::list_devices()?;

        let interface = config.interface.clone().unwrap_or_else(|| {
            available_devices
                .first()
                .map(|d| d.name.clone())
                .unwrap_or_else(|| "any".to_string())
        });

        if !available_devices.iter().any(|d| d.name == interface) && interface != "any" {
            let device_names: Vec<String> = available_devices.iter().map(|d| d.name.clone()).collect();
            return Err(CaptureError::InterfaceNotFound(interface, device_names));
        }

        info!("Opening capture on interface {} (snaplen {})", interface, config.snaplen);

        let device = Device::from(interface.as_str());
        let inactive = Capture::from_device(device)
            .map_err(|e| CaptureError::DeviceError(format!("{}: {}", interface, e)))?;
        let mut capture = inactive
            .promisc(config.promiscuous)
            .snaplen(config.snaplen)
            .timeout(config.timeout_ms)
            .open()
            .map_err(|e| {
                warn!("Failed to open capture device {}: {}", interface, e);
                Self::open_error(&interface, e)
            })?;

        if let Some(filter) = config.filter.as_deref().filter(|f| !f.trim().is_empty()) {
            info!("Setting packet filter to: [ {} ]", filter);
            capture.filter(filter, true).map_err(|e| CaptureError::InvalidFilter {
                filter: filter.to_string(),
                reason: e.to_string(),
            })?;
        }

        let link = Self::link_layer_for(capture.get_datalink())?;
        debug!("Interface {} uses {:?} framing", interface, link);

        Ok(PcapEngine {
            capture,
            interface,
            link,
            stats: NetworkStats::default(),
        })
    }

    pub fn list_devices() -> Result<Vec<Device>, CaptureError> {
        Device::list().map_err(|e| CaptureError::DeviceError(format!("Failed to list devices: {}", e)))
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn get_statistics(&mut self) -> &NetworkStats {
        if let Ok(stat) = self.capture.stats() {
            self.stats.packets_dropped = u64::from(stat.dropped) + u64::from(stat.if_dropped);
        }
        &self.stats
    }

    /// Only permission failures are reported as a privilege problem.
    fn open_error(interface: &str, error: pcap::Error) -> CaptureError {
        let message = error.to_string();
        let lowered = message.to_lowercase();
        if lowered.contains("permission") || lowered.contains("not permitted") {
            CaptureError::InsufficientPrivileges(interface.to_string())
        } else {
            CaptureError::DeviceError(format!("{}: {}", interface, message))
        }
    }

    fn link_layer_for(linktype: Linktype) -> Result<LinkLayer, CaptureError> {
        match linktype.0 {
            1 => Ok(LinkLayer::Ethernet),
            // DLT_RAW has two numbers depending on platform, LINKTYPE_RAW is 101
            12 | 14 | 101 => Ok(LinkLayer::RawIp),
            other => Err(CaptureError::UnsupportedLinkType(other)),
        }
    }

    fn timestamp(header: &pcap::PacketHeader) -> SystemTime {
        let secs = header.ts.tv_sec.max(0) as u64;
        let micros = header.ts.tv_usec.max(0) as u64;
        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros)
    }
}

impl PacketSource for PcapEngine {
    fn link_layer(&self) -> LinkLayer {
        self.link
    }

    fn next_packet(&mut self) -> Result<NextPacket, CaptureError> {
        match self.capture.next_packet() {
            Ok(packet) => {
                self.stats.packets_captured += 1;
                self.stats.bytes_captured += packet.data.len() as u64;

                Ok(NextPacket::Packet(RawPacket {
                    data: packet.data.to_vec(),
                    timestamp: Self::timestamp(packet.header),
                    wire_len: packet.header.len as usize,
                }))
            }
            Err(pcap::Error::TimeoutExpired) => Ok(NextPacket::Timeout),
            Err(pcap::Error::NoMorePackets) => Ok(NextPacket::Closed),
            Err(e) => Err(CaptureError::CaptureError(format!("Packet capture error: {}", e))),
        }
    }
}
