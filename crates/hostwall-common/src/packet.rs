//! Canonical packet view
//!
//! Every stage downstream of the extractor works on [`PacketView`] and
//! [`FiveTuple`]; nothing past the extractor touches raw header offsets.

use crate::ValueError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// IP protocol numbers the engine distinguishes
pub mod ip_proto {
    /// ICMP (IPv4)
    pub const ICMP: u8 = 1;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// ICMPv6
    pub const ICMPV6: u8 = 58;
}

/// Transport protocol of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    /// Transmission Control Protocol
    Tcp,
    /// User Datagram Protocol
    Udp,
    /// ICMP or ICMPv6
    Icmp,
    /// Any other IP protocol number, or 0 when no IP header could be read
    Other(u8),
}

impl Protocol {
    /// Map an IP protocol / IPv6 next-header number
    #[inline]
    pub fn from_ip_number(number: u8) -> Self {
        match number {
            ip_proto::TCP => Self::Tcp,
            ip_proto::UDP => Self::Udp,
            ip_proto::ICMP | ip_proto::ICMPV6 => Self::Icmp,
            other => Self::Other(other),
        }
    }

    /// Whether the protocol carries 16-bit ports
    #[inline]
    pub fn has_ports(&self) -> bool {
        matches!(self, Self::Tcp | Self::Udp)
    }
}

impl Default for Protocol {
    fn default() -> Self {
        Self::Other(0)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "TCP"),
            Self::Udp => write!(f, "UDP"),
            Self::Icmp => write!(f, "ICMP"),
            Self::Other(n) => write!(f, "{}", n),
        }
    }
}

impl FromStr for Protocol {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            "ICMP" | "ICMPV6" => Ok(Self::Icmp),
            other => other
                .parse::<u8>()
                .map(Self::from_ip_number)
                .map_err(|_| ValueError::Protocol(s.to_string())),
        }
    }
}

/// Link-layer framing of captured buffers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    /// Buffer starts at the IP header (netfilter queue payloads)
    #[default]
    Raw,
    /// Ethernet II
    Ethernet,
    /// Linux "cooked" capture (SLL)
    LinuxCooked,
    /// BSD null / loopback
    Null,
}

impl LinkType {
    /// Bytes to skip before the network header
    #[inline]
    pub const fn header_len(&self) -> usize {
        match self {
            Self::Raw => 0,
            Self::Ethernet => 14,
            Self::LinuxCooked => 16,
            Self::Null => 4,
        }
    }
}

impl FromStr for LinkType {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" | "none" | "nfqueue" => Ok(Self::Raw),
            "ethernet" | "en10mb" => Ok(Self::Ethernet),
            "linux_cooked" | "sll" => Ok(Self::LinuxCooked),
            "null" | "loopback" => Ok(Self::Null),
            _ => Err(ValueError::LinkType(s.to_string())),
        }
    }
}

/// Decoded view over one captured packet
///
/// Borrowed from the capture buffer for the duration of one verdict.
/// `payload_offset <= length` always holds; a buffer without a readable IP
/// header yields `Protocol::Other(0)`, no addresses and zero ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketView<'a> {
    /// Captured bytes, link-layer header included
    pub raw: &'a [u8],
    /// Source address, if an IP header was decoded
    pub src_addr: Option<IpAddr>,
    /// Destination address, if an IP header was decoded
    pub dst_addr: Option<IpAddr>,
    /// Source port (0 unless TCP/UDP)
    pub src_port: u16,
    /// Destination port (0 unless TCP/UDP)
    pub dst_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
    /// Offset of the transport payload within `raw`
    pub payload_offset: usize,
    /// Number of captured bytes
    pub length: usize,
}

impl<'a> PacketView<'a> {
    /// View with nothing decoded
    pub fn opaque(raw: &'a [u8]) -> Self {
        Self {
            raw,
            src_addr: None,
            dst_addr: None,
            src_port: 0,
            dst_port: 0,
            protocol: Protocol::default(),
            payload_offset: raw.len(),
            length: raw.len(),
        }
    }

    /// Transport payload (empty when nothing past the headers was captured)
    #[inline]
    pub fn payload(&self) -> &'a [u8] {
        self.raw.get(self.payload_offset..self.length).unwrap_or(&[])
    }

    /// Matching key for the rule engine
    pub fn five_tuple(&self) -> FiveTuple {
        FiveTuple {
            src_ip: self.src_addr,
            src_port: self.src_port,
            dst_ip: self.dst_addr,
            dst_port: self.dst_port,
            protocol: self.protocol,
        }
    }
}

/// Source/destination address and port plus protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FiveTuple {
    /// Source address
    pub src_ip: Option<IpAddr>,
    /// Source port
    pub src_port: u16,
    /// Destination address
    pub dst_ip: Option<IpAddr>,
    /// Destination port
    pub dst_port: u16,
    /// Transport protocol
    pub protocol: Protocol,
}

impl FiveTuple {
    /// Build a tuple from known addresses
    pub fn new(
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: Protocol,
    ) -> Self {
        Self {
            src_ip: Some(src_ip),
            src_port,
            dst_ip: Some(dst_ip),
            dst_port,
            protocol,
        }
    }

    /// Source address as text, empty when unknown
    pub fn src_ip_string(&self) -> String {
        self.src_ip.map(|ip| ip.to_string()).unwrap_or_default()
    }

    /// Destination address as text, empty when unknown
    pub fn dst_ip_string(&self) -> String {
        self.dst_ip.map(|ip| ip.to_string()).unwrap_or_default()
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let src = self.src_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "?".into());
        let dst = self.dst_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "?".into());
        write!(
            f,
            "{}:{} -> {}:{} {}",
            src, self.src_port, dst, self.dst_port, self.protocol
        )
    }
}
