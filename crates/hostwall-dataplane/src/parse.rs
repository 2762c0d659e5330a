//! Protocol Extractor
//!
//! Decodes link, IP and transport headers out of attacker-controlled bytes.
//! Every read goes through `get`; a header that does not fit degrades the
//! view instead of failing:
//!
//! - no readable IP header: `Other(0)`, no addresses, zero ports
//! - IP header present, transport header short: `Other(proto)`, zero ports,
//!   empty payload
//! - non-first fragment: `Other(proto)`, empty payload
//! - unwalked IPv6 extension header: `Other(proto)`, payload after the IP header

use hostwall_common::packet::ip_proto;
use hostwall_common::{LinkType, PacketView, Protocol};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;
const VLAN_TAG_LEN: usize = 4;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;
const ICMP_HEADER: usize = 8;

#[inline]
fn read_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset.checked_add(2)?)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

/// Offset of the network header for this framing
fn network_offset(raw: &[u8], link: LinkType) -> Option<usize> {
    let mut offset = link.header_len();
    if link == LinkType::Ethernet {
        // 802.1Q / 802.1ad tags sit between the MACs and the ethertype
        let mut ethertype_at = 12;
        while matches!(read_u16(raw, ethertype_at)?, ETHERTYPE_VLAN | ETHERTYPE_QINQ) {
            ethertype_at += VLAN_TAG_LEN;
            offset += VLAN_TAG_LEN;
        }
    }
    (offset <= raw.len()).then_some(offset)
}

/// Decode `raw` captured with the given link-layer framing
pub fn extract(raw: &[u8], link: LinkType) -> PacketView<'_> {
    let Some(l3) = network_offset(raw, link) else {
        return PacketView::opaque(raw);
    };

    match raw.get(l3).map(|b| b >> 4) {
        Some(4) => extract_ipv4(raw, l3),
        Some(6) => extract_ipv6(raw, l3),
        _ => PacketView::opaque(raw),
    }
}

fn extract_ipv4(raw: &[u8], l3: usize) -> PacketView<'_> {
    let Some(header) = raw.get(l3..l3 + IPV4_MIN_HEADER) else {
        return PacketView::opaque(raw);
    };

    let ihl = usize::from(header[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HEADER || l3 + ihl > raw.len() {
        return PacketView::opaque(raw);
    }

    let protocol = header[9];
    let src = Ipv4Addr::new(header[12], header[13], header[14], header[15]);
    let dst = Ipv4Addr::new(header[16], header[17], header[18], header[19]);
    let fragment_offset = u16::from_be_bytes([header[6], header[7]]) & 0x1fff;

    let mut view = PacketView {
        raw,
        src_addr: Some(IpAddr::V4(src)),
        dst_addr: Some(IpAddr::V4(dst)),
        src_port: 0,
        dst_port: 0,
        protocol: Protocol::Other(protocol),
        payload_offset: l3 + ihl,
        length: raw.len(),
    };

    if fragment_offset != 0 {
        // Transport header is in the first fragment only
        view.payload_offset = view.length;
        return view;
    }

    transport(&mut view, protocol, l3 + ihl);
    view
}

fn extract_ipv6(raw: &[u8], l3: usize) -> PacketView<'_> {
    let Some(header) = raw.get(l3..l3 + IPV6_HEADER) else {
        return PacketView::opaque(raw);
    };

    let next_header = header[6];
    let mut src = [0u8; 16];
    let mut dst = [0u8; 16];
    src.copy_from_slice(&header[8..24]);
    dst.copy_from_slice(&header[24..40]);

    let mut view = PacketView {
        raw,
        src_addr: Some(IpAddr::V6(Ipv6Addr::from(src))),
        dst_addr: Some(IpAddr::V6(Ipv6Addr::from(dst))),
        src_port: 0,
        dst_port: 0,
        protocol: Protocol::Other(next_header),
        payload_offset: l3 + IPV6_HEADER,
        length: raw.len(),
    };

    transport(&mut view, next_header, l3 + IPV6_HEADER);
    view
}

/// Fill ports, protocol and payload offset from the transport header at `l4`.
///
/// A known transport header that does not fit leaves no payload, so header
/// bytes never reach signature matching.
fn transport(view: &mut PacketView<'_>, protocol: u8, l4: usize) {
    if !decode_transport(view, protocol, l4) {
        view.payload_offset = view.length;
    }
}

fn decode_transport(view: &mut PacketView<'_>, protocol: u8, l4: usize) -> bool {
    let raw = view.raw;

    match protocol {
        ip_proto::TCP => {
            let Some(header) = raw.get(l4..l4 + TCP_MIN_HEADER) else {
                return false;
            };
            let data_offset = usize::from(header[12] >> 4) * 4;
            if data_offset < TCP_MIN_HEADER || l4 + data_offset > raw.len() {
                return false;
            }
            view.src_port = u16::from_be_bytes([header[0], header[1]]);
            view.dst_port = u16::from_be_bytes([header[2], header[3]]);
            view.protocol = Protocol::Tcp;
            view.payload_offset = l4 + data_offset;
            true
        }
        ip_proto::UDP => {
            let Some(header) = raw.get(l4..l4 + UDP_HEADER) else {
                return false;
            };
            view.src_port = u16::from_be_bytes([header[0], header[1]]);
            view.dst_port = u16::from_be_bytes([header[2], header[3]]);
            view.protocol = Protocol::Udp;
            view.payload_offset = l4 + UDP_HEADER;
            true
        }
        ip_proto::ICMP | ip_proto::ICMPV6 => {
            if l4 + ICMP_HEADER > raw.len() {
                return false;
            }
            view.protocol = Protocol::Icmp;
            view.payload_offset = l4 + ICMP_HEADER;
            true
        }
        _ => true,
    }
}
