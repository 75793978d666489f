//! Frame decoding
//!
//! Byte-slice parsers for the layers the worker cares about. Decoding
//! produces a per-packet [`PacketSummary`]: addressing for the capture
//! filter, a protocol tag list for the metadata rows, and the DHCP/DNS
//! payload details the fingerprint reports are built from.

pub mod dhcp;
pub mod dns;
pub mod ethernet;
pub mod ipv4;
pub mod ipv6;
pub mod transport;

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Result;

pub use dhcp::DhcpInfo;
pub use dns::DnsInfo;

/// MAC address (6 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() == 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(slice);
            Some(Self(bytes))
        } else {
            None
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return None;
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16).ok()?;
        }
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({})", self)
    }
}

/// Protocol tags in decode order, e.g. `["eth", "ip4", "udp", "dhcp"]`.
pub type LayerTags = Vec<&'static str>;

/// Everything the worker extracts from one frame.
#[derive(Debug, Clone)]
pub struct PacketSummary {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub ethertype: u16,
    pub vlan_id: Option<u16>,
    pub layers: LayerTags,
    pub src_ip: Option<Ipv4Addr>,
    pub dst_ip: Option<Ipv4Addr>,
    pub src_ip6: Option<Ipv6Addr>,
    pub dst_ip6: Option<Ipv6Addr>,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
    pub dhcp: Option<DhcpInfo>,
    pub dns: Option<DnsInfo>,
}

impl PacketSummary {
    pub fn layer_path(&self) -> String {
        self.layers.join(",")
    }
}

/// Decode a raw Ethernet frame into its summary.
pub fn parse_packet(data: &[u8]) -> Result<PacketSummary> {
    let eth = ethernet::parse_ethernet(data)?;

    let mut summary = PacketSummary {
        src_mac: eth.src_mac,
        dst_mac: eth.dst_mac,
        ethertype: eth.ethertype,
        vlan_id: eth.vlan_id,
        layers: vec!["eth"],
        src_ip: None,
        dst_ip: None,
        src_ip6: None,
        dst_ip6: None,
        src_port: None,
        dst_port: None,
        dhcp: None,
        dns: None,
    };
    if eth.vlan_id.is_some() {
        summary.layers.push("vlan");
    }

    let payload = &data[eth.header_len..];
    match eth.ethertype {
        ethernet::ETHERTYPE_ARP => {
            summary.layers.push("arp");
        }
        ethernet::ETHERTYPE_IPV4 => {
            if let Ok(ip) = ipv4::parse_ipv4(payload) {
                summary.layers.push("ip4");
                summary.src_ip = Some(ip.src_ip);
                summary.dst_ip = Some(ip.dst_ip);
                decode_transport(&mut summary, ip.protocol, &payload[ip.header_len..]);
            }
        }
        ethernet::ETHERTYPE_IPV6 => {
            if let Ok(ip) = ipv6::parse_ipv6(payload) {
                summary.layers.push("ip6");
                summary.src_ip6 = Some(ip.src_ip);
                summary.dst_ip6 = Some(ip.dst_ip);
                decode_transport(&mut summary, ip.next_header, &payload[ipv6::HEADER_LEN..]);
            }
        }
        _ => {}
    }

    Ok(summary)
}

fn decode_transport(summary: &mut PacketSummary, protocol: u8, data: &[u8]) {
    match protocol {
        transport::PROTO_TCP => {
            if let Ok(tcp) = transport::parse_tcp(data) {
                summary.layers.push("tcp");
                summary.src_port = Some(tcp.src_port);
                summary.dst_port = Some(tcp.dst_port);
            }
        }
        transport::PROTO_UDP => {
            if let Ok(udp) = transport::parse_udp(data) {
                summary.layers.push("udp");
                summary.src_port = Some(udp.src_port);
                summary.dst_port = Some(udp.dst_port);
                decode_udp_payload(summary, udp.src_port, udp.dst_port, &data[8..]);
            }
        }
        transport::PROTO_ICMP => {
            summary.layers.push("icmp4");
        }
        transport::PROTO_ICMPV6 => {
            summary.layers.push("icmp6");
        }
        _ => {}
    }
}

fn decode_udp_payload(summary: &mut PacketSummary, src_port: u16, dst_port: u16, data: &[u8]) {
    const DHCP_SERVER: u16 = 67;
    const DHCP_CLIENT: u16 = 68;
    const DNS: u16 = 53;
    const MDNS: u16 = 5353;

    if (src_port == DHCP_CLIENT && dst_port == DHCP_SERVER)
        || (src_port == DHCP_SERVER && dst_port == DHCP_CLIENT)
    {
        if let Ok(info) = dhcp::parse_dhcp(data) {
            summary.layers.push("dhcp");
            summary.dhcp = Some(info);
        }
    } else if src_port == DNS || dst_port == DNS {
        if let Ok(info) = dns::parse_dns(data) {
            summary.layers.push("dns");
            summary.dns = Some(info);
        }
    } else if src_port == MDNS || dst_port == MDNS {
        if let Ok(info) = dns::parse_dns(data) {
            summary.layers.push("mdns");
            summary.dns = Some(info);
        }
    }
}
