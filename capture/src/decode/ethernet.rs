//! Ethernet and 802.1Q/802.1ad header parsing

use anyhow::{bail, Result};

use super::MacAddr;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;
pub const ETHERTYPE_VLAN: u16 = 0x8100; // 802.1Q
pub const ETHERTYPE_QINQ: u16 = 0x88A8; // 802.1ad outer tag
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// Minimum Ethernet frame size (without preamble/FCS)
pub const MIN_FRAME_SIZE: usize = 14;

/// Parsed Ethernet header, VLAN tags folded in.
#[derive(Debug, Clone)]
pub struct EthernetInfo {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    /// EtherType of the innermost payload.
    pub ethertype: u16,
    /// Innermost VLAN id when tagged (802.1Q, or the customer tag of a
    /// QinQ pair).
    pub vlan_id: Option<u16>,
    /// Offset of the payload after all tags.
    pub header_len: usize,
}

pub fn parse_ethernet(data: &[u8]) -> Result<EthernetInfo> {
    if data.len() < MIN_FRAME_SIZE {
        bail!("frame too short: {} bytes (minimum {})", data.len(), MIN_FRAME_SIZE);
    }

    let dst_mac = MacAddr::from_slice(&data[0..6])
        .ok_or_else(|| anyhow::anyhow!("failed to parse destination MAC"))?;
    let src_mac = MacAddr::from_slice(&data[6..12])
        .ok_or_else(|| anyhow::anyhow!("failed to parse source MAC"))?;
    let mut ethertype = u16::from_be_bytes([data[12], data[13]]);
    let mut offset = MIN_FRAME_SIZE;
    let mut vlan_id = None;

    // Unwind up to two tag layers (QinQ outer + inner, or a single 1Q tag).
    for _ in 0..2 {
        if ethertype != ETHERTYPE_VLAN && ethertype != ETHERTYPE_QINQ {
            break;
        }
        if data.len() < offset + 4 {
            bail!("frame too short for VLAN tag");
        }
        let tci = u16::from_be_bytes([data[offset], data[offset + 1]]);
        vlan_id = Some(tci & 0x0fff);
        ethertype = u16::from_be_bytes([data[offset + 2], data[offset + 3]]);
        offset += 4;
    }

    Ok(EthernetInfo {
        dst_mac,
        src_mac,
        ethertype,
        vlan_id,
        header_len: offset,
    })
}
