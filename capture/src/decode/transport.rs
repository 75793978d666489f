//! Transport layer (TCP/UDP) parsing

use anyhow::{bail, Result};

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_ICMPV6: u8 = 58;

#[derive(Debug, Clone)]
pub struct TcpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub flags: u8,
    pub header_len: usize,
}

#[derive(Debug, Clone)]
pub struct UdpInfo {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
}

pub fn parse_tcp(data: &[u8]) -> Result<TcpInfo> {
    if data.len() < 20 {
        bail!("data too short for TCP header: {} bytes (minimum 20)", data.len());
    }

    let header_len = (((data[12] >> 4) & 0x0f) as usize) * 4;
    if header_len < 20 {
        bail!("invalid TCP data offset: {} (minimum 20)", header_len);
    }

    Ok(TcpInfo {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        flags: data[13],
        header_len,
    })
}

pub fn parse_udp(data: &[u8]) -> Result<UdpInfo> {
    if data.len() < 8 {
        bail!("data too short for UDP header: {} bytes (minimum 8)", data.len());
    }

    Ok(UdpInfo {
        src_port: u16::from_be_bytes([data[0], data[1]]),
        dst_port: u16::from_be_bytes([data[2], data[3]]),
        length: u16::from_be_bytes([data[4], data[5]]),
    })
}
