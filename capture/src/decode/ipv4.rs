//! IPv4 header parsing

use std::net::Ipv4Addr;

use anyhow::{bail, Result};

/// Parsed IPv4 information
#[derive(Debug, Clone)]
pub struct Ipv4Info {
    /// Header length in bytes
    pub header_len: usize,
    /// Total length of the IP packet
    pub total_length: u16,
    /// Time To Live
    pub ttl: u8,
    /// Protocol number (6=TCP, 17=UDP, 1=ICMP, etc.)
    pub protocol: u8,
    /// Source IP address
    pub src_ip: Ipv4Addr,
    /// Destination IP address
    pub dst_ip: Ipv4Addr,
}

pub fn parse_ipv4(data: &[u8]) -> Result<Ipv4Info> {
    if data.len() < 20 {
        bail!("data too short for IPv4 header: {} bytes (minimum 20)", data.len());
    }

    let version = (data[0] >> 4) & 0x0f;
    if version != 4 {
        bail!("invalid IP version: {} (expected 4)", version);
    }

    let ihl = (data[0] & 0x0f) as usize;
    let header_len = ihl * 4;
    if header_len < 20 {
        bail!("invalid IHL: {} (minimum 5)", ihl);
    }
    if data.len() < header_len {
        bail!(
            "data too short for IPv4 header with options: {} bytes (need {})",
            data.len(),
            header_len
        );
    }

    Ok(Ipv4Info {
        header_len,
        total_length: u16::from_be_bytes([data[2], data[3]]),
        ttl: data[8],
        protocol: data[9],
        src_ip: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
        dst_ip: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4_header() {
        let data = vec![
            0x45, 0x00, // Version + IHL, DSCP + ECN
            0x00, 0x28, // Total length (40 bytes)
            0x00, 0x01, // Identification
            0x40, 0x00, // Flags + Fragment offset
            0x40, 0x06, // TTL (64) + Protocol (TCP)
            0x00, 0x00, // Header checksum
            0xc0, 0xa8, 0x01, 0x01, // Source: 192.168.1.1
            0xc0, 0xa8, 0x01, 0x02, // Destination: 192.168.1.2
        ];

        let info = parse_ipv4(&data).unwrap();
        assert_eq!(info.header_len, 20);
        assert_eq!(info.total_length, 40);
        assert_eq!(info.ttl, 64);
        assert_eq!(info.protocol, 6);
        assert_eq!(info.src_ip.to_string(), "192.168.1.1");
        assert_eq!(info.dst_ip.to_string(), "192.168.1.2");
    }

    #[test]
    fn test_parse_ipv4_with_options() {
        let data = vec![
            0x46, 0x00, // Version + IHL=6 (24 bytes)
            0x00, 0x2c, 0x00, 0x01, 0x40, 0x00,
            0x40, 0x11, 0x00, 0x00,
            0x0a, 0x00, 0x00, 0x01,
            0x0a, 0x00, 0x00, 0x02,
            0x00, 0x00, 0x00, 0x00, // Options
        ];

        let info = parse_ipv4(&data).unwrap();
        assert_eq!(info.header_len, 24);
        assert_eq!(info.protocol, 17);
    }

    #[test]
    fn test_invalid_version() {
        let mut data = vec![0u8; 20];
        data[0] = 0x65;
        assert!(parse_ipv4(&data).is_err());
    }

    #[test]
    fn test_too_short() {
        assert!(parse_ipv4(&[0x45, 0x00]).is_err());
    }
}
