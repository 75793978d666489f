//! IPv6 fixed header parsing

use std::net::Ipv6Addr;

use anyhow::{bail, Result};

/// IPv6 fixed header length.
pub const HEADER_LEN: usize = 40;

#[derive(Debug, Clone)]
pub struct Ipv6Info {
    pub payload_length: u16,
    /// Next-header value; extension headers are not unwound.
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_ip: Ipv6Addr,
    pub dst_ip: Ipv6Addr,
}

pub fn parse_ipv6(data: &[u8]) -> Result<Ipv6Info> {
    if data.len() < HEADER_LEN {
        bail!(
            "data too short for IPv6 header: {} bytes (minimum {})",
            data.len(),
            HEADER_LEN
        );
    }

    let version = (data[0] >> 4) & 0x0f;
    if version != 6 {
        bail!("invalid IP version: {} (expected 6)", version);
    }

    let mut src = [0u8; 16];
    src.copy_from_slice(&data[8..24]);
    let mut dst = [0u8; 16];
    dst.copy_from_slice(&data[24..40]);

    Ok(Ipv6Info {
        payload_length: u16::from_be_bytes([data[4], data[5]]),
        next_header: data[6],
        hop_limit: data[7],
        src_ip: Ipv6Addr::from(src),
        dst_ip: Ipv6Addr::from(dst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv6_header() {
        let mut data = vec![0u8; HEADER_LEN];
        data[0] = 0x60; // version 6
        data[4] = 0x00;
        data[5] = 0x10; // payload length 16
        data[6] = 17; // UDP
        data[7] = 64; // hop limit
        data[23] = 0x01; // src ::1
        data[39] = 0x02; // dst ::2

        let info = parse_ipv6(&data).unwrap();
        assert_eq!(info.payload_length, 16);
        assert_eq!(info.next_header, 17);
        assert_eq!(info.hop_limit, 64);
        assert_eq!(info.src_ip.to_string(), "::1");
        assert_eq!(info.dst_ip.to_string(), "::2");
    }

    #[test]
    fn test_wrong_version() {
        let mut data = vec![0u8; HEADER_LEN];
        data[0] = 0x40;
        assert!(parse_ipv6(&data).is_err());
    }

    #[test]
    fn test_too_short() {
        assert!(parse_ipv6(&[0x60; 20]).is_err());
    }
}
