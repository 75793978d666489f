//! DNS/mDNS question parsing
//!
//! Reads the header and the first question name. Question sections never
//! use compression pointers, which keeps the label walk simple; a pointer
//! byte ends the name.

use anyhow::{bail, Result};

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsInfo {
    pub transaction_id: u16,
    /// True for responses, false for queries.
    pub is_response: bool,
    /// First question name, dot-joined (empty when there is none).
    pub query: String,
    /// First question record type.
    pub qtype: Option<u16>,
}

pub fn parse_dns(data: &[u8]) -> Result<DnsInfo> {
    if data.len() < HEADER_LEN {
        bail!("data too short for DNS header: {} bytes (minimum {})", data.len(), HEADER_LEN);
    }

    let transaction_id = u16::from_be_bytes([data[0], data[1]]);
    let is_response = data[2] & 0x80 != 0;
    let qdcount = u16::from_be_bytes([data[4], data[5]]);

    let mut info = DnsInfo {
        transaction_id,
        is_response,
        query: String::new(),
        qtype: None,
    };
    if qdcount == 0 {
        return Ok(info);
    }

    let mut labels = Vec::new();
    let mut offset = HEADER_LEN;
    let mut name_len = 0usize;
    loop {
        if offset >= data.len() {
            bail!("truncated DNS question name");
        }
        let len = data[offset] as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        // Compression pointer: not valid in a question name.
        if len & 0xc0 != 0 {
            bail!("unexpected compression pointer in question name");
        }
        if offset + 1 + len > data.len() {
            bail!("truncated DNS label");
        }
        name_len += len + 1;
        if name_len > MAX_NAME_LEN {
            bail!("DNS name exceeds {} bytes", MAX_NAME_LEN);
        }
        labels.push(String::from_utf8_lossy(&data[offset + 1..offset + 1 + len]).into_owned());
        offset += 1 + len;
    }

    info.query = labels.join(".");
    if offset + 2 <= data.len() {
        info.qtype = Some(u16::from_be_bytes([data[offset], data[offset + 1]]));
    }
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let mut data = vec![
            0x12, 0x34, // transaction id
            0x01, 0x00, // standard query, RD
            0x00, 0x01, // one question
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ];
        data.extend_from_slice(b"\x07example\x03com\x00");
        data.extend_from_slice(&[0x00, 0x01, 0x00, 0x01]); // A IN

        let info = parse_dns(&data).unwrap();
        assert_eq!(info.transaction_id, 0x1234);
        assert!(!info.is_response);
        assert_eq!(info.query, "example.com");
        assert_eq!(info.qtype, Some(1));
    }

    #[test]
    fn test_parse_response_flag() {
        let mut data = vec![
            0x00, 0x01,
            0x81, 0x80, // response
            0x00, 0x01,
            0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
        ];
        data.extend_from_slice(b"\x04test\x05local\x00");
        data.extend_from_slice(&[0x00, 0x0c, 0x00, 0x01]);

        let info = parse_dns(&data).unwrap();
        assert!(info.is_response);
        assert_eq!(info.query, "test.local");
        assert_eq!(info.qtype, Some(12));
    }

    #[test]
    fn test_no_questions() {
        let data = vec![0u8; HEADER_LEN];
        let info = parse_dns(&data).unwrap();
        assert!(info.query.is_empty());
        assert!(info.qtype.is_none());
    }

    #[test]
    fn test_truncated_label() {
        let mut data = vec![0u8; HEADER_LEN];
        data[5] = 1; // one question
        data.extend_from_slice(&[0x20]); // label claims 32 bytes, has none
        assert!(parse_dns(&data).is_err());
    }

    #[test]
    fn test_too_short() {
        assert!(parse_dns(&[0u8; 4]).is_err());
    }
}
