//! DHCP (BOOTP) message parsing
//!
//! Extracts the fields device fingerprinting needs: the message type, the
//! client hardware address, the requested hostname and the option 55
//! parameter request list. The parameter list, in request order, is the
//! classic DHCP device signature.

use anyhow::{bail, Result};

use super::MacAddr;

const BOOTP_MIN_LEN: usize = 240;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPT_PAD: u8 = 0;
const OPT_HOSTNAME: u8 = 12;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_PARAM_REQUEST_LIST: u8 = 55;
const OPT_END: u8 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpInfo {
    /// DHCP message type (1=DISCOVER, 3=REQUEST, ...).
    pub message_type: Option<u8>,
    /// Client hardware address from the BOOTP header.
    pub client_mac: MacAddr,
    /// Option 12 hostname, if present.
    pub hostname: Option<String>,
    /// Option 55 parameter request list, in request order.
    pub param_request_list: Vec<u8>,
}

impl DhcpInfo {
    /// The option-55 signature as a comma-joined string, e.g. "1,3,6,15".
    pub fn fingerprint(&self) -> String {
        self.param_request_list
            .iter()
            .map(u8::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

pub fn parse_dhcp(data: &[u8]) -> Result<DhcpInfo> {
    if data.len() < BOOTP_MIN_LEN {
        bail!("data too short for BOOTP: {} bytes (minimum {})", data.len(), BOOTP_MIN_LEN);
    }
    if data[236..240] != MAGIC_COOKIE {
        bail!("missing DHCP magic cookie");
    }

    let hlen = data[2] as usize;
    if hlen != 6 {
        bail!("unsupported hardware address length: {}", hlen);
    }
    let client_mac = MacAddr::from_slice(&data[28..34])
        .ok_or_else(|| anyhow::anyhow!("failed to parse client hardware address"))?;

    let mut info = DhcpInfo {
        message_type: None,
        client_mac,
        hostname: None,
        param_request_list: Vec::new(),
    };

    let mut offset = BOOTP_MIN_LEN;
    while offset < data.len() {
        let code = data[offset];
        match code {
            OPT_PAD => {
                offset += 1;
                continue;
            }
            OPT_END => break,
            _ => {}
        }

        if offset + 1 >= data.len() {
            bail!("truncated DHCP option header");
        }
        let len = data[offset + 1] as usize;
        let value_end = offset + 2 + len;
        if value_end > data.len() {
            bail!("truncated DHCP option {} value", code);
        }
        let value = &data[offset + 2..value_end];

        match code {
            OPT_MESSAGE_TYPE if len == 1 => info.message_type = Some(value[0]),
            OPT_HOSTNAME => {
                info.hostname = Some(String::from_utf8_lossy(value).into_owned());
            }
            OPT_PARAM_REQUEST_LIST => {
                info.param_request_list = value.to_vec();
            }
            _ => {}
        }
        offset = value_end;
    }

    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bootp_request(options: &[u8]) -> Vec<u8> {
        let mut data = vec![0u8; BOOTP_MIN_LEN];
        data[0] = 1; // BOOTREQUEST
        data[1] = 1; // Ethernet
        data[2] = 6; // hlen
        data[28..34].copy_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        data[236..240].copy_from_slice(&MAGIC_COOKIE);
        data.extend_from_slice(options);
        data
    }

    #[test]
    fn test_parse_discover_with_fingerprint() {
        let options = [
            53, 1, 1, // DISCOVER
            12, 7, b'p', b'r', b'i', b'n', b't', b'e', b'r', // hostname
            55, 4, 1, 3, 6, 15, // parameter request list
            255,
        ];
        let data = bootp_request(&options);

        let info = parse_dhcp(&data).unwrap();
        assert_eq!(info.message_type, Some(1));
        assert_eq!(info.client_mac.to_string(), "00:11:22:33:44:55");
        assert_eq!(info.hostname.as_deref(), Some("printer"));
        assert_eq!(info.param_request_list, vec![1, 3, 6, 15]);
        assert_eq!(info.fingerprint(), "1,3,6,15");
    }

    #[test]
    fn test_pad_options_are_skipped() {
        let options = [0, 0, 53, 1, 3, 0, 255];
        let info = parse_dhcp(&bootp_request(&options)).unwrap();
        assert_eq!(info.message_type, Some(3));
        assert!(info.param_request_list.is_empty());
        assert_eq!(info.fingerprint(), "");
    }

    #[test]
    fn test_missing_cookie() {
        let mut data = vec![0u8; BOOTP_MIN_LEN];
        data[2] = 6;
        assert!(parse_dhcp(&data).is_err());
    }

    #[test]
    fn test_truncated_option() {
        let options = [55, 10, 1, 3]; // claims 10 bytes, has 2
        assert!(parse_dhcp(&bootp_request(&options)).is_err());
    }

    #[test]
    fn test_too_short() {
        assert!(parse_dhcp(&[0u8; 100]).is_err());
    }
}
