//! In-memory authoritative state
//!
//! All maps are owned by the supervisor and mutated only on the runtime
//! thread; the SQLite mirrors in [`crate::db`] are written before the
//! in-memory commit so a failed write leaves the maps untouched.

pub mod bridge;

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub use bridge::BridgeGraph;

/// Maximum stored PSK length in bytes (WPA2 passphrase bound).
pub const MAX_PSK_LEN: usize = 64;

/// Maximum device label length.
pub const MAX_LABEL_LEN: usize = 32;

/// Valid 802.1Q VLAN identifier range.
pub fn valid_vlan_id(vlan_id: u16) -> bool {
    (1..=4094).contains(&vlan_id)
}

/// MAC address wrapper for use as a map key
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
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

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Parse the identity forms peers put on the wire: `aa:bb:cc:dd:ee:ff`,
    /// `AA-BB-CC-DD-EE-FF` (Calling-Station-Id) and `aabbccddeeff`
    /// (hostapd RADIUS User-Name).
    pub fn parse_flexible(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.contains(':') || s.contains('-') {
            let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
            if parts.len() != 6 {
                return None;
            }
            let mut bytes = [0u8; 6];
            for (i, part) in parts.iter().enumerate() {
                if part.len() != 2 {
                    return None;
                }
                bytes[i] = u8::from_str_radix(part, 16).ok()?;
            }
            Some(Self(bytes))
        } else if s.len() == 12 {
            let mut bytes = [0u8; 6];
            for (i, byte) in bytes.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16).ok()?;
            }
            Some(Self(bytes))
        } else {
            None
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == [0xff; 6]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }
}

impl FromStr for MacAddr {
    type Err = ();

    /// Strict colon-separated form used by the command language.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 6 {
            return Err(());
        }
        let mut bytes = [0u8; 6];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || part.len() > 2 {
                return Err(());
            }
            bytes[i] = u8::from_str_radix(part, 16).map_err(|_| ())?;
        }
        Ok(Self(bytes))
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

impl Serialize for MacAddr {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|_| serde::de::Error::custom("invalid MAC address"))
    }
}

/// Per-device connection record, keyed by MAC
#[derive(Debug, Clone)]
pub struct MacConn {
    pub mac: MacAddr,

    /// Whether the device may associate.
    pub allow_connection: bool,

    /// Assigned VLAN; must name a key in the VLAN map.
    pub vlan_id: u16,

    /// Whether the device's traffic is NATed to the upstream interface.
    pub nat: bool,

    /// DHCP-assigned address, if any. When set, `ifname` is the interface
    /// whose configured subnet contains it.
    pub ip_addr: Option<Ipv4Addr>,

    /// Interface serving the device's VLAN.
    pub ifname: String,

    /// Device PSK (plaintext in memory, encrypted at rest).
    pub psk: Vec<u8>,

    /// Operator-assigned device label.
    pub label: String,

    /// Last join time, microseconds since epoch.
    pub join_timestamp: i64,

    /// Credential-store key id for this device's PSK.
    pub key_id: String,
}

impl MacConn {
    pub fn new(mac: MacAddr, vlan_id: u16, nat: bool) -> Self {
        Self {
            mac,
            allow_connection: false,
            vlan_id,
            nat,
            ip_addr: None,
            ifname: String::new(),
            psk: Vec::new(),
            label: String::new(),
            join_timestamp: 0,
            key_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn set_psk(&mut self, psk: &[u8]) {
        self.psk = psk[..psk.len().min(MAX_PSK_LEN)].to_vec();
    }

    pub fn set_label(&mut self, label: &str) {
        let mut label = label.to_string();
        label.truncate(MAX_LABEL_LEN);
        self.label = label;
    }
}

impl fmt::Display for MacConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "mac={} allow={} vlan={} nat={} ip={} if={} label={} joined={}",
            self.mac,
            self.allow_connection,
            self.vlan_id,
            self.nat,
            self.ip_addr
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string()),
            if self.ifname.is_empty() { "-" } else { &self.ifname },
            if self.label.is_empty() { "-" } else { &self.label },
            self.join_timestamp,
        )
    }
}

/// Per-VLAN runtime state
#[derive(Debug, Clone)]
pub struct VlanConn {
    pub vlan_id: u16,
    pub ifname: String,

    /// Pid of the live capture worker, if one is running for this VLAN.
    pub analyser_pid: Option<u32>,
}

/// Immutable per-interface tuple loaded from the configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct IfaceConfig {
    pub vlanid: u16,
    pub ifname: String,
    pub ip: Ipv4Addr,
    pub brd: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

/// Derived map from network address (ip & netmask) to interface name.
#[derive(Debug, Clone, Default)]
pub struct SubnetIndex {
    entries: Vec<(u32, u32, String)>,
}

impl SubnetIndex {
    pub fn build(ifaces: &[IfaceConfig]) -> Self {
        let entries = ifaces
            .iter()
            .map(|i| {
                let mask = u32::from(i.netmask);
                (u32::from(i.ip) & mask, mask, i.ifname.clone())
            })
            .collect();
        Self { entries }
    }

    pub fn ifname_for(&self, ip: Ipv4Addr) -> Option<&str> {
        let ip = u32::from(ip);
        self.entries
            .iter()
            .find(|(net, mask, _)| ip & mask == *net)
            .map(|(_, _, ifname)| ifname.as_str())
    }
}

/// A computed RADIUS attribute chain: (attribute type, raw value) pairs in
/// emission order. Memoized so retransmissions get byte-identical replies.
pub type AttrChain = Vec<(u8, Vec<u8>)>;

/// The supervisor's in-memory maps.
#[derive(Debug, Default)]
pub struct StateStore {
    pub mac_conns: HashMap<MacAddr, MacConn>,
    pub vlans: HashMap<u16, VlanConn>,
    pub subnets: SubnetIndex,
    pub bridges: BridgeGraph,
    attr_cache: HashMap<MacAddr, AttrChain>,
}

impl StateStore {
    pub fn new(ifaces: &[IfaceConfig]) -> Self {
        let mut vlans = HashMap::new();
        for iface in ifaces {
            vlans.insert(
                iface.vlanid,
                VlanConn {
                    vlan_id: iface.vlanid,
                    ifname: iface.ifname.clone(),
                    analyser_pid: None,
                },
            );
        }
        Self {
            mac_conns: HashMap::new(),
            vlans,
            subnets: SubnetIndex::build(ifaces),
            bridges: BridgeGraph::default(),
            attr_cache: HashMap::new(),
        }
    }

    pub fn cached_attrs(&self, mac: &MacAddr) -> Option<&AttrChain> {
        self.attr_cache.get(mac)
    }

    pub fn cache_attrs(&mut self, mac: MacAddr, chain: AttrChain) {
        self.attr_cache.insert(mac, chain);
    }

    /// Drop the memoized attribute chain after a credential change.
    pub fn invalidate_attrs(&mut self, mac: &MacAddr) {
        self.attr_cache.remove(mac);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_addr_parse_and_format() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");

        assert!("aa:bb:cc:dd:ee:".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!("zz:bb:cc:dd:ee:ff".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_addr_flexible_forms() {
        let expected = MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(MacAddr::parse_flexible("aa:bb:cc:dd:ee:ff"), Some(expected));
        assert_eq!(MacAddr::parse_flexible("AA-BB-CC-DD-EE-FF"), Some(expected));
        assert_eq!(MacAddr::parse_flexible("aabbccddeeff"), Some(expected));
        assert_eq!(MacAddr::parse_flexible("aabbccddee"), None);
        assert_eq!(MacAddr::parse_flexible("aa:bb:cc:dd:ee"), None);
    }

    #[test]
    fn test_subnet_index_lookup() {
        let ifaces = vec![
            IfaceConfig {
                vlanid: 3,
                ifname: "if3".to_string(),
                ip: "10.0.3.1".parse().unwrap(),
                brd: "10.0.3.255".parse().unwrap(),
                netmask: "255.255.255.0".parse().unwrap(),
            },
            IfaceConfig {
                vlanid: 7,
                ifname: "if7".to_string(),
                ip: "10.0.7.1".parse().unwrap(),
                brd: "10.0.7.255".parse().unwrap(),
                netmask: "255.255.255.0".parse().unwrap(),
            },
        ];
        let index = SubnetIndex::build(&ifaces);

        assert_eq!(index.ifname_for("10.0.3.7".parse().unwrap()), Some("if3"));
        assert_eq!(index.ifname_for("10.0.7.200".parse().unwrap()), Some("if7"));
        assert_eq!(index.ifname_for("192.168.1.1".parse().unwrap()), None);
    }

    #[test]
    fn test_mac_conn_display_fields() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let mut conn = MacConn::new(mac, 3, false);
        conn.allow_connection = true;
        conn.set_label("guest");

        let row = conn.to_string();
        assert!(row.contains("aa:bb:cc:dd:ee:ff"));
        assert!(row.contains("vlan=3"));
        assert!(row.contains("label=guest"));
    }

    #[test]
    fn test_psk_and_label_bounds() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let mut conn = MacConn::new(mac, 1, false);

        conn.set_psk(&[0x41; 100]);
        assert_eq!(conn.psk.len(), MAX_PSK_LEN);

        conn.set_label(&"x".repeat(100));
        assert_eq!(conn.label.len(), MAX_LABEL_LEN);
    }

    #[test]
    fn test_vlan_id_range() {
        assert!(!valid_vlan_id(0));
        assert!(valid_vlan_id(1));
        assert!(valid_vlan_id(4094));
        assert!(!valid_vlan_id(4095));
    }

    #[test]
    fn test_state_store_vlan_map() {
        let ifaces = vec![IfaceConfig {
            vlanid: 3,
            ifname: "if3".to_string(),
            ip: "10.0.3.1".parse().unwrap(),
            brd: "10.0.3.255".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        }];
        let state = StateStore::new(&ifaces);

        assert_eq!(state.vlans.get(&3).unwrap().ifname, "if3");
        assert!(state.vlans.get(&3).unwrap().analyser_pid.is_none());
        assert!(state.vlans.get(&4).is_none());
    }
}
