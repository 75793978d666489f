//! Configuration module for the EDGESec supervisor

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::radius::eap::{EapConfig, EapMethod};
use crate::state::{valid_vlan_id, IfaceConfig, MacAddr};

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub system: SystemConfig,
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub nat: NatConfig,
    pub ap: ApConfig,
    #[serde(default)]
    pub radius: RadiusConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub ticket: TicketConfig,
    #[serde(default)]
    pub dhcp: DhcpConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub interfaces: Vec<IfaceConfig>,
    #[serde(default)]
    pub connections: Vec<ConnectionSeed>,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// System-wide policy flags
#[derive(Debug, Clone, Deserialize)]
pub struct SystemConfig {
    /// Allow every station onto the default open VLAN.
    #[serde(default)]
    pub allow_all_connections: bool,

    /// VLAN used for stations without an assignment.
    #[serde(default = "default_open_vlanid")]
    pub default_open_vlanid: u16,

    /// Default NAT flag for newly created device records.
    #[serde(default)]
    pub allow_all_nat: bool,

    /// Spawn a capture worker per active VLAN.
    #[serde(default)]
    pub exec_capture: bool,

    /// Whether this process starts the collaborating daemons or only
    /// signals already-running ones.
    #[serde(default)]
    pub exec_ap: bool,
    #[serde(default = "default_true")]
    pub exec_radius: bool,
    #[serde(default)]
    pub exec_dhcp: bool,

    /// Take over from a running supervisor instead of refusing to start.
    #[serde(default)]
    pub kill_running_process: bool,

    #[serde(default = "default_pid_file")]
    pub pid_file_path: PathBuf,
}

/// Command socket settings
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Filesystem path of the operator/hook command socket.
    pub domain_server_path: PathBuf,
}

/// NAT / netfilter settings
#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    #[serde(default)]
    pub nat_interface: String,

    /// Disable to track rules without programming the kernel.
    #[serde(default = "default_true")]
    pub exec_netfilter: bool,
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            nat_interface: String::new(),
            exec_netfilter: true,
        }
    }
}

/// Access-point daemon settings
#[derive(Debug, Clone, Deserialize)]
pub struct ApConfig {
    #[serde(default)]
    pub ssid: String,

    /// Open-VLAN passphrase handed to unassigned stations.
    #[serde(default)]
    pub wpa_passphrase: String,

    #[serde(default)]
    pub interface: String,

    /// Control socket of the AP daemon.
    pub ctrl_interface_path: PathBuf,

    /// Bound on one command round-trip.
    #[serde(default = "default_ap_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Probe interval for the AP liveness timer.
    #[serde(default = "default_ap_ping_secs")]
    pub ping_interval_secs: u64,
}

/// RADIUS server settings
#[derive(Debug, Clone, Deserialize)]
pub struct RadiusConfig {
    #[serde(default = "default_radius_port")]
    pub port: u16,

    #[serde(default = "default_localhost")]
    pub client_ip: Ipv4Addr,

    #[serde(default = "default_client_mask")]
    pub client_mask: u8,

    #[serde(default)]
    pub secret: String,

    #[serde(default)]
    pub eap: EapSection,
}

impl Default for RadiusConfig {
    fn default() -> Self {
        Self {
            port: default_radius_port(),
            client_ip: default_localhost(),
            client_mask: default_client_mask(),
            secret: String::new(),
            eap: EapSection::default(),
        }
    }
}

/// EAP sub-section of the radius settings.
#[derive(Debug, Clone, Deserialize)]
pub struct EapSection {
    #[serde(default = "default_eap_methods")]
    pub methods: Vec<EapMethod>,

    #[serde(default)]
    pub ca_cert: Option<PathBuf>,
    #[serde(default)]
    pub server_cert: Option<PathBuf>,
    #[serde(default)]
    pub server_key: Option<PathBuf>,
    #[serde(default)]
    pub dh_params: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub disable_tlsv13: bool,
}

impl Default for EapSection {
    fn default() -> Self {
        Self {
            methods: default_eap_methods(),
            ca_cert: None,
            server_cert: None,
            server_key: None,
            dh_params: None,
            disable_tlsv13: true,
        }
    }
}

impl EapSection {
    pub fn to_eap_config(&self) -> EapConfig {
        EapConfig {
            methods: self.methods.clone(),
            ca_cert: self.ca_cert.clone(),
            server_cert: self.server_cert.clone(),
            server_key: self.server_key.clone(),
            dh_params: self.dh_params.clone(),
            disable_tlsv13: self.disable_tlsv13,
            ..EapConfig::default()
        }
    }
}

/// Database settings
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub path: PathBuf,
}

/// Auth ticket settings
#[derive(Debug, Clone, Deserialize)]
pub struct TicketConfig {
    #[serde(default = "default_ticket_ttl")]
    pub ttl_secs: u64,

    #[serde(default = "default_ticket_passphrase_len")]
    pub passphrase_len: usize,
}

impl Default for TicketConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ticket_ttl(),
            passphrase_len: default_ticket_passphrase_len(),
        }
    }
}

/// One DHCP address range: VLAN plus its pool and lease time.
#[derive(Debug, Clone, Deserialize)]
pub struct DhcpRange {
    pub vlanid: u16,
    pub ip_low: Ipv4Addr,
    pub ip_high: Ipv4Addr,
    pub netmask: Ipv4Addr,
    #[serde(default = "default_lease_time")]
    pub lease_time: String,
}

/// DHCP daemon integration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct DhcpConfig {
    #[serde(default)]
    pub config_path: Option<PathBuf>,

    #[serde(default)]
    pub script_path: Option<PathBuf>,

    #[serde(default)]
    pub lease_file_path: Option<PathBuf>,

    #[serde(default)]
    pub ranges: Vec<DhcpRange>,

    #[serde(default)]
    pub dns_servers: Vec<Ipv4Addr>,
}

/// Capture worker settings (turned into worker argv per VLAN).
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_capture_bin")]
    pub bin_path: PathBuf,

    #[serde(default)]
    pub db_path: Option<PathBuf>,

    #[serde(default = "default_snaplen")]
    pub snaplen: usize,

    #[serde(default = "default_true")]
    pub promiscuous: bool,

    #[serde(default = "default_true")]
    pub immediate: bool,

    #[serde(default = "default_buffer_timeout")]
    pub buffer_timeout_ms: u64,

    #[serde(default)]
    pub filter: String,

    /// Report DHCP/DNS fingerprints back through the command socket.
    #[serde(default = "default_true")]
    pub report_fingerprints: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            bin_path: default_capture_bin(),
            db_path: None,
            snaplen: default_snaplen(),
            promiscuous: true,
            immediate: true,
            buffer_timeout_ms: default_buffer_timeout(),
            filter: String::new(),
            report_fingerprints: true,
        }
    }
}

/// Seed device records loaded at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSeed {
    pub mac: MacAddr,
    #[serde(default = "default_true")]
    pub allow: bool,
    pub vlanid: u16,
    #[serde(default)]
    pub nat: bool,
    #[serde(default)]
    pub psk: String,
    #[serde(default)]
    pub label: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub file: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub stdout: bool,

    #[serde(default = "default_log_format")]
    pub format: String,
}

/// Metrics configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_port")]
    pub port: u16,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: false,
            port: default_metrics_port(),
            path: default_metrics_path(),
        }
    }
}

// Default value functions
fn default_true() -> bool { true }
fn default_open_vlanid() -> u16 { 1 }
fn default_pid_file() -> PathBuf { "/var/run/edgesec.pid".into() }
fn default_ap_timeout_ms() -> u64 { 1000 }
fn default_ap_ping_secs() -> u64 { 60 }
fn default_radius_port() -> u16 { 1812 }
fn default_localhost() -> Ipv4Addr { Ipv4Addr::new(127, 0, 0, 1) }
fn default_client_mask() -> u8 { 32 }
fn default_eap_methods() -> Vec<EapMethod> { EapMethod::all().to_vec() }
fn default_ticket_ttl() -> u64 { 60 }
fn default_ticket_passphrase_len() -> usize { 16 }
fn default_lease_time() -> String { "24h".to_string() }
fn default_capture_bin() -> PathBuf { "edgesec-capture".into() }
fn default_snaplen() -> usize { 1518 }
fn default_buffer_timeout() -> u64 { 100 }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "pretty".to_string() }
fn default_metrics_port() -> u16 { 9101 }
fn default_metrics_path() -> String { "/metrics".to_string() }

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        toml::from_str(&content).with_context(|| "Failed to parse configuration")
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.supervisor.domain_server_path.as_os_str().is_empty() {
            anyhow::bail!("supervisor.domain_server_path must be set");
        }

        if !valid_vlan_id(self.system.default_open_vlanid) {
            anyhow::bail!(
                "system.default_open_vlanid {} outside 1..=4094",
                self.system.default_open_vlanid
            );
        }

        for iface in &self.interfaces {
            if !valid_vlan_id(iface.vlanid) {
                anyhow::bail!("interface {} has invalid VLAN id {}", iface.ifname, iface.vlanid);
            }
            if iface.ifname.is_empty() {
                anyhow::bail!("interface for VLAN {} has an empty name", iface.vlanid);
            }
        }

        for seed in &self.connections {
            if !valid_vlan_id(seed.vlanid) {
                anyhow::bail!("connection {} has invalid VLAN id {}", seed.mac, seed.vlanid);
            }
        }

        if self.system.exec_radius && self.radius.secret.is_empty() {
            anyhow::bail!("radius.secret must be set when exec_radius is enabled");
        }

        if self.radius.client_mask > 32 {
            anyhow::bail!("radius.client_mask {} exceeds 32", self.radius.client_mask);
        }

        if self.capture.snaplen < 64 || self.capture.snaplen > 65535 {
            anyhow::bail!("capture.snaplen must be between 64 and 65535");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[system]
allow_all_connections = false
default_open_vlanid = 1
exec_capture = true
exec_radius = true

[supervisor]
domain_server_path = "/tmp/edgesec.sock"

[nat]
nat_interface = "eth0"

[ap]
ssid = "edge"
wpa_passphrase = "open-sesame"
interface = "wlan0"
ctrl_interface_path = "/var/run/hostapd/wlan0"

[radius]
port = 1812
secret = "radius-secret"

[radius.eap]
methods = ["identity", "tls", "peap"]

[db]
path = "/tmp/edgesec.db"

[dhcp]
dns_servers = ["8.8.8.8", "8.8.4.4"]

[[dhcp.ranges]]
vlanid = 3
ip_low = "10.0.3.2"
ip_high = "10.0.3.254"
netmask = "255.255.255.0"

[[interfaces]]
vlanid = 3
ifname = "if3"
ip = "10.0.3.1"
brd = "10.0.3.255"
netmask = "255.255.255.0"

[[connections]]
mac = "aa:bb:cc:dd:ee:ff"
vlanid = 3
psk = "device-psk"
label = "printer"

[logging]
level = "debug"
"#;

    #[test]
    fn test_parse_sample() {
        let config: Config = toml::from_str(SAMPLE).unwrap();

        assert_eq!(config.system.default_open_vlanid, 1);
        assert!(config.system.exec_capture);
        assert_eq!(config.radius.port, 1812);
        assert_eq!(config.radius.eap.methods.len(), 3);
        assert_eq!(config.interfaces.len(), 1);
        assert_eq!(config.interfaces[0].ifname, "if3");
        assert_eq!(config.connections[0].label, "printer");
        assert_eq!(config.dhcp.ranges[0].lease_time, "24h");
        assert_eq!(config.capture.snaplen, 1518);
        assert_eq!(config.ticket.ttl_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_missing_radius_secret() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.radius.secret.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_vlan() {
        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.system.default_open_vlanid = 0;
        assert!(config.validate().is_err());

        let mut config: Config = toml::from_str(SAMPLE).unwrap();
        config.interfaces[0].vlanid = 4095;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_defaults_fill_optional_sections() {
        let minimal = r#"
[system]

[supervisor]
domain_server_path = "/tmp/s.sock"

[ap]
ctrl_interface_path = "/tmp/h.sock"

[db]
path = "/tmp/d.db"

[logging]
"#;
        let config: Config = toml::from_str(minimal).unwrap();
        assert_eq!(config.radius.port, 1812);
        assert_eq!(config.radius.eap.methods.len(), 11);
        assert!(config.nat.exec_netfilter);
        assert_eq!(config.metrics.port, 9101);
        assert_eq!(config.logging.level, "info");
        // exec_radius defaults on, so the empty secret must fail validation.
        assert!(config.validate().is_err());
    }
}
