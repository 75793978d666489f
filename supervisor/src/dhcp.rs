//! DHCP daemon integration
//!
//! Generates the dnsmasq configuration for the per-VLAN address pools and
//! the lease hook script that reports `SET_IP` notifications into the
//! command socket. The supervisor side of lease handling is the `SET_IP`
//! command itself.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::info;

use crate::config::DhcpConfig;
use crate::state::{IfaceConfig, MacAddr};

/// Render the dnsmasq configuration for the configured ranges.
pub fn dnsmasq_conf(
    dhcp: &DhcpConfig,
    interfaces: &[IfaceConfig],
    script_path: &Path,
) -> String {
    let mut out = String::from("no-resolv\n");

    for server in &dhcp.dns_servers {
        out.push_str(&format!("server={}\n", server));
    }
    if let Some(lease_file) = &dhcp.lease_file_path {
        out.push_str(&format!("dhcp-leasefile={}\n", lease_file.display()));
    }
    out.push_str(&format!("dhcp-script={}\n", script_path.display()));

    for range in &dhcp.ranges {
        let Some(iface) = interfaces.iter().find(|i| i.vlanid == range.vlanid) else {
            continue;
        };
        out.push_str(&format!("interface={}\n", iface.ifname));
        out.push_str(&format!(
            "dhcp-range={},{},{},{},{}\n",
            iface.ifname, range.ip_low, range.ip_high, range.netmask, range.lease_time
        ));
    }
    out
}

/// Render the lease hook script. dnsmasq invokes it as
/// `<script> {add|old|del} <mac> <ip> [hostname]`.
pub fn dnsmasq_script(domain_server_path: &Path) -> String {
    format!(
        "#!/bin/sh\n\
         sockpath=\"{}\"\n\
         str=\"SET_IP $1 $2 $3\"\n\
         echo \"Sending $str ...\"\n\
         echo \"$str\" | nc -uU \"$sockpath\" -w2 -W1\n",
        domain_server_path.display()
    )
}

/// Write the dnsmasq artifacts named in the configuration, if any.
pub fn write_artifacts(
    dhcp: &DhcpConfig,
    interfaces: &[IfaceConfig],
    domain_server_path: &Path,
) -> Result<()> {
    let Some(script_path) = &dhcp.script_path else {
        return Ok(());
    };

    let script = dnsmasq_script(domain_server_path);
    std::fs::write(script_path, script)
        .with_context(|| format!("Failed to write DHCP script {:?}", script_path))?;
    let mut perms = std::fs::metadata(script_path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(script_path, perms)?;
    info!("Wrote DHCP hook script {:?}", script_path);

    if let Some(config_path) = &dhcp.config_path {
        let conf = dnsmasq_conf(dhcp, interfaces, script_path);
        std::fs::write(config_path, conf)
            .with_context(|| format!("Failed to write DHCP config {:?}", config_path))?;
        info!("Wrote DHCP config {:?}", config_path);
    }
    Ok(())
}

/// Drop a device's lease line. Lease rows are
/// `<expiry> <mac> <ip> <hostname> <clientid>`.
pub fn clear_lease(mac: MacAddr, lease_path: &Path) -> Result<bool> {
    let content = std::fs::read_to_string(lease_path)
        .with_context(|| format!("Failed to read lease file {:?}", lease_path))?;

    let mac_str = mac.to_string();
    let mut removed = false;
    let kept: Vec<&str> = content
        .lines()
        .filter(|line| {
            let is_lease = line.split_whitespace().nth(1) == Some(mac_str.as_str());
            removed |= is_lease;
            !is_lease
        })
        .collect();

    if removed {
        let mut out = kept.join("\n");
        if !out.is_empty() {
            out.push('\n');
        }
        std::fs::write(lease_path, out)
            .with_context(|| format!("Failed to rewrite lease file {:?}", lease_path))?;
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhcpRange;
    use std::io::Write;
    use std::path::PathBuf;

    fn sample_dhcp() -> DhcpConfig {
        DhcpConfig {
            config_path: None,
            script_path: None,
            lease_file_path: Some(PathBuf::from("/var/lib/misc/dnsmasq.leases")),
            ranges: vec![DhcpRange {
                vlanid: 3,
                ip_low: "10.0.3.2".parse().unwrap(),
                ip_high: "10.0.3.254".parse().unwrap(),
                netmask: "255.255.255.0".parse().unwrap(),
                lease_time: "24h".to_string(),
            }],
            dns_servers: vec!["8.8.8.8".parse().unwrap()],
        }
    }

    fn sample_ifaces() -> Vec<IfaceConfig> {
        vec![IfaceConfig {
            vlanid: 3,
            ifname: "if3".to_string(),
            ip: "10.0.3.1".parse().unwrap(),
            brd: "10.0.3.255".parse().unwrap(),
            netmask: "255.255.255.0".parse().unwrap(),
        }]
    }

    #[test]
    fn test_dnsmasq_conf_lines() {
        let conf = dnsmasq_conf(
            &sample_dhcp(),
            &sample_ifaces(),
            Path::new("/etc/edgesec/dhcp.sh"),
        );

        assert!(conf.starts_with("no-resolv\n"));
        assert!(conf.contains("server=8.8.8.8\n"));
        assert!(conf.contains("dhcp-leasefile=/var/lib/misc/dnsmasq.leases\n"));
        assert!(conf.contains("dhcp-script=/etc/edgesec/dhcp.sh\n"));
        assert!(conf.contains("interface=if3\n"));
        assert!(conf.contains("dhcp-range=if3,10.0.3.2,10.0.3.254,255.255.255.0,24h\n"));
    }

    #[test]
    fn test_dnsmasq_conf_skips_unknown_vlan() {
        let mut dhcp = sample_dhcp();
        dhcp.ranges[0].vlanid = 9;
        let conf = dnsmasq_conf(&dhcp, &sample_ifaces(), Path::new("/tmp/s.sh"));
        assert!(!conf.contains("dhcp-range"));
    }

    #[test]
    fn test_script_sends_set_ip() {
        let script = dnsmasq_script(Path::new("/var/run/edgesec.sock"));
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("SET_IP $1 $2 $3"));
        assert!(script.contains("/var/run/edgesec.sock"));
    }

    #[test]
    fn test_clear_lease() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "1700000000 aa:bb:cc:dd:ee:ff 10.0.3.7 printer *").unwrap();
        writeln!(file, "1700000001 11:22:33:44:55:66 10.0.7.9 laptop *").unwrap();
        file.flush().unwrap();

        let removed = clear_lease("aa:bb:cc:dd:ee:ff".parse().unwrap(), file.path()).unwrap();
        assert!(removed);

        let content = std::fs::read_to_string(file.path()).unwrap();
        assert!(!content.contains("aa:bb:cc:dd:ee:ff"));
        assert!(content.contains("11:22:33:44:55:66"));

        // Clearing again finds nothing.
        let removed = clear_lease("aa:bb:cc:dd:ee:ff".parse().unwrap(), file.path()).unwrap();
        assert!(!removed);
    }
}
