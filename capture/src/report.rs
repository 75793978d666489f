//! Fingerprint reporting
//!
//! Turns decoded DHCP and DNS/mDNS payloads into `SET_FINGERPRINT`
//! datagrams for the supervisor's command socket. Reporting is
//! fire-and-forget; the protocol row is written once per endpoint by the
//! supervisor itself.

use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::net::UnixDatagram;
use tracing::debug;

use crate::decode::PacketSummary;

pub struct FingerprintReporter {
    socket_path: PathBuf,
}

/// A fingerprint derived from one packet, before formatting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observation {
    pub protocol: &'static str,
    pub fingerprint: String,
    pub query: String,
}

/// What, if anything, a packet contributes to the fingerprint log.
pub fn observe(summary: &PacketSummary) -> Option<Observation> {
    if let Some(dhcp) = &summary.dhcp {
        if dhcp.param_request_list.is_empty() {
            return None;
        }
        return Some(Observation {
            protocol: "dhcp",
            fingerprint: dhcp.fingerprint(),
            query: dhcp.hostname.clone().unwrap_or_else(|| "-".to_string()),
        });
    }

    if let Some(dns) = &summary.dns {
        if dns.is_response || dns.query.is_empty() {
            return None;
        }
        let protocol = if summary.layers.contains(&"mdns") {
            "mdns"
        } else {
            "dns"
        };
        return Some(Observation {
            protocol,
            // The query name is the signal; qtype disambiguates.
            fingerprint: dns.qtype.map(|t| t.to_string()).unwrap_or_default(),
            query: dns.query.clone(),
        });
    }

    None
}

/// `SET_FINGERPRINT` command line for one observation. The query is the
/// final argument and may contain spaces.
pub fn command_line(summary: &PacketSummary, obs: &Observation, timestamp: i64) -> String {
    format!(
        "SET_FINGERPRINT {} {} {} {} {} {}",
        summary.src_mac, summary.dst_mac, obs.protocol, obs.fingerprint, timestamp, obs.query
    )
}

impl FingerprintReporter {
    pub fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }

    pub async fn report(
        &self,
        summary: &PacketSummary,
        obs: &Observation,
        timestamp: i64,
    ) -> Result<()> {
        let line = command_line(summary, obs, timestamp);
        let socket = UnixDatagram::unbound().context("Failed to create report socket")?;
        socket
            .send_to(line.as_bytes(), &self.socket_path)
            .await
            .with_context(|| format!("Failed to report to {:?}", self.socket_path))?;
        debug!("Reported fingerprint: {}", line);
        Ok(())
    }
}
