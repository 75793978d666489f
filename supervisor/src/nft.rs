//! Netfilter rule controller
//!
//! Tracks the MASQUERADE/FORWARD rules this process has installed and keeps
//! every operation idempotent: re-adding an applied rule or deleting an
//! absent one is a no-op success. Rules are programmed by invoking
//! `iptables` (with the xtables lock wait flag); transient failures are
//! retried a bounded number of times. With execution disabled the rule set
//! is tracked without touching the kernel.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::process::Command;
use tracing::{debug, warn};

const IPTABLES_BIN: &str = "iptables";
const XTABLES_WAIT_SECS: &str = "5";
const EXEC_RETRIES: usize = 3;
const RETRY_DELAY: Duration = Duration::from_millis(200);

/// A rule this controller has installed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Rule {
    Nat {
        ip: Ipv4Addr,
        ifname: String,
    },
    /// Endpoints are kept in normalized order so `(a, b)` and `(b, a)`
    /// name the same rule.
    Bridge {
        left: (Ipv4Addr, String),
        right: (Ipv4Addr, String),
    },
}

fn bridge_rule(a: (Ipv4Addr, String), b: (Ipv4Addr, String)) -> Rule {
    if a <= b {
        Rule::Bridge { left: a, right: b }
    } else {
        Rule::Bridge { left: b, right: a }
    }
}

pub struct NetfilterController {
    nat_interface: String,
    exec: bool,
    applied: HashSet<Rule>,
}

impl NetfilterController {
    pub fn new(nat_interface: &str, exec: bool) -> Self {
        Self {
            nat_interface: nat_interface.to_string(),
            exec,
            applied: HashSet::new(),
        }
    }

    /// Install NAT for a client: MASQUERADE on the egress plus FORWARD in
    /// both directions between the client interface and the egress.
    pub async fn add_nat(&mut self, ip: Ipv4Addr, ifname: &str) -> Result<()> {
        let rule = Rule::Nat {
            ip,
            ifname: ifname.to_string(),
        };
        if self.applied.contains(&rule) {
            debug!("NAT rule for {} already installed", ip);
            return Ok(());
        }

        for args in self.nat_args(ip, ifname, true) {
            self.run(&args).await?;
        }
        self.applied.insert(rule);
        Ok(())
    }

    pub async fn delete_nat(&mut self, ip: Ipv4Addr, ifname: &str) -> Result<()> {
        let rule = Rule::Nat {
            ip,
            ifname: ifname.to_string(),
        };
        if !self.applied.contains(&rule) {
            debug!("NAT rule for {} not installed", ip);
            return Ok(());
        }

        for args in self.nat_args(ip, ifname, false) {
            self.run(&args).await?;
        }
        self.applied.remove(&rule);
        Ok(())
    }

    /// Install the FORWARD pair allowing traffic between two clients.
    pub async fn add_bridge(
        &mut self,
        a: (Ipv4Addr, &str),
        b: (Ipv4Addr, &str),
    ) -> Result<()> {
        let rule = bridge_rule((a.0, a.1.to_string()), (b.0, b.1.to_string()));
        if self.applied.contains(&rule) {
            debug!("Bridge rule {} <-> {} already installed", a.0, b.0);
            return Ok(());
        }

        for args in Self::bridge_args(a, b, true) {
            self.run(&args).await?;
        }
        self.applied.insert(rule);
        Ok(())
    }

    pub async fn delete_bridge(
        &mut self,
        a: (Ipv4Addr, &str),
        b: (Ipv4Addr, &str),
    ) -> Result<()> {
        let rule = bridge_rule((a.0, a.1.to_string()), (b.0, b.1.to_string()));
        if !self.applied.contains(&rule) {
            debug!("Bridge rule {} <-> {} not installed", a.0, b.0);
            return Ok(());
        }

        for args in Self::bridge_args(a, b, false) {
            self.run(&args).await?;
        }
        self.applied.remove(&rule);
        Ok(())
    }

    pub fn has_nat(&self, ip: Ipv4Addr, ifname: &str) -> bool {
        self.applied.contains(&Rule::Nat {
            ip,
            ifname: ifname.to_string(),
        })
    }

    pub fn has_bridge(&self, a: (Ipv4Addr, &str), b: (Ipv4Addr, &str)) -> bool {
        self.applied
            .contains(&bridge_rule((a.0, a.1.to_string()), (b.0, b.1.to_string())))
    }

    pub fn rule_count(&self) -> usize {
        self.applied.len()
    }

    fn nat_args(&self, ip: Ipv4Addr, ifname: &str, add: bool) -> Vec<Vec<String>> {
        let action = if add { "-A" } else { "-D" };
        let ip = ip.to_string();
        vec![
            vec![
                "-t".into(),
                "nat".into(),
                action.into(),
                "POSTROUTING".into(),
                "-s".into(),
                format!("{}/32", ip),
                "-o".into(),
                self.nat_interface.clone(),
                "-j".into(),
                "MASQUERADE".into(),
            ],
            vec![
                action.into(),
                "FORWARD".into(),
                "-i".into(),
                ifname.into(),
                "-o".into(),
                self.nat_interface.clone(),
                "-s".into(),
                ip.clone(),
                "-j".into(),
                "ACCEPT".into(),
            ],
            vec![
                action.into(),
                "FORWARD".into(),
                "-i".into(),
                self.nat_interface.clone(),
                "-o".into(),
                ifname.into(),
                "-d".into(),
                ip,
                "-j".into(),
                "ACCEPT".into(),
            ],
        ]
    }

    fn bridge_args(a: (Ipv4Addr, &str), b: (Ipv4Addr, &str), add: bool) -> Vec<Vec<String>> {
        let action = if add { "-A" } else { "-D" };
        vec![
            vec![
                action.into(),
                "FORWARD".into(),
                "-i".into(),
                a.1.into(),
                "-o".into(),
                b.1.into(),
                "-s".into(),
                a.0.to_string(),
                "-d".into(),
                b.0.to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ],
            vec![
                action.into(),
                "FORWARD".into(),
                "-i".into(),
                b.1.into(),
                "-o".into(),
                a.1.into(),
                "-s".into(),
                b.0.to_string(),
                "-d".into(),
                a.0.to_string(),
                "-j".into(),
                "ACCEPT".into(),
            ],
        ]
    }

    async fn run(&self, args: &[String]) -> Result<()> {
        if !self.exec {
            debug!("netfilter (disabled): {} {}", IPTABLES_BIN, args.join(" "));
            return Ok(());
        }

        let mut last_stderr = String::new();
        for attempt in 0..EXEC_RETRIES {
            let output = Command::new(IPTABLES_BIN)
                .arg("-w")
                .arg(XTABLES_WAIT_SECS)
                .args(args)
                .output()
                .await
                .with_context(|| format!("Failed to spawn {}", IPTABLES_BIN))?;

            if output.status.success() {
                return Ok(());
            }

            last_stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!(
                "iptables {} failed (attempt {}): {}",
                args.join(" "),
                attempt + 1,
                last_stderr
            );
            tokio::time::sleep(RETRY_DELAY).await;
        }

        bail!("iptables {} failed: {}", args.join(" "), last_stderr);
    }
}
