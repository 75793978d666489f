//! Per-VLAN capture worker scheduling
//!
//! Spawns one `edgesec-capture` process per active VLAN, verifies the
//! child came up, and tracks the children so exits clear the VLAN's
//! analyser slot and shutdown can kill the survivors.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::CaptureConfig;

pub struct CaptureScheduler {
    conf: CaptureConfig,
    pcap_db_path: PathBuf,
    supervisor_socket: PathBuf,
    children: HashMap<u16, Child>,
}

impl CaptureScheduler {
    pub fn new(conf: CaptureConfig, default_db_path: PathBuf, supervisor_socket: PathBuf) -> Self {
        let pcap_db_path = conf.db_path.clone().unwrap_or(default_db_path);
        Self {
            conf,
            pcap_db_path,
            supervisor_socket,
            children: HashMap::new(),
        }
    }

    /// Worker argv for one VLAN's interface.
    pub fn worker_args(&self, ifname: &str) -> Vec<String> {
        let mut args = vec![
            "--interface".to_string(),
            ifname.to_string(),
            "--db-path".to_string(),
            self.pcap_db_path.display().to_string(),
            "--snaplen".to_string(),
            self.conf.snaplen.to_string(),
            "--buffer-timeout-ms".to_string(),
            self.conf.buffer_timeout_ms.to_string(),
        ];
        if self.conf.promiscuous {
            args.push("--promiscuous".to_string());
        }
        if self.conf.immediate {
            args.push("--immediate".to_string());
        }
        if !self.conf.filter.is_empty() {
            args.push("--filter".to_string());
            args.push(self.conf.filter.clone());
        }
        if self.conf.report_fingerprints {
            args.push("--supervisor-socket".to_string());
            args.push(self.supervisor_socket.display().to_string());
        }
        args
    }

    /// Spawn a worker for `vlan_id` on `ifname` and return its pid.
    pub fn spawn(&mut self, vlan_id: u16, ifname: &str) -> Result<u32> {
        if self.children.contains_key(&vlan_id) {
            bail!("capture worker already tracked for VLAN {}", vlan_id);
        }

        let args = self.worker_args(ifname);
        let mut child = Command::new(&self.conf.bin_path)
            .args(&args)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {:?}", self.conf.bin_path))?;

        if let Some(status) = child.try_wait().context("Capture worker wait failed")? {
            bail!("capture worker for VLAN {} exited at start: {}", vlan_id, status);
        }
        let pid = child
            .id()
            .with_context(|| format!("capture worker for VLAN {} has no pid", vlan_id))?;

        info!("Capture worker pid={} on if={} (vlan {})", pid, ifname, vlan_id);
        self.children.insert(vlan_id, child);
        Ok(pid)
    }

    /// Collect exited workers; returns the VLANs whose slot is now free.
    pub fn reap_exited(&mut self) -> Vec<u16> {
        let mut exited = Vec::new();
        for (vlan_id, child) in self.children.iter_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    info!("Capture worker for VLAN {} exited: {}", vlan_id, status);
                    exited.push(*vlan_id);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Capture worker wait error for VLAN {}: {}", vlan_id, e);
                    exited.push(*vlan_id);
                }
            }
        }
        for vlan_id in &exited {
            self.children.remove(vlan_id);
        }
        exited
    }

    pub fn tracked_vlans(&self) -> Vec<u16> {
        self.children.keys().copied().collect()
    }

    /// Kill all remaining workers (process teardown).
    pub async fn shutdown(&mut self) {
        for (vlan_id, mut child) in self.children.drain() {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill capture worker for VLAN {}: {}", vlan_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> CaptureScheduler {
        let conf = CaptureConfig {
            filter: "ether host aa:bb:cc:dd:ee:ff".to_string(),
            ..CaptureConfig::default()
        };
        CaptureScheduler::new(
            conf,
            "/tmp/edgesec.db".into(),
            "/tmp/edgesec.sock".into(),
        )
    }

    #[test]
    fn test_worker_args_shape() {
        let sched = scheduler();
        let args = sched.worker_args("wlan0.3");

        let joined = args.join(" ");
        assert!(joined.contains("--interface wlan0.3"));
        assert!(joined.contains("--db-path /tmp/edgesec.db"));
        assert!(joined.contains("--snaplen 1518"));
        assert!(joined.contains("--promiscuous"));
        assert!(joined.contains("--immediate"));
        assert!(joined.contains("--filter ether host aa:bb:cc:dd:ee:ff"));
        assert!(joined.contains("--supervisor-socket /tmp/edgesec.sock"));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let conf = CaptureConfig {
            bin_path: "/nonexistent/edgesec-capture".into(),
            ..CaptureConfig::default()
        };
        let mut sched = CaptureScheduler::new(conf, "/tmp/x.db".into(), "/tmp/x.sock".into());

        assert!(sched.spawn(3, "if3").is_err());
        assert!(sched.tracked_vlans().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_track_and_reap() {
        let conf = CaptureConfig {
            // A real short-lived process stands in for the worker.
            bin_path: "/bin/true".into(),
            ..CaptureConfig::default()
        };
        let mut sched = CaptureScheduler::new(conf, "/tmp/x.db".into(), "/tmp/x.sock".into());

        // /bin/true may exit before or after the liveness check; both are
        // valid outcomes, but a tracked worker must eventually be reaped.
        if sched.spawn(3, "if3").is_ok() {
            assert_eq!(sched.tracked_vlans(), vec![3]);
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            let exited = sched.reap_exited();
            assert_eq!(exited, vec![3]);
            assert!(sched.tracked_vlans().is_empty());
        }
    }
}
