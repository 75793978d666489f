//! Datalink capture (AF_PACKET via pnet)
//!
//! One sniffer per worker process, bound to the VLAN interface the
//! supervisor assigned. The read loop runs on a dedicated thread with a
//! bounded read timeout (immediate mode shrinks it to near-zero) and
//! hands truncated packets to the async side over a bounded channel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use pnet::datalink::{self, Channel, Config};
use tracing::{debug, error, info, warn};

/// Read timeout used in immediate mode.
const IMMEDIATE_TIMEOUT: Duration = Duration::from_millis(1);

/// One captured packet, truncated to the snap length.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Capture time, microseconds since epoch.
    pub timestamp: i64,
    /// Bytes captured.
    pub caplen: u32,
    /// Original wire length.
    pub length: u32,
    pub data: Vec<u8>,
}

/// Capture statistics
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub packets_captured: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub packets_dropped: AtomicU64,
}

impl CaptureStats {
    pub fn snapshot(&self) -> (u64, u64, u64) {
        (
            self.packets_captured.load(Ordering::Relaxed),
            self.bytes_captured.load(Ordering::Relaxed),
            self.packets_dropped.load(Ordering::Relaxed),
        )
    }
}

pub struct Sniffer {
    interface: String,
    promiscuous: bool,
    snaplen: usize,
    read_timeout: Duration,
    stats: Arc<CaptureStats>,
    running: Arc<AtomicBool>,
}

impl Sniffer {
    pub fn new(
        interface: &str,
        promiscuous: bool,
        snaplen: usize,
        buffer_timeout: Duration,
        immediate: bool,
    ) -> Result<Self> {
        let exists = datalink::interfaces().iter().any(|i| i.name == interface);
        if !exists {
            bail!("interface {:?} not found", interface);
        }

        Ok(Self {
            interface: interface.to_string(),
            promiscuous,
            snaplen,
            read_timeout: if immediate { IMMEDIATE_TIMEOUT } else { buffer_timeout },
            stats: Arc::new(CaptureStats::default()),
            running: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn stats(&self) -> Arc<CaptureStats> {
        Arc::clone(&self.stats)
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Blocking capture loop; runs until [`Sniffer::stop`].
    pub fn run(&self, tx: Sender<RawPacket>) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            bail!("capture already running on {}", self.interface);
        }

        if self.promiscuous {
            if let Err(e) = set_promiscuous(&self.interface, true) {
                warn!("Failed to enable promiscuous mode: {:#}", e);
            }
        }

        let config = Config {
            read_timeout: Some(self.read_timeout),
            write_buffer_size: 0,
            read_buffer_size: 65536,
            ..Default::default()
        };

        let interfaces = datalink::interfaces();
        let pnet_interface = interfaces
            .into_iter()
            .find(|i| i.name == self.interface)
            .with_context(|| format!("interface {:?} disappeared", self.interface))?;

        let (_, mut rx) = match datalink::channel(&pnet_interface, config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => bail!("unhandled channel type"),
            Err(e) => bail!("failed to open datalink channel: {}", e),
        };

        info!(
            "Capture started on {:?} (promiscuous: {}, snaplen: {})",
            self.interface, self.promiscuous, self.snaplen
        );

        while self.running.load(Ordering::SeqCst) {
            match rx.next() {
                Ok(packet) => {
                    let length = packet.len() as u32;
                    let caplen = packet.len().min(self.snaplen);

                    self.stats.packets_captured.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .bytes_captured
                        .fetch_add(length as u64, Ordering::Relaxed);

                    let raw = RawPacket {
                        timestamp: chrono::Utc::now().timestamp_micros(),
                        caplen: caplen as u32,
                        length,
                        data: packet[..caplen].to_vec(),
                    };
                    if tx.try_send(raw).is_err() {
                        self.stats.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    // Timeouts pace the shutdown checks.
                    let text = e.to_string().to_lowercase();
                    if !text.contains("timed out") && !text.contains("timeout") {
                        error!("Capture read error: {}", e);
                    }
                }
            }
        }

        if self.promiscuous {
            if let Err(e) = set_promiscuous(&self.interface, false) {
                warn!("Failed to disable promiscuous mode: {:#}", e);
            }
        }

        info!("Capture stopped on {:?}", self.interface);
        Ok(())
    }

    /// Start the capture loop on its own thread.
    pub fn start_threaded(
        self: Arc<Self>,
        buffer_size: usize,
    ) -> (std::thread::JoinHandle<()>, Receiver<RawPacket>) {
        let (tx, rx) = bounded(buffer_size);
        let sniffer = Arc::clone(&self);
        let handle = std::thread::spawn(move || {
            if let Err(e) = sniffer.run(tx) {
                error!("Capture thread error: {:#}", e);
            }
        });
        (handle, rx)
    }
}

impl Drop for Sniffer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// List capture-capable interfaces on stdout.
pub fn print_interfaces() {
    for iface in datalink::interfaces() {
        let mac = iface
            .mac
            .map(|m| m.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}\tmac={}\tup={}", iface.name, mac, iface.is_up());
    }
}

/// Toggle IFF_PROMISC on an interface.
fn set_promiscuous(interface: &str, enable: bool) -> Result<()> {
    if interface.len() >= libc::IFNAMSIZ {
        bail!("interface name too long: {:?}", interface);
    }

    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0);
        if fd < 0 {
            bail!("socket() failed: {}", std::io::Error::last_os_error());
        }

        let mut ifr: libc::ifreq = std::mem::zeroed();
        for (slot, byte) in ifr.ifr_name.iter_mut().zip(interface.bytes()) {
            *slot = byte as libc::c_char;
        }

        if libc::ioctl(fd, libc::SIOCGIFFLAGS, &mut ifr) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("SIOCGIFFLAGS failed: {}", err);
        }

        let promisc = libc::IFF_PROMISC as libc::c_short;
        if enable {
            ifr.ifr_ifru.ifru_flags |= promisc;
        } else {
            ifr.ifr_ifru.ifru_flags &= !promisc;
        }

        if libc::ioctl(fd, libc::SIOCSIFFLAGS, &ifr) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("SIOCSIFFLAGS failed: {}", err);
        }

        libc::close(fd);
    }

    debug!(
        "Promiscuous mode {} on {:?}",
        if enable { "enabled" } else { "disabled" },
        interface
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_interface_rejected() {
        let result = Sniffer::new(
            "edgesec-does-not-exist0",
            false,
            1518,
            Duration::from_millis(100),
            false,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = CaptureStats::default();
        stats.packets_captured.fetch_add(10, Ordering::Relaxed);
        stats.bytes_captured.fetch_add(1500, Ordering::Relaxed);

        let (packets, bytes, dropped) = stats.snapshot();
        assert_eq!(packets, 10);
        assert_eq!(bytes, 1500);
        assert_eq!(dropped, 0);
    }
}
