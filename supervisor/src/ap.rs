//! Access-point daemon control client
//!
//! Two independent sockets against the AP daemon's control interface: a
//! command socket doing synchronous write-read round-trips, and an event
//! socket that subscribes with `ATTACH` and then receives unsolicited
//! station events. Every command reply is checked against the expected
//! literal; any mismatch is a peer protocol error.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::sock::{self, ClientSocket, MAX_DATAGRAM};
use crate::state::MacAddr;

const PING_COMMAND: &str = "PING";
const PING_REPLY: &str = "PONG";
const ATTACH_COMMAND: &str = "ATTACH";
const STA_COMMAND: &str = "STA";
const DENYACL_ADD_COMMAND: &str = "DENY_ACL ADD_MAC";
const DENYACL_DEL_COMMAND: &str = "DENY_ACL DEL_MAC";
const OK_REPLY: &str = "OK";
const FAIL_REPLY: &str = "FAIL";

const AP_STA_CONNECTED: &str = "AP-STA-CONNECTED";
const AP_STA_DISCONNECTED: &str = "AP-STA-DISCONNECTED";

/// Station association event from the AP daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApEvent {
    Connected(MacAddr),
    Disconnected(MacAddr),
}

/// Parse an unsolicited AP event line. Only lines whose first token names
/// a station connect/disconnect are interesting; the second token is the
/// station MAC.
pub fn parse_ap_event(line: &str) -> Option<ApEvent> {
    let tokens = sock::split_tokens(line);
    if tokens.len() < 2 {
        return None;
    }

    let mac = MacAddr::parse_flexible(tokens[1])?;
    if tokens[0].contains(AP_STA_DISCONNECTED) {
        Some(ApEvent::Disconnected(mac))
    } else if tokens[0].contains(AP_STA_CONNECTED) {
        Some(ApEvent::Connected(mac))
    } else {
        None
    }
}

/// Synchronous command client for the AP control socket.
#[derive(Clone)]
pub struct ApClient {
    ctrl_path: PathBuf,
    timeout: Duration,
}

impl ApClient {
    pub fn new(ctrl_path: PathBuf, timeout: Duration) -> Self {
        Self { ctrl_path, timeout }
    }

    async fn command(&self, cmd: &str) -> Result<String> {
        sock::request(&self.ctrl_path, cmd, self.timeout)
            .await
            .with_context(|| format!("AP command {:?} failed", cmd))
    }

    /// Liveness probe; the daemon must answer with the exact `PONG`.
    pub async fn ping(&self) -> Result<()> {
        let reply = self.command(PING_COMMAND).await?;
        if reply != PING_REPLY {
            bail!("AP ping reply mismatch: {:?}", reply);
        }
        Ok(())
    }

    /// Whether a station is currently associated.
    pub async fn check_sta(&self, mac: MacAddr) -> Result<bool> {
        let reply = self.command(&format!("{} {}", STA_COMMAND, mac)).await?;
        Ok(!(reply.is_empty() || reply == FAIL_REPLY))
    }

    pub async fn denyacl_add(&self, mac: MacAddr) -> Result<()> {
        self.acl_command(DENYACL_ADD_COMMAND, mac).await
    }

    pub async fn denyacl_del(&self, mac: MacAddr) -> Result<()> {
        self.acl_command(DENYACL_DEL_COMMAND, mac).await
    }

    async fn acl_command(&self, cmd: &str, mac: MacAddr) -> Result<()> {
        let reply = self.command(&format!("{} {}", cmd, mac)).await?;
        if reply != OK_REPLY {
            bail!("AP ACL reply mismatch for {:?}: {:?}", cmd, reply);
        }
        Ok(())
    }

    /// Kick a station without leaving it banned: add to the deny ACL, then
    /// remove it.
    pub async fn disconnect(&self, mac: MacAddr) -> Result<()> {
        self.denyacl_add(mac).await?;
        self.denyacl_del(mac).await?;
        Ok(())
    }
}

/// Event-socket subscriber. Sends `ATTACH` once, then forwards parsed
/// station events until shutdown.
pub struct ApMonitor {
    ctrl_path: PathBuf,
}

impl ApMonitor {
    pub fn new(ctrl_path: PathBuf) -> Self {
        Self { ctrl_path }
    }

    pub async fn run(
        self,
        events: mpsc::Sender<ApEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let client = ClientSocket::bind_ephemeral()?;
        client
            .socket()
            .send_to(ATTACH_COMMAND.as_bytes(), &self.ctrl_path)
            .await
            .with_context(|| format!("Failed to attach to AP socket {:?}", self.ctrl_path))?;
        info!("Attached to AP event socket {:?}", self.ctrl_path);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("AP monitor shutting down");
                    break;
                }
                received = client.socket().recv(&mut buf) => {
                    let len = match received {
                        Ok(len) => len,
                        Err(e) => {
                            warn!("AP event socket read error: {}", e);
                            continue;
                        }
                    };
                    let line = String::from_utf8_lossy(&buf[..len]);
                    let line = sock::trim_trailing(&line);
                    match parse_ap_event(line) {
                        Some(event) => {
                            if events.send(event).await.is_err() {
                                break;
                            }
                        }
                        // ATTACH ack and unrelated event classes land here.
                        None => debug!("Ignoring AP line {:?}", line),
                    }
                }
            }
        }
        Ok(())
    }
}
