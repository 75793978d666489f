//! Operator command socket
//!
//! One datagram in, one reply out. The sender's bound path (if any)
//! doubles as its event-subscription address. Parse failures answer FAIL
//! without touching any state.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixDatagram;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::sock::{self, MAX_DATAGRAM};

use super::commands::{Command, FAIL_REPLY};
use super::Supervisor;

pub struct ControlServer {
    path: PathBuf,
    supervisor: Arc<Supervisor>,
}

impl ControlServer {
    pub fn new(path: PathBuf, supervisor: Arc<Supervisor>) -> Self {
        Self { path, supervisor }
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        // A stale socket file from a previous run blocks the bind.
        let _ = std::fs::remove_file(&self.path);
        let socket = UnixDatagram::bind(&self.path)
            .with_context(|| format!("Failed to bind command socket {:?}", self.path))?;
        info!("Command socket at {:?}", self.path);

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Command socket shutting down");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    let (len, addr) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            warn!("Command socket read error: {}", e);
                            continue;
                        }
                    };

                    let client = addr.as_pathname().map(PathBuf::from);
                    let text = String::from_utf8_lossy(&buf[..len]);
                    let line = sock::trim_trailing(&text);
                    let tokens = sock::split_tokens(line);

                    let reply = match Command::parse(&tokens) {
                        Ok(command) => {
                            self.supervisor.handle_command(command, client.clone()).await
                        }
                        Err(e) => {
                            debug!("Rejecting command {:?}: {}", line, e);
                            let metrics = self.supervisor.metrics();
                            metrics.commands_total.inc();
                            metrics.command_failures_total.inc();
                            FAIL_REPLY.to_string()
                        }
                    };

                    let Some(client) = client else {
                        // Unbound senders cannot receive a reply.
                        debug!("No return address for command {:?}", line);
                        continue;
                    };
                    if let Err(e) = socket.send_to(reply.as_bytes(), &client).await {
                        debug!("Failed to reply to {:?}: {}", client, e);
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.path);
        Ok(())
    }
}
