//! Unix-domain datagram transport
//!
//! One datagram per request, one per reply, bounded by the kernel receive
//! buffer. Replies are routed to the sender's bound path, so clients bind
//! an ephemeral socket before asking.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixDatagram;

/// Upper bound for one command or reply datagram.
pub const MAX_DATAGRAM: usize = 65536;

static CLIENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Strip trailing whitespace before parsing.
pub fn trim_trailing(s: &str) -> &str {
    s.trim_end()
}

/// Split a command line into its space-separated tokens.
pub fn split_tokens(s: &str) -> Vec<&str> {
    s.split(' ').filter(|t| !t.is_empty()).collect()
}

/// Ephemeral client socket bound to a throwaway filesystem path; the path
/// is unlinked on drop.
pub struct ClientSocket {
    socket: UnixDatagram,
    path: PathBuf,
}

impl ClientSocket {
    pub fn bind_ephemeral() -> Result<Self> {
        let seq = CLIENT_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = std::env::temp_dir().join(format!(
            "edgesec-client-{}-{}.sock",
            std::process::id(),
            seq
        ));
        let _ = std::fs::remove_file(&path);
        let socket = UnixDatagram::bind(&path)
            .with_context(|| format!("Failed to bind client socket {:?}", path))?;
        Ok(Self { socket, path })
    }

    pub fn socket(&self) -> &UnixDatagram {
        &self.socket
    }
}

impl Drop for ClientSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Single request/reply round-trip against a datagram server, bounded by
/// `deadline`. The reply is returned with trailing whitespace stripped.
pub async fn request<P: AsRef<Path>>(
    server_path: P,
    payload: &str,
    deadline: Duration,
) -> Result<String> {
    let client = ClientSocket::bind_ephemeral()?;
    client
        .socket()
        .send_to(payload.as_bytes(), server_path.as_ref())
        .await
        .with_context(|| format!("Failed to send to {:?}", server_path.as_ref()))?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let len = tokio::time::timeout(deadline, client.socket().recv(&mut buf))
        .await
        .context("Request timed out")?
        .context("Failed to receive reply")?;

    let reply = String::from_utf8_lossy(&buf[..len]).to_string();
    Ok(trim_trailing(&reply).to_string())
}

/// One-way notification datagram (no reply expected). Errors are returned
/// so callers can prune dead subscribers.
pub async fn notify<P: AsRef<Path>>(dest: P, payload: &str) -> Result<()> {
    let socket = UnixDatagram::unbound().context("Failed to create socket")?;
    socket
        .send_to(payload.as_bytes(), dest.as_ref())
        .await
        .with_context(|| format!("Failed to notify {:?}", dest.as_ref()))?;
    Ok(())
}
