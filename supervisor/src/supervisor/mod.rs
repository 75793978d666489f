//! Supervisor core: command processing and the RADIUS identity callback
//!
//! Owns the state store, the credential store, the netfilter controller
//! and the capture scheduler. Command handlers commit to SQLite before
//! mutating the in-memory maps, so a failed write leaves memory untouched;
//! a netfilter failure after the commit is logged and reported as FAIL
//! without rolling the write back.

pub mod commands;
pub mod server;

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::ap::{ApClient, ApEvent};
use crate::capture::CaptureScheduler;
use crate::config::{Config, ConnectionSeed};
use crate::crypt::CryptStore;
use crate::db::{Database, FingerprintRow, TimeOp};
use crate::metrics::Metrics;
use crate::radius::{packet, IdentitySource, RadiusIdentity};
use crate::sock;
use crate::state::{AttrChain, MacAddr, MacConn, StateStore};
use crate::timers::{TimerClass, TimerQueue};

use commands::{Command, IpChange, FAIL_REPLY, OK_REPLY, PING_REPLY};

/// One-shot operator-minted credential, at most one live per process.
#[derive(Debug, Clone)]
pub struct AuthTicket {
    pub issuer_mac: MacAddr,
    pub device_label: String,
    pub vlan_id: u16,
    pub passphrase: String,
}

/// Policy knobs lifted out of the configuration.
#[derive(Debug, Clone)]
pub struct Policy {
    pub allow_all_connections: bool,
    pub allow_all_nat: bool,
    pub default_open_vlanid: u16,
    pub wpa_passphrase: String,
    pub exec_capture: bool,
    pub ticket_ttl: Duration,
    pub ticket_passphrase_len: usize,
    pub dhcp_lease_file: Option<PathBuf>,
}

impl Policy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            allow_all_connections: config.system.allow_all_connections,
            allow_all_nat: config.system.allow_all_nat,
            default_open_vlanid: config.system.default_open_vlanid,
            wpa_passphrase: config.ap.wpa_passphrase.clone(),
            exec_capture: config.system.exec_capture,
            ticket_ttl: Duration::from_secs(config.ticket.ttl_secs),
            ticket_passphrase_len: config.ticket.passphrase_len,
            dhcp_lease_file: config.dhcp.lease_file_path.clone(),
        }
    }
}

/// Everything mutated on the serialized command path.
pub(crate) struct Inner {
    pub state: StateStore,
    pub nft: crate::nft::NetfilterController,
    pub capture: CaptureScheduler,
    pub ticket: Option<AuthTicket>,
    pub subscribers: HashSet<PathBuf>,
}

pub struct Supervisor {
    policy: Policy,
    db: Database,
    crypt: CryptStore,
    ap: ApClient,
    timers: Arc<TimerQueue>,
    metrics: Arc<Metrics>,
    inner: Mutex<Inner>,
}

impl Supervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy: Policy,
        state: StateStore,
        db: Database,
        crypt: CryptStore,
        ap: ApClient,
        nft: crate::nft::NetfilterController,
        capture: CaptureScheduler,
        timers: Arc<TimerQueue>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            policy,
            db,
            crypt,
            ap,
            timers,
            metrics,
            inner: Mutex::new(Inner {
                state,
                nft,
                capture,
                ticket: None,
                subscribers: HashSet::new(),
            }),
        })
    }

    pub fn timers(&self) -> Arc<TimerQueue> {
        Arc::clone(&self.timers)
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        Arc::clone(&self.metrics)
    }

    /// Restore persisted device records and their PSKs.
    pub async fn reload_from_db(&self) -> Result<usize> {
        let conns = self.db.load_mac_conns().await?;
        let count = conns.len();
        let mut inner = self.inner.lock().await;
        for mut conn in conns {
            if let Some(psk) = self
                .crypt
                .get(&conn.mac.to_string())
                .await
                .unwrap_or_default()
            {
                conn.set_psk(&psk);
            }
            inner.state.mac_conns.insert(conn.mac, conn);
        }
        if count > 0 {
            info!("Reloaded {} device records", count);
        }
        Ok(count)
    }

    /// Apply one `[[connections]]` seed from the configuration.
    pub async fn seed_connection(&self, seed: &ConnectionSeed) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut conn = inner
            .state
            .mac_conns
            .get(&seed.mac)
            .cloned()
            .unwrap_or_else(|| self.default_conn(seed.mac));
        conn.allow_connection = seed.allow;
        conn.vlan_id = seed.vlanid;
        conn.nat = seed.nat;
        conn.set_psk(seed.psk.as_bytes());
        conn.set_label(&seed.label);
        if let Some(vlan) = inner.state.vlans.get(&seed.vlanid) {
            conn.ifname = vlan.ifname.clone();
        }
        self.persist(&mut inner, conn).await
    }

    fn default_conn(&self, mac: MacAddr) -> MacConn {
        MacConn::new(
            mac,
            self.policy.default_open_vlanid,
            self.policy.allow_all_nat,
        )
    }

    /// Commit a record: credential store, then SQLite, then memory.
    async fn persist(&self, inner: &mut Inner, conn: MacConn) -> Result<()> {
        let psk_cipher = self
            .crypt
            .put(&conn.mac.to_string(), &conn.key_id, &conn.psk)
            .await?;
        self.db.save_mac_conn(&conn, &psk_cipher).await?;
        inner.state.mac_conns.insert(conn.mac, conn);
        Ok(())
    }

    /// Process one operator command; the reply string goes back verbatim.
    pub async fn handle_command(&self, command: Command, client: Option<PathBuf>) -> String {
        self.metrics.commands_total.inc();

        let result = match command {
            Command::Ping => Ok(PING_REPLY.to_string()),
            Command::SubscribeEvents => self.subscribe_events(client).await,
            Command::AcceptMac { mac, vlan_id } => self.accept_mac(mac, vlan_id).await.map(ok),
            Command::DenyMac { mac } => self.deny_mac(mac).await.map(ok),
            Command::AddNat { mac } => self.set_nat(mac, true).await.map(ok),
            Command::RemoveNat { mac } => self.set_nat(mac, false).await.map(ok),
            Command::AssignPsk { mac, psk } => self.assign_psk(mac, psk.as_bytes()).await.map(ok),
            Command::ClearPsk { mac } => self.assign_psk(mac, b"").await.map(ok),
            Command::SetIp { change, mac, ip } => self.set_ip(change, mac, ip).await.map(ok),
            Command::AddBridge { left, right } => self.add_bridge(left, right).await.map(ok),
            Command::RemoveBridge { left, right } => {
                self.remove_bridge(left, right).await.map(ok)
            }
            Command::SetFingerprint {
                src_mac,
                dst_mac,
                protocol,
                fingerprint,
                timestamp,
                query,
            } => self
                .set_fingerprint(src_mac, dst_mac, &protocol, &fingerprint, timestamp, &query)
                .await
                .map(ok),
            Command::QueryFingerprint {
                mac,
                timestamp,
                op,
                protocol,
            } => self.query_fingerprint(mac, timestamp, op, &protocol).await,
            Command::RegisterTicket { mac, label, vlan_id } => {
                self.register_ticket(mac, &label, vlan_id).await
            }
            Command::GetMap { mac } => self.get_map(mac).await,
            Command::GetAll => self.get_all().await,
        };

        match result {
            Ok(reply) => reply,
            Err(e) => {
                debug!("Command failed: {:#}", e);
                self.metrics.command_failures_total.inc();
                FAIL_REPLY.to_string()
            }
        }
    }

    async fn subscribe_events(&self, client: Option<PathBuf>) -> Result<String> {
        let client = client.ok_or_else(|| anyhow!("subscriber has no bound address"))?;
        let mut inner = self.inner.lock().await;
        inner.subscribers.insert(client);
        Ok(OK_REPLY.to_string())
    }

    pub async fn accept_mac(&self, mac: MacAddr, vlan_id: u16) -> Result<()> {
        info!("ACCEPT_MAC mac={} vlanid={}", mac, vlan_id);
        let mut inner = self.inner.lock().await;

        let ifname = inner
            .state
            .vlans
            .get(&vlan_id)
            .map(|v| v.ifname.clone())
            .with_context(|| format!("no interface for VLAN {}", vlan_id))?;

        let mut conn = inner
            .state
            .mac_conns
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| self.default_conn(mac));
        conn.allow_connection = true;
        conn.vlan_id = vlan_id;
        conn.ifname = ifname;

        self.persist(&mut inner, conn).await?;
        inner.state.invalidate_attrs(&mac);
        Ok(())
    }

    pub async fn deny_mac(&self, mac: MacAddr) -> Result<()> {
        info!("DENY_MAC mac={}", mac);
        let mut inner = self.inner.lock().await;

        let mut conn = inner
            .state
            .mac_conns
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| self.default_conn(mac));
        conn.allow_connection = false;

        self.persist(&mut inner, conn).await?;
        inner.state.invalidate_attrs(&mac);
        drop(inner);

        // A denied device also loses its lease.
        if let Some(lease_file) = &self.policy.dhcp_lease_file {
            if let Err(e) = crate::dhcp::clear_lease(mac, lease_file) {
                debug!("Lease cleanup for {} failed: {:#}", mac, e);
            }
        }

        // Kick the station if it is currently associated. An unreachable
        // AP daemon reads as "not associated".
        if self.ap.check_sta(mac).await.unwrap_or(false) {
            self.ap
                .disconnect(mac)
                .await
                .context("AP disconnect failed")?;
        }
        Ok(())
    }

    async fn set_nat(&self, mac: MacAddr, nat: bool) -> Result<()> {
        info!("{} mac={}", if nat { "ADD_NAT" } else { "REMOVE_NAT" }, mac);
        let mut inner = self.inner.lock().await;

        let mut conn = inner
            .state
            .mac_conns
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| self.default_conn(mac));
        conn.nat = nat;

        let rule = match conn.ip_addr {
            Some(ip) => {
                let ifname = inner
                    .state
                    .subnets
                    .ifname_for(ip)
                    .with_context(|| format!("no interface serves {}", ip))?
                    .to_string();
                Some((ip, ifname))
            }
            None => None,
        };

        self.persist(&mut inner, conn).await?;

        if let Some((ip, ifname)) = rule {
            if nat {
                inner.nft.add_nat(ip, &ifname).await?;
            } else {
                inner.nft.delete_nat(ip, &ifname).await?;
            }
        }
        Ok(())
    }

    async fn assign_psk(&self, mac: MacAddr, psk: &[u8]) -> Result<()> {
        info!("{} mac={}", if psk.is_empty() { "CLEAR_PSK" } else { "ASSIGN_PSK" }, mac);
        let mut inner = self.inner.lock().await;

        let mut conn = inner
            .state
            .mac_conns
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| self.default_conn(mac));
        conn.set_psk(psk);

        self.persist(&mut inner, conn).await?;
        // A retired or replaced PSK must not survive in a cached chain.
        inner.state.invalidate_attrs(&mac);
        Ok(())
    }

    async fn set_ip(&self, change: IpChange, mac: MacAddr, ip: std::net::Ipv4Addr) -> Result<()> {
        let add = change == IpChange::Add;
        let mut inner = self.inner.lock().await;

        let ifname = inner
            .state
            .subnets
            .ifname_for(ip)
            .with_context(|| format!("no interface serves {}", ip))?
            .to_string();

        let mut conn = inner
            .state
            .mac_conns
            .get(&mac)
            .cloned()
            .unwrap_or_else(|| self.default_conn(mac));
        conn.ifname = ifname.clone();
        conn.ip_addr = if add { Some(ip) } else { None };
        let nat = conn.nat;

        info!("SET_IP add={} mac={} ip={} if={}", add, mac, ip, ifname);
        self.persist(&mut inner, conn).await?;

        if nat {
            if add {
                inner.nft.add_nat(ip, &ifname).await?;
            } else {
                inner.nft.delete_nat(ip, &ifname).await?;
            }
        }

        // Refresh the per-pair rules for every bridge peer with an address.
        let peers: Vec<(std::net::Ipv4Addr, String)> = inner
            .state
            .bridges
            .peers(&mac)
            .into_iter()
            .filter_map(|peer| {
                let peer_conn = inner.state.mac_conns.get(&peer)?;
                Some((peer_conn.ip_addr?, peer_conn.ifname.clone()))
            })
            .collect();

        for (peer_ip, peer_if) in peers {
            if add {
                inner
                    .nft
                    .add_bridge((ip, &ifname), (peer_ip, &peer_if))
                    .await?;
            } else {
                inner
                    .nft
                    .delete_bridge((ip, &ifname), (peer_ip, &peer_if))
                    .await?;
            }
        }
        Ok(())
    }

    fn bridge_endpoints(
        inner: &Inner,
        left: MacAddr,
        right: MacAddr,
    ) -> Option<((std::net::Ipv4Addr, String), (std::net::Ipv4Addr, String))> {
        let left_conn = inner.state.mac_conns.get(&left)?;
        let right_conn = inner.state.mac_conns.get(&right)?;
        Some((
            (left_conn.ip_addr?, left_conn.ifname.clone()),
            (right_conn.ip_addr?, right_conn.ifname.clone()),
        ))
    }

    pub async fn add_bridge(&self, left: MacAddr, right: MacAddr) -> Result<()> {
        info!("ADD_BRIDGE left_mac={} right_mac={}", left, right);
        let mut inner = self.inner.lock().await;

        if !inner.state.bridges.add(left, right) {
            debug!("Bridge {} <-> {} already present", left, right);
            return Ok(());
        }

        if let Some((a, b)) = Self::bridge_endpoints(&inner, left, right) {
            inner.nft.add_bridge((a.0, &a.1), (b.0, &b.1)).await?;
        }
        Ok(())
    }

    pub async fn remove_bridge(&self, left: MacAddr, right: MacAddr) -> Result<()> {
        info!("REMOVE_BRIDGE left_mac={} right_mac={}", left, right);
        let mut inner = self.inner.lock().await;

        if !inner.state.bridges.remove(left, right) {
            debug!("Bridge {} <-> {} not present", left, right);
            return Ok(());
        }

        if let Some((a, b)) = Self::bridge_endpoints(&inner, left, right) {
            inner.nft.delete_bridge((a.0, &a.1), (b.0, &b.1)).await?;
        }
        Ok(())
    }

    async fn set_fingerprint(
        &self,
        src_mac: MacAddr,
        dst_mac: MacAddr,
        protocol: &str,
        fingerprint: &str,
        timestamp: i64,
        query: &str,
    ) -> Result<()> {
        debug!(
            "SET_FINGERPRINT src_mac={} dst_mac={} protocol={} timestamp={}",
            src_mac, dst_mac, protocol, timestamp
        );
        // One row per endpoint.
        for mac in [src_mac, dst_mac] {
            self.db
                .save_fingerprint(&FingerprintRow {
                    mac: mac.to_string(),
                    protocol: protocol.to_string(),
                    fingerprint: fingerprint.to_string(),
                    timestamp,
                    query: query.to_string(),
                })
                .await?;
        }
        Ok(())
    }

    async fn query_fingerprint(
        &self,
        mac: MacAddr,
        timestamp: i64,
        op: TimeOp,
        protocol: &str,
    ) -> Result<String> {
        debug!(
            "QUERY_FINGERPRINT mac={} protocol={} op={} timestamp={}",
            mac,
            protocol,
            op.as_sql(),
            timestamp
        );
        // "all" is a wildcard, never a literal protocol.
        let protocol = (protocol != "all").then_some(protocol);
        let rows = self
            .db
            .query_fingerprints(&mac.to_string(), op, timestamp, protocol)
            .await?;

        if rows.is_empty() {
            return Ok(OK_REPLY.to_string());
        }
        Ok(rows
            .iter()
            .map(FingerprintRow::to_csv)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    pub async fn register_ticket(
        &self,
        mac: MacAddr,
        label: &str,
        vlan_id: u16,
    ) -> Result<String> {
        info!("REGISTER_TICKET mac={} label={} vlanid={}", mac, label, vlan_id);
        let mut inner = self.inner.lock().await;

        if inner.ticket.is_some() {
            bail!("an auth ticket is still active");
        }

        let passphrase: String = rand::rngs::OsRng
            .sample_iter(&Alphanumeric)
            .take(self.policy.ticket_passphrase_len)
            .map(char::from)
            .collect();

        inner.ticket = Some(AuthTicket {
            issuer_mac: mac,
            device_label: label.to_string(),
            vlan_id,
            passphrase: passphrase.clone(),
        });
        self.timers
            .register(TimerClass::TicketExpiry, 0, 0, self.policy.ticket_ttl);

        Ok(passphrase)
    }

    /// Timer-driver callback for the ticket TTL.
    pub async fn expire_ticket(&self) {
        let mut inner = self.inner.lock().await;
        if inner.ticket.take().is_some() {
            info!("Auth ticket timed out");
        }
    }

    async fn get_map(&self, mac: MacAddr) -> Result<String> {
        let inner = self.inner.lock().await;
        inner
            .state
            .mac_conns
            .get(&mac)
            .map(MacConn::to_string)
            .with_context(|| format!("no record for {}", mac))
    }

    async fn get_all(&self) -> Result<String> {
        let inner = self.inner.lock().await;
        if inner.state.mac_conns.is_empty() {
            return Ok(OK_REPLY.to_string());
        }
        let mut rows: Vec<String> = inner
            .state
            .mac_conns
            .values()
            .map(MacConn::to_string)
            .collect();
        rows.sort();
        Ok(rows.join("\n"))
    }

    /// The RADIUS identity decision for a joining station.
    pub async fn get_mac_conn(&self, mac: MacAddr) -> Option<RadiusIdentity> {
        let mut inner = self.inner.lock().await;
        let found = inner.state.mac_conns.get(&mac).cloned();

        if self.policy.allow_all_connections {
            let mut conn = found.unwrap_or_else(|| self.default_conn(mac));
            conn.allow_connection = true;
            conn.vlan_id = self.policy.default_open_vlanid;
            conn.set_psk(self.policy.wpa_passphrase.as_bytes());
            return self.admit(&mut inner, conn).await;
        }

        match found {
            Some(conn) if conn.allow_connection && !conn.psk.is_empty() => {
                self.admit(&mut inner, conn).await
            }
            None => self.admit_unassigned(&mut inner, mac, None).await,
            Some(conn) if conn.allow_connection => {
                self.admit_unassigned(&mut inner, mac, Some(conn)).await
            }
            Some(_) => {
                info!("REJECTING mac={}", mac);
                None
            }
        }
    }

    /// Admit a station with no usable assignment: consume the live ticket
    /// if one exists, else fall back to the default open VLAN.
    async fn admit_unassigned(
        &self,
        inner: &mut Inner,
        mac: MacAddr,
        existing: Option<MacConn>,
    ) -> Option<RadiusIdentity> {
        debug!("mac={} not assigned, checking for an active ticket", mac);
        let mut conn = existing.unwrap_or_else(|| self.default_conn(mac));
        conn.allow_connection = true;

        match inner.ticket.take() {
            Some(ticket) => {
                debug!("Assigning auth ticket to {}", mac);
                conn.vlan_id = ticket.vlan_id;
                conn.set_psk(ticket.passphrase.as_bytes());
                conn.set_label(&ticket.device_label);
                self.timers
                    .cancel(TimerClass::TicketExpiry, crate::timers::CtxMatch::Any, crate::timers::CtxMatch::Any);
            }
            None => {
                debug!("Assigning default connection to {}", mac);
                conn.vlan_id = self.policy.default_open_vlanid;
                conn.set_psk(self.policy.wpa_passphrase.as_bytes());
            }
        }
        self.admit(inner, conn).await
    }

    /// Final admission steps shared by every allow path: capture
    /// scheduling, join stamp, persistence and the memoized attributes.
    async fn admit(&self, inner: &mut Inner, mut conn: MacConn) -> Option<RadiusIdentity> {
        if let Err(e) = self.maybe_schedule_capture(inner, conn.vlan_id) {
            warn!("Capture scheduling failed, REJECTING mac={}: {:#}", conn.mac, e);
            return None;
        }

        conn.join_timestamp = chrono::Utc::now().timestamp_micros();
        if let Some(vlan) = inner.state.vlans.get(&conn.vlan_id) {
            conn.ifname = vlan.ifname.clone();
        }

        info!("ALLOWING mac={} on vlanid={}", conn.mac, conn.vlan_id);
        let identity = self.identity_for(inner, &conn);
        if let Err(e) = self.persist(inner, conn).await {
            warn!("Device record save failed: {:#}", e);
            return None;
        }
        Some(identity)
    }

    fn maybe_schedule_capture(&self, inner: &mut Inner, vlan_id: u16) -> Result<()> {
        if !self.policy.exec_capture {
            return Ok(());
        }
        let vlan = inner
            .state
            .vlans
            .get(&vlan_id)
            .with_context(|| format!("ifname not found for vlanid={}", vlan_id))?;
        if vlan.analyser_pid.is_some() {
            return Ok(());
        }

        let ifname = vlan.ifname.clone();
        debug!("Starting analyser on if={}", ifname);
        let pid = inner.capture.spawn(vlan_id, &ifname)?;
        self.metrics.capture_spawns_total.inc();
        if let Some(vlan) = inner.state.vlans.get_mut(&vlan_id) {
            vlan.analyser_pid = Some(pid);
        }
        Ok(())
    }

    /// Memoized RADIUS attribute material for a device. The cached chain
    /// pins the Tunnel-Password salt so a retransmitted request gets a
    /// byte-identical reply.
    fn identity_for(&self, inner: &mut Inner, conn: &MacConn) -> RadiusIdentity {
        let vlan_value = conn.vlan_id.to_string().into_bytes();

        let cached_salt = inner.state.cached_attrs(&conn.mac).and_then(|chain| {
            let vlan_matches = chain
                .iter()
                .any(|(typ, value)| *typ == packet::attr::TUNNEL_PRIVATE_GROUP_ID && *value == vlan_value);
            if !vlan_matches {
                return None;
            }
            chain
                .iter()
                .find(|(typ, _)| *typ == packet::attr::TUNNEL_PASSWORD)
                .and_then(|(_, value)| value.as_slice().try_into().ok())
        });

        let salt: [u8; 2] = match cached_salt {
            Some(salt) => salt,
            None => {
                let salt = packet::random_tunnel_salt();
                let chain: AttrChain = vec![
                    (packet::attr::TUNNEL_TYPE, packet::TUNNEL_TYPE_VLAN.to_be_bytes().to_vec()),
                    (
                        packet::attr::TUNNEL_MEDIUM_TYPE,
                        packet::TUNNEL_MEDIUM_IEEE_802.to_be_bytes().to_vec(),
                    ),
                    (packet::attr::TUNNEL_PRIVATE_GROUP_ID, vlan_value),
                    (packet::attr::TUNNEL_PASSWORD, salt.to_vec()),
                ];
                inner.state.cache_attrs(conn.mac, chain);
                salt
            }
        };

        RadiusIdentity {
            vlan_id: conn.vlan_id,
            psk: (!conn.psk.is_empty()).then(|| conn.psk.clone()),
            tunnel_salt: salt,
        }
    }

    /// AP monitor callback: count, log and fan out to subscribers.
    pub async fn handle_ap_event(&self, event: ApEvent) {
        self.metrics.ap_events_total.inc();

        let line = match event {
            ApEvent::Connected(mac) => {
                info!("AP-STA-CONNECTED mac={}", mac);
                format!("AP-STA-CONNECTED {}", mac)
            }
            ApEvent::Disconnected(mac) => {
                info!("AP-STA-DISCONNECTED mac={}", mac);
                format!("AP-STA-DISCONNECTED {}", mac)
            }
        };

        let subscribers: Vec<PathBuf> = {
            let inner = self.inner.lock().await;
            inner.subscribers.iter().cloned().collect()
        };

        let mut dead = Vec::new();
        for subscriber in subscribers {
            if sock::notify(&subscriber, &line).await.is_err() {
                dead.push(subscriber);
            }
        }
        if !dead.is_empty() {
            let mut inner = self.inner.lock().await;
            for subscriber in dead {
                debug!("Dropping dead event subscriber {:?}", subscriber);
                inner.subscribers.remove(&subscriber);
            }
        }
    }

    /// Periodic sweep clearing analyser slots of exited capture workers.
    pub async fn reap_capture_workers(&self) {
        let mut inner = self.inner.lock().await;
        for vlan_id in inner.capture.reap_exited() {
            if let Some(vlan) = inner.state.vlans.get_mut(&vlan_id) {
                vlan.analyser_pid = None;
            }
        }
    }

    /// AP liveness probe driven by the timer queue.
    pub async fn probe_ap(&self) {
        if let Err(e) = self.ap.ping().await {
            warn!("AP liveness probe failed: {:#}", e);
        }
    }

    /// Teardown: kill capture workers (reverse start order is handled by
    /// the runtime).
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        inner.capture.shutdown().await;
    }

    #[cfg(test)]
    pub(crate) async fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        let mut inner = self.inner.lock().await;
        f(&mut inner)
    }
}

fn ok(_: ()) -> String {
    OK_REPLY.to_string()
}

impl IdentitySource for Supervisor {
    async fn identify(&self, mac: MacAddr) -> Option<RadiusIdentity> {
        self.get_mac_conn(mac).await
    }
}

#[cfg(test)]
mod tests;
