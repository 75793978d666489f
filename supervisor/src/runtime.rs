//! Process runtime
//!
//! Explicit context carrying the supervisor and its service tasks: the
//! command socket, the RADIUS server, the AP event monitor, the timer
//! driver and the metrics endpoint. SIGTERM/SIGINT drain the tasks and
//! tear down in reverse start order; SIGHUP only re-opens the log file.

use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::ap::{ApClient, ApMonitor};
use crate::capture::CaptureScheduler;
use crate::config::Config;
use crate::crypt::CryptStore;
use crate::db::Database;
use crate::dhcp;
use crate::metrics::{self, Metrics};
use crate::nft::NetfilterController;
use crate::radius::{RadiusServer, RadiusServerConfig};
use crate::state::StateStore;
use crate::supervisor::server::ControlServer;
use crate::supervisor::{Policy, Supervisor};
use crate::timers::{TimerClass, TimerQueue};

/// Exclusively locked PID file; the lock outlives the struct's scope and
/// the file is unlinked on drop.
pub struct PidFile {
    path: PathBuf,
    _file: std::fs::File,
}

impl PidFile {
    pub fn acquire(path: PathBuf, kill_existing: bool) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open PID file {:?}", path))?;

        if !Self::try_lock(&file) {
            if !kill_existing {
                bail!("another supervisor holds the PID lock at {:?}", path);
            }
            Self::kill_holder(&path)?;
            if !Self::try_lock(&file) {
                bail!("PID lock at {:?} still held after kill", path);
            }
        }

        use std::io::Write;
        file.set_len(0).context("Failed to truncate PID file")?;
        let mut locked = &file;
        locked
            .write_all(format!("{}\n", std::process::id()).as_bytes())
            .context("Failed to write PID")?;

        Ok(Self { path, _file: file })
    }

    fn try_lock(file: &std::fs::File) -> bool {
        // Advisory lock; std opens with O_CLOEXEC so children never
        // inherit it.
        unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) == 0 }
    }

    fn kill_holder(path: &PathBuf) -> Result<()> {
        let content = std::fs::read_to_string(path).unwrap_or_default();
        let pid: i32 = content
            .trim()
            .parse()
            .with_context(|| format!("PID file {:?} holds no pid", path))?;
        warn!("Killing running supervisor pid={}", pid);
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        std::thread::sleep(Duration::from_millis(500));
        Ok(())
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub struct Runtime {
    config: Config,
    supervisor: Arc<Supervisor>,
    shutdown_tx: broadcast::Sender<()>,
    _pidfile: PidFile,
}

impl Runtime {
    /// Build the full supervisor context: database, credential store,
    /// state maps, netfilter controller and capture scheduler, then
    /// restore persisted records and apply the configured seeds.
    pub async fn new(config: Config, master_secret: Option<Vec<u8>>) -> Result<Self> {
        let pidfile = PidFile::acquire(
            config.system.pid_file_path.clone(),
            config.system.kill_running_process,
        )?;

        let db = Database::open(&config.db.path).await?;
        let crypt = CryptStore::new(db.clone(), master_secret);
        if !crypt.has_master() {
            warn!("No master secret given, device PSKs will not be persisted encrypted");
        }

        let state = StateStore::new(&config.interfaces);
        let ap = ApClient::new(
            config.ap.ctrl_interface_path.clone(),
            Duration::from_millis(config.ap.command_timeout_ms),
        );
        let nft = NetfilterController::new(&config.nat.nat_interface, config.nat.exec_netfilter);
        let capture = CaptureScheduler::new(
            config.capture.clone(),
            config.db.path.clone(),
            config.supervisor.domain_server_path.clone(),
        );

        let supervisor = Supervisor::new(
            Policy::from_config(&config),
            state,
            db,
            crypt,
            ap,
            nft,
            capture,
            Arc::new(TimerQueue::new()),
            Metrics::new()?,
        );

        supervisor.reload_from_db().await?;
        for seed in &config.connections {
            supervisor
                .seed_connection(seed)
                .await
                .with_context(|| format!("Failed to seed connection {}", seed.mac))?;
        }

        if config.system.exec_dhcp {
            dhcp::write_artifacts(
                &config.dhcp,
                &config.interfaces,
                &config.supervisor.domain_server_path,
            )?;
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            supervisor,
            shutdown_tx,
            _pidfile: pidfile,
        })
    }

    pub fn supervisor(&self) -> Arc<Supervisor> {
        Arc::clone(&self.supervisor)
    }

    /// Run until terminated. `on_sighup` re-opens the log file; no other
    /// state reacts to SIGHUP.
    pub async fn run(&self, on_sighup: impl Fn() + Send + 'static) -> Result<()> {
        let mut handles = Vec::new();

        // Command socket (operators and the DHCP hook).
        let control = ControlServer::new(
            self.config.supervisor.domain_server_path.clone(),
            self.supervisor(),
        );
        let control_shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = control.run(control_shutdown).await {
                error!("Command socket error: {:#}", e);
            }
        }));

        // RADIUS authentication server.
        if self.config.system.exec_radius {
            let server = RadiusServer::new(
                RadiusServerConfig {
                    port: self.config.radius.port,
                    secret: self.config.radius.secret.clone().into_bytes(),
                    client_ip: self.config.radius.client_ip,
                    client_mask: self.config.radius.client_mask,
                    eap: self.config.radius.eap.to_eap_config(),
                },
                self.supervisor(),
                self.supervisor.metrics(),
            );
            let radius_shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = server.run(radius_shutdown).await {
                    error!("RADIUS server error: {:#}", e);
                }
            }));
        }

        // AP event monitor feeding the supervisor.
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let monitor = ApMonitor::new(self.config.ap.ctrl_interface_path.clone());
        let monitor_shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            if let Err(e) = monitor.run(event_tx, monitor_shutdown).await {
                warn!("AP monitor unavailable: {:#}", e);
            }
        }));
        let event_supervisor = self.supervisor();
        let mut pump_shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = pump_shutdown.recv() => break,
                    event = event_rx.recv() => match event {
                        Some(event) => event_supervisor.handle_ap_event(event).await,
                        None => break,
                    }
                }
            }
        }));

        // Timer driver: ticket TTL and the AP liveness probe.
        let timers = self.supervisor.timers();
        timers.register(
            TimerClass::ApLiveness,
            0,
            0,
            Duration::from_secs(self.config.ap.ping_interval_secs),
        );
        let timer_supervisor = self.supervisor();
        let ping_interval = Duration::from_secs(self.config.ap.ping_interval_secs);
        let mut timer_shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = timer_shutdown.recv() => break,
                    fired = timers.wait_fired() => match fired.class {
                        TimerClass::TicketExpiry => timer_supervisor.expire_ticket().await,
                        TimerClass::ApLiveness => {
                            timer_supervisor.probe_ap().await;
                            timers.register(TimerClass::ApLiveness, 0, 0, ping_interval);
                        }
                    }
                }
            }
        }));

        // Capture worker reaper.
        let reap_supervisor = self.supervisor();
        let mut reap_shutdown = self.shutdown_tx.subscribe();
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = reap_shutdown.recv() => break,
                    _ = ticker.tick() => reap_supervisor.reap_capture_workers().await,
                }
            }
        }));

        // Metrics endpoint.
        if self.config.metrics.enabled {
            let metrics = self.supervisor.metrics();
            let port = self.config.metrics.port;
            let path = self.config.metrics.path.clone();
            let metrics_shutdown = self.shutdown_tx.subscribe();
            handles.push(tokio::spawn(async move {
                if let Err(e) = metrics::serve(metrics, port, path, metrics_shutdown).await {
                    error!("Metrics endpoint error: {:#}", e);
                }
            }));
        }

        // Signal handling: TERM/INT terminate, HUP re-opens the log.
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .context("Failed to install SIGTERM handler")?;
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
            .context("Failed to install SIGINT handler")?;
        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .context("Failed to install SIGHUP handler")?;

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sigint.recv() => {
                    info!("SIGINT received");
                    break;
                }
                _ = sighup.recv() => {
                    info!("SIGHUP received, re-opening log file");
                    on_sighup();
                }
            }
        }

        // Drain tasks, newest first, then kill the capture children.
        let _ = self.shutdown_tx.send(());
        for handle in handles.into_iter().rev() {
            let _ = handle.await;
        }
        self.supervisor.shutdown().await;

        info!("Runtime stopped");
        Ok(())
    }

    /// Programmatic termination (tests, embedding).
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
