//! EDGESec Capture Worker - per-VLAN packet capture

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgesec_capture::decode;
use edgesec_capture::report::{self, FingerprintReporter};
use edgesec_capture::sniffer::{print_interfaces, RawPacket, Sniffer};
use edgesec_capture::{FrameFilter, MetaWriter, PacketRecord};

/// EDGESec per-VLAN capture worker
#[derive(Parser, Debug)]
#[command(name = "edgesec-capture")]
#[command(version)]
#[command(about = "Captures and fingerprints packets on one VLAN interface", long_about = None)]
struct Args {
    /// Interface to capture on
    #[arg(long, required_unless_present = "list_interfaces")]
    interface: Option<String>,

    /// SQLite database receiving the pcap metadata rows
    #[arg(long, default_value = "/var/lib/edgesec/edgesec.db")]
    db_path: PathBuf,

    /// Maximum captured bytes per packet
    #[arg(long, default_value_t = 1518)]
    snaplen: usize,

    /// Read timeout in milliseconds (ignored with --immediate)
    #[arg(long, default_value_t = 100)]
    buffer_timeout_ms: u64,

    /// Enable promiscuous mode on the interface
    #[arg(long)]
    promiscuous: bool,

    /// Near-zero read timeout (immediate delivery)
    #[arg(long)]
    immediate: bool,

    /// Capture filter (`ether src|dst|host <mac>`, `or`-combined)
    #[arg(long, default_value = "")]
    filter: String,

    /// Supervisor command socket for fingerprint reports
    #[arg(long)]
    supervisor_socket: Option<PathBuf>,

    /// Rows per metadata flush
    #[arg(long, default_value_t = 256)]
    batch_size: usize,

    /// Metadata flush interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    flush_interval_ms: u64,

    /// List available network interfaces
    #[arg(long)]
    list_interfaces: bool,

    /// Run in debug mode (verbose logging)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    setup_logging(args.debug);

    if args.list_interfaces {
        print_interfaces();
        return Ok(());
    }
    let interface = args
        .interface
        .clone()
        .context("an interface is required")?;

    let filter = FrameFilter::parse(&args.filter)
        .with_context(|| format!("Bad capture filter {:?}", args.filter))?;
    let writer = MetaWriter::open(&args.db_path).await?;
    let reporter = args.supervisor_socket.clone().map(FingerprintReporter::new);

    info!("EDGESec capture worker starting on {:?}", interface);
    if !filter.expression().is_empty() {
        info!("Filter: {}", filter.expression());
    }

    let sniffer = Arc::new(Sniffer::new(
        &interface,
        args.promiscuous,
        args.snaplen,
        Duration::from_millis(args.buffer_timeout_ms),
        args.immediate,
    )?);
    let stats = sniffer.stats();

    let (capture_handle, capture_rx) = Arc::clone(&sniffer).start_threaded(8192);

    // Bridge the capture thread's channel into the async side.
    let (packet_tx, packet_rx) = mpsc::channel::<RawPacket>(1024);
    let bridge_handle = tokio::task::spawn_blocking(move || {
        while let Ok(raw) = capture_rx.recv() {
            if packet_tx.blocking_send(raw).is_err() {
                break;
            }
        }
    });

    // Consume until a termination signal arrives.
    let consumer = consume(
        packet_rx,
        writer,
        reporter,
        filter,
        interface.clone(),
        args.batch_size,
        Duration::from_millis(args.flush_interval_ms),
    );

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())
        .context("Failed to install SIGINT handler")?;

    tokio::select! {
        result = consumer => result?,
        _ = sigterm.recv() => info!("SIGTERM received"),
        _ = sigint.recv() => info!("SIGINT received"),
    }

    info!("Shutting down...");
    sniffer.stop();
    let _ = capture_handle.join();
    bridge_handle.abort();

    let (packets, bytes, dropped) = stats.snapshot();
    info!(
        "Final stats: packets={}, bytes={}, dropped={}",
        packets, bytes, dropped
    );

    info!("EDGESec capture worker stopped");
    Ok(())
}

/// Decode, filter, persist and report packets until the channel closes.
async fn consume(
    mut packets: mpsc::Receiver<RawPacket>,
    writer: MetaWriter,
    reporter: Option<FingerprintReporter>,
    filter: FrameFilter,
    interface: String,
    batch_size: usize,
    flush_interval: Duration,
) -> Result<()> {
    let mut batch: Vec<PacketRecord> = Vec::with_capacity(batch_size);
    let mut seq: u64 = 0;
    let mut ticker = tokio::time::interval(flush_interval);

    loop {
        tokio::select! {
            raw = packets.recv() => {
                let Some(raw) = raw else {
                    break;
                };

                let summary = match decode::parse_packet(&raw.data) {
                    Ok(summary) => summary,
                    Err(e) => {
                        debug!("Undecodable frame ({} bytes): {}", raw.caplen, e);
                        continue;
                    }
                };
                if !filter.matches(&summary) {
                    continue;
                }

                batch.push(PacketRecord {
                    timestamp: raw.timestamp,
                    caplen: raw.caplen,
                    length: raw.length,
                    name: format!("{}-{}", raw.timestamp, seq),
                    interface: interface.clone(),
                    filter: filter.expression().to_string(),
                });
                seq += 1;

                if let (Some(reporter), Some(obs)) = (&reporter, report::observe(&summary)) {
                    if let Err(e) = reporter.report(&summary, &obs, raw.timestamp).await {
                        warn!("Fingerprint report failed: {:#}", e);
                    }
                }

                if batch.len() >= batch_size {
                    writer.write_batch(&batch).await?;
                    batch.clear();
                }
            }
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    writer.write_batch(&batch).await?;
                    batch.clear();
                }
            }
        }
    }

    // Final flush on channel close.
    writer.write_batch(&batch).await?;
    Ok(())
}

/// Setup logging from the debug flag (workers log to the supervisor's
/// stdio).
fn setup_logging(debug: bool) {
    let level = if debug { Level::DEBUG } else { Level::INFO };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("edgesec_capture={}", level).parse().unwrap())
        .add_directive("sqlx=warn".parse().unwrap());

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .init();
}
