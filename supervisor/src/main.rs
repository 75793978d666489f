//! EDGESec Supervisor - network-edge security control plane

use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use edgesec_supervisor::config::Config;
use edgesec_supervisor::Runtime;

/// EDGESec network-edge security supervisor
#[derive(Parser, Debug)]
#[command(name = "edgesec-supervisor")]
#[command(version)]
#[command(about = "Per-device VLAN partitioning, authentication and capture", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/edgesec/supervisor.toml")]
    config: PathBuf,

    /// Master secret for the encrypted credential store (falls back to
    /// the EDGESEC_MASTER_SECRET environment variable)
    #[arg(short = 's', long)]
    master_secret: Option<String>,

    /// Run in debug mode (verbose logging)
    #[arg(short, long)]
    debug: bool,
}

/// Log file writer that SIGHUP can re-open in place.
#[derive(Clone)]
struct ReopenableFile {
    path: PathBuf,
    file: Arc<Mutex<std::fs::File>>,
}

impl ReopenableFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = Self::open_file(&path)?;
        Ok(Self {
            path,
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn open_file(path: &PathBuf) -> Result<std::fs::File> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {:?}", path))
    }

    fn reopen(&self) {
        match Self::open_file(&self.path) {
            Ok(file) => *self.file.lock().unwrap() = file,
            Err(e) => warn!("Log re-open failed: {:#}", e),
        }
    }
}

struct ReopenableWriter(Arc<Mutex<std::fs::File>>);

impl Write for ReopenableWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().unwrap().flush()
    }
}

impl<'a> MakeWriter<'a> for ReopenableFile {
    type Writer = ReopenableWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ReopenableWriter(Arc::clone(&self.file))
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    config.validate()?;

    let (log_file, _stdout_guard) = setup_logging(&config, args.debug)?;

    info!("EDGESec supervisor starting...");
    info!("Command socket: {:?}", config.supervisor.domain_server_path);
    info!("Database: {:?}", config.db.path);

    let master_secret = args
        .master_secret
        .or_else(|| std::env::var("EDGESEC_MASTER_SECRET").ok())
        .map(String::into_bytes);

    let runtime = Runtime::new(config, master_secret)
        .await
        .with_context(|| "Failed to initialize runtime")?;

    runtime
        .run(move || {
            if let Some(file) = &log_file {
                file.reopen();
            }
        })
        .await?;

    info!("EDGESec supervisor stopped");
    Ok(())
}

/// Setup logging based on configuration
fn setup_logging(
    config: &Config,
    debug: bool,
) -> Result<(Option<ReopenableFile>, Option<tracing_appender::non_blocking::WorkerGuard>)> {
    let level = if debug {
        Level::DEBUG
    } else {
        match config.logging.level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" | "warning" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("edgesec_supervisor={}", level).parse().unwrap())
        .add_directive("sqlx=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap());

    let json = config.logging.format == "json";

    let log_file = config
        .logging
        .file
        .as_ref()
        .map(|path| ReopenableFile::open(path.clone()))
        .transpose()?;

    let file_layer = log_file.as_ref().map(|file| {
        fmt::layer()
            .with_writer(file.clone())
            .with_ansi(false)
            .with_target(true)
    });

    let (stdout_layer, guard) = if config.logging.stdout {
        let (writer, guard) = tracing_appender::non_blocking(std::io::stdout());
        (Some(fmt::layer().with_writer(writer)), Some(guard))
    } else {
        (None, None)
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(stdout_layer.map(|l| l.json().boxed()))
            .with(file_layer.map(|l| l.json().boxed()))
            .init();
    } else {
        registry
            .with(stdout_layer.map(|l| l.with_target(true).boxed()))
            .with(file_layer.map(|l| l.boxed()))
            .init();
    }

    Ok((log_file, guard))
}
