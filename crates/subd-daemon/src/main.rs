//! subd - Managed-machine reconciliation agent
//!
//! This binary runs on every managed machine and:
//! - Continuously scans the managed filesystem at a throttled rate
//! - Serves the reconciliation protocol (Poll, Fetch, Update, Cleanup,
//!   configuration, GetFiles) to a coordinator over HTTP
//! - Shuts down gracefully on SIGTERM/SIGINT
//!
//! # Startup
//!
//! Configuration comes from a YAML file, with command-line flags taking
//! precedence. An invalid configuration or a private working directory that
//! cannot be prepared is fatal.

use std::fs::DirBuilder;
use std::os::unix::fs::DirBuilderExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use subd_cache::ObjectCache;
use subd_core::config::{Config, LoggingConfig};
use subd_reconcile::ServiceCommandRunner;
use subd_rpc::{load_netbench, HttpObjectServerConnector, RpcServer, ServiceSettings, SubService};
use subd_scanner::{RateLimiter, ScanDaemon, ScanSettings};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Command line
// ============================================================================

#[derive(Debug, Parser)]
#[command(name = "subd", version, about = "Managed-machine reconciliation agent")]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value_os_t = Config::default_path())]
    config: PathBuf,

    /// Root of the managed filesystem
    #[arg(long)]
    root_dir: Option<PathBuf>,

    /// Private working directory, relative to the root
    #[arg(long)]
    work_dir: Option<String>,

    /// Address for the RPC server
    #[arg(long)]
    listen: Option<String>,

    /// Seconds between scans
    #[arg(long)]
    scan_interval: Option<u64>,

    /// Percentage of disk capacity the scanner may use
    #[arg(long)]
    scan_speed_percent: Option<u8>,

    /// Percentage of network capacity a fetch may use
    #[arg(long)]
    network_speed_percent: Option<u8>,

    /// Reject Fetch and Update
    #[arg(long)]
    read_only: bool,

    /// Reject Update
    #[arg(long)]
    disable_updates: bool,

    /// Log service triggers instead of running them
    #[arg(long)]
    disable_triggers: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    /// Loads the configuration file (if present) and applies flag overrides.
    fn load_config(&self) -> Result<Config> {
        let mut config = if self.config.exists() {
            Config::load(&self.config)
                .with_context(|| format!("Failed to load {}", self.config.display()))?
        } else {
            Config::default()
        };
        self.apply_overrides(&mut config);
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut Config) {
        if let Some(root_dir) = &self.root_dir {
            config.scanner.root_dir = root_dir.clone();
        }
        if let Some(work_dir) = &self.work_dir {
            config.storage.work_dir = work_dir.clone();
        }
        if let Some(listen) = &self.listen {
            config.rpc.listen_address = listen.clone();
        }
        if let Some(interval) = self.scan_interval {
            config.scanner.interval_secs = interval;
        }
        if let Some(percent) = self.scan_speed_percent {
            config.scanner.speed_percent = percent;
        }
        if let Some(percent) = self.network_speed_percent {
            config.network.speed_percent = percent;
        }
        config.safety.read_only |= self.read_only;
        config.safety.disable_updates |= self.disable_updates;
        config.triggers.disabled |= self.disable_triggers;
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.logging.json |= self.log_json;
    }
}

// ============================================================================
// Daemon
// ============================================================================

/// The assembled agent, ready to run
struct SubDaemon {
    listen_address: String,
    scanner: ScanDaemon,
    service: SubService,
}

impl SubDaemon {
    /// Prepares the working directory and wires every component together.
    fn new(config: &Config) -> Result<Self> {
        let work_dir = config.work_dir_path();
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&work_dir)
            .with_context(|| format!("Failed to create working directory {}", work_dir.display()))?;
        let cache = ObjectCache::open(config.objects_dir())
            .context("Failed to open object cache")?;

        let network_speed = load_netbench(&config.netbench_file()).unwrap_or_else(|e| {
            warn!(error = %format!("{e:#}"), "Ignoring saved network benchmark");
            None
        });
        let net_rate = Arc::new(RateLimiter::new(
            "network",
            network_speed.unwrap_or(0),
            config.network.speed_percent,
        ));
        if network_speed.is_some() {
            info!(limiter = %net_rate, "Loaded network benchmark");
        }
        let disk_rate = Arc::new(RateLimiter::new("disk", 0, config.scanner.speed_percent));

        let filter = config.scan_filter().context("Invalid scan exclusions")?;
        let (scanner, handle) = ScanDaemon::new(
            ScanSettings {
                root: config.scanner.root_dir.clone(),
                interval: Duration::from_secs(config.scanner.interval_secs),
                one_file_system: config.scanner.one_file_system,
            },
            filter,
            cache.clone(),
            disk_rate,
        );

        let runner = Arc::new(ServiceCommandRunner::new(
            config.triggers.command.clone(),
            config.triggers.disabled,
        ));
        let connector = Arc::new(HttpObjectServerConnector::new(Duration::from_secs(
            config.network.request_timeout_secs,
        )));
        let service = SubService::new(
            ServiceSettings::from_config(config),
            handle,
            cache,
            net_rate,
            connector,
            runner,
            config.scanner.exclusions.clone(),
        );

        Ok(Self {
            listen_address: config.rpc.listen_address.clone(),
            scanner,
            service,
        })
    }

    /// Runs the scanner and the RPC server until `shutdown` is cancelled.
    async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let scanner = tokio::spawn(self.scanner.run());
        let server = RpcServer::bind(self.service, &self.listen_address).await?;
        let result = server.run(shutdown).await;
        // The scan loop ends once the last handle is gone.
        scanner.abort();
        result
    }
}

// ============================================================================
// Logging and signals
// ============================================================================

fn init_tracing(logging: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Waits for SIGTERM or SIGINT and triggers the cancellation token
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C)");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }

    token.cancel();
}

// ============================================================================
// Main entry point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;
    init_tracing(&config.logging);

    let errors = config.validate();
    if !errors.is_empty() {
        for e in &errors {
            error!(error = %e, "Invalid configuration");
        }
        bail!("configuration has {} error(s)", errors.len());
    }

    info!(
        root = %config.scanner.root_dir.display(),
        listen = %config.rpc.listen_address,
        "subd starting"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal(signal_token).await;
    });

    let daemon = SubDaemon::new(&config)?;
    let result = daemon.run(shutdown).await;

    match &result {
        Ok(()) => info!("subd shut down gracefully"),
        Err(e) => error!(error = %format!("{e:#}"), "subd exiting with error"),
    }

    result
}

// ============================================================================
// Tests
// ============================================================================
