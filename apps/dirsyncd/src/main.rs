//! dirsyncd
//!
//! Keeps a Cyrus-style mail store in step with an LDAP directory: one
//! worker per served domain, mailboxes and shared folders created, renamed
//! and removed as directory entries change.

mod config;
mod connectors;
mod logging;
mod pid;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use config::{DaemonConfig, DEFAULT_CONFIG_PATH};
use connectors::LdapImapFactory;
use dirsync_connector::error::ConnectorError;
use dirsync_connector::types::FeedStrategy;
use dirsync_provisioning::{DefaultWorkerSpawner, Supervisor, SupervisorConfig};
use logging::LogFormat;
use pid::PidFile;

/// Directory to mail store synchronization daemon
#[derive(Debug, Parser)]
#[command(name = "dirsyncd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write the process id to this file
    #[arg(long)]
    pid_file: Option<PathBuf>,

    /// Ignore stored watermarks and sync cursors on the first pass
    #[arg(long)]
    resync: bool,

    /// Force a change feed strategy (persistent, syncrepl, paged, plain)
    #[arg(long)]
    strategy: Option<FeedStrategy>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    /// Serve only this domain and skip namespace discovery
    #[arg(long)]
    domain: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match DaemonConfig::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };
    if cli.strategy.is_some() {
        config.engine.sync.strategy = cli.strategy;
    }

    logging::init_logging(&config.log_filter, cli.log_format);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config.display(),
        ldap = %config.ldap.url(),
        imap = %config.imap.address(),
        primary_domain = %config.engine.sync.primary_domain,
        strategy = ?config.engine.sync.strategy,
        resync = cli.resync,
        "Starting dirsyncd"
    );

    let cancel = CancellationToken::new();
    let Daemon {
        mut supervisor,
        pid_file: _pid_file,
    } = match prepare(&config, &cli, cancel.clone()) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!(error = %e, "Startup failed");
            eprintln!("Error: {e}");
            std::process::exit(1);
        }
    };

    tokio::spawn(log_reload_requests());
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel.cancel();
    });

    supervisor.run().await;
    info!("dirsyncd stopped");
}

/// Errors after configuration loading that prevent startup.
#[derive(Debug, Error)]
enum StartupError {
    #[error("Cannot create directory connector: {0}")]
    Directory(#[from] ConnectorError),

    #[error("Cannot write PID file {path}: {source}")]
    PidFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A supervisor ready to run, and the PID file announcing it.
struct Daemon {
    supervisor: Supervisor,
    pid_file: Option<PidFile>,
}

/// Build the supervisor. The PID file is written last, so no failure can
/// leave it behind.
fn prepare(
    config: &DaemonConfig,
    cli: &Cli,
    cancel: CancellationToken,
) -> Result<Daemon, StartupError> {
    let factory = Arc::new(LdapImapFactory::new(
        config.ldap.clone(),
        config.imap.clone(),
        config.engine.sync.clone(),
    ));
    let discovery = factory.discovery()?;

    let spawner = DefaultWorkerSpawner::new(
        Arc::new(config.engine.clone()),
        config.schema(),
        factory,
    )
    .with_page_size(config.ldap.page_size)
    .with_resync(cli.resync);

    let supervisor = Supervisor::new(
        discovery,
        Arc::new(Arc::new(spawner)),
        SupervisorConfig::from_config(&config.engine).with_fixed_namespace(cli.domain.clone()),
        cancel,
    );

    let pid_file = match cli.pid_file.as_ref().or(config.pid_file.as_ref()) {
        Some(path) => Some(PidFile::create(path).map_err(|source| StartupError::PidFile {
            path: path.clone(),
            source,
        })?),
        None => None,
    };

    Ok(Daemon {
        supervisor,
        pid_file,
    })
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        () = terminate => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

/// SIGHUP is acknowledged but configuration is only read at startup.
async fn log_reload_requests() {
    #[cfg(unix)]
    match signal::unix::signal(signal::unix::SignalKind::hangup()) {
        Ok(mut sig) => {
            while sig.recv().await.is_some() {
                warn!("Received SIGHUP, configuration reload is not supported; restart to apply changes");
            }
        }
        Err(e) => error!("Failed to install SIGHUP handler: {e}"),
    }
}
