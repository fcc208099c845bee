use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use director::store::StoreError;
use director::{ConfigError, DirectorConfig, DirectorError, HostStateManager, Ports, SqliteHostDb};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::Commands;

#[derive(Debug)]
pub enum CliError {
    Config(ConfigError),
    Store(StoreError),
    Director(DirectorError),
    Json(serde_json::Error),
    IoError(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(err) => write!(f, "Configuration error: {}", err),
            CliError::Store(err) => write!(f, "Store error: {}", err),
            CliError::Director(err) => write!(f, "{}", err),
            CliError::Json(err) => write!(f, "Invalid JSON: {}", err),
            CliError::IoError(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for CliError {}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        CliError::Config(err)
    }
}

impl From<StoreError> for CliError {
    fn from(err: StoreError) -> Self {
        CliError::Store(err)
    }
}

impl From<DirectorError> for CliError {
    fn from(err: DirectorError) -> Self {
        CliError::Director(err)
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Json(err)
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        CliError::IoError(err)
    }
}

#[derive(Debug, Parser)]
#[command(name = "labdirector", version = "0.1.0")]
#[command(about = "Lease lab blades and VMs")]
pub struct Cli {
    /// JSON config file; LABDIRECTOR_* variables still apply on top
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Database URL, overrides the config
    #[arg(long, global = true)]
    database: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Everything a command needs. The runtime only drives the database.
pub(crate) struct Context {
    pub runtime: tokio::runtime::Runtime,
    pub manager: HostStateManager,
}

impl Cli {
    pub fn handle() -> Result<(), CliError> {
        let cli = Cli::parse();
        let _guard = init_logging(cli.json_logs, cli.log_dir.as_deref());

        let config = cli.load_config()?;
        tracing::info!(database = %config.database_url, fairness = ?config.fairness, "Loaded configuration");

        let runtime = tokio::runtime::Runtime::new()?;
        let db = SqliteHostDb::open(&config.database_url, runtime.handle().clone())?;
        let manager = HostStateManager::new(config, Arc::new(db), Ports::unavailable());

        cli.command.execute(&Context { runtime, manager })
    }

    fn load_config(&self) -> Result<DirectorConfig, CliError> {
        let config = match self.config {
            Some(ref path) => DirectorConfig::from_file(path)?,
            None => DirectorConfig::default(),
        };
        let mut config = config.with_env()?;
        if let Some(ref url) = self.database {
            config.database_url = url.clone();
        }
        Ok(config)
    }
}

/// Install the subscriber. The returned guard flushes the log file when
/// dropped, so it has to live as long as the program.
fn init_logging(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let (writer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "labdirector.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(writer), Some(guard))
        }
        None => (BoxMakeWriter::new(std::io::stderr), None),
    };

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .log_internal_errors(true)
                    .with_target(false)
                    .flatten_event(true)
                    .with_span_list(false)
                    .with_writer(writer),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(writer))
            .init();
    }
    guard
}
