//! # Queue Host CLI
//!
//! Command-line host that runs a process for every message of a queue.
//!
//! This module provides:
//! - Layered configuration loading (file, then `QUEUE_HOST__` environment)
//! - Logging initialization (plain or JSON)
//! - A process-spawning message handler
//! - The `run` and `validate` commands

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use queue_host_core::{
    HostConfig, HostError, HostExecutor, InMemoryProvider, LockBackendConfig, Message,
    MessageHandler, ProviderConfig, QueueClient, QueueClientFactory, QueueError, QueueName,
    RunMode, RunSummary, SingletonOptions,
};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

/// Default configuration file, looked up relative to the working directory
pub const DEFAULT_CONFIG_FILE: &str = "config/queue-host";

/// Prefix of configuration environment variables, e.g.
/// `QUEUE_HOST__HOST__BATCH_SIZE=10`
pub const ENV_PREFIX: &str = "QUEUE_HOST";

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue host - run a command for every queue message
#[derive(Parser, Debug)]
#[command(name = "queue-host")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run a command for every message of a queue")]
#[command(
    long_about = "Receives messages with at-least-once semantics and runs a command per message. \
                  The message body is written to the command's stdin; a zero exit code deletes \
                  the message, anything else makes it visible again."
)]
pub struct Cli {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "QUEUE_HOST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Consume the queue, running the command for every message
    Run {
        /// Run mode; overrides the configured one
        #[arg(short, long)]
        mode: Option<ModeArg>,

        /// Run as a fleet-wide singleton
        #[arg(long)]
        singleton: bool,

        /// Queue to consume; overrides the configured one
        #[arg(short, long)]
        queue: Option<String>,

        /// Command and arguments to run per message
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Validate the configuration and print it
    Validate,
}

/// Run mode selectable on the command line
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ModeArg {
    /// Drain the queue, then exit
    Job,
    /// Poll until interrupted
    Listener,
}

impl From<ModeArg> for RunMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Job => RunMode::Job,
            ModeArg::Listener => RunMode::Listener,
        }
    }
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Host error: {0}")]
    Host(#[from] HostError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Logging initialization failed: {message}")]
    Logging { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) | Self::Host(HostError::Configuration(_)) => 3,
            Self::Host(HostError::LockLost(_)) => 4,
            Self::Host(_) | Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 5,
            Self::Logging { .. } | Self::Io(_) => 1,
        }
    }
}

impl From<config::ConfigError> for CliError {
    fn from(e: config::ConfigError) -> Self {
        Self::Configuration(e.to_string())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Load the host configuration.
///
/// Sources, later ones overriding earlier ones:
/// 1. `config/queue-host.{yaml,toml,json}` if present
/// 2. `path`, if given (format by extension)
/// 3. environment variables prefixed `QUEUE_HOST__`, with `__` between keys
/// 4. `queue`, if given
pub fn load_configuration(path: Option<&Path>, queue: Option<&str>) -> Result<HostConfig, CliError> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name(DEFAULT_CONFIG_FILE).required(false));

    if let Some(path) = path {
        if !path.exists() {
            return Err(CliError::Configuration(format!(
                "configuration file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(config::File::from(path).required(true));
        info!(path = %path.display(), "Loading configuration from explicit path");
    }

    let config = builder
        .add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("host.queue", queue)?
        .build()?;

    let mut config: HostConfig = config.try_deserialize()?;
    if let ProviderConfig::AzureQueue(azure) = &mut config.provider {
        *azure = std::mem::take(azure).with_env_url();
    }
    Ok(config)
}

/// Apply command-line overrides on top of the loaded configuration
pub fn apply_overrides(
    mut config: HostConfig,
    mode: Option<ModeArg>,
    singleton: bool,
) -> HostConfig {
    if let Some(mode) = mode {
        config.mode = mode.into();
    }
    if singleton && config.singleton.is_none() {
        config.singleton = Some(SingletonOptions::default());
    }
    config
}

/// Copy of the configuration safe to print
pub fn redacted(config: &HostConfig) -> HostConfig {
    let mut config = config.clone();
    match &mut config.provider {
        ProviderConfig::AwsSqs(aws) => {
            if aws.secret_access_key.is_some() {
                aws.secret_access_key = Some("<REDACTED>".to_string());
            }
            if aws.session_token.is_some() {
                aws.session_token = Some("<REDACTED>".to_string());
            }
        }
        ProviderConfig::AzureQueue(azure) => redact_sas(&mut azure.queue_service_url),
        ProviderConfig::InMemory => {}
    }
    if let Some(singleton) = &mut config.singleton {
        if let LockBackendConfig::BlobLease { container_url } = &mut singleton.lock {
            redact_sas(container_url);
        }
    }
    config
}

fn redact_sas(url: &mut String) {
    if let Some((base, _sas)) = url.split_once('?') {
        *url = format!("{}?<REDACTED>", base);
    }
}

// ============================================================================
// Logging
// ============================================================================

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over `level`.
pub fn initialize_logging(level: &str, json: bool) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("queue_host_core={level},queue_host_cli={level}").into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    let result = if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()
    };

    result.map_err(|e| CliError::Logging {
        message: e.to_string(),
    })
}

// ============================================================================
// Process Handler
// ============================================================================

/// Runs a command per message.
///
/// The body goes to the command's stdin and the message metadata to its
/// environment. A zero exit status is success. The child is killed if its
/// task is abandoned at shutdown.
#[derive(Debug, Clone)]
pub struct ProcessHandler {
    program: String,
    args: Vec<String>,
    queue: String,
}

impl ProcessHandler {
    pub const MESSAGE_ID_ENV: &'static str = "QUEUE_HOST_MESSAGE_ID";
    pub const QUEUE_ENV: &'static str = "QUEUE_HOST_QUEUE";
    pub const DEQUEUE_COUNT_ENV: &'static str = "QUEUE_HOST_DEQUEUE_COUNT";

    /// Create a handler from a command line; the first element is the program
    pub fn new(command: Vec<String>, queue: &QueueName) -> Result<Self, CliError> {
        let mut parts = command.into_iter();
        let program = parts.next().ok_or_else(|| CliError::InvalidArgument {
            arg: "command".to_string(),
            message: "a command to run is required".to_string(),
        })?;
        Ok(Self {
            program,
            args: parts.collect(),
            queue: queue.as_str().to_string(),
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

#[async_trait]
impl MessageHandler for ProcessHandler {
    async fn handle(
        &self,
        message: &Message,
        _cancellation: CancellationToken,
    ) -> anyhow::Result<()> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(Self::MESSAGE_ID_ENV, message.message_id.as_str())
            .env(Self::QUEUE_ENV, &self.queue)
            .stdin(Stdio::piped())
            .kill_on_drop(true);
        if let Some(count) = message.dequeue_count() {
            command.env(Self::DEQUEUE_COUNT_ENV, count.to_string());
        }

        let mut child = command
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to start '{}': {}", self.program, e))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A command that ignores its input may exit before reading it.
            if let Err(e) = stdin.write_all(&message.body).await {
                if e.kind() != std::io::ErrorKind::BrokenPipe {
                    return Err(e.into());
                }
            }
        }

        let status = child.wait().await?;
        if !status.success() {
            anyhow::bail!("'{}' exited with {}", self.program, status);
        }
        Ok(())
    }
}

// ============================================================================
// Commands
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();

    initialize_logging(&cli.log_level, cli.json_logs)?;

    let queue = match &cli.command {
        Commands::Run { queue, .. } => queue.as_deref(),
        Commands::Validate => None,
    };
    let config = load_configuration(cli.config.as_deref(), queue)?;

    match cli.command {
        Commands::Run {
            mode,
            singleton,
            command,
            ..
        } => {
            let config = apply_overrides(config, mode, singleton);
            let summary = execute_run_command(config, command).await?;
            println!(
                "{}: processed={} succeeded={} failed={} abandoned={} polls={}",
                summary.outcome,
                summary.processed,
                summary.succeeded,
                summary.failed,
                summary.abandoned,
                summary.polls
            );
            Ok(())
        }
        Commands::Validate => {
            let output = execute_validate_command(&config)?;
            print!("{}", output);
            Ok(())
        }
    }
}

/// Validate the configuration and render it as YAML
pub fn execute_validate_command(config: &HostConfig) -> Result<String, CliError> {
    config
        .validate()
        .map_err(|e| CliError::Configuration(e.to_string()))?;
    serde_yaml::to_string(&redacted(config)).map_err(|e| CliError::Configuration(e.to_string()))
}

/// Run the host until drained or interrupted
pub async fn execute_run_command(
    config: HostConfig,
    command: Vec<String>,
) -> Result<RunSummary, CliError> {
    config
        .validate()
        .map_err(|e| CliError::Configuration(e.to_string()))?;

    let handler = ProcessHandler::new(command, &config.host.queue)?;
    info!(
        queue = %config.host.queue,
        mode = %config.mode,
        program = %handler.program(),
        "Starting queue host"
    );

    let client = create_client(&config)?;
    let executor = HostExecutor::new(config, client, Arc::new(handler))?;

    let cancellation = CancellationToken::new();
    let signal_token = cancellation.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    Ok(executor.run(cancellation).await?)
}

fn create_client(config: &HostConfig) -> Result<Arc<dyn QueueClient>, CliError> {
    match &config.provider {
        ProviderConfig::InMemory => {
            warn!("Using the in-memory provider; messages live only in this process");
            let provider = InMemoryProvider::new();
            provider.create_queue(&config.host.queue);
            Ok(Arc::new(provider))
        }
        other => Ok(QueueClientFactory::create_client(other)?),
    }
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
