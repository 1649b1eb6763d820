//! Sweeper CLI
//!
//! Usage:
//!   sweeper run [--once]
//!   sweeper doctor

use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sweeper::config::{Config, MarkerStoreKind, CONFIG_ENV, DEFAULT_CONFIG_FILE};
use sweeper::doctor;
use sweeper::quota::GhRateLimit;
use sweeper::tracker::{FileMarkerStore, GhCommentMarkers, MarkerStore};
use sweeper::{
    AttemptTracker, GhIssueSource, Orchestrator, OrchestratorSettings, PipelineFixer,
    ProcessLock, QuotaGovernor, SweeperError, SweeperResult,
};

/// Issue sweeper - dispatches open issues to an automated fixer
#[derive(Parser)]
#[command(name = "sweeper")]
#[command(about = "Issue sweeper - dispatches open issues to an automated fixer")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file
    #[arg(long, global = true, env = CONFIG_ENV, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan repositories and dispatch issues until nothing is left, then exit
    Run {
        /// Run a single pass without the trailing sleep
        #[arg(long)]
        once: bool,
    },
    /// Check tools, authentication and quota
    Doctor,
}

#[derive(Clone, Copy, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let default = if verbose { "sweeper=debug,info" } else { "sweeper=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let (text, json) = match format {
        LogFormat::Text => (Some(fmt::layer().with_writer(std::io::stderr)), None),
        LogFormat::Json => (
            None,
            Some(fmt::layer().json().with_writer(std::io::stderr)),
        ),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(text)
        .with(json)
        .init();
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    match dispatch(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Fatal error");
            eprintln!("{}", e.to_string().red());
            ExitCode::from(e.exit_code())
        }
    }
}

async fn dispatch(cli: Cli) -> SweeperResult<()> {
    let config = Config::load(&cli.config)?;
    match cli.command.unwrap_or(Commands::Run { once: false }) {
        Commands::Run { once } => run(config, once).await,
        Commands::Doctor => doctor::report(&config).await,
    }
}

fn build_orchestrator(config: &Config) -> SweeperResult<Orchestrator> {
    let source = GhIssueSource::new(
        &config.repos_directory,
        &config.skip_label,
        config.issue_limit,
    );
    let governor = QuotaGovernor::new(Box::new(GhRateLimit::default()), config.quota.clone());
    let store: Box<dyn MarkerStore> = match config.marker_store {
        MarkerStoreKind::Comments => Box::new(GhCommentMarkers::new(&config.marker_tag)),
        MarkerStoreKind::File => Box::new(FileMarkerStore::new(&config.marker_file)),
    };
    let tracker = AttemptTracker::new(store, config.cooldown());
    let fixer = PipelineFixer::new(config.fixer.clone())
        .map_err(|e| SweeperError::Config(format!("fixer: {e:#}")))?;

    Ok(Orchestrator::new(
        Box::new(source),
        governor,
        tracker,
        Box::new(fixer),
        OrchestratorSettings::from_config(config),
    ))
}

/// The lock is held for the whole loop and released on every exit path,
/// including a termination signal.
async fn run(config: Config, once: bool) -> SweeperResult<()> {
    doctor::preflight(&config)?;
    let mut orchestrator = build_orchestrator(&config)?;

    let mut lock = ProcessLock::new(&config.lock_path);
    if !lock.acquire()? {
        info!(
            owner = ?lock.current_owner(),
            "Another instance is running, exiting"
        );
        return Ok(());
    }

    info!(
        repos_directory = %config.repos_directory.display(),
        marker_store = ?config.marker_store,
        "Sweeper started"
    );

    tokio::select! {
        summary = orchestrator.run(once) => {
            info!(
                passes = summary.passes,
                dispatched = summary.dispatched,
                succeeded = summary.succeeded,
                failed = summary.failed,
                skipped = summary.skipped,
                last_outcome = %summary.last_outcome,
                "Run finished"
            );
        }
        name = shutdown_signal() => {
            warn!(signal = name, "Termination requested, shutting down");
        }
    }

    lock.release();
    Ok(())
}

async fn shutdown_signal() -> &'static str {
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut term), Ok(mut int)) => {
            tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            }
        }
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl-C");
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Ctrl-C handler failed");
                std::future::pending::<()>().await;
            }
            "SIGINT"
        }
    }
}
