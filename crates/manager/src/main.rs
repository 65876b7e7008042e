//! Warden - Main entry point
//!
//! Automated certificate lifecycle manager: runs the renewal daemon and the
//! operator commands that inspect and steer it.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden_common::{CertificateId, ChallengeKind, DomainSet};
use warden_config::{Config, LogFormat};
use warden_manager::operator::exit;
use warden_manager::{App, CertificateStatus, OperatorError, StoreError};

/// Warden - automated TLS certificate lifecycle manager
#[derive(Parser, Debug)]
#[command(name = "warden")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config", env = "WARDEN_CONFIG", global = true)]
    config: Option<String>,

    /// Enable verbose logging (debug level)
    #[arg(long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the renewal daemon (default)
    Run,
    /// Validate configuration and stored certificates, then exit
    Test,
    /// Register a new certificate; the first name is the primary domain
    Register {
        #[arg(required = true)]
        domains: Vec<String>,
        /// Challenge type (http-01 or dns-01)
        #[arg(long, value_parser = parse_challenge)]
        challenge: Option<ChallengeKind>,
        /// Hook to run after issuance (repeatable)
        #[arg(long = "hook")]
        hooks: Vec<String>,
        /// Renew once this many days of validity remain
        #[arg(long)]
        renew_before_days: Option<u32>,
        /// Consecutive failures tolerated before parking the certificate
        #[arg(long)]
        max_retries: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    /// Show one certificate
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show every certificate
    List {
        #[arg(long)]
        json: bool,
    },
    /// Show certificates that need a manual reset
    ListFailed {
        #[arg(long)]
        json: bool,
    },
    /// Issue or renew now, ignoring the renewal window
    ForceRenew { id: String },
    /// Mark a certificate revoked; it is never renewed again
    Revoke { id: String },
    /// Move a failed certificate back to pending
    Reset { id: String },
    /// Delete a certificate record and its key material
    Remove { id: String },
}

fn parse_challenge(s: &str) -> Result<ChallengeKind, String> {
    ChallengeKind::from_str_loose(s).ok_or_else(|| format!("unknown challenge type '{}'", s))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("warden: {:#}", e);
            return ExitCode::from(exit::ERROR);
        }
    };
    init_logging(&config, cli.verbose);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::from(exit::ERROR);
        }
    };

    let command = cli.command.unwrap_or(Commands::Run);
    let code = runtime.block_on(dispatch(command, config, cli.config.as_deref()));
    ExitCode::from(code)
}

/// Load configuration with priority: CLI arg / env var > embedded default
fn load_config(path: Option<&str>) -> Result<Config> {
    match path {
        Some(path) => Config::from_file(path),
        None => Config::default_embedded().context("Failed to load embedded configuration"),
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
    }
}

async fn dispatch(command: Commands, config: Config, config_path: Option<&str>) -> u8 {
    if let Commands::Test = command {
        return match test_config(config, config_path) {
            Ok(()) => exit::OK,
            Err(e) => {
                eprintln!("warden: {:#}", e);
                exit::ERROR
            }
        };
    }

    if let Err(e) = config.validate() {
        eprintln!("warden: {:#}", e);
        return exit::ERROR;
    }

    let opened = match command {
        Commands::Run => App::from_config(config),
        Commands::ForceRenew { .. } => open_for_force_renew(config),
        _ => App::from_config_shared(config),
    };
    let app = match opened {
        Ok(app) => app,
        Err(e) => {
            eprintln!("warden: {:#}", e);
            return if is_locked(&e) { exit::CONFLICT } else { exit::ERROR };
        }
    };

    let result = match command {
        Commands::Run => return run_daemon(&app).await,
        Commands::Test => unreachable!("handled above"),
        Commands::Register {
            domains,
            challenge,
            hooks,
            renew_before_days,
            max_retries,
            json,
        } => register(&app, domains, challenge, hooks, renew_before_days, max_retries)
            .map(|status| print_one(&status, json)),
        Commands::Status { id, json } => app
            .operator()
            .status(&CertificateId::new(id))
            .map(|status| print_one(&status, json)),
        Commands::List { json } => app.operator().list().map(|all| print_all(&all, json)),
        Commands::ListFailed { json } => app
            .operator()
            .list_failed()
            .map(|failed| print_all(&failed, json)),
        Commands::ForceRenew { id } => force_renew(&app, CertificateId::new(id)).await,
        Commands::Revoke { id } => app
            .operator()
            .revoke(&CertificateId::new(id))
            .map(|status| print_one(&status, false)),
        Commands::Reset { id } => app
            .operator()
            .reset(&CertificateId::new(id))
            .map(|status| print_one(&status, false)),
        Commands::Remove { id } => app
            .operator()
            .remove(&CertificateId::new(id))
            .map(|status| println!("removed {}", status.id)),
    };

    match result {
        Ok(()) => exit::OK,
        Err(e) => {
            eprintln!("warden: {}", e);
            e.exit_code()
        }
    }
}

/// Own the storage to run the job here, or share it with a running daemon
/// that will pick the renewal up
fn open_for_force_renew(config: Config) -> Result<App> {
    match App::from_config(config.clone()) {
        Err(e) if is_locked(&e) => {
            info!("Storage is owned by a running daemon, queueing instead");
            App::from_config_shared(config)
        }
        other => other,
    }
}

fn is_locked(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<StoreError>(), Some(StoreError::Locked(_)))
}

async fn force_renew(app: &App, id: CertificateId) -> Result<(), OperatorError> {
    if !app.owns_storage() {
        let status = app.operator().queue_renewal(&id)?;
        println!("{}: queued, the running daemon renews it at its next check", status.id);
        return Ok(());
    }

    let cancel = shutdown_token();
    let result = app.operator().force_renew(&id, &cancel).await;
    if !app.drain().await {
        warn!("Hooks or challenge cleanup still running at exit");
    }
    result.map(|outcome| println!("{}: {}", id, outcome))
}

async fn run_daemon(app: &App) -> u8 {
    let shutdown = shutdown_token();
    info!(
        storage = %app.config().storage.path.display(),
        directory = %app.config().acme.directory_url(),
        "Starting warden"
    );

    match app.run(shutdown).await {
        Ok(()) => {
            info!("Warden stopped");
            exit::OK
        }
        Err(e) => {
            error!(error = %format!("{:#}", e), "Warden failed");
            exit::ERROR
        }
    }
}

/// Token cancelled on SIGINT or SIGTERM
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();

    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "Failed to install SIGTERM handler");
                    let _ = tokio::signal::ctrl_c().await;
                    cancel.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
                _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt, shutting down");
        }
        cancel.cancel();
    });

    token
}

fn register(
    app: &App,
    domains: Vec<String>,
    challenge: Option<ChallengeKind>,
    hooks: Vec<String>,
    renew_before_days: Option<u32>,
    max_retries: Option<u32>,
) -> Result<CertificateStatus, OperatorError> {
    let config = app.config();
    let domains =
        DomainSet::validated(&domains).map_err(|e| OperatorError::Invalid(e.to_string()))?;

    let mut policy = config.policy.clone();
    if let Some(days) = renew_before_days {
        policy = policy.with_renew_before_days(days);
    }
    if let Some(max_retries) = max_retries {
        policy = policy.with_max_retries(max_retries);
    }

    let challenge = challenge.unwrap_or(config.acme.challenge);
    if challenge == ChallengeKind::Http01 && config.acme.webroot.is_none() {
        return Err(OperatorError::Invalid(
            "http-01 needs acme.webroot to be configured".to_string(),
        ));
    }

    app.operator().register(domains, policy, challenge, hooks)
}

fn print_one(status: &CertificateStatus, json: bool) {
    if json {
        match serde_json::to_string_pretty(status) {
            Ok(text) => println!("{}", text),
            Err(e) => error!(error = %e, "Failed to serialize status"),
        }
    } else {
        print!("{}", status);
    }
}

fn print_all(statuses: &[CertificateStatus], json: bool) {
    if json {
        match serde_json::to_string_pretty(statuses) {
            Ok(text) => println!("{}", text),
            Err(e) => error!(error = %e, "Failed to serialize status"),
        }
        return;
    }
    if statuses.is_empty() {
        println!("no certificates");
    }
    for status in statuses {
        let expires = status
            .not_after
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<18} {:<12} failures {}",
            status.id.as_str(),
            status.state.as_str(),
            expires,
            status.failure_count
        );
    }
}

/// Validate configuration and stored certificates
fn test_config(config: Config, config_path: Option<&str>) -> Result<()> {
    let result = config.validate().context("Configuration validation failed")?;

    info!("Configuration test successful:");
    info!("  - {} certificate(s)", config.certificates.len());
    info!("  - {} hook(s)", config.hooks.len());
    info!("  - directory {}", config.acme.directory_url());

    if config.storage.path.join("records").is_dir() {
        let window = config.policy.renew_before_expiry();
        let app = App::from_config_shared(config)?;
        let warnings = app
            .operator()
            .check_artifacts(window)
            .context("Failed to inspect stored certificates")?;
        for warning in &warnings {
            println!("warning: {}: {}", warning.id, warning.message);
        }
    }

    println!(
        "warden: configuration file {} test is successful ({} warning(s))",
        config_path.unwrap_or("(embedded)"),
        result.warnings.len()
    );
    Ok(())
}
