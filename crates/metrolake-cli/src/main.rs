//! metrolake - NYC subway data lake pipeline
//!
//! Pulls stop events, weather, alerts and city events into an S3-compatible
//! lake and promotes them through the raw, processed and cleaned layers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::Result;
use clap::{Parser, Subcommand};
use metrolake_core::{ProgressContext, init_logging, shutdown_flag};

mod cmd;
mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "metrolake")]
#[command(about = "NYC subway data lake: raw, processed and cleaned layers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./metrolake.toml or ~/.config/metrolake/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Maximum retry attempts for transient failures
    #[arg(long, global = true)]
    max_retries: Option<u32>,

    /// Timeout in seconds for store calls and source requests
    #[arg(long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline over a date range
    Run(cmd::run::RunArgs),
    /// Show manifest entries and watermarks
    Status(cmd::status::StatusArgs),
    /// Recompute content hashes of stored partitions
    Verify(cmd::verify::VerifyArgs),
    /// Remove stale staging objects
    Gc(cmd::gc::GcArgs),
    /// Forget a failed partition so the next run retries it
    Reset(cmd::reset::ResetArgs),
    /// Show current configuration
    Config,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = ProgressContext::new();

    // Logging:
    //   TTY:     quiet (warn) unless --debug, progress bars show activity
    //   non-TTY: info unless --debug, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = is_tty && !cli.debug;
    init_logging(quiet, cli.debug, multi);

    let config = match load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Configuration error: {e:#}");
            return ExitCode::from(2);
        }
    };

    let result = match cli.command {
        Command::Run(args) => {
            setup_signal_handler();
            cmd::run::run(args, &config, &progress)
        }
        Command::Status(args) => cmd::status::run(args, &config).map(|()| true),
        Command::Verify(args) => cmd::verify::run(args, &config),
        Command::Gc(args) => cmd::gc::run(args, &config).map(|()| true),
        Command::Reset(args) => cmd::reset::run(args, &config).map(|()| true),
        Command::Config => {
            cmd::show_config(&config);
            Ok(true)
        }
    };

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            log::error!("Fatal error: {e:#}");
            ExitCode::from(2)
        }
    }
}

/// Config file values, then CLI overrides.
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = if let Some(path) = &cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };
    if let Some(n) = cli.max_retries {
        config.pipeline.max_retries = n;
    }
    if let Some(secs) = cli.timeout {
        config.pipeline.fetch_timeout_secs = secs;
        config.store.timeout_secs = secs;
    }
    Ok(config)
}

fn setup_signal_handler() {
    // First signal: set graceful shutdown flag
    // Second signal: force exit
    // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
    unsafe {
        signal_hook::low_level::register(signal_hook::consts::SIGTERM, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("Failed to register SIGTERM handler");
        signal_hook::low_level::register(signal_hook::consts::SIGINT, || {
            if shutdown_flag().swap(true, Ordering::Relaxed) {
                std::process::exit(130);
            }
        })
        .expect("Failed to register SIGINT handler");
    }
}
