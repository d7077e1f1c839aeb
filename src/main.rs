//! Mount a single-file demonstration file system through the fuse-dispatch request layer.
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{debug, error};

mod app_config;
mod daemon;
mod fuse_check;
mod trc;

use crate::app_config::Config;
use crate::trc::Trc;

const LONG_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("VERGEN_GIT_SHA"), ")");

#[derive(Parser)]
#[command(
    version,
    long_version = LONG_VERSION,
    about = "Serve a hello-world FUSE file system through the fuse-dispatch request layer."
)]
struct Args {
    /// Directory to mount on. Created if missing; must be empty.
    mount_point: PathBuf,

    #[arg(long, help = "Log at debug level, without progress spinners.")]
    debug: bool,

    #[arg(long, help = "Also trace every request decoded by the FUSE transport.")]
    debug_fuse: bool,

    #[arg(
        short,
        long,
        value_parser,
        help = "Optional path to a fuse-dispatch config TOML."
    )]
    config: Option<PathBuf>,

    #[arg(long, help = "Run all handlers on one thread.")]
    single_threaded: bool,
}

/// Main entry point for the application.
fn main() -> ExitCode {
    let args = Args::parse();

    // Errors use eprintln since tracing isn't initialized yet.
    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(config) => config,
        Err(app_config::ConfigError::ValidationErrors(error_messages)) => {
            eprintln!("Configuration is invalid.");
            for msg in &error_messages {
                eprintln!(" - {msg}");
            }
            return ExitCode::FAILURE;
        }
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    if args.single_threaded {
        config.session.single_threaded = true;
        config.session.workers = None;
    }

    if let Err(e) = Trc::default()
        .with_debug(args.debug)
        .with_fuse_debug(args.debug_fuse)
        .init()
    {
        eprintln!(
            "Failed to initialize logging. Without logging, we can't provide any useful error \
             messages, so we have to exit: {e}"
        );
        return ExitCode::FAILURE;
    }

    if let Err(e) = fuse_check::ensure_fuse() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    debug!(config = ?config, "Starting with configuration...");
    match daemon::spawn(config, args.mount_point) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fuse-dispatch failed: {e}");
            ExitCode::FAILURE
        }
    }
}
