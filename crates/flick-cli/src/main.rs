//! Flick CLI - Headless feed driver
//!
//! Features:
//! - Feed simulation against headless surfaces
//! - Quality ladder probing for HLS manifests
//! - Configuration printing and validation

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;
mod output;
mod sim;

/// Flick CLI - Short-form feed playback toolkit
#[derive(Parser)]
#[command(name = "flick")]
#[command(version)]
#[command(about = "Simulate and inspect pooled feed playback", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Output format (text, json, table)
    #[arg(short, long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive a feed through a swipe script and print the slot bindings
    Simulate {
        /// Number of videos in the feed
        #[arg(short = 'n', long, default_value = "20")]
        videos: usize,

        /// Number of engine slots in the pool
        #[arg(short, long)]
        slots: Option<usize>,

        /// Comma-separated steps: an index, next, prev, play, pause,
        /// offline, online, low-battery, charging, fast, slow
        #[arg(long, default_value = "0,next,next,next,8,prev")]
        script: String,

        /// Autoplay rule of the simulated platform (allowed, muted_only, blocked)
        #[arg(long, default_value = "allowed")]
        autoplay: String,

        /// Simulated preload latency in milliseconds
        #[arg(long, default_value = "40")]
        latency_ms: u64,

        /// Load settings from a JSON config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Fetch an HLS manifest and print its quality ladder
    Probe {
        /// URL of the master playlist
        manifest: String,
    },

    /// Print the default configuration or validate a file
    Config {
        /// Config file to validate
        #[arg(long)]
        validate: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --verbose
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if cli.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    flick_core::init();

    match cli.command {
        Commands::Simulate {
            videos,
            slots,
            script,
            autoplay,
            latency_ms,
            config,
        } => {
            let options = sim::SimOptions {
                videos,
                slots,
                script: sim::parse_script(&script)?,
                autoplay: sim::parse_autoplay(&autoplay)?,
                latency_ms,
                config,
            };
            commands::simulate(options, &cli.format).await?;
        }
        Commands::Probe { manifest } => {
            commands::probe(&manifest, &cli.format).await?;
        }
        Commands::Config { validate } => {
            commands::config(validate, &cli.format)?;
        }
    }

    Ok(())
}
