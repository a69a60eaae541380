//! Mount an aggregated namespace of pluggable backends over FUSE.
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing::error;

mod app_config;
mod daemon;
mod trc;

use crate::app_config::Config;

#[derive(Parser)]
#[command(version, about = "Aggregated virtual filesystem gateway.")]
struct Args {
    #[arg(short, long, value_parser, help = "Path to a config TOML.")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Mount the configured namespace and serve it.
    Run {
        /// Override the configured mount point.
        #[arg(short, long)]
        mountpoint: Option<PathBuf>,
    },

    /// Load and validate the configuration, then exit.
    Check,
}

fn load_config(args: &Args) -> Config {
    // Errors use eprintln since tracing isn't initialized yet.
    let config = Config::load(args.config_path.as_deref()).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        std::process::exit(1);
    });
    if let Err(problems) = config.validate() {
        eprintln!("Configuration is invalid.");
        for msg in &problems {
            eprintln!(" - {msg}");
        }
        std::process::exit(1);
    }
    config
}

fn main() {
    let args = Args::parse();
    let mut config = load_config(&args);

    match args.command.unwrap_or(Command::Run { mountpoint: None }) {
        Command::Run { mountpoint } => {
            if let Some(mp) = mountpoint {
                config.mount_point = mp;
            }
            if let Err(e) = trc::init() {
                eprintln!("Failed to initialize logging: {e}");
                std::process::exit(1);
            }
            if let Err(e) = daemon::spawn(config) {
                error!("daemon failed: {e}");
                std::process::exit(1);
            }
        }
        Command::Check => {
            println!("configuration ok");
        }
    }
}
