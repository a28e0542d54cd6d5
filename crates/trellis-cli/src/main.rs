//! `trellis` binary entry point.

mod bootstrap;
mod config_file;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "trellis", version, about = "Developer workstation supervisor")]
struct Cli {
    /// Path to the expanded configuration document.
    #[arg(long, short, global = true, default_value = "trellis.json")]
    config: PathBuf,

    /// Log filter used when RUST_LOG is unset (e.g. `info`,
    /// `trellis_runtime=debug`).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Launch the supervisor and proxy in the foreground.
    Run,
    /// Validate the configuration and exit.
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Command::Run => bootstrap::run(&cli.config).await,
        Command::Check => {
            let config = config_file::load(&cli.config)?;
            config_file::check(&config)?;
            println!(
                "{}: {} services, {} proxy listeners",
                cli.config.display(),
                config.services.len(),
                config.proxies.len()
            );
            Ok(())
        }
    }
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
