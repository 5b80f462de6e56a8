#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::uninlined_format_args,
    dead_code
)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use paintbot::Config;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "paintbot")]
#[command(version)]
#[command(about = "Chat bot for local image, chat and speech backends.", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the bot with the local terminal channel
    Run,

    /// Show the last state snapshot written by a running bot
    Status,

    /// Probe both backends once and report reachability
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_init()?;

    match cli.command {
        Commands::Run => {
            config.validate()?;
            info!(config = %config.config_path.display(), "starting paintbot");
            paintbot::daemon::run(config).await
        }
        Commands::Status => paintbot::doctor::status(&config),
        Commands::Doctor => paintbot::doctor::run(&config).await,
    }
}
