use std::path::PathBuf;

use clap::Parser;
use log::{error, info};

use offline_music_downloader::commands::{self, AppState, Command};
use offline_music_downloader::config::AppConfig;

#[derive(Debug, Parser)]
#[command(name = "music-dl", version, about = "Download music for offline listening")]
struct Cli {
    /// Config file to use instead of the one in the user config directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    // Load configuration
    let config = match AppConfig::load(cli.config.as_deref()) {
        Ok(config) => {
            info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            AppConfig::default()
        }
    };

    let state = AppState::initialize(config).await?;
    let result = commands::run(&state, cli.command).await;
    state.shutdown().await;

    match result {
        Err(e) if e.is_caller_error() => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
        result => Ok(result?),
    }
}
