use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{
    open_session, AddCommand, ConfigCommand, DeleteCommand, ListCommand, WatchCommand,
};
use config::Config;

#[derive(Parser)]
#[command(name = "marks")]
#[command(version)]
#[command(about = "Personal bookmarks, kept in sync across devices", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List bookmarks, newest first
    List(ListCommand),

    /// Add a bookmark
    Add(AddCommand),

    /// Delete a bookmark
    Delete(DeleteCommand),

    /// Print bookmark changes as they happen
    Watch(WatchCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "marks=warn,smartmarks_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Save config path for config commands
    let cli_config_path = cli.config.clone();

    // Load configuration
    let config = Config::load(cli.config)?;

    let command = match cli.command {
        Some(Commands::Config(cmd)) => return cmd.run(&config, cli_config_path),
        Some(command) => command,
        None => {
            println!("Use --help to see available commands");
            return Ok(());
        }
    };

    let handle = open_session(&config).await?;
    let result = match &command {
        Commands::List(cmd) => cmd.run(&handle).await,
        Commands::Add(cmd) => cmd.run(&handle).await,
        Commands::Delete(cmd) => cmd.run(&handle).await,
        Commands::Watch(cmd) => cmd.run(&handle).await,
        Commands::Config(_) => Ok(()),
    };

    // Close the live feed before exiting, even when the command failed.
    handle.shutdown().await?;
    result
}
