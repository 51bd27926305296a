//! Flotilla - distributed task-execution server
//!
//! One binary, four long-lived process roles: `master` runs the
//! scheduling orchestrator, `web` the user API, `log` the log collector
//! and `files` the static file server. All roles read the same TOML
//! configuration file.

use clap::Parser;

mod cmd;

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(about = "Distributed task-execution server for container clusters")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: cmd::Commands,

    /// Path to configuration file
    #[arg(short = 'f', long, default_value = "config.toml", global = true)]
    config: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        cmd::Commands::Master => cmd::master::run(&cli.config, cli.debug).await,
        cmd::Commands::Web => cmd::web::run(&cli.config, cli.debug).await,
        cmd::Commands::Log => cmd::log::run(&cli.config, cli.debug).await,
        cmd::Commands::Files => cmd::files::run(&cli.config, cli.debug).await,
        cmd::Commands::User { action } => cmd::user::run(&cli.config, action).await,
    };

    if let Err(e) = result {
        eprintln!("flotilla: {:#}", e);
        std::process::exit(1);
    }
}
