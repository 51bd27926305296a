//! Process role entry points

pub mod files;
pub mod log;
pub mod master;
pub mod user;
pub mod web;

use clap::Subcommand;

use flotilla::bus::LogForwarder;
use flotilla::config::Configuration;

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduling master process
    Master,

    /// Run the user-facing API process
    Web,

    /// Run the log collector process
    Log,

    /// Run the static file server process
    Files,

    /// Manage user accounts
    User {
        #[command(subcommand)]
        action: user::UserAction,
    },
}

/// Install the tracing subscriber; master and web tee their lines to the
/// log process when it is configured.
pub(crate) fn init_tracing(config: &Configuration, debug: bool, forward: bool) {
    let log_level = if debug || config.debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("flotilla={}", log_level).into());

    let log_url = config.server_log.external_url.as_ref().filter(|_| forward);
    match log_url {
        Some(url) => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(LogForwarder::connect(url))
            .init(),
        None => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}
