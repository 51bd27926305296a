//! User account management

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;

use flotilla::auth::Authorize;
use flotilla::config::Configuration;
use flotilla::database::Database;

#[derive(Subcommand)]
pub enum UserAction {
    /// Create or replace a user account
    Add {
        username: String,

        /// Grant administrative rights
        #[arg(long)]
        admin: bool,
    },
}

pub async fn run(config_path: &str, action: UserAction) -> Result<()> {
    let config = Configuration::load(config_path)?;
    let db = Arc::new(Database::open(&config.storage.db_path)?);
    let authorize = Authorize::new(db, config.defaults.authorization.clone());

    match action {
        UserAction::Add { username, admin } => {
            print!("Password for {}: ", username);
            std::io::stdout().flush()?;
            let mut password = String::new();
            std::io::stdin()
                .read_line(&mut password)
                .context("could not read password")?;
            let password = password.trim_end_matches(['\r', '\n']);
            if password.is_empty() {
                anyhow::bail!("password must not be empty");
            }

            authorize.create_user(&username, password, admin).await?;
            println!("User {} created (admin: {})", username, admin);
        }
    }

    Ok(())
}
