//! Login command - store admin credentials

use crate::client::AdminClient;
use crate::config::{config_file, Config};
use anyhow::{Context, Result};
use console::style;

pub async fn run(token: String, server: Option<String>, user: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    config.admin_token = Some(token);
    if let Some(server) = server {
        config.server_url = server;
    }
    if user.is_some() {
        config.admin_user = user;
    }

    // Reject bad credentials before saving them
    let client = AdminClient::from_config(&config)?;
    client
        .statistics()
        .await
        .with_context(|| format!("Could not authenticate against {}", config.server_url))?;

    config.save()?;
    println!(
        "{} Logged in to {}",
        style("✓").green().bold(),
        style(&config.server_url).cyan()
    );
    println!("  Credentials saved to {}", config_file().display());

    Ok(())
}
