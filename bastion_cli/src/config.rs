//! CLI configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Get the configuration directory path
pub fn config_dir() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("bastion")
    }

    #[cfg(not(target_os = "windows"))]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".bastion")
    }
}

/// Get the config file path
pub fn config_file() -> PathBuf {
    config_dir().join("config.yml")
}

/// Operator credentials and server location
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Admin API bearer token
    pub admin_token: Option<String>,

    /// Server URL (default: http://localhost:8080)
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Name recorded as the acting admin on blocks and unblocks
    #[serde(default)]
    pub admin_user: Option<String>,
}

fn default_server_url() -> String {
    "http://localhost:8080".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            admin_token: None,
            server_url: default_server_url(),
            admin_user: None,
        }
    }
}

impl Config {
    /// Load config from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&config_file())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).context("Failed to create config directory")?;
        }
        let content = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        tracing::debug!("Saved config to {}", path.display());
        Ok(())
    }

    /// Get admin token or error
    pub fn require_auth(&self) -> Result<&str> {
        self.admin_token
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("Not logged in. Run `bastion login <TOKEN>` first."))
    }

    /// Base URL of the admin API
    pub fn admin_url(&self) -> String {
        format!("{}/api/admin", self.server_url.trim_end_matches('/'))
    }
}
