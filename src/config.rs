use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::api::DEFAULT_API_BASE_URL;

/// Environment variable overriding the API base URL
pub const API_URL_ENV: &str = "ODEVIO_API_URL";
/// Environment variable overriding the directory holding `config.toml`
pub const CONFIG_DIR_ENV: &str = "ODEVIO_CONFIG_DIR";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
    #[serde(default)]
    pub auth: AuthSection,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct AuthSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_token: Option<String>,
}

impl Config {
    /// Get the API base URL (env override, then config file, then default)
    pub fn get_api_url(&self) -> String {
        std::env::var(API_URL_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| self.api_url.clone())
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string())
            .trim_end_matches('/')
            .to_string()
    }
}

/// Location of the persisted configuration file.
///
/// The file is read on every access so that a token refreshed by one request
/// is visible to the next one without any in-process cache.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    /// Platform config directory (e.g. `~/.config/odevio/config.toml`)
    pub fn default_location() -> Result<Self> {
        let dir = match std::env::var(CONFIG_DIR_ENV) {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir()
                .context("Failed to determine the configuration directory")?
                .join("odevio"),
        };
        Ok(Self::at(dir.join("config.toml")))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load configuration from disk, returning defaults when the file is absent
    pub fn load(&self) -> Result<Config> {
        if !self.path.exists() {
            return Ok(Config::default());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read config file {}", self.path.display()))?;

        let mut unused_fields = Vec::new();
        let deserializer = toml::Deserializer::new(&contents);
        let config: Config = serde_ignored::deserialize(deserializer, |path| {
            unused_fields.push(path.to_string());
        })
        .with_context(|| format!("Failed to parse config file {}", self.path.display()))?;

        for field in &unused_fields {
            warn!(
                "Unknown configuration field in {}: {}",
                self.path.display(),
                field
            );
        }

        Ok(config)
    }

    /// Save configuration to disk, creating the directory if needed
    pub fn save(&self, config: &Config) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.exists() {
                fs::create_dir_all(dir).context("Failed to create config directory")?;
                println!(
                    "Created a configuration file for Odevio : {}",
                    self.path.display()
                );
            }
        }

        let contents = toml::to_string_pretty(config).context("Failed to serialize config")?;
        fs::write(&self.path, contents).context("Failed to write config file")?;
        debug!("Wrote configuration to {}", self.path.display());

        Ok(())
    }

    /// Get the stored authentication token
    pub fn token(&self) -> Result<Option<String>> {
        Ok(self.load()?.auth.jwt_token)
    }

    /// Store the authentication token
    pub fn set_token(&self, token: &str) -> Result<()> {
        let mut config = self.load()?;
        config.auth.jwt_token = Some(token.to_string());
        self.save(&config)
    }

    /// Remove the stored token. Returns false when there was none.
    pub fn clear_token(&self) -> Result<bool> {
        let mut config = self.load()?;
        if config.auth.jwt_token.take().is_none() {
            return Ok(false);
        }
        self.save(&config)?;
        Ok(true)
    }
}
