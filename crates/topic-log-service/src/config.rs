use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use topic_log_core::ChannelId;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    pub bot: BotConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BotConfig {
    pub token: String,
    #[serde(default = "default_command")]
    pub command: String,
    #[serde(default)]
    pub ignored_channels: Vec<ChannelId>,
    #[serde(default = "default_topics_per_page")]
    pub topics_per_page: usize,
    /// Idle timeout of the paginated view, in milliseconds.
    #[serde(default = "default_navigation_timeout")]
    pub navigation_timeout: u64,
    /// Paste host used for viewer URLs.
    #[serde(default = "default_paste_url")]
    pub paste_url: String,
    #[serde(default)]
    pub paste_api_url: Option<String>,
    #[serde(default = "default_paste_timeout_secs")]
    pub paste_timeout_secs: u64,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
}

impl BotConfig {
    /// Base URL of the paste creation API, `https://api.<paste_url>` unless overridden.
    #[must_use]
    pub fn paste_api_base(&self) -> String {
        match &self.paste_api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://api.{}", self.paste_url),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct HttpConfig {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { filter: default_log_filter() }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./topics.sqlite3")
}

fn default_command() -> String {
    "!topics".to_string()
}

fn default_topics_per_page() -> usize {
    5
}

fn default_navigation_timeout() -> u64 {
    60_000
}

fn default_paste_url() -> String {
    "paste.gg".to_string()
}

fn default_paste_timeout_secs() -> u64 {
    15
}

fn default_api_base_url() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 4020))
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Config {
    /// Read, parse, and validate a TOML config file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file is unreadable, malformed, or fails validation.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        Self::from_toml_str(&raw)
    }

    /// # Errors
    /// Returns [`ConfigError`] when the document is malformed or fails validation.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bot.token.trim().is_empty() {
            return Err(ConfigError::Invalid("bot.token must not be empty".to_string()));
        }
        if self.bot.command.trim().is_empty() {
            return Err(ConfigError::Invalid("bot.command must not be empty".to_string()));
        }
        if self.bot.topics_per_page == 0 {
            return Err(ConfigError::Invalid("bot.topics_per_page must be >= 1".to_string()));
        }
        if self.bot.paste_url.trim().is_empty() {
            return Err(ConfigError::Invalid("bot.paste_url must not be empty".to_string()));
        }
        Ok(())
    }
}
