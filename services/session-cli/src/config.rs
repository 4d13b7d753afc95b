//! Configuration types and loading
//!
//! Precedence: CLI args > env vars > config file > defaults. A config file
//! is optional; without one the client talks to a local API and keeps its
//! session in `session.json` next to the working directory.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Measurement API connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

/// Where the session credential lives
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub backend: StorageBackend,
    #[serde(default = "default_session_path")]
    pub path: PathBuf,
    /// How long a derived state may be reused; 0 re-derives on every query
    #[serde(default)]
    pub memo_window_ms: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Gone when the process exits
    Memory,
    /// Survives between invocations
    #[default]
    File,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_session_path(),
            memo_window_ms: 0,
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000/".into()
}

fn default_timeout() -> u64 {
    30
}

fn default_session_path() -> PathBuf {
    PathBuf::from("session.json")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.finish()
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> common::Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Config::default().finish()
        }
    }

    /// Apply env overrides and validate.
    ///
    /// `MEASURE_API_URL` replaces `api.base_url`.
    fn finish(mut self) -> common::Result<Self> {
        if let Ok(url) = std::env::var("MEASURE_API_URL") {
            self.api.base_url = url;
        }

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "api.base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "api.timeout_secs must be greater than 0".into(),
            ));
        }

        if self.session.backend == StorageBackend::File
            && self.session.path.as_os_str().is_empty()
        {
            return Err(common::Error::Config(
                "session.path is required for the file backend".into(),
            ));
        }

        Ok(self)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    pub fn memo_window(&self) -> Duration {
        Duration::from_millis(self.session.memo_window_ms)
    }

    /// Resolve config file path from CLI arg or MEASURE_CONFIG env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("MEASURE_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("measure-session.toml")
    }
}
