//! Configuration types and loading
//!
//! Config precedence: CLI `--config` > `CONFIG_PATH` env > `api-probe.toml`.
//! `API_BASE_URL` overrides `api.base_url`. The access token is never read
//! from the TOML: `API_ACCESS_TOKEN` (with optional `API_TOKEN_EXPIRES_IN`
//! seconds) seeds the session at startup.

use api_client::RetryPolicy;
use common::Secret;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
}

/// Backend settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_path")]
    pub refresh_path: String,
}

/// Credential storage settings
#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    /// Prefix for the stored token fields
    #[serde(default)]
    pub namespace: String,
    /// Token file; tokens live in memory only when unset
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    #[serde(skip)]
    pub access_token: Option<Secret<String>>,
    #[serde(skip)]
    pub expires_in_secs: Option<u64>,
}

/// Executor retry settings
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    /// 0 disables retries
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            base_delay_ms: default_base_delay(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_path() -> String {
    session::REFRESH_TOKEN_PATH.to_string()
}

fn default_base_delay() -> u64 {
    1000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("API_BASE_URL") {
            config.api.base_url = url;
        }
        if let Ok(token) = std::env::var("API_ACCESS_TOKEN") {
            let token = token.trim().to_owned();
            if !token.is_empty() {
                config.session.access_token = Some(Secret::new(token));
            }
        }
        if let Ok(raw) = std::env::var("API_TOKEN_EXPIRES_IN") {
            let secs = raw.trim().parse::<u64>().map_err(|e| {
                common::Error::Config(format!("API_TOKEN_EXPIRES_IN must be seconds, got {raw:?}: {e}"))
            })?;
            config.session.expires_in_secs = Some(secs);
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        if self.api.timeout_secs == 0 {
            return Err(common::Error::Config(
                "timeout_secs must be greater than 0".into(),
            ));
        }

        if !self.api.refresh_path.starts_with('/') {
            return Err(common::Error::Config(format!(
                "refresh_path must be an absolute path, got: {}",
                self.api.refresh_path
            )));
        }

        if self.retry.max_retries > 0 && self.retry.base_delay_ms == 0 {
            return Err(common::Error::Config(
                "base_delay_ms must be greater than 0 when retries are enabled".into(),
            ));
        }

        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }

    /// Executor retry policy; `None` when retries are disabled.
    pub fn retry_policy(&self) -> Option<RetryPolicy> {
        (self.retry.max_retries > 0).then(|| {
            RetryPolicy::new(
                self.retry.max_retries,
                Duration::from_millis(self.retry.base_delay_ms),
            )
        })
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("api-probe.toml")
    }
}
