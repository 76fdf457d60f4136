use std::time::Duration;

use anyhow::{bail, Context, Result};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::model::UserId;

pub const ENV_PREFIX: &str = "INTRANET_MCP";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Root of the CMS, without the `/api` suffix.
    pub api_base_url: String,
    pub api_token: String,
    pub user_id: UserId,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_reconcile_limit")]
    pub reconcile_limit: usize,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub bulk_read_route: Option<String>,
}

impl Settings {
    pub fn load() -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder
            .build()
            .map_err(map_config_error)
            .context("failed to build configuration")?;

        let settings = config
            .try_deserialize::<Settings>()
            .map_err(map_config_error)
            .context("failed to deserialize configuration")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_base_url.starts_with("http://") || self.api_base_url.starts_with("https://"))
        {
            bail!("api_base_url must be an http(s) URL, got `{}`", self.api_base_url);
        }
        if self.api_token.trim().is_empty() {
            bail!("api_token must not be empty");
        }
        if !(1..=60).contains(&self.poll_interval_secs) {
            bail!(
                "poll_interval_secs must be between 1 and 60, got {}",
                self.poll_interval_secs
            );
        }
        if self.page_size == 0 || self.reconcile_limit == 0 || self.dedup_capacity == 0 {
            bail!("page_size, reconcile_limit and dedup_capacity must be positive");
        }
        if self.request_timeout_secs == 0 {
            bail!("request_timeout_secs must be positive");
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn map_config_error(err: ConfigError) -> anyhow::Error {
    match err {
        ConfigError::NotFound(_) => err.into(),
        _ => anyhow::anyhow!(err),
    }
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_page_size() -> usize {
    50
}

fn default_reconcile_limit() -> usize {
    100
}

fn default_dedup_capacity() -> usize {
    50
}

fn default_request_timeout_secs() -> u64 {
    15
}
