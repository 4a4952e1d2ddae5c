use std::time::Duration;

use cln_plugin::{options, Builder, ConfiguredPlugin};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::split::SplitConfig;

pub const DEFAULT_SEARCH_TIMEOUT_SECS: i64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Invalid value for field {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
    #[error("Plugin option error for {field}: {source}")]
    PluginError {
        field: &'static str,
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    search_timeout: Duration,
}

impl Config {
    pub fn new(search_timeout_secs: i64) -> Result<Self, ConfigValidationError> {
        if search_timeout_secs <= 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "search_timeout",
                reason: format!("must be positive, got {}", search_timeout_secs),
            });
        }
        Ok(Self {
            search_timeout: Duration::from_secs(search_timeout_secs as u64),
        })
    }

    pub fn search_timeout(&self) -> Duration {
        self.search_timeout
    }

    pub fn split_config(&self) -> SplitConfig {
        SplitConfig::with_search_timeout(self.search_timeout)
    }
}

#[derive(Debug, Clone)]
pub struct Options<'a> {
    pub search_timeout: options::DefaultIntegerConfigOption<'a>,
}

impl Default for Options<'_> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> Options<'a> {
    pub fn new() -> Self {
        Self {
            search_timeout: options::ConfigOption::new_i64_with_default(
                "sloppy-search-timeout",
                DEFAULT_SEARCH_TIMEOUT_SECS,
                "Seconds to search for an alternate route before a split is abandoned",
            ),
        }
    }

    pub fn register_with_builder<S, I, O>(self, builder: Builder<S, I, O>) -> Builder<S, I, O>
    where
        O: Send + AsyncWrite + Unpin + 'static,
        S: Clone + Sync + Send + 'static,
        I: AsyncRead + Send + Unpin + 'static,
    {
        builder.option(self.search_timeout)
    }

    /// Reads the options once `lightningd` has sent `init`.
    pub fn extract_config<S, I, O>(
        &self,
        plugin: &ConfiguredPlugin<S, I, O>,
    ) -> Result<Config, ConfigValidationError>
    where
        S: Clone + Sync + Send + 'static,
        I: AsyncRead + Send + Unpin + 'static,
        O: Send + AsyncWrite + Unpin + 'static,
    {
        config_from_option(plugin.option(&self.search_timeout))
    }
}

fn config_from_option(secs: anyhow::Result<i64>) -> Result<Config, ConfigValidationError> {
    let secs = secs.map_err(|e| ConfigValidationError::PluginError {
        field: "search_timeout",
        source: e,
    })?;
    Config::new(secs)
}
