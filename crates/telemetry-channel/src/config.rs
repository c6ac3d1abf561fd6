// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::constants::{
    DEFAULT_HTTP_TIMEOUT, DEFAULT_INGESTION_URL, DEFAULT_MAX_STORAGE_BYTES,
    DEFAULT_SHUTDOWN_TIMEOUT, RETRY_INTERVALS,
};
use crate::error::ConfigError;

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Settings of the channel and its reference store and transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
    /// Directory of the file store. `None` keeps logs in memory only.
    pub storage_dir: Option<PathBuf>,
    pub max_storage_bytes: u64,
    pub ingestion_url: String,
    pub app_secret: String,
    pub use_compression: bool,
    /// zstd level
    pub compression_level: i32,
    pub http_timeout: Duration,
    pub retry_intervals: Vec<Duration>,
    /// Replaces the default retryable status classification when set.
    pub retryable_status_codes: Option<HashSet<u16>>,
    pub shutdown_timeout: Duration,
    pub https_proxy: Option<String>,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            storage_dir: None,
            max_storage_bytes: DEFAULT_MAX_STORAGE_BYTES,
            ingestion_url: DEFAULT_INGESTION_URL.to_string(),
            app_secret: String::new(),
            use_compression: true,
            compression_level: 3,
            http_timeout: DEFAULT_HTTP_TIMEOUT,
            retry_intervals: RETRY_INTERVALS.to_vec(),
            retryable_status_codes: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            https_proxy: None,
        }
    }
}

impl ChannelConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key/value source. Unset keys keep
    /// their default; malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let config = Self {
            log_level: get("TELEMETRY_LOG_LEVEL")
                .map(|v| v.to_lowercase())
                .unwrap_or(defaults.log_level),
            storage_dir: get("TELEMETRY_STORAGE_DIR").map(PathBuf::from),
            max_storage_bytes: get("TELEMETRY_MAX_STORAGE_BYTES")
                .map(|v| parse_number("TELEMETRY_MAX_STORAGE_BYTES", &v))
                .transpose()?
                .unwrap_or(defaults.max_storage_bytes),
            ingestion_url: get("TELEMETRY_INGESTION_URL").unwrap_or(defaults.ingestion_url),
            app_secret: get("TELEMETRY_APP_SECRET").unwrap_or(defaults.app_secret),
            use_compression: get("TELEMETRY_USE_COMPRESSION")
                .map(|v| v.to_lowercase() != "false")
                .unwrap_or(defaults.use_compression),
            compression_level: get("TELEMETRY_COMPRESSION_LEVEL")
                .map(|v| parse_number("TELEMETRY_COMPRESSION_LEVEL", &v))
                .transpose()?
                .unwrap_or(defaults.compression_level),
            http_timeout: get("TELEMETRY_HTTP_TIMEOUT_SECS")
                .map(|v| parse_number("TELEMETRY_HTTP_TIMEOUT_SECS", &v).map(Duration::from_secs))
                .transpose()?
                .unwrap_or(defaults.http_timeout),
            retry_intervals: get("TELEMETRY_RETRY_INTERVALS_MS")
                .map(|v| {
                    parse_list::<u64>("TELEMETRY_RETRY_INTERVALS_MS", &v)
                        .map(|ms| ms.into_iter().map(Duration::from_millis).collect())
                })
                .transpose()?
                .unwrap_or(defaults.retry_intervals),
            retryable_status_codes: get("TELEMETRY_RETRYABLE_STATUS_CODES")
                .map(|v| {
                    parse_list::<u16>("TELEMETRY_RETRYABLE_STATUS_CODES", &v)
                        .map(|codes| codes.into_iter().collect())
                })
                .transpose()?,
            shutdown_timeout: get("TELEMETRY_SHUTDOWN_TIMEOUT_MS")
                .map(|v| {
                    parse_number("TELEMETRY_SHUTDOWN_TIMEOUT_MS", &v).map(Duration::from_millis)
                })
                .transpose()?
                .unwrap_or(defaults.shutdown_timeout),
            https_proxy: get("TELEMETRY_PROXY_HTTPS").or_else(|| get("HTTPS_PROXY")),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }
        if self.max_storage_bytes == 0 {
            return Err(ConfigError::Invalid(
                "TELEMETRY_MAX_STORAGE_BYTES must be greater than 0".to_string(),
            ));
        }
        if !self.ingestion_url.starts_with("http://") && !self.ingestion_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid(format!(
                "TELEMETRY_INGESTION_URL must be an http(s) URL, got '{}'",
                self.ingestion_url
            )));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(ConfigError::Invalid(format!(
                "TELEMETRY_COMPRESSION_LEVEL must be between 1 and 22, got {}",
                self.compression_level
            )));
        }
        if self.http_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "TELEMETRY_HTTP_TIMEOUT_SECS must be greater than 0".to_string(),
            ));
        }
        if let Some(codes) = &self.retryable_status_codes {
            if let Some(code) = codes.iter().find(|c| !(100..=599).contains(*c)) {
                return Err(ConfigError::Invalid(format!(
                    "TELEMETRY_RETRYABLE_STATUS_CODES contains invalid status {code}"
                )));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse::<T>()
        .map_err(|_| ConfigError::Invalid(format!("{key} has an invalid value '{value}'")))
}

fn parse_list<T: std::str::FromStr>(key: &str, value: &str) -> Result<Vec<T>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| parse_number(key, item))
        .collect()
}
